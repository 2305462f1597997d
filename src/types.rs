//! NewType wrappers and closed domain enums
//!
//! Provides zero-cost abstractions for domain types,
//! preventing type confusion and enabling rich APIs.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

// ============================================================================
// TASK ID
// ============================================================================

/// `BE-07`-style identifiers: leading letter, then alphanumeric/dash/underscore.
static TASK_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]{0,63}$").expect("valid task id regex"));

/// Strongly-typed task identifier
///
/// Guarantees:
/// - Non-empty, starts with a letter
/// - Valid characters (alphanumeric, dash, underscore)
/// - Maximum 64 characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Maximum allowed length
    pub const MAX_LENGTH: usize = 64;

    /// Create a new TaskId with validation
    pub fn new(id: impl AsRef<str>) -> Result<Self, TaskIdError> {
        let id = id.as_ref();

        if id.is_empty() {
            return Err(TaskIdError::Empty);
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(TaskIdError::TooLong(id.len()));
        }
        if !TASK_ID_RE.is_match(id) {
            return Err(TaskIdError::InvalidCharacters(id.to_string()));
        }

        Ok(TaskId(id.to_string()))
    }

    /// Get as string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = TaskIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskId::new(s)
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        TaskId::new(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskIdError {
    #[error("Task ID cannot be empty")]
    Empty,
    #[error("Task ID too long ({0} > {})", TaskId::MAX_LENGTH)]
    TooLong(usize),
    #[error("Task ID contains invalid characters: {0}")]
    InvalidCharacters(String),
}

// ============================================================================
// ROLE ID
// ============================================================================

/// The closed set of worker roles an executor can be bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleId {
    Coordinator,
    TechnicalLead,
    Backend,
    Frontend,
    Ux,
    Product,
    Qa,
    Documentation,
}

impl RoleId {
    /// All roles, in registry order
    pub const ALL: [RoleId; 8] = [
        RoleId::Coordinator,
        RoleId::TechnicalLead,
        RoleId::Backend,
        RoleId::Frontend,
        RoleId::Ux,
        RoleId::Product,
        RoleId::Qa,
        RoleId::Documentation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RoleId::Coordinator => "coordinator",
            RoleId::TechnicalLead => "technical_lead",
            RoleId::Backend => "backend",
            RoleId::Frontend => "frontend",
            RoleId::Ux => "ux",
            RoleId::Product => "product",
            RoleId::Qa => "qa",
            RoleId::Documentation => "documentation",
        }
    }
}

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoleId {
    type Err = RoleIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coordinator" => Ok(RoleId::Coordinator),
            "technical_lead" => Ok(RoleId::TechnicalLead),
            "backend" => Ok(RoleId::Backend),
            "frontend" => Ok(RoleId::Frontend),
            "ux" => Ok(RoleId::Ux),
            "product" => Ok(RoleId::Product),
            "qa" => Ok(RoleId::Qa),
            "documentation" => Ok(RoleId::Documentation),
            other => Err(RoleIdError::Unknown(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RoleIdError {
    #[error("Unknown role: {0}")]
    Unknown(String),
}

// ============================================================================
// PRIORITY
// ============================================================================

/// Task priority class. Ordering: HIGH > MED > LOW.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    #[default]
    Med,
    High,
}

impl Priority {
    /// Numeric class used by the ready queue (higher dispatches first)
    pub fn class(&self) -> u8 {
        match self {
            Priority::High => 2,
            Priority::Med => 1,
            Priority::Low => 0,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::High => write!(f, "HIGH"),
            Priority::Med => write!(f, "MED"),
            Priority::Low => write!(f, "LOW"),
        }
    }
}

// ============================================================================
// RISK TIER
// ============================================================================

/// Static risk classification carried by the task definition
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskTier {
    #[default]
    Low,
    Med,
    High,
}

impl RiskTier {
    /// Contribution to the HITL risk score
    pub fn weight(&self) -> u32 {
        match self {
            RiskTier::Low => 0,
            RiskTier::Med => 2,
            RiskTier::High => 5,
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskTier::Low => write!(f, "LOW"),
            RiskTier::Med => write!(f, "MED"),
            RiskTier::High => write!(f, "HIGH"),
        }
    }
}

// ============================================================================
// SENSITIVITY
// ============================================================================

/// Memory record classification controlling encryption and PII handling
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Sensitivity {
    Public,
    #[default]
    Internal,
    Secret,
}

impl Sensitivity {
    /// SECRET and INTERNAL are encrypted at rest; PUBLIC may be cached in clear
    pub fn encrypted_at_rest(&self) -> bool {
        !matches!(self, Sensitivity::Public)
    }
}

impl fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sensitivity::Public => write!(f, "PUBLIC"),
            Sensitivity::Internal => write!(f, "INTERNAL"),
            Sensitivity::Secret => write!(f, "SECRET"),
        }
    }
}

// ============================================================================
// QA SEVERITY
// ============================================================================

/// Severity attached to a QA verdict; feeds the HITL risk score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QaSeverity {
    Minor,
    Major,
    Blocker,
}

impl QaSeverity {
    pub fn weight(&self) -> u32 {
        match self {
            QaSeverity::Minor => 0,
            QaSeverity::Major => 2,
            QaSeverity::Blocker => 5,
        }
    }
}

impl fmt::Display for QaSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QaSeverity::Minor => write!(f, "MINOR"),
            QaSeverity::Major => write!(f, "MAJOR"),
            QaSeverity::Blocker => write!(f, "BLOCKER"),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_valid() {
        assert!(TaskId::new("BE-07").is_ok());
        assert!(TaskId::new("fetch_data").is_ok());
        assert!(TaskId::new("a").is_ok());
    }

    #[test]
    fn test_task_id_invalid() {
        assert!(matches!(TaskId::new(""), Err(TaskIdError::Empty)));
        assert!(matches!(
            TaskId::new("x".repeat(65)),
            Err(TaskIdError::TooLong(65))
        ));
        assert!(matches!(
            TaskId::new("has space"),
            Err(TaskIdError::InvalidCharacters(_))
        ));
        // Must start with a letter
        assert!(matches!(
            TaskId::new("-leading"),
            Err(TaskIdError::InvalidCharacters(_))
        ));
        assert!(matches!(
            TaskId::new("7up"),
            Err(TaskIdError::InvalidCharacters(_))
        ));
    }

    #[test]
    fn test_role_id_round_trip() {
        for role in RoleId::ALL {
            assert_eq!(role.as_str().parse::<RoleId>().unwrap(), role);
        }
        assert!("devops".parse::<RoleId>().is_err());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Med);
        assert!(Priority::Med > Priority::Low);
        assert_eq!(Priority::High.class(), 2);
    }

    #[test]
    fn test_risk_tier_weights() {
        assert_eq!(RiskTier::Low.weight(), 0);
        assert_eq!(RiskTier::Med.weight(), 2);
        assert_eq!(RiskTier::High.weight(), 5);
    }

    #[test]
    fn test_sensitivity_encryption_scope() {
        assert!(!Sensitivity::Public.encrypted_at_rest());
        assert!(Sensitivity::Internal.encrypted_at_rest());
        assert!(Sensitivity::Secret.encrypted_at_rest());
    }

    #[test]
    fn test_qa_severity_weights() {
        assert_eq!(QaSeverity::Minor.weight(), 0);
        assert_eq!(QaSeverity::Major.weight(), 2);
        assert_eq!(QaSeverity::Blocker.weight(), 5);
    }

    #[test]
    fn test_serde_wire_format() {
        let p: Priority = serde_yaml::from_str("HIGH").unwrap();
        assert_eq!(p, Priority::High);
        let r: RoleId = serde_yaml::from_str("technical_lead").unwrap();
        assert_eq!(r, RoleId::TechnicalLead);
        let s: Sensitivity = serde_yaml::from_str("SECRET").unwrap();
        assert_eq!(s, Sensitivity::Secret);
    }
}
