//! Role prompt templates
//!
//! Templates are data, not code: plain strings with `{placeholder}` slots.
//! Rendering is a single pass; an unknown placeholder fails closed instead of
//! passing garbage to an executor.

use std::collections::HashMap;

use super::DispatchError;

/// Placeholders a template may reference
pub const ALLOWED_PLACEHOLDERS: [&str; 6] = [
    "task_id",
    "title",
    "description",
    "role",
    "context",
    "attempt",
];

/// Render a template against the provided variables (single pass)
///
/// `{{` escapes a literal brace. Unknown placeholders fail closed with
/// [`DispatchError::UnknownPlaceholder`].
pub fn render(template: &str, vars: &HashMap<&str, String>) -> Result<String, DispatchError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((_, ch)) = chars.next() {
        if ch == '{' {
            if chars.peek().map(|(_, c)| *c) == Some('{') {
                chars.next();
                out.push('{');
                continue;
            }
            let mut name = String::new();
            let mut closed = false;
            for (_, inner) in chars.by_ref() {
                if inner == '}' {
                    closed = true;
                    break;
                }
                name.push(inner);
            }
            if !closed {
                return Err(DispatchError::UnknownPlaceholder {
                    placeholder: format!("{{{name}"),
                });
            }
            match vars.get(name.as_str()) {
                Some(value) => out.push_str(value),
                None => {
                    return Err(DispatchError::UnknownPlaceholder { placeholder: name });
                }
            }
        } else if ch == '}' && chars.peek().map(|(_, c)| *c) == Some('}') {
            chars.next();
            out.push('}');
        } else {
            out.push(ch);
        }
    }

    Ok(out)
}

/// Builtin template used by roles without an override
pub const DEFAULT_TEMPLATE: &str = "\
You are the {role} agent.

## Task {task_id}: {title}

{description}

## Relevant context

{context}

Attempt {attempt}. Produce the expected artifacts and summarize the work.";

/// Role-specific system framing, prepended to the default template
pub fn role_preamble(role: crate::types::RoleId) -> &'static str {
    use crate::types::RoleId;
    match role {
        RoleId::Coordinator => "Coordinate across tasks; resolve conflicts; never write code directly.\n\n",
        RoleId::TechnicalLead => "Own architecture decisions and review implementation plans.\n\n",
        RoleId::Backend => "Implement server-side behavior with tests.\n\n",
        RoleId::Frontend => "Implement UI behavior against the agreed API contract.\n\n",
        RoleId::Ux => "Produce design guidance and interaction specifications.\n\n",
        RoleId::Product => "Clarify requirements and acceptance criteria.\n\n",
        RoleId::Qa => "Verify behavior against acceptance criteria; report findings by severity.\n\n",
        RoleId::Documentation => "Write operator and user documentation for the delivered work.\n\n",
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> HashMap<&'static str, String> {
        HashMap::from([
            ("task_id", "BE-1".to_string()),
            ("title", "Build endpoint".to_string()),
            ("description", "POST /orders".to_string()),
            ("role", "backend".to_string()),
            ("context", "schema v2".to_string()),
            ("attempt", "1".to_string()),
        ])
    }

    #[test]
    fn test_render_happy_path() {
        let rendered = render("Task {task_id}: {title} ({role})", &vars()).unwrap();
        assert_eq!(rendered, "Task BE-1: Build endpoint (backend)");
    }

    #[test]
    fn test_unknown_placeholder_fails_closed() {
        let err = render("Use {secret_key} here", &vars()).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::UnknownPlaceholder { ref placeholder } if placeholder == "secret_key"
        ));
    }

    #[test]
    fn test_unterminated_placeholder_fails_closed() {
        assert!(render("broken {task_id", &vars()).is_err());
    }

    #[test]
    fn test_escaped_braces() {
        let rendered = render("literal {{json}} and {task_id}", &vars()).unwrap();
        assert_eq!(rendered, "literal {json} and BE-1");
    }

    #[test]
    fn test_default_template_renders_with_allowed_set() {
        let vars = vars();
        for placeholder in ALLOWED_PLACEHOLDERS {
            assert!(vars.contains_key(placeholder));
        }
        let rendered = render(DEFAULT_TEMPLATE, &vars).unwrap();
        assert!(rendered.contains("Task BE-1: Build endpoint"));
        assert!(rendered.contains("schema v2"));
    }

    #[test]
    fn test_every_role_has_a_preamble() {
        for role in crate::types::RoleId::ALL {
            assert!(!role_preamble(role).is_empty());
        }
    }
}
