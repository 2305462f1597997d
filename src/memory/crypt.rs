//! At-rest encryption for memory records
//!
//! AES-256-GCM with a process-wide master key derived once at engine init via
//! PBKDF2-SHA256. Each sealed record gets a fresh 96-bit nonce from the OS
//! RNG; the nonce is stored alongside the ciphertext and is never reused.
//! Key rotation is out of scope.

use aes_gcm::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use pbkdf2::pbkdf2_hmac_array;
use sha2::Sha256;

/// Size of the persisted salt for key derivation (16 bytes)
const SALT_SIZE: usize = 16;
/// Size of the AES-GCM nonce (12 bytes / 96 bits)
pub const NONCE_SIZE: usize = 12;
/// Number of PBKDF2 iterations
const PBKDF2_ITERATIONS: u32 = 100_000;
/// Size of the derived key (256 bits)
const KEY_SIZE: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum CryptError {
    #[error("Encryption failed")]
    Seal,
    #[error("Decryption failed: wrong key or corrupted ciphertext")]
    Open,
    #[error("Malformed sealed payload: {0}")]
    Malformed(String),
}

/// Ciphertext plus the nonce it was sealed under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

impl Sealed {
    /// base64(nonce || ciphertext), the at-rest representation
    pub fn encode(&self) -> String {
        let mut raw = Vec::with_capacity(NONCE_SIZE + self.ciphertext.len());
        raw.extend_from_slice(&self.nonce);
        raw.extend_from_slice(&self.ciphertext);
        BASE64.encode(raw)
    }

    pub fn decode(encoded: &str) -> Result<Self, CryptError> {
        let raw = BASE64
            .decode(encoded)
            .map_err(|e| CryptError::Malformed(e.to_string()))?;
        // GCM tag alone is 16 bytes; anything shorter cannot be valid.
        if raw.len() < NONCE_SIZE + 16 {
            return Err(CryptError::Malformed("sealed payload too short".into()));
        }
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&raw[..NONCE_SIZE]);
        Ok(Self {
            nonce,
            ciphertext: raw[NONCE_SIZE..].to_vec(),
        })
    }
}

/// Process-wide master key, derived once at engine init
pub struct MasterKey {
    cipher: Aes256Gcm,
}

impl MasterKey {
    /// Derive from a passphrase and a persisted salt
    pub fn derive(passphrase: &str, salt: &[u8]) -> Self {
        let key: [u8; KEY_SIZE] =
            pbkdf2_hmac_array::<Sha256, KEY_SIZE>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS);
        // 32 bytes is always a valid AES-256 key.
        let cipher = Aes256Gcm::new_from_slice(&key).expect("derived key has fixed size");
        Self { cipher }
    }

    /// Generate a fresh random salt for a new store
    pub fn generate_salt() -> [u8; SALT_SIZE] {
        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        salt
    }

    /// Seal plaintext under a fresh random nonce
    pub fn seal(&self, plaintext: &[u8]) -> Result<Sealed, CryptError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptError::Seal)?;
        Ok(Sealed {
            nonce: nonce_bytes,
            ciphertext,
        })
    }

    /// Open a sealed payload; any tamper fails authentication
    pub fn open(&self, sealed: &Sealed) -> Result<Vec<u8>, CryptError> {
        let nonce = Nonce::from_slice(&sealed.nonce);
        self.cipher
            .decrypt(nonce, sealed.ciphertext.as_slice())
            .map_err(|_| CryptError::Open)
    }
}

// ============================================================================
// TESTS
// ============================================================================
