// =============================================================================
// CredentialVault — AEAD encryption of stored broker passwords
// =============================================================================
//
// Replaces a Fernet-with-base64-fallback scheme: here there is no fallback.
// A missing or malformed key fails at startup (see `config.rs`); a failed
// decrypt is always a `CryptoError`, never a silent pass-through of the raw
// bytes as plaintext.
// =============================================================================

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;

use crate::error::CryptoError;

const NONCE_LEN: usize = 12;

/// Validates that `key_material` decodes to exactly 32 bytes, without
/// constructing a cipher. Used by `AppConfig::from_env` so a bad key is
/// caught before the vault is ever used.
pub fn validate_key_material(key_material: &str) -> Result<(), CryptoError> {
    let bytes = BASE64
        .decode(key_material)
        .map_err(|e| CryptoError::BadKey(e.to_string()))?;
    if bytes.len() != 32 {
        return Err(CryptoError::BadKey(format!(
            "expected 32 bytes after base64 decode, got {}",
            bytes.len()
        )));
    }
    Ok(())
}

/// Encrypts and decrypts broker credentials at rest with AES-256-GCM.
///
/// The key is supplied once, at construction, as a base64-encoded 32-byte
/// string (`ENCRYPTION_KEY`). Ciphertext is stored as `nonce || tag || ct`,
/// base64-encoded for the `BYTEA`/text column it lands in.
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl CredentialVault {
    pub fn new(key_material: &str) -> Result<Self, CryptoError> {
        let bytes = BASE64
            .decode(key_material)
            .map_err(|e| CryptoError::BadKey(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(CryptoError::BadKey(format!(
                "expected 32 bytes after base64 decode, got {}",
                bytes.len()
            )));
        }
        let key = Key::<Aes256Gcm>::from_slice(&bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Encrypts `plaintext`, returning a base64 string safe to store.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::DecryptionFailed)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    /// Decrypts a value produced by `encrypt`. Any failure — truncated
    /// input, wrong key, tampered ciphertext — is a `CryptoError`; there is
    /// no fallback interpretation of the bytes as plaintext.
    pub fn decrypt(&self, stored: &str) -> Result<String, CryptoError> {
        let raw = BASE64
            .decode(stored)
            .map_err(|_| CryptoError::Truncated)?;
        if raw.len() < NONCE_LEN {
            return Err(CryptoError::Truncated);
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptionFailed)
    }
}
