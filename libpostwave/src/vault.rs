//! Credential vault
//!
//! Authenticated encryption of stored OAuth tokens. The key is derived from a
//! hex master secret with HKDF-SHA256 and used with AES-256-GCM. Ciphertexts
//! are stored as `base64(nonce || ciphertext || tag)`.
//!
//! The vault is stateless: every operation takes the key explicitly.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hkdf::Hkdf;
use secrecy::SecretString;
use sha2::Sha256;
use std::fmt;
use zeroize::Zeroizing;

use crate::error::CredentialError;

const NONCE_LEN: usize = 12;
const KEY_SALT: &[u8] = b"postwave-credential-vault";
const KEY_INFO: &[u8] = b"oauth-token-encryption-v1";

/// AES-256 key derived from the master secret.
#[derive(Clone)]
pub struct EncryptionKey {
    key: Zeroizing<[u8; 32]>,
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

impl EncryptionKey {
    /// Derive a key from a 64-character hex secret (32 bytes).
    pub fn from_hex(secret: &str) -> Result<Self, CredentialError> {
        let master = Zeroizing::new(
            hex::decode(secret.trim())
                .map_err(|e| CredentialError::InvalidKey(format!("not valid hex: {}", e)))?,
        );
        if master.len() != 32 {
            return Err(CredentialError::InvalidKey(format!(
                "expected 32 bytes (64 hex characters), got {} bytes",
                master.len()
            )));
        }

        let hk = Hkdf::<Sha256>::new(Some(KEY_SALT), &master);
        let mut key = Zeroizing::new([0u8; 32]);
        hk.expand(KEY_INFO, &mut key[..])
            .map_err(|_| CredentialError::InvalidKey("key derivation failed".to_string()))?;

        Ok(Self { key })
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key[..]))
    }
}

/// Encrypt a token for storage.
pub fn encrypt(key: &EncryptionKey, plaintext: &str) -> Result<String, CredentialError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = key
        .cipher()
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| CredentialError::Encryption)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(out))
}

/// Decrypt a stored token. Fails on a wrong key or any tampering.
pub fn decrypt(key: &EncryptionKey, encoded: &str) -> Result<SecretString, CredentialError> {
    let data = STANDARD
        .decode(encoded.trim())
        .map_err(|e| CredentialError::Decryption(format!("invalid base64: {}", e)))?;
    if data.len() <= NONCE_LEN {
        return Err(CredentialError::Decryption("ciphertext too short".to_string()));
    }

    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    let plaintext = Zeroizing::new(
        key.cipher()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CredentialError::Decryption("authentication failed".to_string()))?,
    );

    let text = String::from_utf8(plaintext.to_vec())
        .map_err(|_| CredentialError::Decryption("plaintext is not UTF-8".to_string()))?;
    Ok(SecretString::from(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    const SECRET: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn test_encrypt_then_decrypt() {
        let key = EncryptionKey::from_hex(SECRET).unwrap();
        let sealed = encrypt(&key, "access-token-123").unwrap();
        assert_ne!(sealed, "access-token-123");
        assert_eq!(decrypt(&key, &sealed).unwrap().expose_secret(), "access-token-123");
    }

    #[test]
    fn test_nonce_is_random_per_call() {
        let key = EncryptionKey::from_hex(SECRET).unwrap();
        assert_ne!(encrypt(&key, "same").unwrap(), encrypt(&key, "same").unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let key = EncryptionKey::from_hex(SECRET).unwrap();
        let other = EncryptionKey::from_hex(&"ab".repeat(32)).unwrap();
        let sealed = encrypt(&key, "token").unwrap();
        assert!(matches!(
            decrypt(&other, &sealed),
            Err(CredentialError::Decryption(_))
        ));
    }

    #[test]
    fn test_tampering_detected() {
        let key = EncryptionKey::from_hex(SECRET).unwrap();
        let sealed = encrypt(&key, "token").unwrap();
        let mut raw = STANDARD.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert!(decrypt(&key, &STANDARD.encode(raw)).is_err());
    }

    #[test]
    fn test_truncated_ciphertext_rejected() {
        let key = EncryptionKey::from_hex(SECRET).unwrap();
        assert!(decrypt(&key, &STANDARD.encode([0u8; 8])).is_err());
    }

    #[test]
    fn test_invalid_hex_key() {
        assert!(EncryptionKey::from_hex("not-hex").is_err());
        assert!(EncryptionKey::from_hex("abcd").is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = EncryptionKey::from_hex(SECRET).unwrap();
        assert_eq!(format!("{:?}", key), "EncryptionKey([REDACTED])");
    }
}
