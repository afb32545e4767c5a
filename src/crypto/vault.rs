use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use base64::{engine::general_purpose::STANDARD, Engine};

use crate::error::{BackupError, Result};
use crate::model::DestinationConfig;

/// AES-256-GCM with a 128-bit IV, matching the stored envelope format.
type Cipher = AesGcm<Aes256, U16>;

const KEY_LENGTH: usize = 32;
const IV_LENGTH: usize = 16;
const TAG_LENGTH: usize = 16;

pub const KEY_ENV_VAR: &str = "BACKUP_ENCRYPTION_KEY";

/// Authenticated encryption for stored secrets.
///
/// Envelopes have the shape `iv:tag:ciphertext`, each part standard base64.
pub struct CredentialVault {
    cipher: Cipher,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault").finish_non_exhaustive()
    }
}

impl CredentialVault {
    /// Builds the vault from 64 hex characters. Any other key is a startup
    /// configuration error.
    pub fn from_hex(key_hex: &str) -> Result<Self> {
        let key_hex = key_hex.trim();
        if key_hex.len() != KEY_LENGTH * 2 {
            return Err(BackupError::Config(format!(
                "encryption key must be {} hex characters ({} bytes), got {} characters",
                KEY_LENGTH * 2,
                KEY_LENGTH,
                key_hex.len()
            )));
        }
        let key = hex::decode(key_hex)
            .map_err(|e| BackupError::Config(format!("encryption key is not valid hex: {}", e)))?;
        Self::from_bytes(&key)
    }

    /// A fresh random key, hex encoded.
    pub fn generate_key_hex() -> String {
        hex::encode(Cipher::generate_key(&mut OsRng))
    }

    pub fn from_bytes(key: &[u8]) -> Result<Self> {
        let cipher = Cipher::new_from_slice(key).map_err(|_| {
            BackupError::Config(format!("encryption key must be exactly {} bytes", KEY_LENGTH))
        })?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        if plaintext.is_empty() {
            return Err(BackupError::Config("cannot encrypt an empty value".to_string()));
        }

        let iv = Cipher::generate_nonce(&mut OsRng);
        let mut sealed = self
            .cipher
            .encrypt(&iv, plaintext.as_bytes())
            .map_err(|_| BackupError::Integrity("encryption failed".to_string()))?;
        let tag = sealed.split_off(sealed.len() - TAG_LENGTH);

        Ok([STANDARD.encode(iv), STANDARD.encode(tag), STANDARD.encode(sealed)].join(":"))
    }

    pub fn decrypt(&self, envelope: &str) -> Result<String> {
        let (iv, tag, mut ciphertext) = split_envelope(envelope)
            .ok_or_else(|| BackupError::Integrity("malformed encrypted envelope".to_string()))?;

        ciphertext.extend_from_slice(&tag);
        let plaintext = self
            .cipher
            .decrypt(GenericArray::from_slice(&iv), ciphertext.as_slice())
            .map_err(|_| {
                BackupError::Integrity(
                    "authentication failed: wrong key or tampered data".to_string(),
                )
            })?;

        String::from_utf8(plaintext)
            .map_err(|_| BackupError::Integrity("decrypted value is not UTF-8".to_string()))
    }

    /// Shape check only; does not verify the tag.
    pub fn is_encrypted(text: &str) -> bool {
        split_envelope(text).is_some()
    }

    /// Encrypts `value` unless it already is an envelope.
    pub fn seal(&self, value: &str) -> Result<String> {
        if value.is_empty() || Self::is_encrypted(value) {
            return Ok(value.to_string());
        }
        self.encrypt(value)
    }

    /// Decrypts an optional secret; an empty value stays empty.
    pub fn reveal(&self, value: &str) -> Result<String> {
        if value.is_empty() {
            return Ok(String::new());
        }
        self.decrypt(value)
    }

    pub fn encrypt_config(&self, config: &DestinationConfig) -> Result<String> {
        let json = serde_json::to_string(config)?;
        self.encrypt(&json)
    }

    pub fn decrypt_config(&self, envelope: &str) -> Result<DestinationConfig> {
        let json = self.decrypt(envelope)?;
        serde_json::from_str(&json)
            .map_err(|e| BackupError::Config(format!("invalid destination configuration: {}", e)))
    }
}

fn split_envelope(text: &str) -> Option<(Vec<u8>, Vec<u8>, Vec<u8>)> {
    let mut parts = text.split(':');
    let (iv, tag, data) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let iv = STANDARD.decode(iv).ok()?;
    let tag = STANDARD.decode(tag).ok()?;
    let data = STANDARD.decode(data).ok()?;
    if iv.len() != IV_LENGTH || tag.len() != TAG_LENGTH {
        return None;
    }
    Some((iv, tag, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LocalSettings;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn vault() -> CredentialVault {
        CredentialVault::from_hex(KEY).unwrap()
    }

    #[test]
    fn test_generated_key_is_usable() {
        let key = CredentialVault::generate_key_hex();
        assert_eq!(key.len(), 64);
        assert_ne!(key, CredentialVault::generate_key_hex());
        let vault = CredentialVault::from_hex(&key).unwrap();
        assert_eq!(vault.decrypt(&vault.encrypt("pw").unwrap()).unwrap(), "pw");
    }

    #[test]
    fn test_roundtrip() {
        let vault = vault();
        for plaintext in ["x", "s3cr3t-p@ss:word", "çãõ ünïcödé", &"long".repeat(500)] {
            let envelope = vault.encrypt(plaintext).unwrap();
            assert!(CredentialVault::is_encrypted(&envelope));
            assert_eq!(vault.decrypt(&envelope).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_empty_plaintext_rejected() {
        assert!(matches!(vault().encrypt(""), Err(BackupError::Config(_))));
    }

    #[test]
    fn test_envelope_uses_fresh_iv() {
        let vault = vault();
        assert_ne!(vault.encrypt("same").unwrap(), vault.encrypt("same").unwrap());
    }

    #[test]
    fn test_any_flipped_character_fails_integrity() {
        let vault = vault();
        let envelope = vault.encrypt("database password").unwrap();

        for i in 0..envelope.len() {
            let mut bytes = envelope.clone().into_bytes();
            bytes[i] = if bytes[i] == b'A' { b'B' } else { b'A' };
            let tampered = String::from_utf8(bytes).unwrap();
            assert!(
                matches!(vault.decrypt(&tampered), Err(BackupError::Integrity(_))),
                "tampering at position {} was not detected",
                i
            );
        }
    }

    #[test]
    fn test_any_flipped_ciphertext_byte_fails_integrity() {
        let vault = vault();
        let envelope = vault.encrypt("database password").unwrap();
        let (iv, tag, data) = split_envelope(&envelope).unwrap();

        for i in 0..data.len() {
            let mut data = data.clone();
            data[i] ^= 0x01;
            let tampered = [STANDARD.encode(&iv), STANDARD.encode(&tag), STANDARD.encode(&data)].join(":");
            assert!(matches!(vault.decrypt(&tampered), Err(BackupError::Integrity(_))));
        }
    }

    #[test]
    fn test_wrong_key_fails_integrity() {
        let envelope = vault().encrypt("secret").unwrap();
        let other = CredentialVault::from_bytes(&[7u8; 32]).unwrap();
        assert!(matches!(other.decrypt(&envelope), Err(BackupError::Integrity(_))));
    }

    #[test]
    fn test_key_length_is_a_config_error() {
        assert!(matches!(CredentialVault::from_hex("abcd"), Err(BackupError::Config(_))));
        let not_hex = "z".repeat(64);
        assert!(matches!(CredentialVault::from_hex(&not_hex), Err(BackupError::Config(_))));
        assert!(matches!(CredentialVault::from_bytes(&[0u8; 16]), Err(BackupError::Config(_))));
    }

    #[test]
    fn test_is_encrypted_rejects_plain_values() {
        assert!(!CredentialVault::is_encrypted("plain-password"));
        assert!(!CredentialVault::is_encrypted("a:b:c"));
        assert!(!CredentialVault::is_encrypted(""));
    }

    #[test]
    fn test_seal_does_not_double_encrypt() {
        let vault = vault();
        let sealed = vault.seal("secret").unwrap();
        assert_eq!(vault.seal(&sealed).unwrap(), sealed);
        assert_eq!(vault.seal("").unwrap(), "");
        assert_eq!(vault.reveal(&sealed).unwrap(), "secret");
    }

    #[test]
    fn test_config_roundtrip() {
        let vault = vault();
        let config = DestinationConfig::Local(LocalSettings {
            base_path: Some("/srv/backups".to_string()),
        });
        let envelope = vault.encrypt_config(&config).unwrap();
        assert_eq!(vault.decrypt_config(&envelope).unwrap(), config);
    }
}
