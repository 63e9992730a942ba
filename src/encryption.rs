//! At-rest sealing of the persisted license cache.
//!
//! AES-256-GCM under a key derived from the device id. A sealed payload is
//! `base64([nonce (12 bytes)] || [ciphertext+tag])`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};

use rand::rngs::OsRng;
use rand::TryRngCore;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;

use ring::digest::{digest, SHA256};

use crate::errors::{LicenseError, LicenseResult};

/// AES-256 key size in bytes.
pub const KEY_SIZE: usize = 32;

/// GCM nonce size in bytes (96-bit).
pub const NONCE_SIZE: usize = 12;

/// Salt that separates cache keys from any other use of the device id.
const CACHE_KEY_SALT: &str = "tillgate_cache_v1:";

/// Generate a new random 256-bit key.
pub fn generate_key() -> LicenseResult<[u8; KEY_SIZE]> {
    let mut key = [0u8; KEY_SIZE];
    OsRng
        .try_fill_bytes(&mut key)
        .map_err(|e| LicenseError::EncryptionError(format!("OS random source failed: {e}")))?;
    Ok(key)
}

/// Seals and opens cache payloads with one fixed key.
#[derive(Clone)]
pub struct Sealer {
    key: [u8; KEY_SIZE],
}

impl std::fmt::Debug for Sealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sealer").finish_non_exhaustive()
    }
}

impl Sealer {
    pub fn from_key(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Derive the sealing key from the installation's device id.
    ///
    /// The key never leaves the machine and changes with the device, so a
    /// cache copied elsewhere fails to open.
    pub fn for_device(device_id: &str) -> Self {
        let salted = format!("{CACHE_KEY_SALT}{device_id}");
        let hash = digest(&SHA256, salted.as_bytes());

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(hash.as_ref());
        Self { key }
    }

    /// Encrypt `plaintext` and return the Base64 envelope.
    pub fn seal(&self, plaintext: &[u8]) -> LicenseResult<String> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng
            .try_fill_bytes(&mut nonce_bytes)
            .map_err(|e| LicenseError::EncryptionError(format!("OS random source failed: {e}")))?;

        let mut ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| LicenseError::EncryptionError(format!("encryption failed: {e}")))?;

        let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        output.extend_from_slice(&nonce_bytes);
        output.append(&mut ciphertext);

        Ok(B64.encode(output))
    }

    /// Decrypt an envelope produced by [`Sealer::seal`].
    pub fn open(&self, sealed: &str) -> LicenseResult<Vec<u8>> {
        let decoded = B64
            .decode(sealed.trim())
            .map_err(|e| LicenseError::DecryptionError(format!("base64 decode failed: {e}")))?;

        if decoded.len() <= NONCE_SIZE {
            return Err(LicenseError::DecryptionError(
                "sealed payload too short".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = decoded.split_at(NONCE_SIZE);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));

        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| LicenseError::DecryptionError(format!("decryption failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open() {
        let sealer = Sealer::for_device("register-01");
        let sealed = sealer.seal(b"cached license").expect("seal should succeed");
        assert!(!sealed.contains("cached license"));

        let opened = sealer.open(&sealed).expect("open should succeed");
        assert_eq!(opened, b"cached license");
    }

    #[test]
    fn other_device_cannot_open() {
        let sealed = Sealer::for_device("register-01")
            .seal(b"cached license")
            .unwrap();
        let result = Sealer::for_device("register-02").open(&sealed);
        assert!(matches!(result, Err(LicenseError::DecryptionError(_))));
    }

    #[test]
    fn tampered_payload_fails() {
        let sealer = Sealer::from_key(generate_key().unwrap());
        let sealed = sealer.seal(b"{\"licenseType\":\"premium\"}").unwrap();

        let mut raw = B64.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;

        assert!(sealer.open(&B64.encode(raw)).is_err());
    }

    #[test]
    fn short_payload_is_rejected() {
        let sealer = Sealer::for_device("register-01");
        assert!(sealer.open(&B64.encode([0u8; NONCE_SIZE])).is_err());
        assert!(sealer.open("not base64 !!").is_err());
    }

    #[test]
    fn debug_output_hides_key() {
        let rendered = format!("{:?}", Sealer::from_key([7u8; KEY_SIZE]));
        assert!(!rendered.contains('7'));
    }
}
