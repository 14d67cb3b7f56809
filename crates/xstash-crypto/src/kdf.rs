//! Key derivation: PBKDF2-HMAC-SHA256 passphrase + group salt → group key

use std::num::NonZeroU32;

use rand::RngCore;
use ring::pbkdf2;
use secrecy::{ExposeSecret, SecretString};
use xstash_core::{StashError, StashResult};
use zeroize::Zeroize;

use crate::{KEY_SIZE, PBKDF2_ITERATIONS, SALT_SIZE};

/// A 256-bit key shared by one group of chunks, together with its salt.
///
/// Zeroized on drop to prevent secrets lingering in memory.
#[derive(Clone)]
pub struct GroupKey {
    salt: [u8; SALT_SIZE],
    bytes: [u8; KEY_SIZE],
}

impl GroupKey {
    /// Pick a fresh random salt and derive its key.
    pub fn generate(passphrase: &SecretString, params: &KdfParams) -> StashResult<Self> {
        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        derive_group_key(passphrase, &salt, params)
    }

    pub fn salt(&self) -> &[u8; SALT_SIZE] {
        &self.salt
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for GroupKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupKey")
            .field("salt", &hex::encode(self.salt))
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// PBKDF2 parameters
#[derive(Debug, Clone)]
pub struct KdfParams {
    /// HMAC-SHA256 rounds (default: 10 000)
    pub iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: PBKDF2_ITERATIONS,
        }
    }
}

/// Derive the group key for `salt`. Same passphrase and salt always give
/// the same key.
pub fn derive_group_key(
    passphrase: &SecretString,
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> StashResult<GroupKey> {
    let iterations = NonZeroU32::new(params.iterations)
        .ok_or_else(|| StashError::Config("PBKDF2 iterations must be at least 1".into()))?;

    let mut bytes = [0u8; KEY_SIZE];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        passphrase.expose_secret().as_bytes(),
        &mut bytes,
    );

    Ok(GroupKey { salt: *salt, bytes })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> KdfParams {
        KdfParams { iterations: 16 }
    }

    #[test]
    fn test_kdf_deterministic() {
        let passphrase = SecretString::from("test-passphrase-123");
        let salt = [1u8; SALT_SIZE];

        let key1 = derive_group_key(&passphrase, &salt, &fast()).unwrap();
        let key2 = derive_group_key(&passphrase, &salt, &fast()).unwrap();

        assert_eq!(
            key1.as_bytes(),
            key2.as_bytes(),
            "KDF must be deterministic"
        );
    }

    #[test]
    fn test_kdf_different_passphrases() {
        let salt = [1u8; SALT_SIZE];
        let key1 = derive_group_key(&SecretString::from("alpha"), &salt, &fast()).unwrap();
        let key2 = derive_group_key(&SecretString::from("beta"), &salt, &fast()).unwrap();
        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_kdf_different_salts() {
        let passphrase = SecretString::from("alpha");
        let key1 = derive_group_key(&passphrase, &[1u8; SALT_SIZE], &fast()).unwrap();
        let key2 = derive_group_key(&passphrase, &[2u8; SALT_SIZE], &fast()).unwrap();
        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_known_vector() {
        // PBKDF2-HMAC-SHA256("password", "salt", c=1, dkLen=32)
        let mut out = [0u8; KEY_SIZE];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            NonZeroU32::new(1).unwrap(),
            b"salt",
            b"password",
            &mut out,
        );
        assert_eq!(
            hex::encode(out),
            "120fb6cffcf8b32c43e7225256c4f837a86548c92ccc35480805987cb70be17b"
        );
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let err = derive_group_key(
            &SecretString::from("x"),
            &[0u8; SALT_SIZE],
            &KdfParams { iterations: 0 },
        )
        .unwrap_err();
        assert!(matches!(err, StashError::Config(_)));
    }

    #[test]
    fn test_generate_uses_fresh_salt() {
        let passphrase = SecretString::from("alpha");
        let a = GroupKey::generate(&passphrase, &fast()).unwrap();
        let b = GroupKey::generate(&passphrase, &fast()).unwrap();
        assert_ne!(a.salt(), b.salt());
        let again = derive_group_key(&passphrase, a.salt(), &fast()).unwrap();
        assert_eq!(again.as_bytes(), a.as_bytes());
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = derive_group_key(&SecretString::from("x"), &[0u8; SALT_SIZE], &fast()).unwrap();
        let rendered = format!("{key:?}");
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains(&hex::encode(key.as_bytes())));
    }
}
