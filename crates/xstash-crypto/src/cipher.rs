//! Per-chunk AES-256-GCM with a 128-bit IV and a detached tag
//!
//! Chunk files hold the raw ciphertext only:
//! ```text
//! [N bytes: ciphertext]        (same length as the plaintext)
//! iv (16 bytes) and tag (16 bytes) are recorded in the manifest
//! ```

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce, Tag};
use rand::RngCore;
use xstash_core::{StashError, StashResult};

use crate::kdf::GroupKey;
use crate::{IV_SIZE, TAG_SIZE};

/// AES-256-GCM instantiated with a 16-byte nonce.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

pub fn generate_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

/// Encrypt `data` in place and return the authentication tag.
pub fn encrypt_chunk(
    key: &GroupKey,
    iv: &[u8; IV_SIZE],
    data: &mut [u8],
) -> StashResult<[u8; TAG_SIZE]> {
    let cipher = Aes256Gcm16::new_from_slice(key.as_bytes())
        .map_err(|e| StashError::Crypto(format!("invalid chunk key: {e}")))?;
    let tag = cipher
        .encrypt_in_place_detached(Nonce::<U16>::from_slice(iv), b"", data)
        .map_err(|e| StashError::Crypto(format!("chunk encryption failed: {e}")))?;
    let mut out = [0u8; TAG_SIZE];
    out.copy_from_slice(&tag);
    Ok(out)
}

/// Decrypt `data` in place, verifying `tag`.
///
/// On failure `data` is left unspecified and must not be used.
pub fn decrypt_chunk(
    key: &GroupKey,
    iv: &[u8; IV_SIZE],
    tag: &[u8; TAG_SIZE],
    data: &mut [u8],
) -> Result<(), aes_gcm::Error> {
    let cipher = Aes256Gcm16::new_from_slice(key.as_bytes()).map_err(|_| aes_gcm::Error)?;
    cipher.decrypt_in_place_detached(
        Nonce::<U16>::from_slice(iv),
        b"",
        data,
        Tag::<U16>::from_slice(tag),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::{derive_group_key, KdfParams};
    use crate::SALT_SIZE;
    use secrecy::SecretString;

    fn key(passphrase: &str) -> GroupKey {
        derive_group_key(
            &SecretString::from(passphrase),
            &[7u8; SALT_SIZE],
            &KdfParams { iterations: 16 },
        )
        .unwrap()
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = key("p");
        let iv = generate_iv();
        let plaintext = b"Hello, stash! This is a test chunk.".to_vec();

        let mut data = plaintext.clone();
        let tag = encrypt_chunk(&key, &iv, &mut data).unwrap();
        assert_eq!(data.len(), plaintext.len(), "GCM must not change the length");
        assert_ne!(data, plaintext);

        decrypt_chunk(&key, &iv, &tag, &mut data).unwrap();
        assert_eq!(data, plaintext);
    }

    #[test]
    fn test_decrypt_wrong_key() {
        let iv = generate_iv();
        let mut data = b"secret data".to_vec();
        let tag = encrypt_chunk(&key("right"), &iv, &mut data).unwrap();
        assert!(decrypt_chunk(&key("wrong"), &iv, &tag, &mut data).is_err());
    }

    #[test]
    fn test_decrypt_wrong_iv() {
        let key = key("p");
        let iv = generate_iv();
        let mut data = b"secret data".to_vec();
        let tag = encrypt_chunk(&key, &iv, &mut data).unwrap();
        let mut other = iv;
        other[0] ^= 0x01;
        assert!(decrypt_chunk(&key, &other, &tag, &mut data).is_err());
    }

    #[test]
    fn test_tampered_ciphertext() {
        let key = key("p");
        let iv = generate_iv();
        let mut data = b"tamper test data here".to_vec();
        let tag = encrypt_chunk(&key, &iv, &mut data).unwrap();
        data[5] ^= 0xFF;
        assert!(decrypt_chunk(&key, &iv, &tag, &mut data).is_err());
    }

    #[test]
    fn test_tampered_tag() {
        let key = key("p");
        let iv = generate_iv();
        let mut data = b"tamper test data here".to_vec();
        let mut tag = encrypt_chunk(&key, &iv, &mut data).unwrap();
        tag[15] ^= 0x80;
        assert!(decrypt_chunk(&key, &iv, &tag, &mut data).is_err());
    }

    #[test]
    fn test_empty_chunk() {
        let key = key("p");
        let iv = generate_iv();
        let mut data = Vec::new();
        let tag = encrypt_chunk(&key, &iv, &mut data).unwrap();
        decrypt_chunk(&key, &iv, &tag, &mut data).unwrap();
        assert!(data.is_empty());
    }
}
