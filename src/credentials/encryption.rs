//! AES-256-GCM encryption for credential blobs.
//!
//! The key is derived once from the master secret with PBKDF2-HMAC-SHA256. Each
//! blob carries its own random 128-bit IV, the 128-bit authentication tag, and a
//! key-version tag identifying the derived key it was sealed with.
//!
//! Blob format: `base64(iv):base64(ciphertext):base64(tag):key_version`

use aes_gcm::{
    aead::{consts::U16, Aead, AeadCore, KeyInit, OsRng},
    aes::Aes256,
    AesGcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};

use crate::error::{ConnectorError, Result};

/// AES-256-GCM with a 16-byte IV (interoperable with stored blobs).
pub(crate) type Cipher = AesGcm<Aes256, U16>;

/// Size of the derived key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the IV in bytes (128 bits)
pub const IV_SIZE: usize = 16;

/// Size of the authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Minimum PBKDF2 iteration count accepted for key derivation.
pub const MIN_ITERATIONS: u32 = 100_000;

/// Number of colon-separated segments in a blob.
const SEGMENTS: usize = 4;

/// Derives the 256-bit vault key from the master secret.
///
/// # Arguments
/// * `master_secret` - Externally supplied deployment secret
/// * `salt` - Fixed application salt (not secret)
/// * `iterations` - PBKDF2 rounds, at least [`MIN_ITERATIONS`]
pub fn derive_key(master_secret: &str, salt: &str, iterations: u32) -> Result<[u8; KEY_SIZE]> {
    if master_secret.is_empty() {
        return Err(ConnectorError::Validation(
            "master secret must not be empty".to_string(),
        ));
    }
    if iterations < MIN_ITERATIONS {
        return Err(ConnectorError::Validation(format!(
            "key derivation requires at least {} iterations, got {}",
            MIN_ITERATIONS, iterations
        )));
    }

    let mut key = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(master_secret.as_bytes(), salt.as_bytes(), iterations, &mut key);
    Ok(key)
}

/// Computes the key-version tag for a derived key.
///
/// The tag is the base64 of the first 8 bytes of SHA-256(key): it identifies the
/// key without revealing it.
pub fn key_version(key: &[u8; KEY_SIZE]) -> String {
    let digest = Sha256::digest(key);
    BASE64.encode(&digest[..8])
}

/// Builds the cipher for a derived key.
pub(crate) fn cipher_for(key: &[u8; KEY_SIZE]) -> Result<Cipher> {
    Cipher::new_from_slice(key)
        .map_err(|e| ConnectorError::EncryptionFailed(format!("Failed to create cipher: {}", e)))
}

/// Encrypts plaintext into a blob with a fresh random IV.
///
/// # Security
/// - A cryptographically secure random IV is generated per call (never reused)
/// - Authenticated encryption (tampering detected on decrypt)
pub(crate) fn seal(cipher: &Cipher, version: &str, plaintext: &[u8]) -> Result<String> {
    let iv = Cipher::generate_nonce(&mut OsRng);

    let sealed = cipher
        .encrypt(&iv, plaintext)
        .map_err(|e| ConnectorError::EncryptionFailed(format!("Encryption failed: {}", e)))?;

    // aes-gcm appends the tag to the ciphertext
    let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_SIZE);

    Ok(format!(
        "{}:{}:{}:{}",
        BASE64.encode(iv),
        BASE64.encode(ciphertext),
        BASE64.encode(tag),
        version
    ))
}

/// Decrypts a blob produced by [`seal`].
///
/// Fails closed with `DecryptionFailed` on a malformed blob, an unknown key
/// version, or a failed authentication tag. No partial plaintext is returned.
pub(crate) fn open(cipher: &Cipher, version: &str, blob: &str) -> Result<Vec<u8>> {
    let segments: Vec<&str> = blob.split(':').collect();
    if segments.len() != SEGMENTS {
        return Err(ConnectorError::DecryptionFailed(format!(
            "malformed blob: expected {} segments, got {}",
            SEGMENTS,
            segments.len()
        )));
    }

    if segments[3] != version {
        return Err(ConnectorError::DecryptionFailed(
            "unrecognized key version".to_string(),
        ));
    }

    let iv = decode_segment(segments[0], "iv")?;
    let ciphertext = decode_segment(segments[1], "ciphertext")?;
    let tag = decode_segment(segments[2], "tag")?;

    if iv.len() != IV_SIZE {
        return Err(ConnectorError::DecryptionFailed(format!(
            "invalid iv size: expected {}, got {}",
            IV_SIZE,
            iv.len()
        )));
    }
    if tag.len() != TAG_SIZE {
        return Err(ConnectorError::DecryptionFailed(format!(
            "invalid tag size: expected {}, got {}",
            TAG_SIZE,
            tag.len()
        )));
    }

    let mut sealed = ciphertext;
    sealed.extend_from_slice(&tag);

    cipher
        .decrypt(Nonce::<U16>::from_slice(&iv), sealed.as_ref())
        .map_err(|_| {
            ConnectorError::DecryptionFailed(
                "authentication failed (wrong key or tampered data)".to_string(),
            )
        })
}

fn decode_segment(segment: &str, name: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(segment)
        .map_err(|_| ConnectorError::DecryptionFailed(format!("invalid base64 in {} segment", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> (Cipher, String) {
        let key = [7u8; KEY_SIZE];
        (cipher_for(&key).unwrap(), key_version(&key))
    }

    #[test]
    fn test_blob_has_four_segments() {
        let (cipher, version) = test_cipher();
        let blob = seal(&cipher, &version, b"secret").unwrap();

        let segments: Vec<&str> = blob.split(':').collect();
        assert_eq!(segments.len(), 4);
        assert_eq!(BASE64.decode(segments[0]).unwrap().len(), IV_SIZE);
        assert_eq!(BASE64.decode(segments[1]).unwrap().len(), 6);
        assert_eq!(BASE64.decode(segments[2]).unwrap().len(), TAG_SIZE);
        assert_eq!(segments[3], version);
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let (cipher, version) = test_cipher();
        let blob = seal(&cipher, &version, b"my-secret-access-token-12345").unwrap();
        let plaintext = open(&cipher, &version, &blob).unwrap();
        assert_eq!(plaintext, b"my-secret-access-token-12345");
    }

    #[test]
    fn test_empty_plaintext() {
        let (cipher, version) = test_cipher();
        let blob = seal(&cipher, &version, b"").unwrap();
        assert!(open(&cipher, &version, &blob).unwrap().is_empty());
    }

    #[test]
    fn test_wrong_key_fails() {
        let (cipher, version) = test_cipher();
        let blob = seal(&cipher, &version, b"secret").unwrap();

        // Same version string, different key: the tag check must catch it
        let other = cipher_for(&[8u8; KEY_SIZE]).unwrap();
        let err = open(&other, &version, &blob).unwrap_err();
        assert!(matches!(err, ConnectorError::DecryptionFailed(_)));
    }

    #[test]
    fn test_unknown_version_fails() {
        let (cipher, version) = test_cipher();
        let blob = seal(&cipher, &version, b"secret").unwrap();
        let err = open(&cipher, "AAAAAAAAAAA=", &blob).unwrap_err();
        assert!(matches!(err, ConnectorError::DecryptionFailed(_)));
    }

    #[test]
    fn test_malformed_segments_fail() {
        let (cipher, version) = test_cipher();
        for blob in ["", "abc", "a:b:c", "a:b:c:d:e"] {
            let err = open(&cipher, &version, blob).unwrap_err();
            assert!(matches!(err, ConnectorError::DecryptionFailed(_)), "{}", blob);
        }
    }

    #[test]
    fn test_invalid_base64_fails() {
        let (cipher, version) = test_cipher();
        let blob = format!("!!!:AAAA:AAAA:{}", version);
        let err = open(&cipher, &version, &blob).unwrap_err();
        assert!(matches!(err, ConnectorError::DecryptionFailed(_)));
    }

    #[test]
    fn test_derive_key_deterministic() {
        let a = derive_key("deployment-secret", "salt", MIN_ITERATIONS).unwrap();
        let b = derive_key("deployment-secret", "salt", MIN_ITERATIONS).unwrap();
        let c = derive_key("other-secret", "salt", MIN_ITERATIONS).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(key_version(&a), key_version(&b));
        assert_ne!(key_version(&a), key_version(&c));
    }

    #[test]
    fn test_derive_key_rejects_weak_params() {
        assert!(derive_key("", "salt", MIN_ITERATIONS).is_err());
        assert!(derive_key("secret", "salt", 1_000).is_err());
    }
}
