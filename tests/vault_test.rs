// Integration tests for the secret vault blob format and its failure modes.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use conduit::config::VaultConfig;
use conduit::credentials::{mask, SecretVault, IV_SIZE, KEY_SIZE, TAG_SIZE};
use conduit::ConnectorError;
use serde_json::json;
use std::collections::HashSet;

fn vault() -> SecretVault {
    SecretVault::from_key([7u8; KEY_SIZE]).unwrap()
}

/// Flips the lowest bit of the first byte of segment `idx`.
fn flip_bit(blob: &str, idx: usize) -> String {
    let mut parts: Vec<String> = blob.split(':').map(str::to_string).collect();
    let mut bytes = BASE64.decode(&parts[idx]).unwrap();
    bytes[0] ^= 0x01;
    parts[idx] = BASE64.encode(bytes);
    parts.join(":")
}

#[test]
fn test_roundtrip_with_derived_key() {
    let vault = SecretVault::new("deployment-master-secret").unwrap();
    let blob = vault.encrypt("postgres://app:hunter2@db/sales").unwrap();
    assert_eq!(vault.decrypt(&blob).unwrap(), "postgres://app:hunter2@db/sales");

    // Same secret and salt derive the same key
    let again = SecretVault::new("deployment-master-secret").unwrap();
    assert_eq!(again.key_version(), vault.key_version());
    assert_eq!(again.decrypt(&blob).unwrap(), "postgres://app:hunter2@db/sales");
}

#[test]
fn test_blob_layout() {
    let vault = vault();
    let blob = vault.encrypt("secret").unwrap();
    let parts: Vec<&str> = blob.split(':').collect();
    assert_eq!(parts.len(), 4);
    assert_eq!(BASE64.decode(parts[0]).unwrap().len(), IV_SIZE);
    assert_eq!(BASE64.decode(parts[1]).unwrap().len(), "secret".len());
    assert_eq!(BASE64.decode(parts[2]).unwrap().len(), TAG_SIZE);
    assert_eq!(parts[3], vault.key_version());
    assert!(!blob.contains("secret"));
}

#[test]
fn test_tampered_ciphertext_or_tag_fails_closed() {
    let vault = vault();
    let blob = vault.encrypt("api-key-0123456789").unwrap();

    for segment in [1, 2] {
        let tampered = flip_bit(&blob, segment);
        assert!(matches!(
            vault.decrypt(&tampered),
            Err(ConnectorError::DecryptionFailed(_))
        ));
    }
}

#[test]
fn test_malformed_blobs_rejected() {
    let vault = vault();
    let blob = vault.encrypt("x").unwrap();
    let (head, _) = blob.rsplit_once(':').unwrap();

    let cases = vec![
        head.to_string(),
        format!("{}:extra", blob),
        format!("{}:not-the-key", head),
        "!!!:!!!:!!!:v1".to_string(),
        String::new(),
    ];
    for case in cases {
        assert!(
            matches!(vault.decrypt(&case), Err(ConnectorError::DecryptionFailed(_))),
            "accepted {:?}",
            case
        );
    }
}

#[test]
fn test_foreign_key_rejected() {
    let blob = vault().encrypt("x").unwrap();
    let other = SecretVault::from_key([8u8; KEY_SIZE]).unwrap();
    assert!(matches!(
        other.decrypt(&blob),
        Err(ConnectorError::DecryptionFailed(_))
    ));
}

#[test]
fn test_iv_unique_across_10k_encryptions() {
    let vault = vault();
    let mut ivs = HashSet::new();
    for _ in 0..10_000 {
        let blob = vault.encrypt("same plaintext").unwrap();
        let iv = blob.split(':').next().unwrap().to_string();
        ivs.insert(iv);
    }
    assert_eq!(ivs.len(), 10_000);
}

#[test]
fn test_structured_credentials() {
    let vault = vault();
    let creds = json!({"username": "app", "password": "p@ss:word"});
    let blob = vault.encrypt_structured(&creds).unwrap();
    let back: serde_json::Value = vault.decrypt_structured(&blob).unwrap();
    assert_eq!(back, creds);
}

#[test]
fn test_weak_derivation_settings_rejected() {
    let config = VaultConfig {
        iterations: 1_000,
        ..VaultConfig::default()
    };
    assert!(matches!(
        SecretVault::with_config("secret", &config),
        Err(ConnectorError::Validation(_))
    ));
    assert!(SecretVault::new("").is_err());
}

#[test]
fn test_mask_live_key() {
    let masked = mask("sk_live_abcdef123456", 4);
    assert!(masked.starts_with("sk_l"));
    assert!(masked.ends_with("3456"));
    assert!(masked[4..masked.len() - 4].chars().all(|c| c == '*'));
    assert_eq!(masked.len(), mask("sk_live_abcdef1234567890abcdef", 4).len());
}
