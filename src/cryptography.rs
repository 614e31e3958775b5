use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{KEY_SIZE, NONCE_SIZE};

/// Fixed, public salt mixed into code-derived keys.
///
/// The code itself is the only secret here. Six decimal digits carry about
/// 20 bits of entropy, so this scheme leans on the download rate limiter and
/// the short retention window rather than on the key being hard to guess.
/// The externally-keyed mode exists for anyone who needs real
/// confidentiality against the server operator.
pub const KEY_SALT: &[u8] = b"tcpraw-v1";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    Seal,
    #[error("decryption failed (wrong code/key or corrupted data)")]
    Open,
    #[error("nonce must be 12 bytes")]
    InvalidNonce,
    #[error("key must be 32 bytes given as 64 hex characters")]
    InvalidKey,
}

/// Derives the AES-256 key for a rendezvous code.
///
/// `key = SHA-256(code || salt)`. Both ends compute the same key from the
/// same six digits, so a blob uploaded with a code can be opened by anyone
/// who knows that code and nothing else.
pub fn derive_code_key(code: &str) -> [u8; KEY_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    hasher.update(KEY_SALT);
    hasher.finalize().into()
}

/// Generates a random 256-bit key for secure mode.
///
/// The key never travels to the server; the sender shows it as 64 hex
/// characters and the receiver types it back in.
pub fn generate_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

/// Parses a key the user typed or pasted: exactly 64 hex characters.
pub fn parse_key_hex(raw: &str) -> Result<[u8; KEY_SIZE], CryptoError> {
    let bytes = hex::decode(raw.trim()).map_err(|_| CryptoError::InvalidKey)?;
    bytes.try_into().map_err(|_| CryptoError::InvalidKey)
}

/// Encrypt one plaintext chunk with AES-256-GCM.
///
/// A fresh random 12-byte nonce is drawn from the OS RNG for every call, so
/// sealing the same chunk twice never reuses a nonce even across uploads
/// that share a key. The returned ciphertext carries its 16-byte
/// authentication tag appended.
///
/// # Arguments
/// * `key` - The 32-byte encryption key
/// * `plaintext` - The chunk to encrypt
///
/// # Returns
/// The nonce and the sealed bytes (length = plaintext.len() + 16)
pub fn seal_chunk(
    key: &[u8; KEY_SIZE],
    plaintext: &[u8],
) -> Result<([u8; NONCE_SIZE], Vec<u8>), CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let sealed = cipher.encrypt(&nonce, plaintext).map_err(|_| CryptoError::Seal)?;
    Ok((nonce.into(), sealed))
}

/// Decrypt one sealed chunk with AES-256-GCM.
///
/// Verifies the authentication tag before releasing any plaintext; a wrong
/// key, a wrong nonce, or a single flipped bit all fail the same way.
///
/// # Arguments
/// * `key` - The 32-byte decryption key
/// * `nonce` - The 12-byte nonce the chunk was sealed with
/// * `sealed` - Ciphertext with its authentication tag appended
///
/// # Returns
/// The decrypted plaintext, or [`CryptoError::Open`] on any authentication
/// failure
pub fn open_chunk(
    key: &[u8; KEY_SIZE],
    nonce: &[u8],
    sealed: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::InvalidNonce);
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| CryptoError::Open)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CHUNK_SIZE, TAG_SIZE};

    // ============================================================================
    // Seal/Open Round Trips
    // ============================================================================

    #[test]
    fn test_seal_open_round_trip() {
        let key = derive_code_key("482917");
        let plaintext = b"Hello, World! This is a test message.";

        let (nonce, sealed) = seal_chunk(&key, plaintext).expect("seal should succeed");
        assert_eq!(sealed.len(), plaintext.len() + TAG_SIZE);

        let opened = open_chunk(&key, &nonce, &sealed).expect("open should succeed");
        assert_eq!(&opened[..], plaintext);
    }

    #[test]
    fn test_open_with_wrong_key_fails() {
        let key = derive_code_key("111111");
        let other = derive_code_key("111112");
        let (nonce, sealed) = seal_chunk(&key, b"secret").unwrap();

        assert!(open_chunk(&other, &nonce, &sealed).is_err());
    }

    #[test]
    fn test_open_with_wrong_nonce_fails() {
        let key = derive_code_key("222222");
        let (mut nonce, sealed) = seal_chunk(&key, b"payload").unwrap();
        nonce[0] ^= 0x01;

        assert!(open_chunk(&key, &nonce, &sealed).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = derive_code_key("333333");
        let (nonce, mut sealed) = seal_chunk(&key, b"important data").unwrap();
        sealed[3] ^= 0xFF;

        assert!(open_chunk(&key, &nonce, &sealed).is_err());
    }

    #[test]
    fn test_tampered_tag_fails() {
        let key = derive_code_key("444444");
        let (nonce, mut sealed) = seal_chunk(&key, b"authenticated").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        assert!(open_chunk(&key, &nonce, &sealed).is_err());
    }

    #[test]
    fn test_truncated_ciphertext_fails() {
        let key = derive_code_key("555555");
        let (nonce, sealed) = seal_chunk(&key, b"data to be truncated").unwrap();

        assert!(open_chunk(&key, &nonce, &sealed[..sealed.len() - 5]).is_err());
    }

    #[test]
    fn test_bad_nonce_length_rejected() {
        let key = derive_code_key("666666");
        let (_, sealed) = seal_chunk(&key, b"x").unwrap();

        assert!(matches!(
            open_chunk(&key, &[0u8; 8], &sealed),
            Err(CryptoError::InvalidNonce)
        ));
    }

    // ============================================================================
    // Edge Cases
    // ============================================================================

    #[test]
    fn test_seal_empty_chunk() {
        let key = derive_code_key("000000");
        let (nonce, sealed) = seal_chunk(&key, b"").unwrap();
        assert_eq!(sealed.len(), TAG_SIZE);

        let opened = open_chunk(&key, &nonce, &sealed).unwrap();
        assert!(opened.is_empty());
    }

    #[test]
    fn test_seal_full_chunk() {
        let key = generate_key();
        let plaintext = vec![0xAA; CHUNK_SIZE];

        let (nonce, sealed) = seal_chunk(&key, &plaintext).unwrap();
        assert_eq!(sealed.len(), CHUNK_SIZE + TAG_SIZE);

        let opened = open_chunk(&key, &nonce, &sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_fresh_nonce_per_seal() {
        let key = derive_code_key("777777");
        let (nonce1, sealed1) = seal_chunk(&key, b"same plaintext").unwrap();
        let (nonce2, sealed2) = seal_chunk(&key, b"same plaintext").unwrap();

        assert_ne!(nonce1, nonce2, "nonces must be fresh per seal");
        assert_ne!(sealed1, sealed2);
    }

    // ============================================================================
    // Key Derivation
    // ============================================================================

    #[test]
    fn test_derive_code_key_deterministic() {
        assert_eq!(derive_code_key("482917"), derive_code_key("482917"));
    }

    #[test]
    fn test_derive_code_key_differs_per_code() {
        assert_ne!(derive_code_key("482917"), derive_code_key("482918"));
    }

    #[test]
    fn test_derive_code_key_matches_manual_hash() {
        let mut hasher = Sha256::new();
        hasher.update(b"123456");
        hasher.update(KEY_SALT);
        let expected: [u8; KEY_SIZE] = hasher.finalize().into();
        assert_eq!(derive_code_key("123456"), expected);
    }

    #[test]
    fn test_generated_keys_differ() {
        assert_ne!(generate_key(), generate_key());
    }

    #[test]
    fn test_key_hex_round_trip() {
        let key = generate_key();
        let parsed = parse_key_hex(&hex::encode(key)).unwrap();
        assert_eq!(parsed, key);
        // Whitespace from a copy-paste is tolerated.
        let parsed = parse_key_hex(&format!("  {}\n", hex::encode(key))).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_key_hex_rejects_bad_input() {
        assert!(parse_key_hex("").is_err());
        assert!(parse_key_hex("abcd").is_err());
        assert!(parse_key_hex(&"zz".repeat(32)).is_err());
        assert!(parse_key_hex(&"ab".repeat(33)).is_err());
    }
}
