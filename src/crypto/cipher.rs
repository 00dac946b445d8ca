//! Authenticated encryption at the edges of the ratchet.
//!
//! Two ciphers live here. [`PayloadCipher`] wraps a content key inside a
//! [`KeyMessage`](crate::session::KeyMessage) under a ratchet message key;
//! the default implementation is ChaCha20-Poly1305 with the nonce prefixed to
//! the ciphertext. The message body itself is sealed by
//! [`encrypt_payload`] with AES-128-GCM, where the 32-byte content key is the
//! 16-byte AES key followed by the 16-byte authentication tag and the body
//! carries no tag of its own.

use crate::utils::{CryptoError, Result};
use aes_gcm::Aes128Gcm;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::rngs::OsRng;
use rand_core::RngCore;
use std::fmt;

/// Nonce length for both AEADs
pub const NONCE_SIZE: usize = 12;

/// Authentication tag length for both AEADs
pub const TAG_SIZE: usize = 16;

/// Size of the message body content key (AES key || tag)
pub const PAYLOAD_KEY_SIZE: usize = 32;

const AES_KEY_SIZE: usize = 16;

/// Authenticated cipher used to transport content keys
///
/// Implementations are stateless; the ratchet supplies a fresh 32-byte key
/// for every message.
pub trait PayloadCipher {
    /// Encrypt `plaintext`, binding `associated_data`
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Encryption` or an entropy failure
    fn seal(key: &[u8; 32], associated_data: &[u8], plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt and authenticate a value produced by [`PayloadCipher::seal`]
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Decryption` if authentication fails
    fn open(key: &[u8; 32], associated_data: &[u8], sealed: &[u8]) -> Result<Vec<u8>>;
}

/// ChaCha20-Poly1305 with a random nonce prefixed to the ciphertext
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChaChaPolyCipher;

impl PayloadCipher for ChaChaPolyCipher {
    fn seal(key: &[u8; 32], associated_data: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(key.into());
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);

        let mut ciphertext = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: associated_data,
                },
            )
            .map_err(|_| CryptoError::Encryption {
                reason: "Key encryption failed".to_string(),
            })?;

        let mut result = nonce.to_vec();
        result.append(&mut ciphertext);
        Ok(result)
    }

    fn open(key: &[u8; 32], associated_data: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::Decryption {
                reason: "Ciphertext too short".to_string(),
            }
            .into());
        }

        let cipher = ChaCha20Poly1305::new(key.into());
        let nonce = Nonce::from_slice(&sealed[..NONCE_SIZE]);

        cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &sealed[NONCE_SIZE..],
                    aad: associated_data,
                },
            )
            .map_err(|_| {
                CryptoError::Decryption {
                    reason: "Key decryption failed".to_string(),
                }
                .into()
            })
    }
}

/// An encrypted message body
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    /// AES-128 key followed by the GCM tag; transported via the ratchet
    pub content_key: [u8; PAYLOAD_KEY_SIZE],
    /// GCM nonce, sent in the clear
    pub iv: [u8; NONCE_SIZE],
    /// Ciphertext without tag
    pub ciphertext: Vec<u8>,
}

impl fmt::Debug for EncryptedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedPayload")
            .field("content_key", &"[REDACTED]")
            .field("iv", &hex::encode(self.iv))
            .field("ciphertext_len", &self.ciphertext.len())
            .finish()
    }
}

/// Encrypt a message body with a fresh AES-128-GCM key
///
/// # Errors
///
/// Returns `CryptoError::EntropyFailure` if no key or nonce can be drawn
pub fn encrypt_payload(plaintext: &[u8]) -> Result<EncryptedPayload> {
    let mut key = [0u8; AES_KEY_SIZE];
    let mut iv = [0u8; NONCE_SIZE];
    OsRng.try_fill_bytes(&mut key)?;
    OsRng.try_fill_bytes(&mut iv)?;

    let cipher = Aes128Gcm::new((&key).into());
    let sealed = cipher
        .encrypt(aes_gcm::Nonce::from_slice(&iv), plaintext)
        .map_err(|_| CryptoError::Encryption {
            reason: "Payload encryption failed".to_string(),
        })?;

    let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_SIZE);
    let mut content_key = [0u8; PAYLOAD_KEY_SIZE];
    content_key[..AES_KEY_SIZE].copy_from_slice(&key);
    content_key[AES_KEY_SIZE..].copy_from_slice(tag);

    Ok(EncryptedPayload {
        content_key,
        iv,
        ciphertext: ciphertext.to_vec(),
    })
}

/// Decrypt a message body sealed by [`encrypt_payload`]
///
/// # Errors
///
/// Returns `CryptoError::InvalidKey` for a short content key and
/// `CryptoError::Decryption` if authentication fails
pub fn decrypt_payload(content_key: &[u8], iv: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if content_key.len() < PAYLOAD_KEY_SIZE {
        return Err(CryptoError::InvalidKey {
            reason: format!(
                "Content key too short: expected {}, got {}",
                PAYLOAD_KEY_SIZE,
                content_key.len()
            ),
        }
        .into());
    }

    let cipher = Aes128Gcm::new_from_slice(&content_key[..AES_KEY_SIZE]).map_err(|_| {
        CryptoError::InvalidKey {
            reason: "Invalid AES key".to_string(),
        }
    })?;

    let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_SIZE);
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(&content_key[AES_KEY_SIZE..PAYLOAD_KEY_SIZE]);

    cipher
        .decrypt(aes_gcm::Nonce::from_slice(iv), sealed.as_slice())
        .map_err(|_| {
            CryptoError::Decryption {
                reason: "Payload decryption failed".to_string(),
            }
            .into()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_and_open() {
        let key = [3u8; 32];
        let sealed = ChaChaPolyCipher::seal(&key, b"header", b"content key").unwrap();

        assert_eq!(sealed.len(), NONCE_SIZE + 11 + TAG_SIZE);
        let opened = ChaChaPolyCipher::open(&key, b"header", &sealed).unwrap();
        assert_eq!(opened, b"content key");
    }

    #[test]
    fn test_open_rejects_wrong_associated_data() {
        let key = [3u8; 32];
        let sealed = ChaChaPolyCipher::seal(&key, b"header", b"content key").unwrap();

        assert!(ChaChaPolyCipher::open(&key, b"other header", &sealed).is_err());
        assert!(ChaChaPolyCipher::open(&[4u8; 32], b"header", &sealed).is_err());
        assert!(ChaChaPolyCipher::open(&key, b"header", &sealed[..20]).is_err());
    }

    #[test]
    fn test_nonces_are_fresh() {
        let key = [3u8; 32];
        let a = ChaChaPolyCipher::seal(&key, b"", b"same").unwrap();
        let b = ChaChaPolyCipher::seal(&key, b"", b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_payload_key_packs_tag() {
        let encrypted = encrypt_payload(b"Hello").unwrap();

        assert_eq!(encrypted.ciphertext.len(), 5);
        let plain = decrypt_payload(&encrypted.content_key, &encrypted.iv, &encrypted.ciphertext).unwrap();
        assert_eq!(plain, b"Hello");
    }

    #[test]
    fn test_payload_tampering_detected() {
        let encrypted = encrypt_payload(b"Hello").unwrap();

        let mut ciphertext = encrypted.ciphertext.clone();
        ciphertext[0] ^= 1;
        assert!(decrypt_payload(&encrypted.content_key, &encrypted.iv, &ciphertext).is_err());

        let mut key = encrypted.content_key;
        key[31] ^= 1;
        assert!(decrypt_payload(&key, &encrypted.iv, &encrypted.ciphertext).is_err());

        assert!(decrypt_payload(&key[..16], &encrypted.iv, &encrypted.ciphertext).is_err());
    }
}
