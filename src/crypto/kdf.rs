//! Key derivation for the handshake and the ratchet.
//!
//! HKDF-SHA256 mixes Diffie-Hellman outputs into the root key, and
//! HMAC-SHA256 advances the symmetric chains. The info strings are the ones
//! used by deployed OMEMO clients, so derived keys interoperate.

use crate::utils::{CryptoError, Result};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Info string for the X3DH secret
pub const X3DH_INFO: &[u8] = b"WhisperText";

/// Info string for root key ratchet steps
pub const ROOT_INFO: &[u8] = b"WhisperRatchet";

/// Info string for per-message cipher keys
pub const MESSAGE_KEY_INFO: &[u8] = b"WhisperMessageKeys";

/// Root key and chain key pair produced by a derivation
pub type KeyPairOutput = ([u8; 32], [u8; 32]);

fn hkdf_split(salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<KeyPairOutput> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; 64];
    hk.expand(info, &mut okm)
        .map_err(|e| CryptoError::KeyDerivation {
            reason: e.to_string(),
        })?;

    let mut first = [0u8; 32];
    let mut second = [0u8; 32];
    first.copy_from_slice(&okm[..32]);
    second.copy_from_slice(&okm[32..]);
    Ok((first, second))
}

/// Derive the initial root key and chain key from X3DH outputs
///
/// # Arguments
///
/// * `dh_outputs` - DH1..DH3 and optionally DH4, in protocol order
///
/// # Errors
///
/// Returns `CryptoError::KeyDerivation` if HKDF fails
pub fn derive_x3dh(dh_outputs: &[[u8; 32]]) -> Result<KeyPairOutput> {
    let mut ikm = Vec::with_capacity(32 * (dh_outputs.len() + 1));
    ikm.extend_from_slice(&[0xFF; 32]);
    for dh in dh_outputs {
        ikm.extend_from_slice(dh);
    }
    hkdf_split(&[0u8; 32], &ikm, X3DH_INFO)
}

/// Root KDF: mix a ratchet DH output into the root key
///
/// # Returns
///
/// The next root key and a fresh chain key
///
/// # Errors
///
/// Returns `CryptoError::KeyDerivation` if HKDF fails
pub fn kdf_rk(root_key: &[u8; 32], dh_output: &[u8; 32]) -> Result<KeyPairOutput> {
    hkdf_split(root_key, dh_output, ROOT_INFO)
}

/// Chain KDF: advance a chain key by one message
///
/// # Returns
///
/// The next chain key and the message key
///
/// # Errors
///
/// Returns `CryptoError::KeyDerivation` if the MAC cannot be keyed
pub fn kdf_ck(chain_key: &[u8; 32]) -> Result<KeyPairOutput> {
    let message_key = hmac(chain_key, &[0x01])?;
    let next_chain_key = hmac(chain_key, &[0x02])?;
    Ok((next_chain_key, message_key))
}

/// Expand a message key into the key used by the payload cipher
///
/// # Errors
///
/// Returns `CryptoError::KeyDerivation` if HKDF fails
pub fn message_cipher_key(message_key: &[u8; 32]) -> Result<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(&[0u8; 32]), message_key);
    let mut key = [0u8; 32];
    hk.expand(MESSAGE_KEY_INFO, &mut key)
        .map_err(|e| CryptoError::KeyDerivation {
            reason: e.to_string(),
        })?;
    Ok(key)
}

fn hmac(key: &[u8; 32], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|e| {
        CryptoError::KeyDerivation {
            reason: e.to_string(),
        }
    })?;
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}
