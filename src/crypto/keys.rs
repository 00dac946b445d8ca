//! Curve25519 key material and XEdDSA signatures.
//!
//! A single X25519 keypair type backs identities, signed prekeys, one-time
//! prekeys and ratchet keys. Identity keys sign with XEdDSA so that the same
//! key can take part in Diffie-Hellman and produce signatures. On the wire a
//! public key always carries a one-byte type tag.

use crate::utils::codec::fixed_array;
use crate::utils::{CryptoError, OmemoError, Result};
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use xeddsa::{xed25519, Sign, Verify};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Type tag prefixed to serialized Curve25519 public keys
pub const KEY_TYPE_DJB: u8 = 0x05;

/// Length of a raw key
pub const KEY_LENGTH: usize = 32;

/// Length of a tagged public key
pub const SERIALIZED_KEY_LENGTH: usize = KEY_LENGTH + 1;

/// Length of an XEdDSA signature
pub const SIGNATURE_LENGTH: usize = 64;

/// Curve25519 public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Zeroize)]
pub struct PublicKey([u8; KEY_LENGTH]);

impl PublicKey {
    /// Wrap raw key bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes without the type tag
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    /// Serialize as `0x05 || key`
    #[must_use]
    pub fn serialize(&self) -> [u8; SERIALIZED_KEY_LENGTH] {
        let mut out = [0u8; SERIALIZED_KEY_LENGTH];
        out[0] = KEY_TYPE_DJB;
        out[1..].copy_from_slice(&self.0);
        out
    }

    /// Parse a tagged public key
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` on a wrong length or unknown type tag
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SERIALIZED_KEY_LENGTH {
            return Err(CryptoError::InvalidKey {
                reason: format!(
                    "Invalid public key length: expected {}, got {}",
                    SERIALIZED_KEY_LENGTH,
                    bytes.len()
                ),
            }
            .into());
        }

        if bytes[0] != KEY_TYPE_DJB {
            return Err(CryptoError::InvalidKey {
                reason: format!("Unknown key type: {:#04x}", bytes[0]),
            }
            .into());
        }

        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&bytes[1..]);
        Ok(Self(key))
    }

    /// Verify an XEdDSA signature made by the owner of this key
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::BadSignature` if verification fails
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let verify_key = xed25519::PublicKey::from(&X25519Public::from(self.0));
        verify_key
            .verify(message, &signature.0)
            .map_err(|_| CryptoError::BadSignature.into())
    }

    pub(crate) fn to_dalek(self) -> X25519Public {
        X25519Public::from(self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        fixed_array::serialize(&self.serialize(), serializer)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let bytes: [u8; SERIALIZED_KEY_LENGTH] = fixed_array::deserialize(deserializer)?;
        Self::deserialize(&bytes).map_err(serde::de::Error::custom)
    }
}

/// XEdDSA signature
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "fixed_array")] [u8; SIGNATURE_LENGTH]);

impl Signature {
    /// Wrap raw signature bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; SIGNATURE_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Raw signature bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(self.0))
    }
}

/// Curve25519 keypair
///
/// The private half is clamped at generation and wiped on drop. A keypair
/// with both halves zero marks an empty slot (see [`KeyPair::empty`]).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyPair {
    private: [u8; KEY_LENGTH],
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh keypair
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EntropyFailure` if the randomness source fails
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Result<Self> {
        let mut private = [0u8; KEY_LENGTH];
        rng.try_fill_bytes(&mut private)?;
        let keypair = Self::from_private(private);
        private.zeroize();
        Ok(keypair)
    }

    /// Rebuild a keypair from its private half
    #[must_use]
    pub fn from_private(mut private: [u8; KEY_LENGTH]) -> Self {
        clamp(&mut private);
        let secret = StaticSecret::from(private);
        let public = PublicKey(X25519Public::from(&secret).to_bytes());
        Self { private, public }
    }

    /// All-zero placeholder for consumed prekey slots
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            private: [0u8; KEY_LENGTH],
            public: PublicKey([0u8; KEY_LENGTH]),
        }
    }

    /// True for the placeholder returned by [`KeyPair::empty`]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.private == [0u8; KEY_LENGTH] && self.public.0 == [0u8; KEY_LENGTH]
    }

    /// True if the public half matches the private half
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let secret = StaticSecret::from(self.private);
        X25519Public::from(&secret).to_bytes() == self.public.0
    }

    /// Public half
    #[must_use]
    pub const fn public(&self) -> &PublicKey {
        &self.public
    }

    /// Raw private half
    #[must_use]
    pub const fn private_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.private
    }

    /// X25519 agreement with a peer public key
    ///
    /// # Errors
    ///
    /// Returns a protocol violation if the peer key yields a non-contributory
    /// (all-zero) shared secret
    pub fn diffie_hellman(&self, their_public: &PublicKey) -> Result<[u8; KEY_LENGTH]> {
        let secret = StaticSecret::from(self.private);
        let shared = secret.diffie_hellman(&their_public.to_dalek());
        if !shared.was_contributory() {
            return Err(OmemoError::violation(
                "non-contributory Diffie-Hellman output",
            ));
        }
        Ok(shared.to_bytes())
    }

    /// Produce an XEdDSA signature with this key
    pub fn sign<R: RngCore + CryptoRng>(&self, message: &[u8], rng: &mut R) -> Signature {
        let signing_key = xed25519::PrivateKey::from(&StaticSecret::from(self.private));
        let signature: [u8; SIGNATURE_LENGTH] = signing_key.sign(message, &mut *rng);
        Signature(signature)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("private", &"[REDACTED]")
            .field("public", &self.public)
            .finish()
    }
}

fn clamp(private: &mut [u8; KEY_LENGTH]) {
    private[0] &= 248;
    private[31] &= 127;
    private[31] |= 64;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn test_keypair_generation() {
        let a = KeyPair::generate(&mut OsRng).unwrap();
        let b = KeyPair::generate(&mut OsRng).unwrap();

        assert_ne!(a.public(), b.public());
        assert!(a.is_consistent());
        assert!(!a.is_empty());
        assert_eq!(a.private_bytes()[0] & 7, 0);
    }

    #[test]
    fn test_from_private_is_deterministic() {
        let a = KeyPair::generate(&mut OsRng).unwrap();
        let b = KeyPair::from_private(*a.private_bytes());
        assert_eq!(a, b);
    }

    #[test]
    fn test_diffie_hellman_agreement() {
        let a = KeyPair::generate(&mut OsRng).unwrap();
        let b = KeyPair::generate(&mut OsRng).unwrap();

        let ab = a.diffie_hellman(b.public()).unwrap();
        let ba = b.diffie_hellman(a.public()).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_low_order_point_rejected() {
        let a = KeyPair::generate(&mut OsRng).unwrap();
        let zero = PublicKey::from_bytes([0u8; KEY_LENGTH]);
        let err = a.diffie_hellman(&zero).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ProtocolViolation);
    }

    #[test]
    fn test_sign_and_verify() {
        let identity = KeyPair::generate(&mut OsRng).unwrap();
        let message = b"signed prekey bytes";

        let signature = identity.sign(message, &mut OsRng);
        assert!(identity.public().verify(message, &signature).is_ok());

        let err = identity.public().verify(b"other", &signature).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::BadSignature);
    }

    #[test]
    fn test_tagged_serialization() {
        let key = *KeyPair::generate(&mut OsRng).unwrap().public();
        let bytes = key.serialize();

        assert_eq!(bytes[0], KEY_TYPE_DJB);
        assert_eq!(PublicKey::deserialize(&bytes).unwrap(), key);

        let mut wrong_tag = bytes;
        wrong_tag[0] = 0x06;
        assert!(PublicKey::deserialize(&wrong_tag).is_err());
        assert!(PublicKey::deserialize(&bytes[..32]).is_err());
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let keypair = KeyPair::generate(&mut OsRng).unwrap();
        let debug = format!("{keypair:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains(&hex::encode(keypair.private_bytes())));
    }
}
