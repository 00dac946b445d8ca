//! Signed and one-time prekeys and the publishable bundle.
//!
//! Prekeys let a peer start a session while this device is offline. The
//! signed prekey is medium-term and authenticated by the identity key; the
//! one-time prekeys are each used by at most one handshake. A [`Bundle`] is
//! the public projection a peer fetches to run the initiator side of X3DH.

use crate::crypto::{KeyPair, PublicKey, Signature};
use crate::utils::{codec, Result};
use rand::seq::SliceRandom;
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

/// Identifier of a consumed one-time prekey slot
pub const CONSUMED_PREKEY_ID: u32 = 0;

/// A one-time prekey for X3DH key agreement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKey {
    /// Identifier, or [`CONSUMED_PREKEY_ID`] once used
    pub id: u32,
    /// Key material, empty once used
    pub keypair: KeyPair,
}

impl PreKey {
    /// Create a new one-time prekey
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EntropyFailure` if key generation fails
    pub fn generate<R: RngCore + CryptoRng>(id: u32, rng: &mut R) -> Result<Self> {
        Ok(Self {
            id,
            keypair: KeyPair::generate(rng)?,
        })
    }

    /// True once this slot has been used by a handshake
    #[must_use]
    pub fn is_consumed(&self) -> bool {
        self.id == CONSUMED_PREKEY_ID
    }

    /// Wipe the slot so it can never be used again
    pub fn consume(&mut self) {
        self.id = CONSUMED_PREKEY_ID;
        self.keypair = KeyPair::empty();
    }
}

/// A signed prekey that proves ownership by the identity key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKey {
    /// Identifier, always at least 1
    pub id: u32,
    /// Key material
    pub keypair: KeyPair,
    /// XEdDSA signature over the tagged public key
    pub signature: Signature,
}

impl SignedPreKey {
    /// Create a new signed prekey
    ///
    /// # Arguments
    ///
    /// * `id` - Identifier for this signed prekey
    /// * `identity` - Identity keypair used for signing
    /// * `rng` - Randomness source
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EntropyFailure` if key generation fails
    pub fn generate<R: RngCore + CryptoRng>(
        id: u32,
        identity: &KeyPair,
        rng: &mut R,
    ) -> Result<Self> {
        let keypair = KeyPair::generate(rng)?;
        let signature = identity.sign(&keypair.public().serialize(), rng);

        Ok(Self {
            id,
            keypair,
            signature,
        })
    }

    /// Verify the signature against an identity public key
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::BadSignature` if verification fails
    pub fn verify(&self, identity: &PublicKey) -> Result<()> {
        identity.verify(&self.keypair.public().serialize(), &self.signature)
    }
}

/// Public half of a one-time prekey as published in a bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundlePreKey {
    /// Prekey identifier
    pub id: u32,
    /// Prekey public key
    pub key: PublicKey,
}

/// A complete prekey bundle for X3DH key agreement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    /// Long-term identity public key
    pub identity_key: PublicKey,
    /// Current signed prekey
    pub signed_prekey: PublicKey,
    /// Signature over the tagged signed prekey
    pub signed_prekey_signature: Signature,
    /// Signed prekey identifier
    pub signed_prekey_id: u32,
    /// Available one-time prekeys
    pub one_time_prekeys: Vec<BundlePreKey>,
}

impl Bundle {
    /// Verify the signed prekey signature against the identity key
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::BadSignature` if the signature is invalid
    pub fn verify(&self) -> Result<()> {
        self.identity_key.verify(
            &self.signed_prekey.serialize(),
            &self.signed_prekey_signature,
        )
    }

    /// Pick a random one-time prekey
    ///
    /// # Returns
    ///
    /// The chosen prekey, or None if the bundle lists none
    pub fn choose_prekey<R: RngCore + CryptoRng>(&self, rng: &mut R) -> Option<BundlePreKey> {
        self.one_time_prekeys.choose(rng).copied()
    }

    /// Look up a listed one-time prekey by id
    #[must_use]
    pub fn prekey(&self, id: u32) -> Option<BundlePreKey> {
        self.one_time_prekeys.iter().find(|p| p.id == id).copied()
    }

    /// Serialize to JSON
    ///
    /// # Errors
    ///
    /// Returns a serialization error if encoding fails
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Into::into)
    }

    /// Deserialize from JSON and verify the signature
    ///
    /// # Errors
    ///
    /// Returns a serialization error or `CryptoError::BadSignature`
    pub fn from_json(json: &str) -> Result<Self> {
        let bundle: Self = serde_json::from_str(json)?;
        bundle.verify()?;
        Ok(bundle)
    }

    /// Encode in the binary wire format
    ///
    /// Tagged keys take 33 bytes and the signature 64, with no length
    /// prefix; the prekey list is preceded by its u64 count.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if encoding fails
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        codec::encode(self).map_err(Into::into)
    }

    /// Decode from the binary wire format and verify the signature
    ///
    /// # Errors
    ///
    /// Returns a protocol error on malformed input or `CryptoError::BadSignature`
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bundle: Self = codec::decode(bytes)?;
        bundle.verify()?;
        Ok(bundle)
    }
}
