//! Identity and prekey store for one device.
//!
//! The store owns every private key a device publishes: the long-term
//! identity, the current signed prekey (plus the previous one, kept for one
//! more rotation so in-flight handshakes still complete) and a fixed-size
//! pool of one-time prekeys. Prekey ids grow monotonically; a consumed slot
//! is zeroed and its id set to [`CONSUMED_PREKEY_ID`] until refilled.

use crate::crypto::{
    Bundle, BundlePreKey, KeyPair, PreKey, PublicKey, SignedPreKey, CONSUMED_PREKEY_ID,
};
use crate::utils::{OmemoError, Result, StoreConfig};
use log::{debug, info};
use rand::rngs::OsRng;
use rand_core::{CryptoRng, RngCore};

/// Identity and prekey store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Store {
    pub(crate) identity: KeyPair,
    pub(crate) signed_prekey: SignedPreKey,
    pub(crate) previous_signed_prekey: Option<SignedPreKey>,
    pub(crate) prekeys: Vec<PreKey>,
    pub(crate) prekey_counter: u32,
}

impl Store {
    /// Generate a new store using the operating system RNG
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EntropyFailure` if the randomness source fails,
    /// or a configuration error for an invalid pool size
    pub fn setup(config: &StoreConfig) -> Result<Self> {
        Self::setup_with_rng(config, &mut OsRng)
    }

    /// Generate a new store from the given randomness source
    ///
    /// # Errors
    ///
    /// See [`Store::setup`]
    pub fn setup_with_rng<R: RngCore + CryptoRng>(config: &StoreConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;

        let identity = KeyPair::generate(rng)?;
        let signed_prekey = SignedPreKey::generate(1, &identity, rng)?;

        let mut prekeys = Vec::with_capacity(config.prekey_count);
        for id in 1..=config.prekey_count {
            let id = u32::try_from(id).map_err(|_| OmemoError::violation("prekey id overflow"))?;
            prekeys.push(PreKey::generate(id, rng)?);
        }
        let prekey_counter = prekeys.last().map_or(0, |p| p.id);

        info!(
            "Store set up with {} one-time prekeys, identity {}",
            prekeys.len(),
            identity.public()
        );

        Ok(Self {
            identity,
            signed_prekey,
            previous_signed_prekey: None,
            prekeys,
            prekey_counter,
        })
    }

    /// Long-term identity keypair
    #[must_use]
    pub fn identity(&self) -> &KeyPair {
        &self.identity
    }

    /// Long-term identity public key
    #[must_use]
    pub fn identity_key(&self) -> &PublicKey {
        self.identity.public()
    }

    /// Current signed prekey
    #[must_use]
    pub fn current_signed_prekey(&self) -> &SignedPreKey {
        &self.signed_prekey
    }

    /// Signed prekey by id, current or previous
    #[must_use]
    pub fn signed_prekey(&self, id: u32) -> Option<&SignedPreKey> {
        std::iter::once(&self.signed_prekey)
            .chain(self.previous_signed_prekey.as_ref())
            .find(|spk| spk.id == id)
    }

    /// Unconsumed one-time prekey by id
    #[must_use]
    pub fn prekey(&self, id: u32) -> Option<&PreKey> {
        if id == CONSUMED_PREKEY_ID {
            return None;
        }
        self.prekeys.iter().find(|p| p.id == id)
    }

    /// Number of one-time prekeys still available
    #[must_use]
    pub fn available_prekeys(&self) -> usize {
        self.prekeys.iter().filter(|p| !p.is_consumed()).count()
    }

    /// Public projection for publication, excluding consumed prekeys
    #[must_use]
    pub fn bundle(&self) -> Bundle {
        Bundle {
            identity_key: *self.identity.public(),
            signed_prekey: *self.signed_prekey.keypair.public(),
            signed_prekey_signature: self.signed_prekey.signature,
            signed_prekey_id: self.signed_prekey.id,
            one_time_prekeys: self
                .prekeys
                .iter()
                .filter(|p| !p.is_consumed())
                .map(|p| BundlePreKey {
                    id: p.id,
                    key: *p.keypair.public(),
                })
                .collect(),
        }
    }

    /// Mark a one-time prekey as used
    ///
    /// # Errors
    ///
    /// Returns a protocol violation if the id is the sentinel, unknown or
    /// already consumed
    pub fn consume_prekey(&mut self, id: u32) -> Result<()> {
        let slot = self
            .prekeys
            .iter_mut()
            .find(|p| id != CONSUMED_PREKEY_ID && p.id == id)
            .ok_or_else(|| OmemoError::violation(format!("one-time prekey {id} is not available")))?;
        slot.consume();
        debug!("Consumed one-time prekey {}", id);
        Ok(())
    }

    /// Replace every consumed slot with a fresh prekey
    ///
    /// # Returns
    ///
    /// The number of prekeys generated
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EntropyFailure` if key generation fails; the
    /// store is left unchanged in that case
    pub fn refill_prekeys(&mut self) -> Result<usize> {
        self.refill_prekeys_with_rng(&mut OsRng)
    }

    /// [`Store::refill_prekeys`] with an explicit randomness source
    ///
    /// # Errors
    ///
    /// See [`Store::refill_prekeys`]
    pub fn refill_prekeys_with_rng<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<usize> {
        let mut prekeys = self.prekeys.clone();
        let mut counter = self.prekey_counter;
        let mut generated = 0;

        for slot in prekeys.iter_mut().filter(|p| p.is_consumed()) {
            counter = counter
                .checked_add(1)
                .ok_or_else(|| OmemoError::violation("prekey id space exhausted"))?;
            *slot = PreKey::generate(counter, rng)?;
            generated += 1;
        }

        self.prekeys = prekeys;
        self.prekey_counter = counter;
        if generated > 0 {
            info!("Refilled {} one-time prekeys (last id {})", generated, counter);
        }
        Ok(generated)
    }

    /// Generate a new signed prekey, keeping the current one as previous
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EntropyFailure` if key generation fails
    pub fn rotate_signed_prekey(&mut self) -> Result<()> {
        self.rotate_signed_prekey_with_rng(&mut OsRng)
    }

    /// [`Store::rotate_signed_prekey`] with an explicit randomness source
    ///
    /// # Errors
    ///
    /// See [`Store::rotate_signed_prekey`]
    pub fn rotate_signed_prekey_with_rng<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<()> {
        let id = self
            .signed_prekey
            .id
            .checked_add(1)
            .ok_or_else(|| OmemoError::violation("signed prekey id space exhausted"))?;
        let next = SignedPreKey::generate(id, &self.identity, rng)?;
        let previous = std::mem::replace(&mut self.signed_prekey, next);
        info!("Rotated signed prekey {} -> {}", previous.id, id);
        self.previous_signed_prekey = Some(previous);
        Ok(())
    }

    /// Serialize the store, private keys included
    ///
    /// # Errors
    ///
    /// Returns a protocol error if encoding fails
    pub fn serialize(&self) -> Result<Vec<u8>> {
        crate::state::encode_store(self)
    }

    /// Restore a store written by [`Store::serialize`]
    ///
    /// # Errors
    ///
    /// Returns `StateError::Malformed` or `StateError::UnsupportedVersion`
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        crate::state::decode_store(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingRng;

    impl RngCore for FailingRng {
        fn next_u32(&mut self) -> u32 {
            0
        }

        fn next_u64(&mut self) -> u64 {
            0
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(0);
        }

        fn try_fill_bytes(&mut self, _dest: &mut [u8]) -> std::result::Result<(), rand_core::Error> {
            Err(rand_core::Error::new("entropy source unavailable"))
        }
    }

    impl CryptoRng for FailingRng {}

    fn small_store() -> Store {
        Store::setup(&StoreConfig { prekey_count: 5 }).unwrap()
    }

    #[test]
    fn test_setup() {
        let store = Store::setup(&StoreConfig::default()).unwrap();

        assert_eq!(store.prekeys.len(), 100);
        assert_eq!(store.available_prekeys(), 100);
        assert_eq!(store.prekeys[0].id, 1);
        assert_eq!(store.prekey_counter, 100);
        assert_eq!(store.current_signed_prekey().id, 1);
        assert!(store.previous_signed_prekey.is_none());
    }

    #[test]
    fn test_setup_entropy_failure() {
        let err = Store::setup_with_rng(&StoreConfig::default(), &mut FailingRng).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::EntropyFailure);
    }

    #[test]
    fn test_bundle_projection() {
        let store = small_store();
        let bundle = store.bundle();

        assert!(bundle.verify().is_ok());
        assert_eq!(&bundle.identity_key, store.identity_key());
        assert_eq!(bundle.signed_prekey_id, 1);
        assert_eq!(bundle.one_time_prekeys.len(), 5);
        assert_eq!(store.bundle(), bundle);
    }

    #[test]
    fn test_consumed_prekey_excluded_from_bundle() {
        let mut store = small_store();
        store.consume_prekey(3).unwrap();

        let bundle = store.bundle();
        assert_eq!(bundle.one_time_prekeys.len(), 4);
        assert!(bundle.prekey(3).is_none());
        assert!(bundle.one_time_prekeys.iter().all(|p| p.id != CONSUMED_PREKEY_ID));
        assert!(store.prekey(3).is_none());
    }

    #[test]
    fn test_consume_twice_fails() {
        let mut store = small_store();
        store.consume_prekey(2).unwrap();

        let err = store.consume_prekey(2).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ProtocolViolation);
        assert!(store.consume_prekey(CONSUMED_PREKEY_ID).is_err());
        assert!(store.consume_prekey(99).is_err());
    }

    #[test]
    fn test_refill_never_reuses_ids() {
        let mut store = small_store();
        store.consume_prekey(1).unwrap();
        store.consume_prekey(4).unwrap();

        assert_eq!(store.refill_prekeys().unwrap(), 2);
        assert_eq!(store.available_prekeys(), 5);

        let ids: Vec<u32> = store.bundle().one_time_prekeys.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![6, 2, 3, 7, 5]);
        assert_eq!(store.refill_prekeys().unwrap(), 0);
    }

    #[test]
    fn test_refill_entropy_failure_leaves_store_unchanged() {
        let mut store = small_store();
        store.consume_prekey(1).unwrap();
        let before = store.clone();

        assert!(store.refill_prekeys_with_rng(&mut FailingRng).is_err());
        assert_eq!(store, before);
    }

    #[test]
    fn test_rotate_signed_prekey() {
        let mut store = small_store();
        let first = store.current_signed_prekey().clone();

        store.rotate_signed_prekey().unwrap();
        assert_eq!(store.current_signed_prekey().id, 2);
        assert_eq!(store.signed_prekey(1), Some(&first));
        assert!(store.bundle().verify().is_ok());

        store.rotate_signed_prekey().unwrap();
        assert!(store.signed_prekey(1).is_none());
        assert!(store.signed_prekey(2).is_some());
        assert!(store.signed_prekey(3).is_some());
    }
}
