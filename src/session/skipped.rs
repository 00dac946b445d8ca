//! Skipped message keys and the storage capability the decrypt protocol uses.
//!
//! When a message arrives ahead of the receiving chain, the ratchet derives
//! the message keys for the gap and hands them out for storage. A later
//! out-of-order message asks for its key back by `(ratchet key, counter)`.
//! Where those keys live is up to the caller: anything implementing
//! [`MessageKeyStore`] (or [`AsyncMessageKeyStore`] for I/O-backed storage)
//! can serve. [`SkippedKeys`] is the bounded in-memory store every session
//! carries by default.

use crate::crypto::PublicKey;
use crate::utils::Result;
use log::{trace, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use zeroize::Zeroize;

/// A derived but unused message key
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize)]
pub struct MessageKey {
    /// Ratchet public key of the chain the key belongs to
    pub ratchet_key: PublicKey,
    /// Message counter within that chain
    pub counter: u32,
    /// Key material
    pub key: [u8; 32],
}

impl MessageKey {
    /// True if this key decrypts the message at `(ratchet_key, counter)`
    #[must_use]
    pub fn matches(&self, ratchet_key: &PublicKey, counter: u32) -> bool {
        self.counter == counter && &self.ratchet_key == ratchet_key
    }
}

impl fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageKey")
            .field("ratchet_key", &self.ratchet_key)
            .field("counter", &self.counter)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Storage for skipped message keys
///
/// `load_key` must not remove the key: the engine calls `discard_key` once
/// the key has actually decrypted a message, so a failed attempt never
/// loses it.
pub trait MessageKeyStore {
    /// Look up the key for `(ratchet_key, counter)`
    fn load_key(&self, ratchet_key: &PublicKey, counter: u32) -> Option<MessageKey>;

    /// Persist freshly derived keys for future out-of-order messages
    ///
    /// # Errors
    ///
    /// Implementations may refuse or fail to persist
    fn store_keys(&mut self, keys: &[MessageKey]) -> Result<()>;

    /// Forget a key after it has been consumed
    fn discard_key(&mut self, ratchet_key: &PublicKey, counter: u32);
}

/// Asynchronous variant of [`MessageKeyStore`] for I/O-backed storage
#[allow(async_fn_in_trait)]
pub trait AsyncMessageKeyStore {
    /// Look up the key for `(ratchet_key, counter)`
    ///
    /// # Errors
    ///
    /// Returns the storage backend's error
    async fn load_key(&self, ratchet_key: &PublicKey, counter: u32) -> Result<Option<MessageKey>>;

    /// Persist freshly derived keys
    ///
    /// # Errors
    ///
    /// Returns the storage backend's error
    async fn store_keys(&mut self, keys: &[MessageKey]) -> Result<()>;

    /// Forget a key after it has been consumed
    ///
    /// # Errors
    ///
    /// Returns the storage backend's error
    async fn discard_key(&mut self, ratchet_key: &PublicKey, counter: u32) -> Result<()>;
}

/// Bounded in-memory skipped-key cache
///
/// Keys are kept in arrival order; once the capacity is reached the oldest
/// key is evicted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedKeys {
    keys: VecDeque<MessageKey>,
    capacity: usize,
}

impl SkippedKeys {
    /// Create an empty cache holding at most `capacity` keys
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            keys: VecDeque::new(),
            capacity,
        }
    }

    /// Rebuild a cache from persisted keys
    pub(crate) fn from_keys(keys: Vec<MessageKey>, capacity: usize) -> Self {
        Self {
            keys: keys.into(),
            capacity,
        }
    }

    /// Number of cached keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True if no keys are cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Maximum number of cached keys
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Cached keys, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &MessageKey> {
        self.keys.iter()
    }
}

impl Default for SkippedKeys {
    fn default() -> Self {
        Self::new(crate::defaults::DEFAULT_MAX_CACHED_KEYS)
    }
}

impl MessageKeyStore for SkippedKeys {
    fn load_key(&self, ratchet_key: &PublicKey, counter: u32) -> Option<MessageKey> {
        let found = self.keys.iter().find(|k| k.matches(ratchet_key, counter)).cloned();
        trace!("Skipped key lookup for counter {}: {}", counter, found.is_some());
        found
    }

    fn store_keys(&mut self, keys: &[MessageKey]) -> Result<()> {
        for key in keys {
            if self.keys.len() >= self.capacity {
                if let Some(mut evicted) = self.keys.pop_front() {
                    warn!(
                        "Skipped-key cache full, evicting key for counter {}",
                        evicted.counter
                    );
                    evicted.zeroize();
                }
            }
            self.keys.push_back(key.clone());
        }
        Ok(())
    }

    fn discard_key(&mut self, ratchet_key: &PublicKey, counter: u32) {
        if let Some(pos) = self.keys.iter().position(|k| k.matches(ratchet_key, counter)) {
            if let Some(mut key) = self.keys.remove(pos) {
                key.zeroize();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: u8, counter: u32) -> MessageKey {
        MessageKey {
            ratchet_key: PublicKey::from_bytes([id; 32]),
            counter,
            key: [counter as u8; 32],
        }
    }

    #[test]
    fn test_store_and_load() {
        let mut cache = SkippedKeys::new(10);
        cache.store_keys(&[key(1, 0), key(1, 1), key(2, 0)]).unwrap();

        let dh = PublicKey::from_bytes([1; 32]);
        assert_eq!(cache.load_key(&dh, 1), Some(key(1, 1)));
        assert_eq!(cache.load_key(&dh, 5), None);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_load_does_not_remove() {
        let mut cache = SkippedKeys::new(10);
        cache.store_keys(&[key(1, 3)]).unwrap();

        let dh = PublicKey::from_bytes([1; 32]);
        assert!(cache.load_key(&dh, 3).is_some());
        assert!(cache.load_key(&dh, 3).is_some());

        cache.discard_key(&dh, 3);
        assert!(cache.load_key(&dh, 3).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut cache = SkippedKeys::new(2);
        cache.store_keys(&[key(1, 0), key(1, 1), key(1, 2)]).unwrap();

        let dh = PublicKey::from_bytes([1; 32]);
        assert_eq!(cache.len(), 2);
        assert!(cache.load_key(&dh, 0).is_none());
        assert!(cache.load_key(&dh, 2).is_some());
    }

    #[test]
    fn test_debug_redacts_key() {
        let debug = format!("{:?}", key(1, 7));
        assert!(debug.contains("REDACTED"));
    }
}
