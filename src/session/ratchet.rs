//! Double Ratchet state and chain stepping.
//!
//! This module holds the pure key schedule: symmetric chain steps, DH
//! ratchet steps and skipped-key derivation. It never touches storage and
//! never decrypts; the session engine drives it on a scratch copy and
//! commits the copy only when a message has authenticated.

use crate::crypto::{kdf, KeyPair, PublicKey};
use crate::session::{Agreement, Header, MessageKey};
use crate::utils::{OmemoError, Result, SessionError};
use log::debug;
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of symmetric ratchet keys
pub const KEY_SIZE: usize = 32;

/// Double Ratchet state for one peer
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct RatchetState {
    /// Root key for key derivation
    root_key: [u8; KEY_SIZE],
    /// Current sending chain key
    sending_chain_key: Option<[u8; KEY_SIZE]>,
    /// Current receiving chain key
    receiving_chain_key: Option<[u8; KEY_SIZE]>,
    /// Our current DH key pair
    dh_keypair: KeyPair,
    /// Remote DH public key
    remote_dh_public: Option<PublicKey>,
    /// Previous sending chain length
    previous_sending_chain_length: u32,
    /// Current sending message number
    sending_message_number: u32,
    /// Current receiving message number
    receiving_message_number: u32,
}

impl fmt::Debug for RatchetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RatchetState")
            .field("root_key", &"[REDACTED]")
            .field("sending_chain_key", &"[REDACTED]")
            .field("receiving_chain_key", &"[REDACTED]")
            .field("dh_public", self.dh_keypair.public())
            .field("remote_dh_public", &self.remote_dh_public)
            .field("previous_sending_chain_length", &self.previous_sending_chain_length)
            .field("sending_message_number", &self.sending_message_number)
            .field("receiving_message_number", &self.receiving_message_number)
            .finish()
    }
}

impl RatchetState {
    /// Initialize the ratchet as the handshake initiator
    ///
    /// The responder's signed prekey acts as its first ratchet key, so the
    /// initiator performs a sending ratchet step straight away.
    ///
    /// # Arguments
    ///
    /// * `agreement` - Keys agreed by X3DH
    /// * `remote_signed_prekey` - The responder's signed prekey
    /// * `rng` - Randomness source for the first ratchet key
    ///
    /// # Errors
    ///
    /// Returns an entropy failure or a protocol violation for a bad key
    pub fn new_initiator<R: RngCore + CryptoRng>(
        agreement: &Agreement,
        remote_signed_prekey: PublicKey,
        rng: &mut R,
    ) -> Result<Self> {
        let dh_keypair = KeyPair::generate(rng)?;
        let (root_key, sending_chain_key) = kdf::kdf_rk(
            &agreement.root_key,
            &dh_keypair.diffie_hellman(&remote_signed_prekey)?,
        )?;

        Ok(Self {
            root_key,
            sending_chain_key: Some(sending_chain_key),
            receiving_chain_key: None,
            dh_keypair,
            remote_dh_public: Some(remote_signed_prekey),
            previous_sending_chain_length: 0,
            sending_message_number: 0,
            receiving_message_number: 0,
        })
    }

    /// Initialize the ratchet as the handshake responder
    ///
    /// The signed prekey becomes the first ratchet key; both chains are
    /// established by the DH ratchet step on the first incoming message.
    #[must_use]
    pub fn new_responder(agreement: &Agreement, signed_prekey: KeyPair) -> Self {
        Self {
            root_key: agreement.root_key,
            sending_chain_key: None,
            receiving_chain_key: None,
            dh_keypair: signed_prekey,
            remote_dh_public: None,
            previous_sending_chain_length: 0,
            sending_message_number: 0,
            receiving_message_number: 0,
        }
    }

    /// Our current ratchet public key
    #[must_use]
    pub fn dh_public(&self) -> &PublicKey {
        self.dh_keypair.public()
    }

    /// Last ratchet key received from the peer
    #[must_use]
    pub fn remote_dh_public(&self) -> Option<&PublicKey> {
        self.remote_dh_public.as_ref()
    }

    /// Next expected receiving counter
    #[must_use]
    pub fn receiving_message_number(&self) -> u32 {
        self.receiving_message_number
    }

    /// Next sending counter
    #[must_use]
    pub fn sending_message_number(&self) -> u32 {
        self.sending_message_number
    }

    /// Length of the previous sending chain
    #[must_use]
    pub fn previous_sending_chain_length(&self) -> u32 {
        self.previous_sending_chain_length
    }

    /// True once a receiving chain exists
    #[must_use]
    pub fn has_receiving_chain(&self) -> bool {
        self.receiving_chain_key.is_some()
    }

    /// True once a sending chain exists
    #[must_use]
    pub fn has_sending_chain(&self) -> bool {
        self.sending_chain_key.is_some()
    }

    /// Integrity check used when loading persisted state
    pub(crate) fn is_consistent(&self) -> bool {
        self.dh_keypair.is_consistent()
            && (self.receiving_chain_key.is_none() || self.remote_dh_public.is_some())
    }

    /// Advance the sending chain by one message
    ///
    /// # Returns
    ///
    /// The message key and the header (without handshake fields) to send
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidState` if no sending chain exists yet
    pub fn next_sending_key(&mut self) -> Result<([u8; KEY_SIZE], Header)> {
        let chain_key = self
            .sending_chain_key
            .ok_or_else(|| SessionError::InvalidState {
                state: "No sending chain established".to_string(),
            })?;
        let next_counter = self
            .sending_message_number
            .checked_add(1)
            .ok_or_else(|| OmemoError::violation("sending counter overflow"))?;

        let (next_chain_key, message_key) = kdf::kdf_ck(&chain_key)?;
        let header = Header {
            ratchet_key: *self.dh_keypair.public(),
            counter: self.sending_message_number,
            previous_chain_length: self.previous_sending_chain_length,
            prekey: None,
        };

        self.sending_chain_key = Some(next_chain_key);
        self.sending_message_number = next_counter;
        Ok((message_key, header))
    }

    /// Advance the receiving chain by one message
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidState` if no receiving chain exists
    pub fn next_receiving_key(&mut self) -> Result<[u8; KEY_SIZE]> {
        let chain_key = self.receiving_chain()?;
        let next_counter = self
            .receiving_message_number
            .checked_add(1)
            .ok_or_else(|| OmemoError::violation("receiving counter overflow"))?;

        let (next_chain_key, message_key) = kdf::kdf_ck(&chain_key)?;
        self.receiving_chain_key = Some(next_chain_key);
        self.receiving_message_number = next_counter;
        Ok(message_key)
    }

    /// Derive and return the keys for receiving counters up to `until`
    ///
    /// Does nothing when no receiving chain exists or `until` is not ahead.
    /// The caller is responsible for bounding the gap.
    ///
    /// # Errors
    ///
    /// Returns a key derivation failure
    pub fn skip_message_keys(&mut self, until: u32) -> Result<Vec<MessageKey>> {
        let (Some(mut chain_key), Some(remote)) = (self.receiving_chain_key, self.remote_dh_public) else {
            return Ok(Vec::new());
        };

        let mut skipped = Vec::with_capacity(until.saturating_sub(self.receiving_message_number) as usize);
        for counter in self.receiving_message_number..until {
            let (next_chain_key, message_key) = kdf::kdf_ck(&chain_key)?;
            chain_key = next_chain_key;
            skipped.push(MessageKey {
                ratchet_key: remote,
                counter,
                key: message_key,
            });
        }

        if !skipped.is_empty() {
            debug!("Derived {} skipped message keys", skipped.len());
            self.receiving_chain_key = Some(chain_key);
            self.receiving_message_number = until;
        }
        Ok(skipped)
    }

    /// Perform DH ratchet step when receiving a new DH public key
    ///
    /// Both counters reset to zero and a fresh sending key pair is generated.
    ///
    /// # Errors
    ///
    /// Returns an entropy failure or a protocol violation for a bad key
    pub fn dh_ratchet_receive<R: RngCore + CryptoRng>(
        &mut self,
        remote_dh_public: &PublicKey,
        rng: &mut R,
    ) -> Result<()> {
        // Derive new receiving chain key
        let (root_key, receiving_chain_key) = kdf::kdf_rk(
            &self.root_key,
            &self.dh_keypair.diffie_hellman(remote_dh_public)?,
        )?;

        // Generate new DH key pair for sending
        let dh_keypair = KeyPair::generate(rng)?;
        let (root_key, sending_chain_key) =
            kdf::kdf_rk(&root_key, &dh_keypair.diffie_hellman(remote_dh_public)?)?;

        self.previous_sending_chain_length = self.sending_message_number;
        self.sending_message_number = 0;
        self.receiving_message_number = 0;
        self.remote_dh_public = Some(*remote_dh_public);
        self.root_key = root_key;
        self.receiving_chain_key = Some(receiving_chain_key);
        self.sending_chain_key = Some(sending_chain_key);
        self.dh_keypair = dh_keypair;

        debug!("DH ratchet step, new sending key {}", self.dh_keypair.public());
        Ok(())
    }

    fn receiving_chain(&self) -> Result<[u8; KEY_SIZE]> {
        self.receiving_chain_key.ok_or_else(|| {
            SessionError::InvalidState {
                state: "No receiving chain established".to_string(),
            }
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn agreement() -> Agreement {
        Agreement {
            root_key: [5u8; 32],
            chain_key: [6u8; 32],
        }
    }

    fn pair() -> (RatchetState, RatchetState) {
        let signed_prekey = KeyPair::generate(&mut OsRng).unwrap();
        let alice =
            RatchetState::new_initiator(&agreement(), *signed_prekey.public(), &mut OsRng).unwrap();
        let bob = RatchetState::new_responder(&agreement(), signed_prekey);
        (alice, bob)
    }

    #[test]
    fn test_first_step_matches() {
        let (mut alice, mut bob) = pair();
        let (alice_key, header) = alice.next_sending_key().unwrap();

        bob.dh_ratchet_receive(&header.ratchet_key, &mut OsRng).unwrap();
        let bob_key = bob.next_receiving_key().unwrap();

        assert_eq!(alice_key, bob_key);
        assert_eq!(header.counter, 0);
        assert_eq!(alice.sending_message_number(), 1);
        assert_eq!(bob.receiving_message_number(), 1);
    }

    #[test]
    fn test_responder_has_no_chains_before_receiving() {
        let (_, mut bob) = pair();
        assert!(!bob.has_sending_chain());
        assert!(bob.next_sending_key().is_err());
        assert!(bob.next_receiving_key().is_err());
        assert!(bob.skip_message_keys(5).unwrap().is_empty());
    }

    #[test]
    fn test_skip_message_keys() {
        let (mut alice, mut bob) = pair();
        let sent: Vec<_> = (0..4).map(|_| alice.next_sending_key().unwrap()).collect();

        bob.dh_ratchet_receive(&sent[0].1.ratchet_key, &mut OsRng).unwrap();
        let skipped = bob.skip_message_keys(3).unwrap();

        assert_eq!(skipped.len(), 3);
        for (i, key) in skipped.iter().enumerate() {
            assert_eq!(key.counter, i as u32);
            assert_eq!(key.key, sent[i].0);
        }
        assert_eq!(bob.next_receiving_key().unwrap(), sent[3].0);
    }

    #[test]
    fn test_dh_ratchet_resets_counters() {
        let (mut alice, mut bob) = pair();
        let (_, header) = alice.next_sending_key().unwrap();
        let old_key = *bob.dh_public();
        bob.dh_ratchet_receive(&header.ratchet_key, &mut OsRng).unwrap();
        bob.next_receiving_key().unwrap();

        let (bob_key, reply) = bob.next_sending_key().unwrap();
        assert_ne!(reply.ratchet_key, old_key);
        assert_eq!(&reply.ratchet_key, bob.dh_public());
        assert_eq!(reply.previous_chain_length, 0);

        alice.dh_ratchet_receive(&reply.ratchet_key, &mut OsRng).unwrap();
        assert_eq!(alice.previous_sending_chain_length(), 1);
        assert_eq!(alice.sending_message_number(), 0);
        assert_eq!(alice.next_receiving_key().unwrap(), bob_key);
    }

    #[test]
    fn test_debug_redacts_keys() {
        let (alice, _) = pair();
        assert!(format!("{alice:?}").contains("REDACTED"));
    }
}
