//! Per-peer session state machine and the resumable decrypt protocol.
//!
//! A [`Session`] moves from `Uninitialized` to `Initiated` when it sends a
//! handshake, and to `Active` once it has decrypted a message. Decryption
//! is exposed as a step function: [`Session::decrypt_key_step`] either
//! finishes or tells the caller what it needs (a cached key, or permission
//! to hand out a batch of skipped keys). All derivation happens on a scratch
//! copy of the ratchet; nothing is written back until
//! [`Session::apply`] commits a finished step.

use crate::crypto::{
    kdf, Bundle, ChaChaPolyCipher, PayloadCipher, PublicKey, Store, CONSUMED_PREKEY_ID,
};
use crate::session::{
    AsyncMessageKeyStore, KeyMessage, MessageKey, MessageKeyStore, PreKeyHeader, RatchetState,
    SkippedKeys, X3DHInitiator, X3DHRecipient,
};
use crate::utils::{OmemoError, ProtocolError, Result, SessionConfig, SessionError};
use log::{debug, info, trace, warn};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use zeroize::Zeroize;

/// Upper bound on step calls a driver makes for one message
const MAX_DECRYPT_ROUNDS: usize = 3;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    /// No key agreement yet
    Uninitialized,
    /// Handshake sent, nothing received back yet
    Initiated,
    /// At least one message decrypted
    Active,
}

/// Answer to a previous [`DecryptStep::NeedKey`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum KeyLookup {
    /// The caller has not been asked yet
    #[default]
    NotAttempted,
    /// The caller found the requested key
    Found(MessageKey),
    /// The caller has no key for the request
    Missing,
}

/// Caller-supplied input carried between decrypt steps
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resume {
    /// Result of the key lookup, if one was requested
    pub lookup: KeyLookup,
    /// Number of skipped keys the caller agreed to persist
    pub skip_buffer: Option<u32>,
}

/// Outcome of one decrypt step
#[derive(Debug)]
pub enum DecryptStep {
    /// Decryption succeeded; pass the result to [`Session::apply`]
    Done(DecryptedKey),
    /// Look up the cached key for `(ratchet_key, counter)` and retry
    NeedKey {
        /// Ratchet key of the chain the message belongs to
        ratchet_key: PublicKey,
        /// Counter of the message within that chain
        counter: u32,
    },
    /// Retry once ready to persist this many freshly derived keys
    NeedSkipBuffer(u32),
}

/// Result of a successful decrypt step, not yet committed
pub struct DecryptedKey {
    /// The transported content key
    pub content_key: Vec<u8>,
    /// Keys derived for skipped counters; the caller must persist them
    pub skipped_keys: Vec<MessageKey>,
    /// Cached key used for this message; the caller must discard it
    pub consumed_key: Option<(PublicKey, u32)>,
    /// One-time prekey the handshake used, consumed on commit
    pub consumed_prekey: Option<u32>,
    pending: PendingState,
}

struct PendingState {
    ratchet: RatchetState,
    remote_identity: PublicKey,
    handshake: Option<PreKeyHeader>,
    new_handshake: bool,
}

impl fmt::Debug for DecryptedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptedKey")
            .field("content_key", &"[REDACTED]")
            .field("skipped_keys", &self.skipped_keys.len())
            .field("consumed_key", &self.consumed_key)
            .field("consumed_prekey", &self.consumed_prekey)
            .finish()
    }
}

/// Double Ratchet session with one peer
///
/// The session does not own the local [`Store`]; operations borrow it.
/// `C` selects the cipher that wraps content keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session<C: PayloadCipher = ChaChaPolyCipher> {
    pub(crate) status: SessionStatus,
    pub(crate) remote_identity: Option<PublicKey>,
    pub(crate) ratchet: Option<RatchetState>,
    pub(crate) handshake: Option<PreKeyHeader>,
    pub(crate) skipped: SkippedKeys,
    pub(crate) config: SessionConfig,
    cipher: PhantomData<C>,
}

impl Session<ChaChaPolyCipher> {
    /// Create an uninitialized session with the default cipher
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` fails validation
    pub fn new(config: SessionConfig) -> Result<Self> {
        Self::with_cipher(config)
    }
}

impl<C: PayloadCipher> Session<C> {
    /// Create an uninitialized session using cipher `C`
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` fails validation
    pub fn with_cipher(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            status: SessionStatus::Uninitialized,
            remote_identity: None,
            ratchet: None,
            handshake: None,
            skipped: SkippedKeys::new(config.max_cached_keys),
            config,
            cipher: PhantomData,
        })
    }

    pub(crate) fn from_parts(
        status: SessionStatus,
        remote_identity: Option<PublicKey>,
        ratchet: Option<RatchetState>,
        handshake: Option<PreKeyHeader>,
        skipped: SkippedKeys,
        config: SessionConfig,
    ) -> Self {
        Self {
            status,
            remote_identity,
            ratchet,
            handshake,
            skipped,
            config,
            cipher: PhantomData,
        }
    }

    /// Current lifecycle state
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Peer identity key, once known
    #[must_use]
    pub fn remote_identity(&self) -> Option<&PublicKey> {
        self.remote_identity.as_ref()
    }

    /// Ratchet state, once initialized
    #[must_use]
    pub fn ratchet(&self) -> Option<&RatchetState> {
        self.ratchet.as_ref()
    }

    /// Handshake parameters sent or received
    #[must_use]
    pub fn handshake(&self) -> Option<&PreKeyHeader> {
        self.handshake.as_ref()
    }

    /// The session's own skipped-key cache
    #[must_use]
    pub fn skipped_keys(&self) -> &SkippedKeys {
        &self.skipped
    }

    /// Runtime configuration
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// True once enough messages arrived without a reply that an empty
    /// message should be sent back to advance the ratchet
    #[must_use]
    pub fn needs_heartbeat(&self) -> bool {
        self.ratchet
            .as_ref()
            .is_some_and(|r| r.receiving_message_number() >= self.config.heartbeat_threshold)
    }

    /// Start a session from a peer bundle, attaching a random one-time prekey
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::BadSignature` for a forged bundle and
    /// `SessionError::PrekeyExhausted` if the bundle offers no prekey and the
    /// configuration requires one
    pub fn initiate_session(&mut self, store: &Store, bundle: &Bundle) -> Result<()> {
        let prekey_id = bundle.choose_prekey(&mut OsRng).map(|p| p.id);
        self.initiate_session_with_prekey(store, bundle, prekey_id)
    }

    /// Start a session from a peer bundle using the named one-time prekey
    ///
    /// # Arguments
    ///
    /// * `store` - Local identity store
    /// * `bundle` - The peer's published bundle
    /// * `prekey_id` - One-time prekey to attach, `None` for the three-DH
    ///   fallback
    ///
    /// # Errors
    ///
    /// See [`Session::initiate_session`]
    pub fn initiate_session_with_prekey(
        &mut self,
        store: &Store,
        bundle: &Bundle,
        prekey_id: Option<u32>,
    ) -> Result<()> {
        bundle.verify()?;

        let one_time_prekey = match prekey_id.and_then(|id| bundle.prekey(id)) {
            Some(prekey) => Some(prekey),
            None if self.config.require_one_time_prekey => {
                return Err(SessionError::PrekeyExhausted.into());
            }
            None => {
                warn!("No one-time prekey available, using three-DH handshake");
                None
            }
        };

        let initiator = X3DHInitiator::new(store.identity(), &mut OsRng)?;
        let (header, agreement) = initiator.agree(bundle, one_time_prekey)?;
        let ratchet = RatchetState::new_initiator(&agreement, bundle.signed_prekey, &mut OsRng)?;

        self.status = SessionStatus::Initiated;
        self.remote_identity = Some(bundle.identity_key);
        self.ratchet = Some(ratchet);
        self.handshake = Some(header);

        info!("Session initiated with {}", bundle.identity_key);
        Ok(())
    }

    /// Encrypt a content key for the peer
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidState` before initiation and
    /// `SessionError::InvalidContentKey` for a key of the wrong size
    pub fn encrypt_key(&mut self, store: &Store, content_key: &[u8]) -> Result<KeyMessage> {
        if content_key.len() != self.config.content_key_size {
            return Err(SessionError::InvalidContentKey {
                expected: self.config.content_key_size,
                actual: content_key.len(),
            }
            .into());
        }

        let (Some(ratchet), Some(remote_identity)) = (&self.ratchet, self.remote_identity) else {
            return Err(SessionError::InvalidState {
                state: "Session has not been initiated".to_string(),
            }
            .into());
        };

        let mut ratchet = ratchet.clone();
        let (mut message_key, mut header) = ratchet.next_sending_key()?;
        if self.status == SessionStatus::Initiated {
            header.prekey = self.handshake;
        }

        let cipher_key = kdf::message_cipher_key(&message_key);
        message_key.zeroize();
        let mut cipher_key = cipher_key?;

        let associated_data = header.associated_data(store.identity_key(), &remote_identity)?;
        let sealed = C::seal(&cipher_key, &associated_data, content_key);
        cipher_key.zeroize();
        let ciphertext = sealed?;

        trace!("Encrypted key message {}", header.counter);
        self.ratchet = Some(ratchet);
        Ok(KeyMessage::new(header, ciphertext))
    }

    /// Run one step of the decrypt protocol without mutating the session
    ///
    /// Start with `Resume::default()`. On `NeedKey`, set `resume.lookup`
    /// and call again; on `NeedSkipBuffer(n)`, set `resume.skip_buffer` to
    /// `Some(n)` and call again. On `Done`, persist the skipped keys,
    /// discard the consumed key and pass the result to [`Session::apply`].
    ///
    /// # Errors
    ///
    /// Returns `SessionError::SkipLimitExceeded` for a gap beyond
    /// `max_skip`, `ProtocolError::MessageKeyGone` for a key that was
    /// already used, or a protocol/crypto error for an invalid message
    pub fn decrypt_key_step(
        &self,
        store: &Store,
        message: &KeyMessage,
        resume: &Resume,
    ) -> Result<DecryptStep> {
        message.validate()?;
        let header = &message.header;
        let counter = header.counter;

        let Receiving {
            mut ratchet,
            remote_identity,
            handshake,
            consumed_prekey,
        } = self.receiving_state(store, header.prekey.as_ref())?;

        let on_current_chain = ratchet.has_receiving_chain()
            && ratchet.remote_dh_public() == Some(&header.ratchet_key);
        let mut skipped_keys = Vec::new();
        let mut consumed_key = None;

        let mut message_key = if on_current_chain && counter >= ratchet.receiving_message_number() {
            let gap = counter - ratchet.receiving_message_number();
            if !self.skip_accepted(u64::from(gap), resume)? {
                return Ok(DecryptStep::NeedSkipBuffer(gap));
            }
            skipped_keys.extend(ratchet.skip_message_keys(counter)?);
            ratchet.next_receiving_key()?
        } else {
            // A session that never received has nothing cached to look up
            let lookup = if ratchet.has_receiving_chain() {
                resume.lookup.clone()
            } else {
                KeyLookup::Missing
            };

            match lookup {
                KeyLookup::NotAttempted => {
                    return Ok(DecryptStep::NeedKey {
                        ratchet_key: header.ratchet_key,
                        counter,
                    });
                }
                KeyLookup::Found(key) => {
                    if !key.matches(&header.ratchet_key, counter) {
                        return Err(OmemoError::violation(
                            "supplied message key does not match the request",
                        ));
                    }
                    consumed_key = Some((header.ratchet_key, counter));
                    key.key
                }
                KeyLookup::Missing if on_current_chain => {
                    return Err(ProtocolError::MessageKeyGone { counter }.into());
                }
                KeyLookup::Missing => {
                    let remaining = if ratchet.has_receiving_chain() {
                        header
                            .previous_chain_length
                            .checked_sub(ratchet.receiving_message_number())
                            .ok_or_else(|| {
                                OmemoError::violation("previous chain length regressed")
                            })?
                    } else {
                        0
                    };

                    let total = u64::from(remaining) + u64::from(counter);
                    if !self.skip_accepted(total, resume)? {
                        // Bounded by max_skip, which is a u32
                        return Ok(DecryptStep::NeedSkipBuffer(
                            u32::try_from(total).unwrap_or(u32::MAX),
                        ));
                    }

                    skipped_keys.extend(ratchet.skip_message_keys(header.previous_chain_length)?);
                    ratchet.dh_ratchet_receive(&header.ratchet_key, &mut OsRng)?;
                    skipped_keys.extend(ratchet.skip_message_keys(counter)?);
                    ratchet.next_receiving_key()?
                }
            }
        };

        let cipher_key = kdf::message_cipher_key(&message_key);
        message_key.zeroize();
        let mut cipher_key = cipher_key?;

        let associated_data = header.associated_data(&remote_identity, store.identity_key())?;
        let opened = C::open(&cipher_key, &associated_data, &message.ciphertext);
        cipher_key.zeroize();
        let content_key = opened?;

        if content_key.len() != self.config.content_key_size {
            return Err(SessionError::InvalidContentKey {
                expected: self.config.content_key_size,
                actual: content_key.len(),
            }
            .into());
        }

        Ok(DecryptStep::Done(DecryptedKey {
            content_key,
            skipped_keys,
            consumed_key,
            consumed_prekey,
            pending: PendingState {
                ratchet,
                remote_identity,
                handshake,
                new_handshake: consumed_prekey.is_some() || handshake != self.handshake,
            },
        }))
    }

    /// Commit a finished decrypt step
    ///
    /// Consumes the one-time prekey in `store` if a handshake was run and
    /// replaces the ratchet with the advanced copy.
    ///
    /// # Returns
    ///
    /// The decrypted content key
    ///
    /// # Errors
    ///
    /// Returns a protocol violation if the prekey was consumed meanwhile;
    /// the session is unchanged in that case
    pub fn apply(&mut self, store: &mut Store, decrypted: DecryptedKey) -> Result<Vec<u8>> {
        let DecryptedKey {
            content_key,
            consumed_prekey,
            pending,
            ..
        } = decrypted;

        if let Some(id) = consumed_prekey {
            store.consume_prekey(id)?;
        }

        if pending.new_handshake {
            if self.status != SessionStatus::Uninitialized {
                warn!("Replacing session with {} after new handshake", pending.remote_identity);
            }
            info!("Session established with {}", pending.remote_identity);
        }

        self.status = SessionStatus::Active;
        self.remote_identity = Some(pending.remote_identity);
        self.ratchet = Some(pending.ratchet);
        self.handshake = pending.handshake;
        Ok(content_key)
    }

    /// Decrypt using the session's own skipped-key cache
    ///
    /// # Errors
    ///
    /// See [`Session::decrypt_key_step`]
    pub fn decrypt_key(&mut self, store: &mut Store, message: &KeyMessage) -> Result<Vec<u8>> {
        let mut cache = std::mem::take(&mut self.skipped);
        let result = self.decrypt_key_with(store, message, &mut cache);
        self.skipped = cache;
        result
    }

    /// Decrypt, looking up and persisting skipped keys in `keys`
    ///
    /// # Errors
    ///
    /// See [`Session::decrypt_key_step`]; storage errors from `keys` are
    /// returned before anything is committed
    pub fn decrypt_key_with<K: MessageKeyStore>(
        &mut self,
        store: &mut Store,
        message: &KeyMessage,
        keys: &mut K,
    ) -> Result<Vec<u8>> {
        let mut resume = Resume::default();

        for _ in 0..MAX_DECRYPT_ROUNDS {
            match self.decrypt_key_step(store, message, &resume)? {
                DecryptStep::Done(decrypted) => {
                    if !decrypted.skipped_keys.is_empty() {
                        keys.store_keys(&decrypted.skipped_keys)?;
                    }
                    if let Some((ratchet_key, counter)) = &decrypted.consumed_key {
                        keys.discard_key(ratchet_key, *counter);
                    }
                    return self.apply(store, decrypted);
                }
                DecryptStep::NeedKey {
                    ratchet_key,
                    counter,
                } => {
                    resume.lookup = match keys.load_key(&ratchet_key, counter) {
                        Some(key) => KeyLookup::Found(key),
                        None => KeyLookup::Missing,
                    };
                }
                DecryptStep::NeedSkipBuffer(count) => {
                    debug!("Accepting {} skipped message keys", count);
                    resume.skip_buffer = Some(count);
                }
            }
        }

        Err(OmemoError::violation("decrypt protocol did not converge"))
    }

    /// Asynchronous variant of [`Session::decrypt_key_with`]
    ///
    /// Every await happens before the session is committed, so dropping the
    /// future leaves the session unchanged.
    ///
    /// # Errors
    ///
    /// See [`Session::decrypt_key_with`]
    pub async fn decrypt_key_async<K: AsyncMessageKeyStore>(
        &mut self,
        store: &mut Store,
        message: &KeyMessage,
        keys: &mut K,
    ) -> Result<Vec<u8>> {
        let mut resume = Resume::default();

        for _ in 0..MAX_DECRYPT_ROUNDS {
            match self.decrypt_key_step(store, message, &resume)? {
                DecryptStep::Done(decrypted) => {
                    if !decrypted.skipped_keys.is_empty() {
                        keys.store_keys(&decrypted.skipped_keys).await?;
                    }
                    if let Some((ratchet_key, counter)) = &decrypted.consumed_key {
                        keys.discard_key(ratchet_key, *counter).await?;
                    }
                    return self.apply(store, decrypted);
                }
                DecryptStep::NeedKey {
                    ratchet_key,
                    counter,
                } => {
                    resume.lookup = match keys.load_key(&ratchet_key, counter).await? {
                        Some(key) => KeyLookup::Found(key),
                        None => KeyLookup::Missing,
                    };
                }
                DecryptStep::NeedSkipBuffer(count) => {
                    debug!("Accepting {} skipped message keys", count);
                    resume.skip_buffer = Some(count);
                }
            }
        }

        Err(OmemoError::violation("decrypt protocol did not converge"))
    }

    /// Serialize the session for persistence
    ///
    /// # Errors
    ///
    /// Returns a protocol error if encoding fails
    pub fn serialize(&self) -> Result<Vec<u8>> {
        crate::state::encode_session(self)
    }

    /// Restore a session written by [`Session::serialize`]
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` fails validation, otherwise
    /// `StateError::Malformed` or `StateError::UnsupportedVersion`
    pub fn deserialize(bytes: &[u8], config: SessionConfig) -> Result<Self> {
        crate::state::decode_session(bytes, config)
    }

    fn receiving_state(&self, store: &Store, prekey: Option<&PreKeyHeader>) -> Result<Receiving> {
        match (prekey, &self.ratchet, self.remote_identity) {
            // Repeated prekey message for the handshake we already ran
            (Some(prekey), Some(ratchet), Some(remote_identity))
                if self.handshake.is_some_and(|h| h.base_key == prekey.base_key) =>
            {
                if remote_identity != prekey.identity_key {
                    return Err(OmemoError::violation("identity changed within a handshake"));
                }
                Ok(Receiving {
                    ratchet: ratchet.clone(),
                    remote_identity,
                    handshake: self.handshake,
                    consumed_prekey: None,
                })
            }
            (Some(prekey), ..) => self.respond(store, prekey),
            (None, Some(ratchet), Some(remote_identity)) => Ok(Receiving {
                ratchet: ratchet.clone(),
                remote_identity,
                handshake: self.handshake,
                consumed_prekey: None,
            }),
            (None, ..) => Err(SessionError::InvalidState {
                state: "No session for a non-prekey message".to_string(),
            }
            .into()),
        }
    }

    fn respond(&self, store: &Store, prekey: &PreKeyHeader) -> Result<Receiving> {
        let signed_prekey = store.signed_prekey(prekey.signed_prekey_id).ok_or_else(|| {
            OmemoError::violation(format!("unknown signed prekey {}", prekey.signed_prekey_id))
        })?;

        let one_time_prekey = if prekey.one_time_prekey_id == CONSUMED_PREKEY_ID {
            if self.config.require_one_time_prekey {
                return Err(SessionError::PrekeyExhausted.into());
            }
            None
        } else {
            Some(store.prekey(prekey.one_time_prekey_id).ok_or_else(|| {
                OmemoError::violation(format!(
                    "one-time prekey {} is not available",
                    prekey.one_time_prekey_id
                ))
            })?)
        };

        let agreement = X3DHRecipient::new(
            store.identity(),
            &signed_prekey.keypair,
            one_time_prekey.map(|p| &p.keypair),
        )
        .receive(prekey)?;

        debug!(
            "Responding to handshake on signed prekey {} and one-time prekey {}",
            prekey.signed_prekey_id, prekey.one_time_prekey_id
        );

        Ok(Receiving {
            ratchet: RatchetState::new_responder(&agreement, signed_prekey.keypair.clone()),
            remote_identity: prekey.identity_key,
            handshake: Some(*prekey),
            consumed_prekey: one_time_prekey.map(|p| p.id),
        })
    }

    /// `Ok(true)` to proceed, `Ok(false)` to ask for a skip buffer first
    fn skip_accepted(&self, count: u64, resume: &Resume) -> Result<bool> {
        if count > u64::from(self.config.max_skip) {
            return Err(SessionError::SkipLimitExceeded {
                requested: count,
                max_skip: self.config.max_skip,
            }
            .into());
        }
        Ok(count == 0 || resume.skip_buffer.map(u64::from) == Some(count))
    }
}

/// Scratch state a decrypt step works on
struct Receiving {
    ratchet: RatchetState,
    remote_identity: PublicKey,
    handshake: Option<PreKeyHeader>,
    consumed_prekey: Option<u32>,
}
