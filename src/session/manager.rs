//! Session manager for one device talking to many peers.
//!
//! The manager owns the device [`Store`] and one [`Session`] per peer
//! address. Every operation takes `&mut self`, which makes the manager the
//! single writer of the Store shared by all of its sessions.

use crate::crypto::{Bundle, Store};
use crate::session::{KeyMessage, Session};
use crate::utils::{Result, SessionConfig, SessionError};
use log::{debug, info};
use std::collections::HashMap;

/// Session manager for handling multiple peer sessions
#[derive(Debug)]
pub struct SessionManager {
    /// Local identity and prekeys
    store: Store,
    /// Sessions indexed by peer address
    sessions: HashMap<String, Session>,
    /// Configuration applied to new sessions
    config: SessionConfig,
}

impl SessionManager {
    /// Create a new session manager around a store
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid
    pub fn new(store: Store, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            sessions: HashMap::new(),
            config,
        })
    }

    /// The local store
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Bundle to publish for this device
    #[must_use]
    pub fn bundle(&self) -> Bundle {
        self.store.bundle()
    }

    /// Start a session with `peer`, replacing any existing one
    ///
    /// # Errors
    ///
    /// Returns `SessionError::TooManySessions` at capacity, or any error of
    /// [`Session::initiate_session`]; no session is stored on failure
    pub fn initiate(&mut self, peer: &str, bundle: &Bundle) -> Result<()> {
        self.ensure_capacity(peer)?;

        let mut session = Session::new(self.config)?;
        session.initiate_session(&self.store, bundle)?;
        self.sessions.insert(peer.to_string(), session);
        Ok(())
    }

    /// Encrypt a content key for `peer`
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotFound` if there is no session with `peer`
    pub fn encrypt_key(&mut self, peer: &str, content_key: &[u8]) -> Result<KeyMessage> {
        let session = self.sessions.get_mut(peer).ok_or_else(|| SessionError::NotFound {
            peer: peer.to_string(),
        })?;
        session.encrypt_key(&self.store, content_key)
    }

    /// Decrypt a key message from `peer`
    ///
    /// A prekey message from an unknown peer creates a new session, which is
    /// kept only if decryption succeeds.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotFound` for a non-prekey message from an
    /// unknown peer, or any error of [`Session::decrypt_key`]
    pub fn decrypt_key(&mut self, peer: &str, message: &KeyMessage) -> Result<Vec<u8>> {
        if let Some(session) = self.sessions.get_mut(peer) {
            return session.decrypt_key(&mut self.store, message);
        }

        if !message.is_prekey {
            return Err(SessionError::NotFound {
                peer: peer.to_string(),
            }
            .into());
        }

        self.ensure_capacity(peer)?;
        let mut session = Session::new(self.config)?;
        let content_key = session.decrypt_key(&mut self.store, message)?;

        info!("Accepted new session from {}", peer);
        self.sessions.insert(peer.to_string(), session);
        Ok(content_key)
    }

    /// Session with `peer`, if any
    #[must_use]
    pub fn session(&self, peer: &str) -> Option<&Session> {
        self.sessions.get(peer)
    }

    /// Add a session restored from persisted state
    ///
    /// # Errors
    ///
    /// Returns `SessionError::TooManySessions` at capacity
    pub fn insert_session(&mut self, peer: &str, session: Session) -> Result<()> {
        self.ensure_capacity(peer)?;
        self.sessions.insert(peer.to_string(), session);
        Ok(())
    }

    /// Remove a session
    pub fn remove_session(&mut self, peer: &str) -> Option<Session> {
        debug!("Removing session with {}", peer);
        self.sessions.remove(peer)
    }

    /// Addresses of all peers with a session, sorted
    #[must_use]
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.sessions.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Number of sessions held
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True if no sessions are held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Replace consumed one-time prekeys
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EntropyFailure` if key generation fails
    pub fn refill_prekeys(&mut self) -> Result<usize> {
        self.store.refill_prekeys()
    }

    /// Rotate the signed prekey
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EntropyFailure` if key generation fails
    pub fn rotate_signed_prekey(&mut self) -> Result<()> {
        self.store.rotate_signed_prekey()
    }

    fn ensure_capacity(&self, peer: &str) -> Result<()> {
        if !self.sessions.contains_key(peer) && self.sessions.len() >= self.config.max_sessions {
            return Err(SessionError::TooManySessions {
                max: self.config.max_sessions,
            }
            .into());
        }
        Ok(())
    }
}
