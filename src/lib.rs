//! # OMEMO Session
//!
//! The session core of OMEMO end-to-end encryption: identity and prekey
//! management, the X3DH handshake and the Double Ratchet, with a resumable
//! decrypt protocol so skipped message keys can live in caller-owned storage.
//!
//! ## Features
//!
//! - **Prekey Store**: X25519 identity, XEdDSA-signed prekey and a refillable one-time prekey pool
//! - **Key Agreement**: X3DH with optional fallback when no one-time prekey is left
//! - **Double Ratchet**: per-message keys with forward secrecy and break-in recovery
//! - **Out-of-Order Delivery**: bounded skipped-key derivation, pluggable sync or async key storage
//! - **Persistence**: strict, versioned binary encoding of Store and Session state
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use omemo_session::{Session, SessionConfig, Store, StoreConfig};
//!
//! fn main() -> omemo_session::Result<()> {
//!     let mut alice_store = Store::setup(&StoreConfig::default())?;
//!     let bob_store = Store::setup(&StoreConfig::default())?;
//!
//!     let mut bob = Session::new(SessionConfig::default())?;
//!     bob.initiate_session(&bob_store, &alice_store.bundle())?;
//!     let message = bob.encrypt_key(&bob_store, &[7u8; 32])?;
//!
//!     let mut alice = Session::new(SessionConfig::default())?;
//!     let key = alice.decrypt_key(&mut alice_store, &message)?;
//!     assert_eq!(key, vec![7u8; 32]);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The library is organized into several key modules:
//!
//! - [`crypto`]: Keys, key derivation, ciphers and the prekey store
//! - [`session`]: X3DH, the Double Ratchet, key messages and sessions
//! - [`state`]: Persistence format for stores and sessions
//! - [`utils`]: Configuration, error handling, and encoding
//!
//! Sessions never own the store; every operation borrows it, so one store
//! can back any number of sessions under a single writer such as
//! [`SessionManager`].

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::module_name_repetitions)]

pub mod crypto;
pub mod session;
pub mod state;
pub mod utils;

// Re-export commonly used types for convenience
pub use crypto::{decrypt_payload, encrypt_payload, Bundle, EncryptedPayload, KeyPair, PublicKey, Store};
pub use session::{
    DecryptStep, DecryptedKey, KeyLookup, KeyMessage, MessageKey, MessageKeyStore, Resume,
    Session, SessionManager, SessionStatus,
};
pub use utils::{ErrorKind, OmemoConfig, OmemoError, Result, SessionConfig, StoreConfig};

/// Version information for the session protocol
pub const PROTOCOL_VERSION: &str = "0.3.0";

/// Default configuration values
pub mod defaults {
    /// Default number of one-time prekeys in a store
    pub const DEFAULT_PREKEY_COUNT: usize = 100;

    /// Default maximum number of message keys skipped in one decrypt
    pub const DEFAULT_MAX_SKIP: u32 = 1000;

    /// Default capacity of a session's skipped-key cache
    pub const DEFAULT_MAX_CACHED_KEYS: usize = 2000;

    /// Default content key size (legacy OMEMO)
    pub const DEFAULT_CONTENT_KEY_SIZE: usize = 32;

    /// Default receiving count after which a heartbeat is advisable
    pub const DEFAULT_HEARTBEAT_THRESHOLD: u32 = 53;

    /// Default maximum number of sessions per manager
    pub const DEFAULT_MAX_SESSIONS: usize = 1000;
}
