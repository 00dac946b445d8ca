//! Error types for the OMEMO session core.
//!
//! Every fallible operation in the crate returns [`Result`]. Errors are
//! grouped by the layer that raises them, and [`OmemoError::kind`] folds
//! them back onto the flat protocol taxonomy callers usually branch on.

use thiserror::Error;

/// Result type alias for the OMEMO session library
pub type Result<T> = std::result::Result<T, OmemoError>;

/// Comprehensive error type for all session operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OmemoError {
    /// Cryptographic operation errors
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Session and ratchet errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Persisted state errors
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Protocol-level errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Cryptographic operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The randomness source failed
    #[error("Entropy source failure: {reason}")]
    EntropyFailure { reason: String },

    /// Signed prekey signature does not verify against the identity key
    #[error("Signature verification failed")]
    BadSignature,

    /// Invalid key format or size
    #[error("Invalid key: {reason}")]
    InvalidKey { reason: String },

    /// Encryption operation failure
    #[error("Encryption failed: {reason}")]
    Encryption { reason: String },

    /// Decryption operation failure
    #[error("Decryption failed: {reason}")]
    Decryption { reason: String },

    /// Key derivation failure
    #[error("Key derivation failed: {reason}")]
    KeyDerivation { reason: String },
}

/// Session management errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Session not found for a peer
    #[error("Session not found: {peer}")]
    NotFound { peer: String },

    /// Invalid session state for operation
    #[error("Invalid session state: {state}")]
    InvalidState { state: String },

    /// Message is further ahead than the skip limit allows
    #[error("Skip limit exceeded: {requested} keys requested (max: {max_skip})")]
    SkipLimitExceeded { requested: u64, max_skip: u32 },

    /// No one-time prekey available for the handshake
    #[error("No one-time prekey available")]
    PrekeyExhausted,

    /// Content key has the wrong length for the configured variant
    #[error("Invalid content key size: expected {expected}, got {actual}")]
    InvalidContentKey { expected: usize, actual: usize },

    /// Too many sessions held by a manager
    #[error("Session limit reached: {max}")]
    TooManySessions { max: usize },
}

/// Errors raised while decoding persisted Store or Session blobs
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// Blob failed an integrity or format check
    #[error("Malformed state: {reason}")]
    Malformed { reason: String },

    /// Blob was written by an unknown format version
    #[error("Unsupported state version: {version}")]
    UnsupportedVersion { version: u8 },
}

/// Protocol-level errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Header or field invariant breach; the session should be re-established
    #[error("Protocol violation: {reason}")]
    Violation { reason: String },

    /// A cached message key was expected but is gone
    #[error("Message key for counter {counter} is no longer available")]
    MessageKeyGone { counter: u32 },

    /// Unsupported wire version
    #[error("Unsupported protocol version: {version}")]
    UnsupportedVersion { version: u8 },

    /// Invalid message format
    #[error("Invalid message format: {reason}")]
    InvalidMessage { reason: String },

    /// Message too large
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration parsing error
    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },

    /// Directory creation failure
    #[error("Failed to create directory: {path}")]
    DirectoryCreation { path: String },
}

/// Flat protocol-level classification of an [`OmemoError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Randomness source unavailable
    EntropyFailure,
    /// Bundle signature invalid
    BadSignature,
    /// Persisted state failed to decode
    MalformedState,
    /// Counter gap larger than the configured maximum
    SkipLimitExceeded,
    /// Handshake could not attach a one-time prekey
    PrekeyExhausted,
    /// Header or field invariant breach
    ProtocolViolation,
    /// Other cryptographic failure (AEAD, KDF, key format)
    Crypto,
    /// Operation not valid in the current session state
    InvalidState,
    /// Configuration problem
    Config,
    /// I/O or external serialization failure
    Io,
}

impl OmemoError {
    /// Convenience constructor for protocol violations
    pub fn violation<S: Into<String>>(reason: S) -> Self {
        Self::Protocol(ProtocolError::Violation {
            reason: reason.into(),
        })
    }

    /// Convenience constructor for malformed persisted state
    pub fn malformed<S: Into<String>>(reason: S) -> Self {
        Self::State(StateError::Malformed {
            reason: reason.into(),
        })
    }

    /// Maps this error onto the protocol taxonomy
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Crypto(CryptoError::EntropyFailure { .. }) => ErrorKind::EntropyFailure,
            Self::Crypto(CryptoError::BadSignature) => ErrorKind::BadSignature,
            Self::Crypto(_) => ErrorKind::Crypto,
            Self::State(_) => ErrorKind::MalformedState,
            Self::Session(SessionError::SkipLimitExceeded { .. }) => ErrorKind::SkipLimitExceeded,
            Self::Session(SessionError::PrekeyExhausted) => ErrorKind::PrekeyExhausted,
            Self::Session(SessionError::InvalidContentKey { .. }) => ErrorKind::ProtocolViolation,
            Self::Session(_) => ErrorKind::InvalidState,
            Self::Protocol(_) => ErrorKind::ProtocolViolation,
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_) | Self::Serialization(_) => ErrorKind::Io,
        }
    }

    /// Returns true if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Session(SessionError::PrekeyExhausted)
                | Self::Session(SessionError::TooManySessions { .. })
                | Self::Protocol(ProtocolError::MessageTooLarge { .. })
                | Self::Io(_)
        )
    }

    /// Returns true if this error indicates a security violation
    #[must_use]
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            Self::Crypto(CryptoError::BadSignature)
                | Self::Crypto(CryptoError::Decryption { .. })
                | Self::Protocol(ProtocolError::Violation { .. })
                | Self::Protocol(ProtocolError::MessageKeyGone { .. })
                | Self::Session(SessionError::SkipLimitExceeded { .. })
        )
    }
}

impl From<std::io::Error> for OmemoError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for OmemoError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for OmemoError {
    fn from(err: bincode::Error) -> Self {
        Self::Protocol(ProtocolError::InvalidMessage {
            reason: err.to_string(),
        })
    }
}

impl From<rand_core::Error> for OmemoError {
    fn from(err: rand_core::Error) -> Self {
        Self::Crypto(CryptoError::EntropyFailure {
            reason: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = OmemoError::Crypto(CryptoError::InvalidKey {
            reason: "Invalid key length".to_string(),
        });
        assert!(error.to_string().contains("Invalid key"));
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(
            OmemoError::from(CryptoError::BadSignature).kind(),
            ErrorKind::BadSignature
        );
        assert_eq!(
            OmemoError::malformed("truncated").kind(),
            ErrorKind::MalformedState
        );
        assert_eq!(
            OmemoError::from(StateError::UnsupportedVersion { version: 9 }).kind(),
            ErrorKind::MalformedState
        );
        assert_eq!(
            OmemoError::from(SessionError::SkipLimitExceeded {
                requested: 500,
                max_skip: 100
            })
            .kind(),
            ErrorKind::SkipLimitExceeded
        );
        assert_eq!(
            OmemoError::from(ProtocolError::MessageKeyGone { counter: 3 }).kind(),
            ErrorKind::ProtocolViolation
        );
        assert_eq!(
            OmemoError::from(SessionError::PrekeyExhausted).kind(),
            ErrorKind::PrekeyExhausted
        );
    }

    #[test]
    fn test_entropy_failure_from_rng_error() {
        let err: OmemoError = rand_core::Error::new("no entropy").into();
        assert_eq!(err.kind(), ErrorKind::EntropyFailure);
    }

    #[test]
    fn test_error_recovery() {
        assert!(OmemoError::from(SessionError::PrekeyExhausted).is_recoverable());
        assert!(!OmemoError::from(CryptoError::BadSignature).is_recoverable());
    }

    #[test]
    fn test_security_violations() {
        assert!(OmemoError::from(CryptoError::BadSignature).is_security_violation());
        assert!(OmemoError::violation("counter regression").is_security_violation());
        assert!(!OmemoError::Io("disk full".to_string()).is_security_violation());
    }
}
