//! Wire format for ratchet key messages.
//!
//! A [`KeyMessage`] carries one encrypted content key plus the ratchet
//! header the receiver needs to derive the matching message key. Messages
//! sent before the initiator has heard back also carry a [`PreKeyHeader`]
//! so the responder can run its side of X3DH.

use crate::crypto::PublicKey;
use crate::utils::{codec, OmemoError, ProtocolError, Result};
use serde::{Deserialize, Serialize};

/// Wire format version of key messages
pub const KEY_MESSAGE_VERSION: u8 = 3;

/// Maximum encoded size of a key message
pub const MAX_KEY_MESSAGE_SIZE: usize = 1024;

/// X3DH parameters attached to messages until the session is confirmed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyHeader {
    /// Initiator's identity key
    pub identity_key: PublicKey,
    /// Initiator's ephemeral (base) key
    pub base_key: PublicKey,
    /// Responder signed prekey used
    pub signed_prekey_id: u32,
    /// Responder one-time prekey used, 0 if none
    pub one_time_prekey_id: u32,
}

/// Ratchet header sent in the clear with every key message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Sender's current ratchet public key
    pub ratchet_key: PublicKey,
    /// Message number in the sending chain
    pub counter: u32,
    /// Length of the sender's previous sending chain
    pub previous_chain_length: u32,
    /// Handshake parameters, present only on prekey messages
    pub prekey: Option<PreKeyHeader>,
}

/// Encrypted content key envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMessage {
    /// Wire format version
    pub version: u8,
    /// Receiver must run the X3DH handshake first
    pub is_prekey: bool,
    /// Ratchet header
    pub header: Header,
    /// Content key sealed under the message key
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

impl Header {
    /// Associated data binding both identities and this header
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the header cannot be encoded
    pub fn associated_data(&self, sender: &PublicKey, receiver: &PublicKey) -> Result<Vec<u8>> {
        let mut ad = Vec::with_capacity(2 * 33 + 128);
        ad.extend_from_slice(&sender.serialize());
        ad.extend_from_slice(&receiver.serialize());
        ad.extend_from_slice(&codec::encode(self)?);
        Ok(ad)
    }
}

impl KeyMessage {
    /// Create a key message at the current wire version
    #[must_use]
    pub fn new(header: Header, ciphertext: Vec<u8>) -> Self {
        Self {
            version: KEY_MESSAGE_VERSION,
            is_prekey: header.prekey.is_some(),
            header,
            ciphertext,
        }
    }

    /// Serialize message to bytes
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::MessageTooLarge` if the encoding exceeds the limit
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let serialized = codec::encode(self)?;

        if serialized.len() > MAX_KEY_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: serialized.len(),
                max: MAX_KEY_MESSAGE_SIZE,
            }
            .into());
        }

        Ok(serialized)
    }

    /// Deserialize message from bytes
    ///
    /// # Errors
    ///
    /// Returns a protocol error for oversized, malformed or inconsistent input
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_KEY_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: bytes.len(),
                max: MAX_KEY_MESSAGE_SIZE,
            }
            .into());
        }

        let message: Self = codec::decode(bytes)?;
        message.validate()?;
        Ok(message)
    }

    /// Check the envelope invariants
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::UnsupportedVersion` or a protocol violation if
    /// the prekey flag disagrees with the header
    pub fn validate(&self) -> Result<()> {
        if self.version != KEY_MESSAGE_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                version: self.version,
            }
            .into());
        }

        if self.is_prekey != self.header.prekey.is_some() {
            return Err(OmemoError::violation(
                "prekey flag does not match header contents",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use rand::rngs::OsRng;

    fn key() -> PublicKey {
        *KeyPair::generate(&mut OsRng).unwrap().public()
    }

    fn header(prekey: Option<PreKeyHeader>) -> Header {
        Header {
            ratchet_key: key(),
            counter: 4,
            previous_chain_length: 2,
            prekey,
        }
    }

    #[test]
    fn test_message_encoding() {
        let prekey = PreKeyHeader {
            identity_key: key(),
            base_key: key(),
            signed_prekey_id: 1,
            one_time_prekey_id: 17,
        };
        let message = KeyMessage::new(header(Some(prekey)), vec![1, 2, 3]);
        assert!(message.is_prekey);

        let bytes = message.to_bytes().unwrap();
        assert_eq!(KeyMessage::from_bytes(&bytes).unwrap(), message);
    }

    #[test]
    fn test_inconsistent_prekey_flag_rejected() {
        let mut message = KeyMessage::new(header(None), vec![0; 8]);
        message.is_prekey = true;

        let bytes = codec::encode(&message).unwrap();
        let err = KeyMessage::from_bytes(&bytes).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ProtocolViolation);
    }

    #[test]
    fn test_version_checked() {
        let mut message = KeyMessage::new(header(None), vec![0; 8]);
        message.version = 2;

        let bytes = codec::encode(&message).unwrap();
        assert!(matches!(
            KeyMessage::from_bytes(&bytes),
            Err(OmemoError::Protocol(ProtocolError::UnsupportedVersion { version: 2 }))
        ));
    }

    #[test]
    fn test_oversized_message_rejected() {
        let message = KeyMessage::new(header(None), vec![0; MAX_KEY_MESSAGE_SIZE]);
        assert!(message.to_bytes().is_err());
        assert!(KeyMessage::from_bytes(&[0; MAX_KEY_MESSAGE_SIZE + 1]).is_err());
    }

    #[test]
    fn test_associated_data_is_directional() {
        let h = header(None);
        let (a, b) = (key(), key());
        assert_ne!(
            h.associated_data(&a, &b).unwrap(),
            h.associated_data(&b, &a).unwrap()
        );
    }
}
