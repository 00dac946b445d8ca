//! Persistence format for Store and Session state.
//!
//! A blob is a four-byte magic, a one-byte format version and a bincode
//! body with fixed field order. Decoding is strict: trailing bytes,
//! unknown tags and any state that could not have been produced by this
//! crate are rejected as malformed rather than repaired.

use crate::crypto::{KeyPair, PayloadCipher, PreKey, PublicKey, SignedPreKey, Store};
use crate::session::{MessageKey, PreKeyHeader, RatchetState, Session, SessionStatus, SkippedKeys};
use crate::utils::{codec, OmemoError, Result, SessionConfig, StateError, MAX_PREKEY_COUNT};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Magic prefix of a Store blob
pub const STORE_MAGIC: [u8; 4] = *b"OMST";

/// Magic prefix of a Session blob
pub const SESSION_MAGIC: [u8; 4] = *b"OMSN";

/// Current state format version
pub const STATE_VERSION: u8 = 1;

const HEADER_SIZE: usize = 5;

#[derive(Serialize)]
struct StoreRecordRef<'a> {
    identity: &'a KeyPair,
    signed_prekey: &'a SignedPreKey,
    previous_signed_prekey: Option<&'a SignedPreKey>,
    prekeys: &'a [PreKey],
    prekey_counter: u32,
}

#[derive(Deserialize)]
struct StoreRecord {
    identity: KeyPair,
    signed_prekey: SignedPreKey,
    previous_signed_prekey: Option<SignedPreKey>,
    prekeys: Vec<PreKey>,
    prekey_counter: u32,
}

#[derive(Serialize)]
struct SessionRecordRef<'a> {
    status: SessionStatus,
    remote_identity: Option<&'a PublicKey>,
    ratchet: Option<&'a RatchetState>,
    handshake: Option<&'a PreKeyHeader>,
    skipped: Vec<&'a MessageKey>,
}

#[derive(Deserialize)]
struct SessionRecord {
    status: SessionStatus,
    remote_identity: Option<PublicKey>,
    ratchet: Option<RatchetState>,
    handshake: Option<PreKeyHeader>,
    skipped: Vec<MessageKey>,
}

/// Encode a Store, private keys included
///
/// # Errors
///
/// Returns a protocol error if encoding fails
pub fn encode_store(store: &Store) -> Result<Vec<u8>> {
    let record = StoreRecordRef {
        identity: &store.identity,
        signed_prekey: &store.signed_prekey,
        previous_signed_prekey: store.previous_signed_prekey.as_ref(),
        prekeys: &store.prekeys,
        prekey_counter: store.prekey_counter,
    };
    frame(STORE_MAGIC, &record)
}

/// Decode and validate a Store blob
///
/// # Errors
///
/// Returns `StateError::Malformed` for any integrity failure and
/// `StateError::UnsupportedVersion` for an unknown format version
pub fn decode_store(bytes: &[u8]) -> Result<Store> {
    let record: StoreRecord = unframe(STORE_MAGIC, bytes)?;

    if !record.identity.is_consistent() {
        return Err(OmemoError::malformed("identity keypair is inconsistent"));
    }

    for signed in std::iter::once(&record.signed_prekey).chain(record.previous_signed_prekey.as_ref()) {
        if signed.id == 0 || !signed.keypair.is_consistent() {
            return Err(OmemoError::malformed(format!("signed prekey {} is invalid", signed.id)));
        }
        signed
            .verify(record.identity.public())
            .map_err(|_| OmemoError::malformed(format!("signed prekey {} has a bad signature", signed.id)))?;
    }

    if record.prekeys.is_empty() || record.prekeys.len() > MAX_PREKEY_COUNT {
        return Err(OmemoError::malformed("prekey pool size out of range"));
    }

    let mut ids = HashSet::with_capacity(record.prekeys.len());
    for prekey in &record.prekeys {
        if prekey.is_consumed() {
            if !prekey.keypair.is_empty() {
                return Err(OmemoError::malformed("consumed prekey slot still holds keys"));
            }
            continue;
        }
        if prekey.id > record.prekey_counter || !prekey.keypair.is_consistent() {
            return Err(OmemoError::malformed(format!("prekey {} is invalid", prekey.id)));
        }
        if !ids.insert(prekey.id) {
            return Err(OmemoError::malformed(format!("duplicate prekey id {}", prekey.id)));
        }
    }

    debug!("Decoded store with {} available prekeys", ids.len());
    Ok(Store {
        identity: record.identity,
        signed_prekey: record.signed_prekey,
        previous_signed_prekey: record.previous_signed_prekey,
        prekeys: record.prekeys,
        prekey_counter: record.prekey_counter,
    })
}

/// Encode a Session, skipped-key cache included
///
/// Runtime configuration is not part of the blob.
///
/// # Errors
///
/// Returns a protocol error if encoding fails
pub fn encode_session<C: PayloadCipher>(session: &Session<C>) -> Result<Vec<u8>> {
    let record = SessionRecordRef {
        status: session.status,
        remote_identity: session.remote_identity.as_ref(),
        ratchet: session.ratchet.as_ref(),
        handshake: session.handshake.as_ref(),
        skipped: session.skipped.iter().collect(),
    };
    frame(SESSION_MAGIC, &record)
}

/// Decode and validate a Session blob, attaching `config`
///
/// # Errors
///
/// Returns `StateError::Malformed` for any integrity failure and
/// `StateError::UnsupportedVersion` for an unknown format version
pub fn decode_session<C: PayloadCipher>(bytes: &[u8], config: SessionConfig) -> Result<Session<C>> {
    config.validate()?;
    let record: SessionRecord = unframe(SESSION_MAGIC, bytes)?;

    let consistent = match record.status {
        SessionStatus::Uninitialized => {
            record.ratchet.is_none() && record.remote_identity.is_none() && record.handshake.is_none()
        }
        SessionStatus::Initiated => {
            record.ratchet.is_some() && record.remote_identity.is_some() && record.handshake.is_some()
        }
        SessionStatus::Active => record.ratchet.is_some() && record.remote_identity.is_some(),
    };
    if !consistent {
        return Err(OmemoError::malformed(format!(
            "session fields contradict status {:?}",
            record.status
        )));
    }

    if record.ratchet.as_ref().is_some_and(|r| !r.is_consistent()) {
        return Err(OmemoError::malformed("ratchet state is inconsistent"));
    }

    if record.skipped.len() > config.max_cached_keys {
        return Err(OmemoError::malformed(format!(
            "{} skipped keys exceed capacity {}",
            record.skipped.len(),
            config.max_cached_keys
        )));
    }

    Ok(Session::from_parts(
        record.status,
        record.remote_identity,
        record.ratchet,
        record.handshake,
        SkippedKeys::from_keys(record.skipped, config.max_cached_keys),
        config,
    ))
}

fn frame<T: Serialize>(magic: [u8; 4], record: &T) -> Result<Vec<u8>> {
    let body = codec::encode(record)?;
    let mut bytes = Vec::with_capacity(HEADER_SIZE + body.len());
    bytes.extend_from_slice(&magic);
    bytes.push(STATE_VERSION);
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

fn unframe<'a, T: Deserialize<'a>>(magic: [u8; 4], bytes: &'a [u8]) -> Result<T> {
    if bytes.len() < HEADER_SIZE {
        return Err(OmemoError::malformed("state blob is truncated"));
    }
    if bytes[..4] != magic {
        return Err(OmemoError::malformed("unexpected state magic"));
    }
    if bytes[4] != STATE_VERSION {
        return Err(StateError::UnsupportedVersion { version: bytes[4] }.into());
    }
    codec::decode(&bytes[HEADER_SIZE..]).map_err(|e| OmemoError::malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{ErrorKind, StoreConfig};
    use rand::rngs::OsRng;

    fn store() -> Store {
        Store::setup(&StoreConfig { prekey_count: 4 }).unwrap()
    }

    /// Bob initiated with Alice; Alice received three of four messages
    fn sessions() -> (Store, Session, Store, Session) {
        let mut alice_store = store();
        let bob_store = store();
        let mut alice = Session::new(SessionConfig::default()).unwrap();
        let mut bob = Session::new(SessionConfig::default()).unwrap();

        bob.initiate_session(&bob_store, &alice_store.bundle()).unwrap();
        let messages: Vec<_> = (0..4u8)
            .map(|i| bob.encrypt_key(&bob_store, &[i; 32]).unwrap())
            .collect();
        for i in [0, 1, 3] {
            alice.decrypt_key(&mut alice_store, &messages[i]).unwrap();
        }
        (alice_store, alice, bob_store, bob)
    }

    fn assert_malformed(result: Result<impl std::fmt::Debug>) {
        assert_eq!(result.unwrap_err().kind(), ErrorKind::MalformedState);
    }

    #[test]
    fn test_store_round_trip() {
        let mut original = store();
        original.consume_prekey(2).unwrap();
        original.rotate_signed_prekey().unwrap();

        let bytes = original.serialize().unwrap();
        assert_eq!(&bytes[..4], b"OMST");
        assert_eq!(bytes[4], STATE_VERSION);

        let restored = Store::deserialize(&bytes).unwrap();
        assert_eq!(restored, original);
        assert_eq!(restored.serialize().unwrap(), bytes);
    }

    #[test]
    fn test_session_round_trip() {
        let (_, alice, _, bob) = sessions();
        assert_eq!(alice.skipped_keys().len(), 1);

        for session in [&alice, &bob, &Session::new(SessionConfig::default()).unwrap()] {
            let bytes = session.serialize().unwrap();
            assert_eq!(&bytes[..4], b"OMSN");
            let restored: Session = Session::deserialize(&bytes, SessionConfig::default()).unwrap();
            assert_eq!(&restored, session);
        }
    }

    #[test]
    fn test_restored_session_keeps_working() {
        let (mut alice_store, alice, mut bob_store, mut bob) = sessions();

        let alice_store_bytes = alice_store.serialize().unwrap();
        let alice_bytes = alice.serialize().unwrap();
        drop(alice);
        alice_store = Store::deserialize(&alice_store_bytes).unwrap();
        let mut alice: Session = Session::deserialize(&alice_bytes, SessionConfig::default()).unwrap();

        let reply = alice.encrypt_key(&alice_store, &[8u8; 32]).unwrap();
        assert_eq!(bob.decrypt_key(&mut bob_store, &reply).unwrap(), vec![8u8; 32]);

        let message = bob.encrypt_key(&bob_store, &[9u8; 32]).unwrap();
        assert_eq!(alice.decrypt_key(&mut alice_store, &message).unwrap(), vec![9u8; 32]);
    }

    #[test]
    fn test_header_checks() {
        let bytes = store().serialize().unwrap();

        let mut wrong_magic = bytes.clone();
        wrong_magic[0] = b'X';
        assert_malformed(Store::deserialize(&wrong_magic));

        let session_bytes = Session::new(SessionConfig::default()).unwrap().serialize().unwrap();
        assert_malformed(Store::deserialize(&session_bytes));

        let mut future = bytes.clone();
        future[4] = STATE_VERSION + 1;
        assert!(matches!(
            Store::deserialize(&future),
            Err(OmemoError::State(StateError::UnsupportedVersion { .. }))
        ));

        assert_malformed(Store::deserialize(&bytes[..3]));
        assert_malformed(Store::deserialize(&bytes[..bytes.len() - 1]));

        let mut trailing = bytes;
        trailing.push(0);
        assert_malformed(Store::deserialize(&trailing));
    }

    #[test]
    fn test_inconsistent_keypair_rejected() {
        let mut bytes = store().serialize().unwrap();
        // First byte of the identity private key follows the header
        bytes[HEADER_SIZE + 1] ^= 0x10;
        assert_malformed(Store::deserialize(&bytes));
    }

    #[test]
    fn test_consumed_slot_with_keys_rejected() {
        let mut tampered = store();
        tampered.consume_prekey(1).unwrap();
        let slot = tampered.prekeys.iter_mut().find(|p| p.is_consumed()).unwrap();
        slot.keypair = KeyPair::generate(&mut OsRng).unwrap();

        assert_malformed(Store::deserialize(&tampered.serialize().unwrap()));
    }

    #[test]
    fn test_duplicate_prekey_ids_rejected() {
        let mut tampered = store();
        tampered.prekeys[1].id = tampered.prekeys[0].id;
        assert_malformed(Store::deserialize(&tampered.serialize().unwrap()));
    }

    #[test]
    fn test_status_contradiction_rejected() {
        let (_, alice, _, _) = sessions();
        let mut tampered = alice.clone();
        tampered.status = SessionStatus::Uninitialized;
        let bytes = tampered.serialize().unwrap();
        assert_malformed(Session::<crate::crypto::ChaChaPolyCipher>::deserialize(
            &bytes,
            SessionConfig::default(),
        ));

        let mut tampered = alice;
        tampered.handshake = None;
        tampered.status = SessionStatus::Initiated;
        let bytes = tampered.serialize().unwrap();
        assert_malformed(Session::<crate::crypto::ChaChaPolyCipher>::deserialize(
            &bytes,
            SessionConfig::default(),
        ));
    }

    #[test]
    fn test_skipped_cache_over_capacity_rejected() {
        let (_, alice, _, _) = sessions();
        let bytes = alice.serialize().unwrap();
        let small = SessionConfig {
            max_cached_keys: 0,
            ..SessionConfig::default()
        };
        assert_malformed(Session::<crate::crypto::ChaChaPolyCipher>::deserialize(&bytes, small));
    }
}
