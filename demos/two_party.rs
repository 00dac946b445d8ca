//! Two devices exchanging OMEMO key messages in one process.
//!
//! Alice publishes a bundle, Bob starts a session with it, and both sides
//! trade content keys, including one delivered out of order. The last
//! exchange carries a real message body sealed with AES-128-GCM.
//!
//! Run with `cargo run --example two_party`; set `OMEMO_LOG_LEVEL=debug`
//! to see the ratchet steps.

use anyhow::{ensure, Result};
use log::info;
use omemo_session::crypto::PAYLOAD_KEY_SIZE;
use omemo_session::{
    decrypt_payload, encrypt_payload, Bundle, OmemoConfig, Session, SessionStatus, Store,
};
use rand::rngs::OsRng;
use rand::RngCore;

fn init_logging(level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

fn random_key(size: usize) -> Vec<u8> {
    let mut key = vec![0u8; size];
    OsRng.fill_bytes(&mut key);
    key
}

fn main() -> Result<()> {
    let config = OmemoConfig::default().merge_from_env()?;
    config.validate()?;
    init_logging(&config.logging.level);

    let mut alice_store = Store::setup(&config.store)?;
    let mut bob_store = Store::setup(&config.store)?;
    let mut alice = Session::new(config.session)?;
    let mut bob = Session::new(config.session)?;

    // The bundle travels as JSON, as it would through a server
    let published = alice_store.bundle().to_json()?;
    let bundle = Bundle::from_json(&published)?;
    info!("Alice publishes {} one-time prekeys", bundle.one_time_prekeys.len());

    bob.initiate_session(&bob_store, &bundle)?;
    let key_size = config.session.content_key_size;

    let key = random_key(key_size);
    let message = bob.encrypt_key(&bob_store, &key)?;
    ensure!(alice.decrypt_key(&mut alice_store, &message)? == key, "handshake key mismatch");
    info!("Alice accepted Bob's handshake, {} prekeys left", alice_store.available_prekeys());

    let keys: Vec<_> = (0..4).map(|_| random_key(key_size)).collect();
    let mut messages = Vec::with_capacity(keys.len());
    for key in &keys {
        messages.push(alice.encrypt_key(&alice_store, key)?);
    }

    for i in [0, 1, 3, 2] {
        let received = bob.decrypt_key(&mut bob_store, &messages[i])?;
        ensure!(received == keys[i], "key {} mismatch", i);
        info!("Bob decrypted key {}", i);
    }
    ensure!(bob.status() == SessionStatus::Active, "Bob's session is not active");

    // The built-in body cipher only yields legacy 32-byte keys
    if key_size == PAYLOAD_KEY_SIZE {
        let payload = encrypt_payload(b"Hello")?;
        let message = bob.encrypt_key(&bob_store, &payload.content_key)?;

        let wire = message.to_bytes()?;
        let received = omemo_session::KeyMessage::from_bytes(&wire)?;
        let content_key = alice.decrypt_key(&mut alice_store, &received)?;
        let plain = decrypt_payload(&content_key, &payload.iv, &payload.ciphertext)?;
        info!("Alice reads: {}", String::from_utf8_lossy(&plain));
    } else {
        info!("Skipping message body: {}-byte keys need an external cipher", key_size);
    }

    let restored: Session = Session::deserialize(&alice.serialize()?, config.session)?;
    ensure!(restored == alice, "session did not survive persistence");
    alice_store.refill_prekeys()?;
    ensure!(
        Store::deserialize(&alice_store.serialize()?)? == alice_store,
        "store did not survive persistence"
    );

    info!("Scenario complete");
    Ok(())
}
