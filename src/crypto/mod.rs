//! Cryptographic primitives and prekey management.
//!
//! This module provides the key types shared by every layer, the key
//! derivation functions used by the handshake and the ratchet, the
//! authenticated ciphers at the edges, and the device-wide prekey store.

pub mod cipher;
pub mod kdf;
pub mod keys;
pub mod prekeys;
pub mod store;

pub use cipher::*;
pub use keys::*;
pub use prekeys::*;
pub use store::*;
