//! Session layer: key agreement, the Double Ratchet and per-peer sessions.
//!
//! This module provides X3DH key agreement, the Double Ratchet key
//! schedule, the key message wire format, skipped-key storage and the
//! [`Session`] state machine built from them.

pub mod engine;
pub mod manager;
pub mod message;
pub mod ratchet;
pub mod skipped;
pub mod x3dh;

pub use engine::*;
pub use manager::*;
pub use message::*;
pub use ratchet::RatchetState;
pub use skipped::*;
pub use x3dh::*;
