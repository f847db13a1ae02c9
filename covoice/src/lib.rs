//! covoice
//!
//! Peer-to-peer voice for a collaboration room. [`VoiceSession`] is the
//! entry point an application drives: connect/disconnect, mute, deafen,
//! volume, plus the signal and presence callbacks of the room.

pub mod error;
pub mod session;

pub use error::SessionError;
pub use session::{SessionContext, SessionSettings, VoiceSession};
