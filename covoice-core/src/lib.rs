//! covoice core
//!
//! Shared vocabulary of the voice-session subsystem:
//!
//! - **`ParticipantId` / `Participant`**: who is in the collaboration room
//! - **`SignalChannel`**: the out-of-band bus that carries offers, answers and
//!   ICE candidates between participants (consumed, not implemented here,
//!   except for the in-process `LocalSignalBus`)
//! - **`Presence`**: the room's participant list and join/leave notifications
//! - configuration, logging setup and the core error types

pub mod config;
pub mod error;
pub mod logging;
pub mod presence;
pub mod signal;
pub mod types;

pub use config::Config;
pub use error::{Result, SignalError};
pub use presence::{Presence, PresenceEvent, RoomRoster};
pub use signal::{
    BusEndpoint, IceCandidate, InboundSignal, LocalSignalBus, OutboundSignal, SignalChannel,
    SignalKind, SignalPayload,
};
pub use types::{generate_id, Participant, ParticipantId};

#[cfg(any(test, feature = "mock"))]
pub use signal::MockSignalChannel;
