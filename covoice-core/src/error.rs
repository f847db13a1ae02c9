use thiserror::Error;

use crate::types::ParticipantId;

/// Signal channel errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalError {
    #[error("Unknown recipient: {0}")]
    UnknownRecipient(ParticipantId),

    #[error("Signal channel closed for {0}")]
    ChannelClosed(ParticipantId),

    #[error("Signal transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, SignalError>;
