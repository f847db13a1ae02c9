use thiserror::Error;

/// Microphone acquisition errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaAccessError {
    #[error("Microphone permission denied")]
    PermissionDenied,

    #[error("No microphone device available")]
    NoDevice,

    #[error("Microphone device error: {0}")]
    Device(String),
}
