use covoice_media::MediaAccessError;
use thiserror::Error;

/// Errors surfaced by session-level operations.
///
/// Per-peer failures never appear here; they stay on the peer's record.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Voice session is already connected")]
    AlreadyConnected,

    #[error(transparent)]
    MediaAccess(#[from] MediaAccessError),
}
