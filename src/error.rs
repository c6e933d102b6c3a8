//! Hadron placement error abstractions.

use thiserror::Error;

// Error messages.
pub const ERR_ITER_FAILURE: &str = "error returned during key/value iteration from database";
pub const ERR_DB_FLUSH: &str = "error flushing database state";

/// Application error variants.
///
/// Protocol rejections (an already assigned channel, a stale unavailability report) are not
/// errors and are never represented here. They are returned as outcomes from the operations
/// which produce them.
#[derive(Debug, Error)]
pub enum AppError {
    /// The target channel has not been registered.
    #[error("channel {0} not found")]
    ChannelNotFound(String),
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// A conditional write kept losing to concurrent writers.
    ///
    /// Callers should treat this as transient and retry the whole operation later.
    #[error("conflicting updates to channel {channel}, gave up after {attempts} attempts")]
    Conflict { channel: String, attempts: u32 },
    /// An operation was presented with a term older than the latest known term of its channel.
    #[error("stale term {term} for channel {channel}, latest observed term is {latest}")]
    StaleTerm { channel: String, term: u64, latest: u64 },
    /// An external collaborator could not be reached.
    #[error("collaborator unavailable: {0}")]
    Unavailable(anyhow::Error),
}

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;
