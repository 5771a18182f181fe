use thiserror::Error;

/// Errors surfaced by either side of a PIR session.
///
/// `Abort` is the single fatal protocol error: once it is returned the
/// session state (hint pool, cache, channel position) must be discarded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PirError {
    #[error("session aborted: {0}")]
    Abort(String),
    #[error("channel error: {0}")]
    Channel(String),
    #[error("invalid params: {0}")]
    InvalidParams(&'static str),
    #[error("index {index} out of range [0, {num_entries})")]
    InvalidIndex { index: usize, num_entries: usize },
    #[error("entry length mismatch: expected {expected} bytes, got {got}")]
    InvalidEntry { expected: usize, got: usize },
    #[error("client has not completed preprocessing")]
    NotPreprocessed,
}

impl PirError {
    pub(crate) fn abort(reason: impl Into<String>) -> Self {
        Self::Abort(reason.into())
    }

    /// True for errors after which the session cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Abort(_) | Self::Channel(_))
    }
}

pub type Result<T> = std::result::Result<T, PirError>;
