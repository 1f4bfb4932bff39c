/// Result alias that carries the custom [`CallerError`] type.
pub type Result<T> = std::result::Result<T, CallerError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum CallerError {
    /// Free-form message for failures that do not warrant their own variant.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// The moves document or a config file is not valid JSON for its schema.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    /// Tempo outside the accepted beats-per-minute range.
    #[error("invalid tempo {0} bpm")]
    InvalidTempo(i64),
    /// Volume that is not a finite number.
    #[error("invalid volume {0}")]
    InvalidVolume(f32),
    /// Sequencing was requested with no moves to choose from.
    #[error("move catalog is empty")]
    EmptyCatalog,
    /// A catalog entry failed validation.
    #[error("invalid move `{id}`: {reason}")]
    InvalidMove { id: String, reason: String },
    /// The host audio output could not be used.
    #[error("audio unavailable: {0}")]
    AudioUnavailable(String),
    /// The host speech facility could not be used.
    #[error("speech unavailable: {0}")]
    SpeechUnavailable(String),
    /// The session driver has shut down and no longer accepts commands.
    #[error("session is closed")]
    SessionClosed,
}

impl CallerError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub(crate) fn invalid_move(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidMove {
            id: id.into(),
            reason: reason.into(),
        }
    }
}
