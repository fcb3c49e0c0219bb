use thiserror::Error;

/// Terminal error of a statement that ran under [`retry_on_deadlock`].
///
/// Carries the driver's message verbatim; callers that care whether the
/// retry budget was exhausted by contention or by an unrelated SQL error
/// inspect the message, not the type.
///
/// [`retry_on_deadlock`]: crate::jobs::retry::retry_on_deadlock
#[derive(Debug, Error)]
#[error("{message}")]
pub struct RetryError {
    pub message: String,
}

impl RetryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A handler blob that could not be decoded back into a payload.
#[derive(Debug, Error)]
#[error("could not decode job payload: {0}")]
pub struct DeserializationError(pub String);

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Retry(#[from] RetryError),

    #[error(transparent)]
    Deserialization(#[from] DeserializationError),

    #[error("unsupported database url scheme: {0}")]
    UnsupportedScheme(String),
}

pub type Result<T> = std::result::Result<T, Error>;
