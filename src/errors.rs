use std::{io, path::PathBuf};

use thiserror::Error;

use crate::backend::BackendError;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Please call the Start method first.")]
    NotRunning,
    #[error("failed to read image {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("unknown model: {0}")]
    ModelUnknown(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("model error: {0}")]
    Model(String),
    #[error("stream error: {0}")]
    Stream(String),
}

impl ChatError {
    /// Wraps a failure that ended a response stream early.
    pub fn from_stream(error: BackendError) -> Self {
        ChatError::Stream(error.to_string())
    }

    pub fn is_not_running(&self) -> bool {
        matches!(self, ChatError::NotRunning)
    }
}

impl From<BackendError> for ChatError {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::Unauthorized(message) => ChatError::Auth(message),
            BackendError::ModelNotFound(model) => ChatError::ModelUnknown(model),
            BackendError::Unavailable(_) | BackendError::Timeout(_) => {
                ChatError::Transport(error.to_string())
            }
            BackendError::InvalidResponse(_)
            | BackendError::InvalidRequest(_)
            | BackendError::Blocked(_) => ChatError::Model(error.to_string()),
        }
    }
}
