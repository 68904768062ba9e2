use thiserror::Error;

use crate::common::error::GridAllocError::GenericError;

#[derive(Debug, Error)]
pub enum GridAllocError {
    /// The backend rejected a submission or the submission command could not
    /// produce a request identifier. Carries the raw scheduler diagnostic.
    #[error("Submission failed: {0}")]
    Submission(String),
    /// A scheduler-native status token that has no entry in the backend's
    /// translation table.
    #[error("Backend {backend} reported unknown status token {token:?}")]
    UnknownStatusToken { backend: String, token: String },
    /// The command transport failed before the scheduler command could run at
    /// all (e.g. the binary is missing or the remote channel is unreachable).
    #[error("Command transport error: {0}")]
    Channel(String),
    /// The scheduler command ran and exited with a failure.
    #[error("Command `{program}` exited with code {code}\nStderr: {stderr}\nStdout: {stdout}")]
    CommandFailed {
        program: String,
        code: i32,
        stderr: String,
        stdout: String,
    },
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Error: {0}")]
    GenericError(String),
}

impl GridAllocError {
    pub fn is_channel_failure(&self) -> bool {
        matches!(self, GridAllocError::Channel(_))
    }
}

impl From<anyhow::Error> for GridAllocError {
    fn from(error: anyhow::Error) -> Self {
        GenericError(format!("{error:?}"))
    }
}

impl From<String> for GridAllocError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}

pub fn error<T>(message: String) -> crate::Result<T> {
    Err(GenericError(message))
}
