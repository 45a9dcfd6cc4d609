use palaver_storage::{SessionId, StorageError};
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ControllerError {
    #[snafu(display("please select a model before sending a message"))]
    ModelNotSelected { stage: &'static str },
    #[snafu(display("session {session_id} is still streaming a response"))]
    SubmissionInFlight {
        stage: &'static str,
        session_id: SessionId,
    },
    #[snafu(display("session {session_id} has no user message to regenerate from"))]
    NothingToReload {
        stage: &'static str,
        session_id: SessionId,
    },
    #[snafu(display("session store failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
}

impl ControllerError {
    /// Errors that leave the controller untouched and only need a notice for the user.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, Self::Storage { .. })
    }
}

pub type ControllerResult<T> = Result<T, ControllerError>;
