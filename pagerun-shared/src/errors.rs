//! Error taxonomy for stage execution.
//!
//! A rejected conflict is not an error: it is reported as a normal outcome
//! by the engine. Everything here ends an execution in `Failed`, or is
//! returned before any side effect took place.

use thiserror::Error;

pub type PagerunResult<T> = Result<T, PagerunError>;

#[derive(Debug, Error)]
pub enum PagerunError {
    /// The external program could not be located or spawned.
    #[error("failed to launch {program}: {reason}")]
    Launch { program: String, reason: String },

    /// `start` was called twice on the same process handle.
    #[error("process handle already started")]
    AlreadyStarted,

    /// The external program exited unsuccessfully.
    #[error("process exited unsuccessfully (code: {code:?}, signal: {signal:?})")]
    ProcessExit {
        code: Option<i32>,
        signal: Option<i32>,
    },

    /// The process succeeded but its outputs could not be moved into place.
    #[error("post-processing failed: {0}")]
    PostProcessing(String),

    /// Directory creation or stale output deletion failed.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for PagerunError {
    fn from(err: std::io::Error) -> Self {
        PagerunError::Storage(err.to_string())
    }
}

impl PagerunError {
    /// Stable short name, logged as `error_kind` when an execution fails.
    pub fn kind(&self) -> &'static str {
        match self {
            PagerunError::Launch { .. } => "launch",
            PagerunError::AlreadyStarted => "already_started",
            PagerunError::ProcessExit { .. } => "process_exit",
            PagerunError::PostProcessing(_) => "post_processing",
            PagerunError::Storage(_) => "storage",
            PagerunError::InvalidArgument(_) => "invalid_argument",
            PagerunError::InvalidState(_) => "invalid_state",
            PagerunError::Config(_) => "config",
            PagerunError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_maps_to_storage() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: PagerunError = io.into();
        assert_eq!(err.kind(), "storage");
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn test_process_exit_display() {
        let err = PagerunError::ProcessExit {
            code: Some(2),
            signal: None,
        };
        assert!(err.to_string().contains("Some(2)"));
        assert_eq!(err.kind(), "process_exit");
    }
}
