use courtside_model::TaskId;
use thiserror::Error;

use crate::storage::SinkError;

#[derive(Error, Debug)]
pub enum CollectError {
    #[error("Storage error: {0}")]
    Sink(#[from] SinkError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("Task {0} is not in progress")]
    NotInProgress(TaskId),
}

pub type Result<T> = std::result::Result<T, CollectError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_errors_convert_with_their_message() {
        fn list() -> Result<()> {
            let listed: std::result::Result<(), SinkError> =
                Err(SinkError::Fatal("read-only file system".into()));
            listed?;
            Ok(())
        }
        let err = list().unwrap_err();
        assert!(matches!(err, CollectError::Sink(SinkError::Fatal(_))));
        assert_eq!(err.to_string(), "Storage error: fatal storage error: read-only file system");
    }
}
