use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the processing core. Retryability is a property of the
/// variant: only `Transient` failures are ever re-enqueued by the dispatcher.
#[derive(Error, Debug)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not authorized: {0}")]
    Authorization(String),

    /// The external tool exited non-zero. Carries a bounded tail of its
    /// stderr so the failure is diagnosable from the job record alone.
    #[error("processing failed: {message}")]
    Processing { message: String, stderr_tail: String },

    #[error("timed out after {0} seconds")]
    Timeout(u64),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Error::Transient(msg.into())
    }

    pub fn processing(message: impl Into<String>, stderr_tail: impl Into<String>) -> Self {
        Error::Processing {
            message: message.into(),
            stderr_tail: stderr_tail.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// User-visible message recorded on failed jobs. No stack frames and no
    /// connection strings; the stderr tail of the tool is the one exception.
    pub fn user_message(&self) -> String {
        match self {
            Error::Processing {
                message,
                stderr_tail,
            } if !stderr_tail.is_empty() => format!("{message}\n{stderr_tail}"),
            other => other.to_string(),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Error::NotFound("record not found".to_string()),
            other => Error::Transient(format!("database error: {other}")),
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::Transient(format!("shared store error: {e}"))
    }
}

impl From<object_store::Error> for Error {
    fn from(e: object_store::Error) -> Self {
        match e {
            object_store::Error::NotFound { path, .. } => {
                Error::NotFound(format!("object {path} not found"))
            }
            other => Error::Transient(format!("object store error: {other}")),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transient(format!("io error: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Validation(format!("invalid json: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(Error::transient("broker down").is_retryable());
        for err in [
            Error::validation("bad config"),
            Error::not_found("file 9"),
            Error::Authorization("owner mismatch".into()),
            Error::processing("ffmpeg exited with status 1", ""),
            Error::Timeout(3600),
            Error::Cancelled,
        ] {
            assert!(!err.is_retryable(), "{err} must not be retryable");
        }
    }

    #[test]
    fn user_message_includes_stderr_tail() {
        let err = Error::processing("ffmpeg exited with status 1", "No such filter: 'bogus'");
        let msg = err.user_message();
        assert!(msg.contains("ffmpeg exited with status 1"));
        assert!(msg.contains("No such filter"));
    }

    #[test]
    fn missing_object_maps_to_not_found() {
        let err: Error = object_store::Error::NotFound {
            path: "files/1/a.mp4".to_string(),
            source: "gone".into(),
        }
        .into();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
