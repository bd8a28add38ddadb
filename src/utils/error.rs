use thiserror::Error;

/// 會話（瀏覽器聊天）失敗的分類
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("timed out waiting for a response after {waited_secs}s")]
    Timeout { waited_secs: u64 },

    #[error("page reported a problem: {reason}")]
    PageAnomaly { reason: String, transient: bool },

    #[error("platform error: {reason}")]
    Platform { reason: String },

    #[error("authentication required: {reason}")]
    Auth { reason: String },

    #[error("response still truncated after {turns} turns")]
    MaxTurns { turns: usize },

    #[error("page returned an empty response")]
    EmptyResponse,

    #[error("browser driver error: {message}")]
    Driver { message: String },

    #[error("cancelled")]
    Cancelled,
}

impl SessionError {
    /// 暫時性錯誤會以全新會話重試
    pub fn is_transient(&self) -> bool {
        match self {
            SessionError::Timeout { .. }
            | SessionError::EmptyResponse
            | SessionError::Driver { .. } => true,
            SessionError::PageAnomaly { transient, .. } => *transient,
            SessionError::Platform { .. }
            | SessionError::Auth { .. }
            | SessionError::MaxTurns { .. }
            | SessionError::Cancelled => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum WriterError {
    #[error("HTTP request failed: {0}")]
    ApiError(#[from] reqwest::Error),

    #[error("CSV processing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Missing configuration: {field}")]
    MissingConfigError { field: String },

    #[error("Invalid value for {field} ({value}): {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Configuration validation failed for {field}: {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Session failed: {0}")]
    Session(#[from] SessionError),

    #[error("Image error ({source_ref}): {message}")]
    ImageError { source_ref: String, message: String },

    #[error("Upload failed: {message}")]
    UploadError { message: String },

    #[error("Progress could not be saved: {message}")]
    PersistenceError { message: String },

    #[error("Data processing error: {message}")]
    ProcessingError { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Session,
    Image,
    Persistence,
    Io,
    Network,
    Processing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl WriterError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            WriterError::ConfigError { .. }
            | WriterError::MissingConfigError { .. }
            | WriterError::InvalidConfigValueError { .. }
            | WriterError::ConfigValidationError { .. } => ErrorCategory::Configuration,
            WriterError::Session(_) => ErrorCategory::Session,
            WriterError::ImageError { .. } | WriterError::UploadError { .. } => {
                ErrorCategory::Image
            }
            WriterError::PersistenceError { .. } => ErrorCategory::Persistence,
            WriterError::IoError(_) => ErrorCategory::Io,
            WriterError::ApiError(_) => ErrorCategory::Network,
            WriterError::CsvError(_)
            | WriterError::SerializationError(_)
            | WriterError::ProcessingError { .. } => ErrorCategory::Processing,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::Image => ErrorSeverity::Low,
            ErrorCategory::Session | ErrorCategory::Network => ErrorSeverity::Medium,
            ErrorCategory::Io | ErrorCategory::Processing => ErrorSeverity::High,
            ErrorCategory::Configuration | ErrorCategory::Persistence => ErrorSeverity::Critical,
        }
    }

    /// 只有設定錯誤與進度持久化錯誤會中止整批任務
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Configuration | ErrorCategory::Persistence
        )
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            WriterError::ConfigError { .. } | WriterError::MissingConfigError { .. } => {
                "Check the platform/model table and the TOML configuration file"
            }
            WriterError::InvalidConfigValueError { .. }
            | WriterError::ConfigValidationError { .. } => {
                "Fix the reported configuration value and run again"
            }
            WriterError::Session(SessionError::Auth { .. }) => {
                "Log in to the chat platform in the automated browser profile, then re-run"
            }
            WriterError::Session(e) if e.is_transient() => {
                "Re-run the batch; failed titles are picked up again automatically"
            }
            WriterError::Session(_) => "Inspect the platform page and adjust the platform profile",
            WriterError::ImageError { .. } | WriterError::UploadError { .. } => {
                "Check the upload backend settings; broken images are marked in the article"
            }
            WriterError::PersistenceError { .. } => {
                "Make sure the progress file location is writable and has free space"
            }
            WriterError::IoError(_) => "Check file permissions and paths",
            WriterError::ApiError(_) => "Check network connectivity",
            WriterError::CsvError(_) => "Check the title file format (UTF-8 CSV or plain text)",
            WriterError::SerializationError(_) | WriterError::ProcessingError { .. } => {
                "Run again with --verbose and inspect the log"
            }
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self.category() {
            ErrorCategory::Configuration => format!("Configuration problem: {}", self),
            ErrorCategory::Persistence => format!("Progress could not be saved: {}", self),
            ErrorCategory::Session => format!("Chat session failed: {}", self),
            ErrorCategory::Image => format!("Image handling failed: {}", self),
            _ => self.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, WriterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SessionError::Timeout { waited_secs: 10 }.is_transient());
        assert!(SessionError::EmptyResponse.is_transient());
        assert!(SessionError::PageAnomaly {
            reason: "rate limited".into(),
            transient: true
        }
        .is_transient());
        assert!(!SessionError::Auth {
            reason: "login".into()
        }
        .is_transient());
        assert!(!SessionError::MaxTurns { turns: 5 }.is_transient());
        assert!(!SessionError::Cancelled.is_transient());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(WriterError::ConfigError {
            message: "x".into()
        }
        .is_fatal());
        assert!(WriterError::PersistenceError {
            message: "disk full".into()
        }
        .is_fatal());
        assert!(!WriterError::Session(SessionError::Cancelled).is_fatal());
        assert!(!WriterError::UploadError {
            message: "503".into()
        }
        .is_fatal());
    }
}
