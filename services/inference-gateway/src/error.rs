use thiserror::Error;

/// Failure taxonomy for loading and running brand models.
///
/// Payloads are strings so a single outcome can be cloned to every caller
/// waiting on the same in-flight load.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelError {
    #[error("no local checkpoint and no remote mapping for brand '{brand}'")]
    NotConfigured { brand: String },
    #[error("download failed for brand '{brand}': {reason}")]
    DownloadFailed { brand: String, reason: String },
    #[error("corrupt artifact {path}: {reason}")]
    CorruptArtifact { path: String, reason: String },
    #[error("weight shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;

impl ModelError {
    pub fn corrupt(path: impl AsRef<std::path::Path>, reason: impl std::fmt::Display) -> Self {
        Self::CorruptArtifact { path: path.as_ref().display().to_string(), reason: reason.to_string() }
    }

    pub fn download(brand: &str, reason: impl std::fmt::Display) -> Self {
        Self::DownloadFailed { brand: brand.to_string(), reason: reason.to_string() }
    }

    /// Short label used as a metric attribute.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotConfigured { .. } => "not_configured",
            Self::DownloadFailed { .. } => "download_failed",
            Self::CorruptArtifact { .. } => "corrupt_artifact",
            Self::ShapeMismatch(_) => "shape_mismatch",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Unexpected(_) => "unexpected",
        }
    }

    /// Whether repeating the same call may succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DownloadFailed { .. })
    }
}

impl From<candle_core::Error> for ModelError {
    fn from(e: candle_core::Error) -> Self { Self::Unexpected(e.to_string()) }
}

impl From<tokio::task::JoinError> for ModelError {
    fn from(e: tokio::task::JoinError) -> Self { Self::Unexpected(format!("worker task failed: {e}")) }
}
