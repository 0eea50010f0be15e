//! Error types shared across components.
//!
//! Each boundary (store, queue, assets, capture, intake) has its own error
//! enum. Worker handlers collapse them into [`TaskError`], which tells the
//! worker loop whether the delivery should be retried or dropped.

use thiserror::Error;

/// Failures reported by the status store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Database(sqlx::Error::PoolTimedOut)
            | StoreError::Database(sqlx::Error::Io(_)) => true,
            StoreError::Database(sqlx::Error::Database(db)) => {
                let message = db.message().to_lowercase();
                message.contains("locked") || message.contains("busy")
            }
            _ => false,
        }
    }
}

/// Failures reported by the job queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,

    #[error("failed to encode task: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failures reported by the asset store.
#[derive(Debug, Error)]
pub enum AssetError {
    #[error("asset not found: {0}")]
    NotFound(String),

    #[error("invalid asset path: {0}")]
    InvalidPath(String),

    #[error("asset I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("asset encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl AssetError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AssetError::Io(_))
    }
}

/// Failures reported by the page capturer.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("unsupported content type '{0}'")]
    UnsupportedContent(String),

    #[error("capture timed out after {0}s")]
    Timeout(u64),
}

impl CaptureError {
    /// Permanent errors (client errors, wrong content) are not worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            CaptureError::Http(e) => !e.is_builder(),
            CaptureError::Status { status, .. } => *status >= 500 || *status == 429,
            CaptureError::UnsupportedContent(_) => false,
            CaptureError::Timeout(_) => true,
        }
    }
}

/// Caller-facing errors returned synchronously by intake.
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("quota exceeded for tenant '{tenant_id}': {active} active analyses (limit {limit})")]
    QuotaExceeded {
        tenant_id: String,
        active: u64,
        limit: u64,
    },

    #[error(transparent)]
    Persistence(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Outcome classification for a failed task handler.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Transient infrastructure failure; the delivery should be redelivered.
    #[error("retryable: {0}")]
    Retryable(String),

    /// The task can never succeed; acknowledge and drop it.
    #[error("terminal: {0}")]
    Terminal(String),
}

impl From<StoreError> for TaskError {
    fn from(e: StoreError) -> Self {
        if e.is_retryable() {
            TaskError::Retryable(e.to_string())
        } else {
            TaskError::Terminal(e.to_string())
        }
    }
}

/// A closed queue stays closed and an unencodable task stays unencodable.
impl From<QueueError> for TaskError {
    fn from(e: QueueError) -> Self {
        TaskError::Terminal(e.to_string())
    }
}

impl From<AssetError> for TaskError {
    fn from(e: AssetError) -> Self {
        if e.is_retryable() {
            TaskError::Retryable(e.to_string())
        } else {
            TaskError::Terminal(e.to_string())
        }
    }
}
