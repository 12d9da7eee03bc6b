use hyper::StatusCode;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

/// Application error type covering every failure surface of the broadcast queue.
#[derive(Error, Debug)]
pub enum AppError {
    // ===== HTTP & Network Errors =====
    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    // ===== Serialization Errors =====
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ===== Database & Storage Errors =====
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Queue Errors =====
    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Lock error: {0}")]
    Lock(String),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Config(String),

    // ===== Unknown/Generic Errors =====
    #[error("Unknown error: {0}")]
    Unknown(#[from] anyhow::Error),
}

impl AppError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Reqwest(_) => StatusCode::BAD_GATEWAY,
            AppError::Database(_) | AppError::Redis(_) | AppError::Queue(_) | AppError::Lock(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Json(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get a user-friendly error message (without sensitive details)
    pub fn user_message(&self) -> String {
        match self {
            AppError::Database(_) => "Database error".to_string(),
            AppError::Redis(_) => "Queue store error".to_string(),
            AppError::Reqwest(_) => "External service error".to_string(),
            AppError::Queue(msg) => format!("Queue error: {}", msg),
            AppError::Lock(msg) => format!("Lock error: {}", msg),
            AppError::Config(msg) => format!("Configuration error: {}", msg),
            _ => "Internal server error".to_string(),
        }
    }
}
