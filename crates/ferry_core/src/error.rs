/// Errors returned by the `LoadBalancer` and `Service` public operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid host pattern: {0}")]
    InvalidHostPattern(String),

    #[error("service already exists")]
    ServiceAlreadyExists,

    #[error("service not found")]
    ServiceNotFound,

    #[error("service failed to become healthy: {0}")]
    ServiceFailedToBecomeHealthy(String),

    #[error("state file io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file encode/decode error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
