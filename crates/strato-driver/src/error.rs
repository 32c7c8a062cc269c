use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("create failed: {0}")]
    CreateFailed(String),

    #[error("delete failed: {0}")]
    DeleteFailed(String),

    #[error("detect failed: {0}")]
    DetectFailed(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("cluster registration failed: {0}")]
    Cluster(String),

    #[error("driver misconfigured: {0}")]
    Config(String),

    #[error("internal driver error: {0}")]
    Internal(String),
}
