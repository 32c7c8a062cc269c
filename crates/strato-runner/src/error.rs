use strato_config::ConfigError;
use strato_driver::DriverError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("invalid time specification: '{0}'")]
    InvalidTime(String),

    #[error("duplicate {kind} '{name}' detected")]
    DuplicateResource { kind: &'static str, name: String },

    #[error("command failed with exit code {code}")]
    CommandFailed { code: i32 },

    #[error("command timed out")]
    CommandTimedOut,

    #[error("provisioning failed: node '{0}' entered ERROR with no retries left")]
    ProvisionFailed(String),

    #[error("invalid deployment config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
