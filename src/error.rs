use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported cpu architecture: {0}")]
    UnsupportedArch(String),

    #[error("Docker not found at {0}")]
    EngineNotFound(String),

    #[error("Docker error: {0}")]
    Engine(#[from] bollard::errors::Error),

    #[error("Invalid job ID: {0:?}")]
    InvalidJobId(String),

    #[error("Image build failed: {0}")]
    Build(String),

    #[error("Dispatch request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Dispatch service rejected request: {0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;
