use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config file error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Replication error: {message}")]
    Replication { message: String },

    #[error("Invalid message format: {message}")]
    InvalidMessage { message: String },

    #[error("Watcher error: {0}")]
    Watcher(String),

    #[error("Shutdown requested")]
    Shutdown,
}

impl Error {
    /// Non-retriable errors abort the Runner instead of triggering backoff.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Shutdown)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
