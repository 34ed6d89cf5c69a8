use thiserror::Error;

/// Errors produced by the Vernite gateway and its protocol layer.
#[derive(Debug, Error)]
pub enum VerniteError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("duplicate handler for packet type {0}")]
    DuplicateHandler(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("session store error: {0}")]
    Store(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("integration error: {0}")]
    Integration(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<ciborium::de::Error<std::io::Error>> for VerniteError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        VerniteError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for VerniteError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        VerniteError::Codec(e.to_string())
    }
}

pub type VerniteResult<T> = Result<T, VerniteError>;
