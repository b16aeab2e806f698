use thiserror::Error;

/// Errors produced by the CollabVM relay.
#[derive(Debug, Error)]
pub enum CvmError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("upstream protocol error: {0}")]
    Protocol(String),

    #[error("upstream authentication failed: {0}")]
    Auth(String),

    #[error("surface error: {0}")]
    Surface(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<ciborium::de::Error<std::io::Error>> for CvmError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        CvmError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for CvmError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        CvmError::Codec(e.to_string())
    }
}

pub type CvmResult<T> = Result<T, CvmError>;
