use thiserror::Error;

/// Errors produced by the veil protocol layer and server plumbing.
#[derive(Debug, Error)]
pub enum VeilError {
    #[error("config error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("link error: {0}")]
    Link(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<base64::DecodeError> for VeilError {
    fn from(e: base64::DecodeError) -> Self {
        VeilError::Link(e.to_string())
    }
}

impl From<std::string::FromUtf8Error> for VeilError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        VeilError::Link(e.to_string())
    }
}

pub type VeilResult<T> = Result<T, VeilError>;
