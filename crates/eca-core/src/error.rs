use thiserror::Error;

/// Errors produced by the ECA gateway and its protocol layer.
#[derive(Debug, Error)]
pub enum EcaError {
    /// The claimed node identifier is missing or not a valid identifier.
    #[error("malformed credential: {0}")]
    MalformedCredential(String),

    /// The identifier parsed but no node record exists for it.
    #[error("identity not found: {0}")]
    IdentityNotFound(String),

    /// The node record exists but is not authorized to connect.
    #[error("node not authorized: {0}")]
    NotAuthorized(String),

    #[error("identity store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("protocol misuse: {0}")]
    ProtocolMisuse(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for EcaError {
    fn from(e: serde_json::Error) -> Self {
        EcaError::Codec(e.to_string())
    }
}

pub type EcaResult<T> = Result<T, EcaError>;
