use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Peer unreachable at {address}: {reason}")]
    PeerUnreachable { address: String, reason: String },

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Ledger error: {0}")]
    Ledger(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(String),
}

/// Failures to read an envelope out of a structured document that does carry
/// a performative. Documents without one are not errors; see
/// [`crate::acl::Decoded::Unparseable`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("content reference `{0}` does not resolve inside the body")]
    DanglingContentRef(String),

    #[error("malformed content node: {0}")]
    MalformedContent(String),
}

impl AgentError {
    pub fn unreachable(address: impl Into<String>, reason: impl ToString) -> Self {
        AgentError::PeerUnreachable {
            address: address.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, AgentError::PeerUnreachable { .. })
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::Serialization(err.to_string())
    }
}

impl From<uuid::Error> for AgentError {
    fn from(err: uuid::Error) -> Self {
        AgentError::Validation(err.to_string())
    }
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::Io(err.to_string())
    }
}
