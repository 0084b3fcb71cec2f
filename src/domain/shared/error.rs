//! Relay errors

use super::value_objects::AllocationId;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Stale nonce")]
    StaleNonce,

    #[error("Wrong credentials: {0}")]
    WrongCredentials(String),

    #[error("Allocation already exists: {0}")]
    DuplicateAllocation(AllocationId),

    #[error("Allocation mismatch: {0}")]
    AllocationMismatch(String),

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Not bound: {0}")]
    NotBound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unsupported transport protocol: {0}")]
    UnsupportedTransport(u8),

    #[error("Connection already exists for {0}")]
    ConnectionAlreadyExists(String),

    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Session closed")]
    SessionClosed,

    #[error("Request timeout")]
    Timeout,

    #[error("Server error {code}: {reason}")]
    Server { code: u16, reason: String },
}

impl RelayError {
    /// STUN error code sent back to the requester
    pub fn error_code(&self) -> u16 {
        match self {
            RelayError::BadRequest(_)
            | RelayError::Conflict(_)
            | RelayError::NotBound(_)
            | RelayError::Codec(_) => 400,
            RelayError::Unauthorized(_) => 401,
            RelayError::Forbidden(_) => 403,
            RelayError::DuplicateAllocation(_)
            | RelayError::AllocationMismatch(_)
            | RelayError::NotFound(_) => 437,
            RelayError::StaleNonce => 438,
            RelayError::WrongCredentials(_) => 441,
            RelayError::UnsupportedTransport(_) => 442,
            RelayError::ConnectionAlreadyExists(_) => 446,
            RelayError::ConnectionFailure(_) => 447,
            RelayError::ResourceExhausted(_) => 508,
            RelayError::Server { code, .. } => *code,
            RelayError::Transport(_)
            | RelayError::InvalidStateTransition(_)
            | RelayError::SessionClosed
            | RelayError::Timeout => 500,
        }
    }

    /// Reason phrase matching [`RelayError::error_code`]
    pub fn reason(&self) -> &'static str {
        match self.error_code() {
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            437 => "Allocation Mismatch",
            438 => "Stale Nonce",
            441 => "Wrong Credentials",
            442 => "Unsupported Transport Protocol",
            446 => "Connection Already Exists",
            447 => "Connection Timeout or Failure",
            486 => "Allocation Quota Reached",
            508 => "Insufficient Capacity",
            _ => "Server Error",
        }
    }

    /// Map an ERROR-CODE received from a server back into the taxonomy
    pub fn from_error_code(code: u16, reason: &str) -> Self {
        match code {
            401 => RelayError::Unauthorized(reason.to_string()),
            403 => RelayError::Forbidden(reason.to_string()),
            437 => RelayError::AllocationMismatch(reason.to_string()),
            438 => RelayError::StaleNonce,
            441 => RelayError::WrongCredentials(reason.to_string()),
            442 => RelayError::UnsupportedTransport(0),
            447 => RelayError::ConnectionFailure(reason.to_string()),
            508 => RelayError::ResourceExhausted(reason.to_string()),
            _ => RelayError::Server {
                code,
                reason: reason.to_string(),
            },
        }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Transport(err.to_string())
    }
}
