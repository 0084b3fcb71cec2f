/// STUN (Session Traversal Utilities for NAT) wire codec
/// RFC 5389, with the TURN attributes of RFC 5766 and RFC 6062
pub mod attribute;
pub mod integrity;
pub mod message;

pub use attribute::Attribute;
pub use message::{MessageClass, MessageType, Method, StunError, StunMessage, TransactionId};

use crate::domain::shared::RelayError;

impl From<StunError> for RelayError {
    fn from(err: StunError) -> Self {
        RelayError::Codec(err.to_string())
    }
}
