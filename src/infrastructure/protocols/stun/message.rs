/// STUN message format (RFC 5389) with the TURN methods of RFC 5766 and RFC 6062
use super::attribute::{kind, Attribute};
use super::integrity::{fingerprint, message_integrity, verify_message_integrity};
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

/// Magic cookie for STUN (RFC 5389)
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// Fixed header length
pub const HEADER_LEN: usize = 20;

pub type TransactionId = [u8; 12];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StunError {
    #[error("Message too short: {0} bytes")]
    TooShort(usize),

    #[error("Not a STUN message")]
    NotStun,

    #[error("Invalid magic cookie: {0:#x}")]
    InvalidMagicCookie(u32),

    #[error("Length mismatch: header says {declared}, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Unknown method: {0:#x}")]
    UnknownMethod(u16),

    #[error("Malformed attribute {kind:#06x}: {reason}")]
    MalformedAttribute { kind: u16, reason: String },

    #[error("Message too long to encode")]
    TooLong,

    #[error("FINGERPRINT mismatch")]
    FingerprintMismatch,

    #[error("Invalid MESSAGE-INTEGRITY key")]
    InvalidKey,
}

/// STUN method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Binding,
    Allocate,
    Refresh,
    Send,
    Data,
    CreatePermission,
    ChannelBind,
    Connect,
    ConnectionBind,
    ConnectionAttempt,
}

impl Method {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x001 => Some(Method::Binding),
            0x003 => Some(Method::Allocate),
            0x004 => Some(Method::Refresh),
            0x006 => Some(Method::Send),
            0x007 => Some(Method::Data),
            0x008 => Some(Method::CreatePermission),
            0x009 => Some(Method::ChannelBind),
            0x00A => Some(Method::Connect),
            0x00B => Some(Method::ConnectionBind),
            0x00C => Some(Method::ConnectionAttempt),
            _ => None,
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Method::Binding => 0x001,
            Method::Allocate => 0x003,
            Method::Refresh => 0x004,
            Method::Send => 0x006,
            Method::Data => 0x007,
            Method::CreatePermission => 0x008,
            Method::ChannelBind => 0x009,
            Method::Connect => 0x00A,
            Method::ConnectionBind => 0x00B,
            Method::ConnectionAttempt => 0x00C,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Binding => "Binding",
            Method::Allocate => "Allocate",
            Method::Refresh => "Refresh",
            Method::Send => "Send",
            Method::Data => "Data",
            Method::CreatePermission => "CreatePermission",
            Method::ChannelBind => "ChannelBind",
            Method::Connect => "Connect",
            Method::ConnectionBind => "ConnectionBind",
            Method::ConnectionAttempt => "ConnectionAttempt",
        }
    }
}

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

impl MessageClass {
    fn bits(self) -> u16 {
        match self {
            MessageClass::Request => 0b00,
            MessageClass::Indication => 0b01,
            MessageClass::SuccessResponse => 0b10,
            MessageClass::ErrorResponse => 0b11,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => MessageClass::Request,
            0b01 => MessageClass::Indication,
            0b10 => MessageClass::SuccessResponse,
            _ => MessageClass::ErrorResponse,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageClass::Request => "request",
            MessageClass::Indication => "indication",
            MessageClass::SuccessResponse => "success response",
            MessageClass::ErrorResponse => "error response",
        }
    }
}

/// STUN message type: method and class interleaved in 14 bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType {
    pub method: Method,
    pub class: MessageClass,
}

impl MessageType {
    pub fn new(method: Method, class: MessageClass) -> Self {
        Self { method, class }
    }

    pub fn from_u16(value: u16) -> Result<Self, StunError> {
        let method = (value & 0x000F) | ((value >> 1) & 0x0070) | ((value >> 2) & 0x0F80);
        let class = ((value >> 4) & 0b01) | ((value >> 7) & 0b10);
        let method = Method::from_u16(method).ok_or(StunError::UnknownMethod(method))?;
        Ok(Self::new(method, MessageClass::from_bits(class)))
    }

    pub fn to_u16(self) -> u16 {
        let method = self.method.to_u16();
        let class = self.class.bits();
        (method & 0x000F)
            | ((method & 0x0070) << 1)
            | ((method & 0x0F80) << 2)
            | ((class & 0b01) << 4)
            | ((class & 0b10) << 7)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method.as_str(), self.class.as_str())
    }
}

/// Bytes covered by a received MESSAGE-INTEGRITY, length field already adjusted
#[derive(Debug, Clone)]
struct SignedPrefix {
    data: Vec<u8>,
    mac: [u8; 20],
}

/// STUN message
#[derive(Debug, Clone)]
pub struct StunMessage {
    pub message_type: MessageType,
    pub transaction_id: TransactionId,
    pub attributes: Vec<Attribute>,
    signed: Option<SignedPrefix>,
}

impl StunMessage {
    pub fn new(method: Method, class: MessageClass, transaction_id: TransactionId) -> Self {
        Self {
            message_type: MessageType::new(method, class),
            transaction_id,
            attributes: Vec::new(),
            signed: None,
        }
    }

    /// New request with a random transaction id
    pub fn new_request(method: Method) -> Self {
        Self::new(method, MessageClass::Request, rand::random())
    }

    pub fn new_indication(method: Method) -> Self {
        Self::new(method, MessageClass::Indication, rand::random())
    }

    /// Success response sharing this message's method and transaction id
    pub fn success_response(&self) -> Self {
        Self::new(
            self.method(),
            MessageClass::SuccessResponse,
            self.transaction_id,
        )
    }

    pub fn error_response(&self, code: u16, reason: &str) -> Self {
        Self::new(self.method(), MessageClass::ErrorResponse, self.transaction_id).with(
            Attribute::ErrorCode {
                code,
                reason: reason.to_string(),
            },
        )
    }

    pub fn with(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn add(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    pub fn method(&self) -> Method {
        self.message_type.method
    }

    pub fn class(&self) -> MessageClass {
        self.message_type.class
    }

    /// Quick check for the STUN header shape
    pub fn is_stun(data: &[u8]) -> bool {
        data.len() >= HEADER_LEN
            && data[0] & 0xC0 == 0
            && u32::from_be_bytes([data[4], data[5], data[6], data[7]]) == MAGIC_COOKIE
    }

    /// Total message length announced by a header
    pub fn total_length(header: &[u8]) -> Option<usize> {
        if header.len() < 4 {
            return None;
        }
        Some(HEADER_LEN + u16::from_be_bytes([header[2], header[3]]) as usize)
    }

    /// Serialize, appending MESSAGE-INTEGRITY when a key is given and always FINGERPRINT
    pub fn encode(&self, key: Option<&[u8]>) -> Result<Vec<u8>, StunError> {
        let mut buffer = Vec::with_capacity(HEADER_LEN + 64);

        buffer.extend_from_slice(&self.message_type.to_u16().to_be_bytes());
        buffer.extend_from_slice(&0u16.to_be_bytes());
        buffer.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buffer.extend_from_slice(&self.transaction_id);

        for attribute in &self.attributes {
            if matches!(
                attribute,
                Attribute::MessageIntegrity(_) | Attribute::Fingerprint(_)
            ) {
                continue;
            }
            let value = attribute.encode_value(&self.transaction_id);
            write_attribute(&mut buffer, attribute.kind(), &value)?;
        }

        if let Some(key) = key {
            let length = buffer.len() - HEADER_LEN + 24;
            set_length(&mut buffer, length)?;
            let mac = message_integrity(key, &buffer)?;
            write_attribute(&mut buffer, kind::MESSAGE_INTEGRITY, &mac)?;
        }

        let length = buffer.len() - HEADER_LEN + 8;
        set_length(&mut buffer, length)?;
        let crc = fingerprint(&buffer);
        write_attribute(&mut buffer, kind::FINGERPRINT, &crc.to_be_bytes())?;

        Ok(buffer)
    }

    /// Parse from bytes; the buffer must hold exactly one message
    pub fn from_bytes(data: &[u8]) -> Result<Self, StunError> {
        if data.len() < HEADER_LEN {
            return Err(StunError::TooShort(data.len()));
        }
        if data[0] & 0xC0 != 0 {
            return Err(StunError::NotStun);
        }

        let magic_cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if magic_cookie != MAGIC_COOKIE {
            return Err(StunError::InvalidMagicCookie(magic_cookie));
        }

        let declared = u16::from_be_bytes([data[2], data[3]]) as usize;
        if declared % 4 != 0 || HEADER_LEN + declared != data.len() {
            return Err(StunError::LengthMismatch {
                declared,
                actual: data.len() - HEADER_LEN,
            });
        }

        let message_type = MessageType::from_u16(u16::from_be_bytes([data[0], data[1]]))?;
        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&data[8..20]);

        let mut attributes = Vec::new();
        let mut signed = None;
        let mut offset = HEADER_LEN;

        while offset + 4 <= data.len() {
            let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let attr_length = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            let value_start = offset + 4;
            let value_end = value_start + attr_length;
            if value_end > data.len() {
                return Err(StunError::MalformedAttribute {
                    kind: attr_type,
                    reason: "value runs past the message end".to_string(),
                });
            }
            let value = &data[value_start..value_end];

            match attr_type {
                kind::FINGERPRINT => {
                    let attribute = Attribute::decode(attr_type, value, &transaction_id)?;
                    if attribute != Attribute::Fingerprint(fingerprint(&data[..offset])) {
                        return Err(StunError::FingerprintMismatch);
                    }
                    attributes.push(attribute);
                    break;
                }
                // Anything between MESSAGE-INTEGRITY and FINGERPRINT is ignored
                _ if signed.is_some() => {}
                kind::MESSAGE_INTEGRITY => {
                    let attribute = Attribute::decode(attr_type, value, &transaction_id)?;
                    if let Attribute::MessageIntegrity(mac) = attribute {
                        let mut prefix = data[..offset].to_vec();
                        let length = (offset - HEADER_LEN + 24) as u16;
                        prefix[2..4].copy_from_slice(&length.to_be_bytes());
                        signed = Some(SignedPrefix { data: prefix, mac });
                    }
                    attributes.push(attribute);
                }
                _ => attributes.push(Attribute::decode(attr_type, value, &transaction_id)?),
            }

            // Attributes are padded to 4-byte boundary
            offset = value_end + (4 - attr_length % 4) % 4;
        }

        Ok(Self {
            message_type,
            transaction_id,
            attributes,
            signed,
        })
    }

    pub fn has_integrity(&self) -> bool {
        self.signed.is_some()
    }

    /// Check MESSAGE-INTEGRITY of a decoded message against `key`
    pub fn verify_integrity(&self, key: &[u8]) -> bool {
        self.signed
            .as_ref()
            .map_or(false, |signed| verify_message_integrity(key, &signed.data, &signed.mac))
    }

    pub fn get_username(&self) -> Option<&str> {
        self.attributes.iter().find_map(|attr| match attr {
            Attribute::Username(value) => Some(value.as_str()),
            _ => None,
        })
    }

    pub fn get_realm(&self) -> Option<&str> {
        self.attributes.iter().find_map(|attr| match attr {
            Attribute::Realm(value) => Some(value.as_str()),
            _ => None,
        })
    }

    pub fn get_nonce(&self) -> Option<&str> {
        self.attributes.iter().find_map(|attr| match attr {
            Attribute::Nonce(value) => Some(value.as_str()),
            _ => None,
        })
    }

    pub fn get_error_code(&self) -> Option<(u16, &str)> {
        self.attributes.iter().find_map(|attr| match attr {
            Attribute::ErrorCode { code, reason } => Some((*code, reason.as_str())),
            _ => None,
        })
    }

    pub fn get_lifetime(&self) -> Option<u32> {
        self.attributes.iter().find_map(|attr| match attr {
            Attribute::Lifetime(seconds) => Some(*seconds),
            _ => None,
        })
    }

    pub fn get_xor_mapped_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|attr| match attr {
            Attribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn get_mapped_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|attr| match attr {
            Attribute::MappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn get_xor_relayed_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|attr| match attr {
            Attribute::XorRelayedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// Every XOR-PEER-ADDRESS, in order
    pub fn get_xor_peer_addresses(&self) -> Vec<SocketAddr> {
        self.attributes
            .iter()
            .filter_map(|attr| match attr {
                Attribute::XorPeerAddress(addr) => Some(*addr),
                _ => None,
            })
            .collect()
    }

    pub fn get_xor_peer_address(&self) -> Option<SocketAddr> {
        self.get_xor_peer_addresses().into_iter().next()
    }

    pub fn get_data(&self) -> Option<&Bytes> {
        self.attributes.iter().find_map(|attr| match attr {
            Attribute::Data(data) => Some(data),
            _ => None,
        })
    }

    pub fn get_channel_number(&self) -> Option<u16> {
        self.attributes.iter().find_map(|attr| match attr {
            Attribute::ChannelNumber(channel) => Some(*channel),
            _ => None,
        })
    }

    pub fn get_requested_transport(&self) -> Option<u8> {
        self.attributes.iter().find_map(|attr| match attr {
            Attribute::RequestedTransport(protocol) => Some(*protocol),
            _ => None,
        })
    }

    pub fn get_connection_id(&self) -> Option<u32> {
        self.attributes.iter().find_map(|attr| match attr {
            Attribute::ConnectionId(id) => Some(*id),
            _ => None,
        })
    }
}

impl fmt::Display for StunMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tid={} attrs={}",
            self.message_type,
            hex::encode(self.transaction_id),
            self.attributes.len()
        )
    }
}

fn write_attribute(buffer: &mut Vec<u8>, attr_type: u16, value: &[u8]) -> Result<(), StunError> {
    let length = u16::try_from(value.len()).map_err(|_| StunError::TooLong)?;
    buffer.extend_from_slice(&attr_type.to_be_bytes());
    buffer.extend_from_slice(&length.to_be_bytes());
    buffer.extend_from_slice(value);
    // Padding
    let padding = (4 - (value.len() % 4)) % 4;
    buffer.extend_from_slice(&[0u8; 3][..padding]);
    Ok(())
}

fn set_length(buffer: &mut [u8], length: usize) -> Result<(), StunError> {
    let length = u16::try_from(length).map_err(|_| StunError::TooLong)?;
    buffer[2..4].copy_from_slice(&length.to_be_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_interleaving() {
        let cases = [
            (Method::Binding, MessageClass::Request, 0x0001),
            (Method::Binding, MessageClass::SuccessResponse, 0x0101),
            (Method::Binding, MessageClass::ErrorResponse, 0x0111),
            (Method::Allocate, MessageClass::Request, 0x0003),
            (Method::Allocate, MessageClass::ErrorResponse, 0x0113),
            (Method::Send, MessageClass::Indication, 0x0016),
            (Method::Data, MessageClass::Indication, 0x0017),
            (Method::ChannelBind, MessageClass::SuccessResponse, 0x0109),
            (Method::ConnectionAttempt, MessageClass::Indication, 0x001C),
        ];
        for (method, class, wire) in cases {
            let message_type = MessageType::new(method, class);
            assert_eq!(message_type.to_u16(), wire, "{}", message_type);
            assert_eq!(MessageType::from_u16(wire).unwrap(), message_type);
        }
        assert_eq!(MessageType::from_u16(0x0002), Err(StunError::UnknownMethod(0x002)));
    }

    #[test]
    fn test_encode_decode_with_integrity() {
        let key = md5::compute("alice:example.org:secret").0;
        let peer: SocketAddr = "192.0.2.7:4000".parse().unwrap();
        let request = StunMessage::new_request(Method::CreatePermission)
            .with(Attribute::XorPeerAddress(peer))
            .with(Attribute::Username("alice".to_string()))
            .with(Attribute::Realm("example.org".to_string()))
            .with(Attribute::Nonce("abc".to_string()));

        let bytes = request.encode(Some(&key)).unwrap();
        assert!(StunMessage::is_stun(&bytes));
        assert_eq!(StunMessage::total_length(&bytes), Some(bytes.len()));

        let decoded = StunMessage::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.message_type, request.message_type);
        assert_eq!(decoded.transaction_id, request.transaction_id);
        assert_eq!(decoded.get_xor_peer_address(), Some(peer));
        assert_eq!(decoded.get_username(), Some("alice"));
        assert!(decoded.has_integrity());
        assert!(decoded.verify_integrity(&key));
        assert!(!decoded.verify_integrity(&md5::compute("alice:example.org:wrong").0));
    }

    #[test]
    fn test_message_without_integrity() {
        let bytes = StunMessage::new_request(Method::Binding).encode(None).unwrap();
        let decoded = StunMessage::from_bytes(&bytes).unwrap();
        assert!(!decoded.has_integrity());
        assert!(!decoded.verify_integrity(b"any"));
        assert!(matches!(decoded.attributes.last(), Some(Attribute::Fingerprint(_))));
    }

    #[test]
    fn test_tampered_message_fails_fingerprint() {
        let mut bytes = StunMessage::new_request(Method::Allocate)
            .with(Attribute::Lifetime(600))
            .encode(None)
            .unwrap();
        bytes[HEADER_LEN + 7] ^= 0x01;
        assert_eq!(StunMessage::from_bytes(&bytes).unwrap_err(), StunError::FingerprintMismatch);
    }

    #[test]
    fn test_rejects_malformed_headers() {
        assert_eq!(StunMessage::from_bytes(&[0u8; 10]).unwrap_err(), StunError::TooShort(10));

        let mut bytes = StunMessage::new_request(Method::Binding).encode(None).unwrap();
        bytes.push(0);
        assert!(matches!(
            StunMessage::from_bytes(&bytes),
            Err(StunError::LengthMismatch { .. })
        ));

        let mut bytes = StunMessage::new_request(Method::Binding).encode(None).unwrap();
        bytes[4] = 0;
        assert!(!StunMessage::is_stun(&bytes));
        assert!(matches!(
            StunMessage::from_bytes(&bytes),
            Err(StunError::InvalidMagicCookie(_))
        ));
    }

    #[test]
    fn test_error_response_carries_code() {
        let request = StunMessage::new_request(Method::Refresh);
        let response = request.error_response(437, "Allocation Mismatch");
        let decoded = StunMessage::from_bytes(&response.encode(None).unwrap()).unwrap();

        assert_eq!(decoded.class(), MessageClass::ErrorResponse);
        assert_eq!(decoded.method(), Method::Refresh);
        assert_eq!(decoded.transaction_id, request.transaction_id);
        assert_eq!(decoded.get_error_code(), Some((437, "Allocation Mismatch")));
    }

    #[test]
    fn test_data_padding() {
        let indication = StunMessage::new_indication(Method::Send)
            .with(Attribute::Data(Bytes::from_static(b"hello")))
            .with(Attribute::XorPeerAddress("10.0.0.1:9".parse().unwrap()));
        let bytes = indication.encode(None).unwrap();
        assert_eq!(bytes.len() % 4, 0);

        let decoded = StunMessage::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.get_data().unwrap().as_ref(), b"hello");
        assert_eq!(decoded.get_xor_peer_address(), Some("10.0.0.1:9".parse().unwrap()));
    }
}
