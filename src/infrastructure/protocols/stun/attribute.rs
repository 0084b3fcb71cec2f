/// STUN/TURN attributes (RFC 5389, RFC 5766, RFC 6062)
use super::message::{StunError, TransactionId, MAGIC_COOKIE};
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Attribute type codes
pub mod kind {
    pub const MAPPED_ADDRESS: u16 = 0x0001;
    pub const USERNAME: u16 = 0x0006;
    pub const MESSAGE_INTEGRITY: u16 = 0x0008;
    pub const ERROR_CODE: u16 = 0x0009;
    pub const CHANNEL_NUMBER: u16 = 0x000C;
    pub const LIFETIME: u16 = 0x000D;
    pub const XOR_PEER_ADDRESS: u16 = 0x0012;
    pub const DATA: u16 = 0x0013;
    pub const REALM: u16 = 0x0014;
    pub const NONCE: u16 = 0x0015;
    pub const XOR_RELAYED_ADDRESS: u16 = 0x0016;
    pub const REQUESTED_TRANSPORT: u16 = 0x0019;
    pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
    pub const CONNECTION_ID: u16 = 0x002A;
    pub const SOFTWARE: u16 = 0x8022;
    pub const FINGERPRINT: u16 = 0x8028;
}

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// Decoded attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    MappedAddress(SocketAddr),
    XorMappedAddress(SocketAddr),
    XorRelayedAddress(SocketAddr),
    XorPeerAddress(SocketAddr),
    Username(String),
    Realm(String),
    Nonce(String),
    Software(String),
    ErrorCode { code: u16, reason: String },
    Lifetime(u32),
    Data(Bytes),
    ChannelNumber(u16),
    /// IANA protocol number (17 = UDP, 6 = TCP)
    RequestedTransport(u8),
    ConnectionId(u32),
    MessageIntegrity([u8; 20]),
    Fingerprint(u32),
    Unknown { kind: u16, value: Vec<u8> },
}

impl Attribute {
    pub fn kind(&self) -> u16 {
        match self {
            Attribute::MappedAddress(_) => kind::MAPPED_ADDRESS,
            Attribute::XorMappedAddress(_) => kind::XOR_MAPPED_ADDRESS,
            Attribute::XorRelayedAddress(_) => kind::XOR_RELAYED_ADDRESS,
            Attribute::XorPeerAddress(_) => kind::XOR_PEER_ADDRESS,
            Attribute::Username(_) => kind::USERNAME,
            Attribute::Realm(_) => kind::REALM,
            Attribute::Nonce(_) => kind::NONCE,
            Attribute::Software(_) => kind::SOFTWARE,
            Attribute::ErrorCode { .. } => kind::ERROR_CODE,
            Attribute::Lifetime(_) => kind::LIFETIME,
            Attribute::Data(_) => kind::DATA,
            Attribute::ChannelNumber(_) => kind::CHANNEL_NUMBER,
            Attribute::RequestedTransport(_) => kind::REQUESTED_TRANSPORT,
            Attribute::ConnectionId(_) => kind::CONNECTION_ID,
            Attribute::MessageIntegrity(_) => kind::MESSAGE_INTEGRITY,
            Attribute::Fingerprint(_) => kind::FINGERPRINT,
            Attribute::Unknown { kind, .. } => *kind,
        }
    }

    /// Encode the attribute value (without the TLV header or padding)
    pub fn encode_value(&self, transaction_id: &TransactionId) -> Vec<u8> {
        match self {
            Attribute::MappedAddress(addr) => encode_address(*addr),
            Attribute::XorMappedAddress(addr)
            | Attribute::XorRelayedAddress(addr)
            | Attribute::XorPeerAddress(addr) => encode_xor_address(*addr, transaction_id),
            Attribute::Username(value)
            | Attribute::Realm(value)
            | Attribute::Nonce(value)
            | Attribute::Software(value) => value.as_bytes().to_vec(),
            Attribute::ErrorCode { code, reason } => {
                let mut value = vec![0, 0, (code / 100) as u8, (code % 100) as u8];
                value.extend_from_slice(reason.as_bytes());
                value
            }
            Attribute::Lifetime(seconds) => seconds.to_be_bytes().to_vec(),
            Attribute::Data(data) => data.to_vec(),
            Attribute::ChannelNumber(channel) => {
                let mut value = channel.to_be_bytes().to_vec();
                value.extend_from_slice(&[0, 0]);
                value
            }
            Attribute::RequestedTransport(protocol) => vec![*protocol, 0, 0, 0],
            Attribute::ConnectionId(id) => id.to_be_bytes().to_vec(),
            Attribute::MessageIntegrity(mac) => mac.to_vec(),
            Attribute::Fingerprint(crc) => crc.to_be_bytes().to_vec(),
            Attribute::Unknown { value, .. } => value.clone(),
        }
    }

    /// Decode an attribute value
    pub fn decode(
        attr_type: u16,
        value: &[u8],
        transaction_id: &TransactionId,
    ) -> Result<Self, StunError> {
        let attribute = match attr_type {
            kind::MAPPED_ADDRESS => Attribute::MappedAddress(decode_address(attr_type, value)?),
            kind::XOR_MAPPED_ADDRESS => {
                Attribute::XorMappedAddress(decode_xor_address(attr_type, value, transaction_id)?)
            }
            kind::XOR_RELAYED_ADDRESS => {
                Attribute::XorRelayedAddress(decode_xor_address(attr_type, value, transaction_id)?)
            }
            kind::XOR_PEER_ADDRESS => {
                Attribute::XorPeerAddress(decode_xor_address(attr_type, value, transaction_id)?)
            }
            kind::USERNAME => Attribute::Username(decode_text(attr_type, value)?),
            kind::REALM => Attribute::Realm(decode_text(attr_type, value)?),
            kind::NONCE => Attribute::Nonce(decode_text(attr_type, value)?),
            kind::SOFTWARE => Attribute::Software(decode_text(attr_type, value)?),
            kind::ERROR_CODE => {
                if value.len() < 4 {
                    return Err(malformed(attr_type, "error code shorter than 4 bytes"));
                }
                let code = u16::from(value[2] & 0x07) * 100 + u16::from(value[3]);
                Attribute::ErrorCode {
                    code,
                    reason: decode_text(attr_type, &value[4..])?,
                }
            }
            kind::LIFETIME => Attribute::Lifetime(u32::from_be_bytes(fixed(attr_type, value)?)),
            kind::DATA => Attribute::Data(Bytes::copy_from_slice(value)),
            kind::CHANNEL_NUMBER => {
                let raw: [u8; 4] = fixed(attr_type, value)?;
                Attribute::ChannelNumber(u16::from_be_bytes([raw[0], raw[1]]))
            }
            kind::REQUESTED_TRANSPORT => {
                let raw: [u8; 4] = fixed(attr_type, value)?;
                Attribute::RequestedTransport(raw[0])
            }
            kind::CONNECTION_ID => Attribute::ConnectionId(u32::from_be_bytes(fixed(attr_type, value)?)),
            kind::MESSAGE_INTEGRITY => Attribute::MessageIntegrity(fixed(attr_type, value)?),
            kind::FINGERPRINT => Attribute::Fingerprint(u32::from_be_bytes(fixed(attr_type, value)?)),
            _ => Attribute::Unknown {
                kind: attr_type,
                value: value.to_vec(),
            },
        };
        Ok(attribute)
    }
}

fn malformed(kind: u16, reason: &str) -> StunError {
    StunError::MalformedAttribute {
        kind,
        reason: reason.to_string(),
    }
}

fn fixed<const N: usize>(kind: u16, value: &[u8]) -> Result<[u8; N], StunError> {
    value
        .try_into()
        .map_err(|_| malformed(kind, &format!("expected {} bytes, got {}", N, value.len())))
}

fn decode_text(kind: u16, value: &[u8]) -> Result<String, StunError> {
    String::from_utf8(value.to_vec()).map_err(|_| malformed(kind, "not valid UTF-8"))
}

fn encode_address(addr: SocketAddr) -> Vec<u8> {
    let mut value = vec![0];
    match addr.ip() {
        IpAddr::V4(ip) => {
            value.push(FAMILY_IPV4);
            value.extend_from_slice(&addr.port().to_be_bytes());
            value.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            value.push(FAMILY_IPV6);
            value.extend_from_slice(&addr.port().to_be_bytes());
            value.extend_from_slice(&ip.octets());
        }
    }
    value
}

fn decode_address(kind: u16, value: &[u8]) -> Result<SocketAddr, StunError> {
    if value.len() < 4 {
        return Err(malformed(kind, "address shorter than 4 bytes"));
    }
    let port = u16::from_be_bytes([value[2], value[3]]);
    match (value[1], value.len()) {
        (FAMILY_IPV4, 8) => {
            let ip = Ipv4Addr::new(value[4], value[5], value[6], value[7]);
            Ok(SocketAddr::new(IpAddr::V4(ip), port))
        }
        (FAMILY_IPV6, 20) => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        (family, len) => Err(malformed(
            kind,
            &format!("bad address family {:#04x} with length {}", family, len),
        )),
    }
}

/// XOR key: magic cookie followed by the transaction id
fn xor_key(transaction_id: &TransactionId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    key[4..].copy_from_slice(transaction_id);
    key
}

fn xor_port(port: u16) -> u16 {
    port ^ (MAGIC_COOKIE >> 16) as u16
}

pub fn encode_xor_address(addr: SocketAddr, transaction_id: &TransactionId) -> Vec<u8> {
    let key = xor_key(transaction_id);
    let mut value = vec![0];
    match addr.ip() {
        IpAddr::V4(ip) => {
            value.push(FAMILY_IPV4);
            value.extend_from_slice(&xor_port(addr.port()).to_be_bytes());
            value.extend(ip.octets().iter().zip(&key[..4]).map(|(b, k)| b ^ k));
        }
        IpAddr::V6(ip) => {
            value.push(FAMILY_IPV6);
            value.extend_from_slice(&xor_port(addr.port()).to_be_bytes());
            value.extend(ip.octets().iter().zip(&key).map(|(b, k)| b ^ k));
        }
    }
    value
}

pub fn decode_xor_address(
    kind: u16,
    value: &[u8],
    transaction_id: &TransactionId,
) -> Result<SocketAddr, StunError> {
    let plain = decode_address(kind, value)?;
    let key = xor_key(transaction_id);
    let ip = match plain.ip() {
        IpAddr::V4(ip) => {
            let mut octets = ip.octets();
            octets.iter_mut().zip(&key[..4]).for_each(|(b, k)| *b ^= k);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        IpAddr::V6(ip) => {
            let mut octets = ip.octets();
            octets.iter_mut().zip(&key).for_each(|(b, k)| *b ^= k);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    };
    Ok(SocketAddr::new(ip, xor_port(plain.port())))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TID: TransactionId = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];

    #[test]
    fn test_xor_address_ipv4_wire_value() {
        // 192.0.2.1:32853 from RFC 5769 section 2.2
        let addr: SocketAddr = "192.0.2.1:32853".parse().unwrap();
        let value = encode_xor_address(addr, &TID);
        assert_eq!(value, vec![0x00, 0x01, 0xa1, 0x47, 0xe1, 0x12, 0xa6, 0x43]);
        assert_eq!(decode_xor_address(kind::XOR_MAPPED_ADDRESS, &value, &TID).unwrap(), addr);
    }

    #[test]
    fn test_xor_address_ipv6_uses_transaction_id() {
        let addr: SocketAddr = "[2001:db8::1]:4000".parse().unwrap();
        let value = encode_xor_address(addr, &TID);
        assert_eq!(value.len(), 20);
        assert_eq!(decode_xor_address(kind::XOR_PEER_ADDRESS, &value, &TID).unwrap(), addr);

        let other: TransactionId = [0; 12];
        assert_ne!(decode_xor_address(kind::XOR_PEER_ADDRESS, &value, &other).unwrap(), addr);
    }

    #[test]
    fn test_error_code_value() {
        let attr = Attribute::ErrorCode {
            code: 438,
            reason: "Stale Nonce".to_string(),
        };
        let value = attr.encode_value(&TID);
        assert_eq!(&value[..4], &[0, 0, 4, 38]);
        assert_eq!(Attribute::decode(kind::ERROR_CODE, &value, &TID).unwrap(), attr);
    }

    #[test]
    fn test_malformed_values() {
        assert!(Attribute::decode(kind::LIFETIME, &[0, 1], &TID).is_err());
        assert!(Attribute::decode(kind::XOR_PEER_ADDRESS, &[0, 3, 0, 0, 1, 2, 3, 4], &TID).is_err());
        assert!(Attribute::decode(kind::USERNAME, &[0xff, 0xfe], &TID).is_err());
    }

    #[test]
    fn test_unknown_attribute_preserved() {
        let attr = Attribute::decode(0x8029, &[1, 2, 3], &TID).unwrap();
        assert_eq!(
            attr,
            Attribute::Unknown {
                kind: 0x8029,
                value: vec![1, 2, 3]
            }
        );
    }
}
