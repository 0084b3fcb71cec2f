/// ChannelData framing (RFC 5766 section 11.4)
use crate::domain::shared::{ChannelNumber, RelayError, Result};
use bytes::{BufMut, Bytes, BytesMut};

pub const CHANNEL_DATA_HEADER_LEN: usize = 4;

/// A ChannelData message: channel number, then the application payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    pub channel: ChannelNumber,
    pub data: Bytes,
}

impl ChannelData {
    pub fn new(channel: ChannelNumber, data: Bytes) -> Self {
        Self { channel, data }
    }

    /// First two bits `01` mark a ChannelData frame
    pub fn is_channel_data(data: &[u8]) -> bool {
        data.len() >= CHANNEL_DATA_HEADER_LEN && data[0] & 0xC0 == 0x40
    }

    /// Bytes a frame occupies given its header; stream transports pad to 4
    pub fn total_length(header: &[u8], padded: bool) -> Option<usize> {
        if header.len() < CHANNEL_DATA_HEADER_LEN {
            return None;
        }
        let length = u16::from_be_bytes([header[2], header[3]]) as usize;
        let length = if padded { (length + 3) & !3 } else { length };
        Some(CHANNEL_DATA_HEADER_LEN + length)
    }

    /// Serialize; pad to a multiple of 4 when sent over a stream
    pub fn encode(&self, padded: bool) -> Result<Bytes> {
        let length = u16::try_from(self.data.len())
            .map_err(|_| RelayError::Codec("channel data payload too large".to_string()))?;
        let padding = if padded {
            (4 - self.data.len() % 4) % 4
        } else {
            0
        };

        let mut buffer = BytesMut::with_capacity(CHANNEL_DATA_HEADER_LEN + self.data.len() + padding);
        buffer.put_u16(self.channel.value());
        buffer.put_u16(length);
        buffer.put_slice(&self.data);
        buffer.put_bytes(0, padding);
        Ok(buffer.freeze())
    }

    /// Parse a frame; trailing padding is ignored
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < CHANNEL_DATA_HEADER_LEN {
            return Err(RelayError::Codec(format!(
                "channel data too short: {} bytes",
                data.len()
            )));
        }
        let channel = ChannelNumber::new(u16::from_be_bytes([data[0], data[1]]))?;
        let length = u16::from_be_bytes([data[2], data[3]]) as usize;
        let payload = &data[CHANNEL_DATA_HEADER_LEN..];
        if payload.len() < length {
            return Err(RelayError::Codec(format!(
                "channel data declares {} bytes, carries {}",
                length,
                payload.len()
            )));
        }
        Ok(Self {
            channel,
            data: Bytes::copy_from_slice(&payload[..length]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(value: u16) -> ChannelNumber {
        ChannelNumber::new(value).unwrap()
    }

    #[test]
    fn test_encode_layout() {
        let frame = ChannelData::new(channel(0x4001), Bytes::from_static(b"abcde"));

        let datagram = frame.encode(false).unwrap();
        assert_eq!(&datagram[..4], &[0x40, 0x01, 0x00, 0x05]);
        assert_eq!(datagram.len(), 9);

        let streamed = frame.encode(true).unwrap();
        assert_eq!(streamed.len(), 12);
        assert_eq!(ChannelData::total_length(&streamed, true), Some(12));
        assert_eq!(ChannelData::decode(&streamed).unwrap(), frame);
    }

    #[test]
    fn test_detection() {
        assert!(ChannelData::is_channel_data(&[0x40, 0x00, 0x00, 0x00]));
        assert!(ChannelData::is_channel_data(&[0x7f, 0xff, 0x00, 0x00]));
        assert!(!ChannelData::is_channel_data(&[0x00, 0x01, 0x00, 0x00]));
        assert!(!ChannelData::is_channel_data(&[0x40, 0x00]));
    }

    #[test]
    fn test_decode_errors() {
        assert!(ChannelData::decode(&[0x40, 0x00, 0x00, 0x08, 1, 2]).is_err());
        // 0x8000 is outside the channel range
        assert!(ChannelData::decode(&[0x80, 0x00, 0x00, 0x00]).is_err());
    }
}
