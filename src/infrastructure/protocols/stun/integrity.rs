/// MESSAGE-INTEGRITY (HMAC-SHA1) and FINGERPRINT (CRC-32) helpers
use super::message::StunError;
use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// XOR applied to the CRC-32 carried in FINGERPRINT
pub const FINGERPRINT_XOR: u32 = 0x5354_554E;

/// HMAC-SHA1 of `data` keyed with the long-term key
pub fn message_integrity(key: &[u8], data: &[u8]) -> Result<[u8; 20], StunError> {
    let mut mac = HmacSha1::new_from_slice(key).map_err(|_| StunError::InvalidKey)?;
    mac.update(data);
    let mut out = [0u8; 20];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Constant-time check of a received MESSAGE-INTEGRITY value
pub fn verify_message_integrity(key: &[u8], data: &[u8], expected: &[u8; 20]) -> bool {
    match HmacSha1::new_from_slice(key) {
        Ok(mut mac) => {
            mac.update(data);
            mac.verify_slice(expected).is_ok()
        }
        Err(_) => false,
    }
}

pub fn fingerprint(data: &[u8]) -> u32 {
    crc32(data) ^ FINGERPRINT_XOR
}

const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0u32;
    while i < 256 {
        let mut crc = i;
        let mut bit = 0;
        while bit < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
            bit += 1;
        }
        table[i as usize] = crc;
        i += 1;
    }
    table
};

/// CRC-32 (IEEE 802.3)
pub fn crc32(data: &[u8]) -> u32 {
    let crc = data.iter().fold(0xFFFF_FFFFu32, |crc, byte| {
        (crc >> 8) ^ CRC32_TABLE[((crc ^ u32::from(*byte)) & 0xFF) as usize]
    });
    crc ^ 0xFFFF_FFFF
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn test_message_integrity_verifies() {
        let key = md5::compute("user:realm:pass").0;
        let mac = message_integrity(&key, b"payload").unwrap();

        assert!(verify_message_integrity(&key, b"payload", &mac));
        assert!(!verify_message_integrity(&key, b"tampered", &mac));
        assert!(!verify_message_integrity(b"other", b"payload", &mac));
    }
}
