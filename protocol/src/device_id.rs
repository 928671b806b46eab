use byteorder::{BigEndian, ByteOrder};
use uuid::Uuid;

/// 128-bit opaque device identifier, serialized on the wire as two
/// big-endian `int64` halves. The canonical 36-character UUID form is only
/// used for marker filenames and logging; on the wire it is always the two
/// halves, never a UUID string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceId {
    pub hi: i64,
    pub lo: i64,
}

impl DeviceId {
    pub const WIRE_LEN: usize = 16;

    pub const ZERO: DeviceId = DeviceId { hi: 0, lo: 0 };

    pub fn is_zero(&self) -> bool {
        self.hi == 0 && self.lo == 0
    }

    /// A fresh type-4 UUID split into its two big-endian halves, matching
    /// `RegisterRequest`'s device-id generation.
    pub fn new_random() -> Self {
        let uuid = Uuid::new_v4();
        let bytes = uuid.as_bytes();
        let hi = BigEndian::read_i64(&bytes[0..8]);
        let lo = BigEndian::read_i64(&bytes[8..16]);
        DeviceId { hi, lo }
    }

    /// Canonical 36-character UUID form used for marker filenames.
    pub fn to_uuid_string(self) -> String {
        let mut bytes = [0u8; 16];
        BigEndian::write_i64(&mut bytes[0..8], self.hi);
        BigEndian::write_i64(&mut bytes[8..16], self.lo);
        Uuid::from_bytes(bytes).hyphenated().to_string()
    }

    pub fn from_uuid_string(s: &str) -> Option<Self> {
        let uuid = Uuid::parse_str(s).ok()?;
        let bytes = uuid.as_bytes();
        Some(DeviceId {
            hi: BigEndian::read_i64(&bytes[0..8]),
            lo: BigEndian::read_i64(&bytes[8..16]),
        })
    }

    pub fn read(buf: &[u8]) -> DeviceId {
        DeviceId {
            hi: BigEndian::read_i64(&buf[0..8]),
            lo: BigEndian::read_i64(&buf[8..16]),
        }
    }

    pub fn write(self, buf: &mut [u8]) {
        BigEndian::write_i64(&mut buf[0..8], self.hi);
        BigEndian::write_i64(&mut buf[8..16], self.lo);
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_uuid_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_wire_bytes() {
        let id = DeviceId { hi: -7, lo: 42 };
        let mut buf = [0u8; 16];
        id.write(&mut buf);
        assert_eq!(DeviceId::read(&buf), id);
    }

    #[test]
    fn round_trips_through_uuid_string() {
        let id = DeviceId::new_random();
        let s = id.to_uuid_string();
        assert_eq!(DeviceId::from_uuid_string(&s), Some(id));
    }

    #[test]
    fn zero_is_the_failure_sentinel() {
        assert!(DeviceId::ZERO.is_zero());
        assert!(!DeviceId::new_random().is_zero());
    }
}
