use byteorder::{BigEndian, ByteOrder};

use crate::error::ParseError;

/// `1-byte length (TLV total, header included) | 1-byte field id | body`.
pub const TLV_HEADER_LEN: usize = 2;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldId {
    BatteryLevel = 0,
    NetworkName = 1,
    Location = 2,
    TrackingStopped = 3,
}

/// A single parsed TLV, borrowing its variable-length payload (`NetworkName`)
/// straight out of the source buffer. The codec allocates nothing to parse.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TlvField<'a> {
    BatteryLevel { time: i64, level: i16 },
    NetworkName { time: i64, name: &'a [u8] },
    Location { time: i64, lat: f64, lon: f64, alt: f64 },
    TrackingStopped { time: i64 },
}

impl<'a> TlvField<'a> {
    pub fn to_owned_field(self) -> TlvFieldOwned {
        match self {
            TlvField::BatteryLevel { time, level } => TlvFieldOwned::BatteryLevel { time, level },
            TlvField::NetworkName { time, name } => TlvFieldOwned::NetworkName {
                time,
                name: name.to_vec(),
            },
            TlvField::Location { time, lat, lon, alt } => {
                TlvFieldOwned::Location { time, lat, lon, alt }
            }
            TlvField::TrackingStopped { time } => TlvFieldOwned::TrackingStopped { time },
        }
    }
}

/// Owned counterpart used when *building* an outgoing message (e.g. a
/// fan-out/snapshot Tracking message assembled from `DeviceState` under
/// lock, where the source bytes don't outlive the guard).
#[derive(Debug, Clone, PartialEq)]
pub enum TlvFieldOwned {
    BatteryLevel { time: i64, level: i16 },
    NetworkName { time: i64, name: Vec<u8> },
    Location { time: i64, lat: f64, lon: f64, alt: f64 },
    TrackingStopped { time: i64 },
}

impl TlvFieldOwned {
    /// Size in bytes of this TLV on the wire, header included.
    pub fn size(&self) -> usize {
        TLV_HEADER_LEN
            + match self {
                TlvFieldOwned::BatteryLevel { .. } => 8 + 2,
                TlvFieldOwned::NetworkName { name, .. } => 8 + name.len(),
                TlvFieldOwned::Location { .. } => 8 + 8 + 8 + 8,
                TlvFieldOwned::TrackingStopped { .. } => 8,
            }
    }

    /// Encodes this TLV at `buf[offset..]` and returns the new write offset.
    pub fn encode(&self, buf: &mut [u8], offset: usize) -> usize {
        let len = self.size();
        buf[offset] = len as u8;
        let mut pos = offset + 1;
        match self {
            TlvFieldOwned::BatteryLevel { time, level } => {
                buf[pos] = FieldId::BatteryLevel as u8;
                pos += 1;
                BigEndian::write_i64(&mut buf[pos..pos + 8], *time);
                pos += 8;
                BigEndian::write_i16(&mut buf[pos..pos + 2], *level);
                pos += 2;
            }
            TlvFieldOwned::NetworkName { time, name } => {
                buf[pos] = FieldId::NetworkName as u8;
                pos += 1;
                BigEndian::write_i64(&mut buf[pos..pos + 8], *time);
                pos += 8;
                buf[pos..pos + name.len()].copy_from_slice(name);
                pos += name.len();
            }
            TlvFieldOwned::Location { time, lat, lon, alt } => {
                buf[pos] = FieldId::Location as u8;
                pos += 1;
                BigEndian::write_i64(&mut buf[pos..pos + 8], *time);
                pos += 8;
                BigEndian::write_f64(&mut buf[pos..pos + 8], *lat);
                pos += 8;
                BigEndian::write_f64(&mut buf[pos..pos + 8], *lon);
                pos += 8;
                BigEndian::write_f64(&mut buf[pos..pos + 8], *alt);
                pos += 8;
            }
            TlvFieldOwned::TrackingStopped { time } => {
                buf[pos] = FieldId::TrackingStopped as u8;
                pos += 1;
                BigEndian::write_i64(&mut buf[pos..pos + 8], *time);
                pos += 8;
            }
        }
        pos
    }

    pub fn time(&self) -> i64 {
        match self {
            TlvFieldOwned::BatteryLevel { time, .. }
            | TlvFieldOwned::NetworkName { time, .. }
            | TlvFieldOwned::Location { time, .. }
            | TlvFieldOwned::TrackingStopped { time } => *time,
        }
    }
}

/// Result of parsing all TLVs in a Tracking message body.
///
/// `fields` holds every TLV successfully parsed *before* `error`, in their
/// original order. A broken field aborts parsing but never rolls back the
/// prefix already decoded.
#[derive(Debug, Default)]
pub struct TlvParseOutcome<'a> {
    pub fields: Vec<TlvField<'a>>,
    pub error: Option<ParseError>,
}

/// Parses every TLV in `buf`, stopping at the first malformed or truncated
/// one. Unknown field ids are skipped by their declared length and are not
/// an error.
pub fn parse_tlvs(buf: &[u8]) -> TlvParseOutcome<'_> {
    let mut out = TlvParseOutcome::default();
    let mut offset = 0usize;

    while offset < buf.len() {
        let remaining = buf.len() - offset;
        if remaining < TLV_HEADER_LEN {
            out.error = Some(ParseError::TruncatedField {
                offset,
                declared: TLV_HEADER_LEN,
                remaining,
            });
            break;
        }
        let len = buf[offset] as usize;
        if len == 0 {
            out.error = Some(ParseError::ZeroLengthField);
            break;
        }
        if len > remaining {
            out.error = Some(ParseError::TruncatedField {
                offset,
                declared: len,
                remaining,
            });
            break;
        }
        let field_id = buf[offset + 1];
        let body = &buf[offset + TLV_HEADER_LEN..offset + len];

        match field_id {
            id if id == FieldId::BatteryLevel as u8 => {
                if body.len() < 10 {
                    out.error = Some(ParseError::TruncatedField {
                        offset,
                        declared: len,
                        remaining,
                    });
                    break;
                }
                out.fields.push(TlvField::BatteryLevel {
                    time: BigEndian::read_i64(&body[0..8]),
                    level: BigEndian::read_i16(&body[8..10]),
                });
            }
            id if id == FieldId::NetworkName as u8 => {
                if body.len() < 8 {
                    out.error = Some(ParseError::TruncatedField {
                        offset,
                        declared: len,
                        remaining,
                    });
                    break;
                }
                out.fields.push(TlvField::NetworkName {
                    time: BigEndian::read_i64(&body[0..8]),
                    name: &body[8..],
                });
            }
            id if id == FieldId::Location as u8 => {
                if body.len() < 32 {
                    out.error = Some(ParseError::TruncatedField {
                        offset,
                        declared: len,
                        remaining,
                    });
                    break;
                }
                out.fields.push(TlvField::Location {
                    time: BigEndian::read_i64(&body[0..8]),
                    lat: BigEndian::read_f64(&body[8..16]),
                    lon: BigEndian::read_f64(&body[16..24]),
                    alt: BigEndian::read_f64(&body[24..32]),
                });
            }
            id if id == FieldId::TrackingStopped as u8 => {
                if body.len() < 8 {
                    out.error = Some(ParseError::TruncatedField {
                        offset,
                        declared: len,
                        remaining,
                    });
                    break;
                }
                out.fields.push(TlvField::TrackingStopped {
                    time: BigEndian::read_i64(&body[0..8]),
                });
            }
            _ => {
                // UnknownFieldId: skip by declared length, not an error.
            }
        }

        offset += len;
    }

    out
}
