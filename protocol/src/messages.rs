//! Per-message-type codec functions. No message owns its own memory: every
//! `encode` takes the destination buffer and returns the new write offset,
//! every accessor reads a caller-supplied buffer at a documented offset.
//! Each message type gets its own module of free functions grouped by
//! message rather than methods on a per-type struct, since none of these
//! messages need per-instance state.

use byteorder::{BigEndian, ByteOrder};

use crate::device_id::DeviceId;
use crate::error::{ParseError, ParseResult};
use crate::header::{self, HEADER_LEN};
use crate::message_id::MessageId;
use crate::resync;
use crate::tlv::TlvFieldOwned;

fn check_available(buf: &[u8], need: usize, what: &'static str) -> ParseResult<()> {
    if buf.len() < need {
        return Err(ParseError::BodyTooShort {
            what,
            need,
            got: buf.len(),
        });
    }
    Ok(())
}

pub mod ping {
    use super::*;

    pub const SIZE: usize = HEADER_LEN;

    pub fn encode(buf: &mut [u8]) -> usize {
        header::write_header(buf, SIZE as u16, MessageId::Ping as u16)
    }
}

pub mod register_request {
    use super::*;

    pub const SIZE: usize = HEADER_LEN;

    pub fn encode(buf: &mut [u8]) -> usize {
        header::write_header(buf, SIZE as u16, MessageId::RegisterRequest as u16)
    }
}

pub mod register_reply {
    use super::*;

    pub const SIZE: usize = HEADER_LEN + DeviceId::WIRE_LEN;

    pub fn encode(buf: &mut [u8], device_id: DeviceId) -> usize {
        header::write_header(buf, SIZE as u16, MessageId::RegisterReply as u16);
        device_id.write(&mut buf[HEADER_LEN..SIZE]);
        SIZE
    }

    pub fn get_device_id(buf: &[u8]) -> ParseResult<DeviceId> {
        check_available(buf, SIZE, "RegisterReply")?;
        Ok(DeviceId::read(&buf[HEADER_LEN..SIZE]))
    }
}

pub mod tracker_link_request {
    use super::*;

    pub const SIZE: usize = HEADER_LEN + DeviceId::WIRE_LEN;

    pub fn encode(buf: &mut [u8], device_id: DeviceId) -> usize {
        header::write_header(buf, SIZE as u16, MessageId::TrackerLinkRequest as u16);
        device_id.write(&mut buf[HEADER_LEN..SIZE]);
        SIZE
    }

    pub fn get_device_id(buf: &[u8]) -> ParseResult<DeviceId> {
        check_available(buf, SIZE, "TrackerLinkRequest")?;
        Ok(DeviceId::read(&buf[HEADER_LEN..SIZE]))
    }
}

pub mod tracker_link_reply {
    use super::*;

    pub const SIZE: usize = HEADER_LEN + 4;

    pub fn encode(buf: &mut [u8], link_code: u32) -> usize {
        header::write_header(buf, SIZE as u16, MessageId::TrackerLinkReply as u16);
        BigEndian::write_u32(&mut buf[HEADER_LEN..SIZE], link_code);
        SIZE
    }

    pub fn get_link_code(buf: &[u8]) -> ParseResult<u32> {
        check_available(buf, SIZE, "TrackerLinkReply")?;
        Ok(BigEndian::read_u32(&buf[HEADER_LEN..SIZE]))
    }
}

pub mod monitor_link_request {
    use super::*;

    pub const SIZE: usize = HEADER_LEN + 4;

    pub fn encode(buf: &mut [u8], link_code: u32) -> usize {
        header::write_header(buf, SIZE as u16, MessageId::MonitorLinkRequest as u16);
        BigEndian::write_u32(&mut buf[HEADER_LEN..SIZE], link_code);
        SIZE
    }

    pub fn get_link_code(buf: &[u8]) -> ParseResult<u32> {
        check_available(buf, SIZE, "MonitorLinkRequest")?;
        Ok(BigEndian::read_u32(&buf[HEADER_LEN..SIZE]))
    }
}

pub mod monitor_link_reply {
    use super::*;

    pub const SIZE: usize = HEADER_LEN + DeviceId::WIRE_LEN;

    /// `device_id` is `DeviceId::ZERO` on a redeem failure, never an error.
    pub fn encode(buf: &mut [u8], device_id: DeviceId) -> usize {
        header::write_header(buf, SIZE as u16, MessageId::MonitorLinkReply as u16);
        device_id.write(&mut buf[HEADER_LEN..SIZE]);
        SIZE
    }

    pub fn get_device_id(buf: &[u8]) -> ParseResult<DeviceId> {
        check_available(buf, SIZE, "MonitorLinkReply")?;
        Ok(DeviceId::read(&buf[HEADER_LEN..SIZE]))
    }
}

pub mod stream_open_request {
    use super::*;

    pub const SIZE: usize = HEADER_LEN + DeviceId::WIRE_LEN;

    pub fn encode(buf: &mut [u8], device_id: DeviceId) -> usize {
        header::write_header(buf, SIZE as u16, MessageId::StreamOpenRequest as u16);
        device_id.write(&mut buf[HEADER_LEN..SIZE]);
        SIZE
    }

    pub fn get_device_id(buf: &[u8]) -> ParseResult<DeviceId> {
        check_available(buf, SIZE, "StreamOpenRequest")?;
        Ok(DeviceId::read(&buf[HEADER_LEN..SIZE]))
    }
}

/// `int64 did1, did2, uint8 n, uint8 pad, int64 sn0, int32 delta[n-1]`.
pub mod resync_request {
    use super::*;

    const PREFIX_LEN: usize = DeviceId::WIRE_LEN + 2; // device id + n + pad

    pub fn size(sequence_count: usize) -> usize {
        HEADER_LEN + PREFIX_LEN + resync::wire_size(sequence_count)
    }

    /// Returns `None` if `sequence_numbers` exceeds the 255-entry wire limit
    /// (the caller should reject the request before calling this).
    pub fn encode(buf: &mut [u8], device_id: DeviceId, sequence_numbers: &[u64]) -> Option<usize> {
        if sequence_numbers.len() > 255 {
            return None;
        }
        let total = size(sequence_numbers.len());
        header::write_header(buf, total as u16, MessageId::ResyncRequest as u16);
        let mut pos = HEADER_LEN;
        device_id.write(&mut buf[pos..pos + DeviceId::WIRE_LEN]);
        pos += DeviceId::WIRE_LEN;
        buf[pos] = sequence_numbers.len() as u8;
        buf[pos + 1] = 0; // pad
        pos += 2;
        resync::encode_delta_list(buf, pos, sequence_numbers);
        Some(total)
    }

    /// Decodes the device id and requested sequence numbers, rejecting (as
    /// a framing error, not a field error) any declared count whose implied
    /// wire size disagrees with the bytes actually present.
    pub fn decode(buf: &[u8]) -> ParseResult<(DeviceId, Vec<u64>)> {
        check_available(buf, HEADER_LEN + PREFIX_LEN, "ResyncRequest")?;
        let device_id = DeviceId::read(&buf[HEADER_LEN..HEADER_LEN + DeviceId::WIRE_LEN]);
        let count_offset = HEADER_LEN + DeviceId::WIRE_LEN;
        let count = buf[count_offset];
        let list_offset = count_offset + 2;

        let declared_total = size(count as usize);
        let available = buf.len();
        if declared_total != available {
            return Err(ParseError::ResyncCountMismatch {
                declared: declared_total,
                computed: available,
            });
        }

        let (values, _) = resync::decode_delta_list(buf, list_offset, count)?;
        Ok((device_id, values))
    }
}

/// `uint8 nAck, uint8 nReq, {ack list}?, {request list}?`.
pub mod resync_reply {
    use super::*;

    const PREFIX_LEN: usize = 2; // nAck + nReq

    pub fn size(ack_count: usize, request_count: usize) -> usize {
        HEADER_LEN + PREFIX_LEN + resync::wire_size(ack_count) + resync::wire_size(request_count)
    }

    pub fn encode(buf: &mut [u8], ack: &[u64], request: &[u64]) -> Option<usize> {
        if ack.len() > 255 || request.len() > 255 {
            return None;
        }
        let total = size(ack.len(), request.len());
        header::write_header(buf, total as u16, MessageId::ResyncReply as u16);
        buf[HEADER_LEN] = ack.len() as u8;
        buf[HEADER_LEN + 1] = request.len() as u8;
        let mut pos = HEADER_LEN + PREFIX_LEN;
        pos = resync::encode_delta_list(buf, pos, ack);
        resync::encode_delta_list(buf, pos, request);
        Some(total)
    }

    pub fn decode(buf: &[u8]) -> ParseResult<(Vec<u64>, Vec<u64>)> {
        check_available(buf, HEADER_LEN + PREFIX_LEN, "ResyncReply")?;
        let n_ack = buf[HEADER_LEN];
        let n_req = buf[HEADER_LEN + 1];
        let list_offset = HEADER_LEN + PREFIX_LEN;
        let (ack, after_ack) = resync::decode_delta_list(buf, list_offset, n_ack)?;
        let (request, _) = resync::decode_delta_list(buf, after_ack, n_req)?;
        Ok((ack, request))
    }
}

/// Tracker-to-server Tracking message: `did1, did2, sn, TLV*`.
pub mod tracking_to_server {
    use super::*;

    const PREFIX_LEN: usize = DeviceId::WIRE_LEN + 8; // device id + sequence number

    pub fn size(fields: &[TlvFieldOwned]) -> usize {
        HEADER_LEN + PREFIX_LEN + fields.iter().map(TlvFieldOwned::size).sum::<usize>()
    }

    pub fn encode(
        buf: &mut [u8],
        device_id: DeviceId,
        sequence: u64,
        fields: &[TlvFieldOwned],
    ) -> usize {
        let total = size(fields);
        header::write_header(buf, total as u16, MessageId::Tracking as u16);
        let mut pos = HEADER_LEN;
        device_id.write(&mut buf[pos..pos + DeviceId::WIRE_LEN]);
        pos += DeviceId::WIRE_LEN;
        BigEndian::write_u64(&mut buf[pos..pos + 8], sequence);
        pos += 8;
        for field in fields {
            pos = field.encode(buf, pos);
        }
        total
    }

    pub fn get_device_id(buf: &[u8]) -> ParseResult<DeviceId> {
        check_available(buf, HEADER_LEN + DeviceId::WIRE_LEN, "Tracking")?;
        Ok(DeviceId::read(&buf[HEADER_LEN..HEADER_LEN + DeviceId::WIRE_LEN]))
    }

    pub fn get_sequence(buf: &[u8]) -> ParseResult<u64> {
        check_available(buf, HEADER_LEN + PREFIX_LEN, "Tracking")?;
        let offset = HEADER_LEN + DeviceId::WIRE_LEN;
        Ok(BigEndian::read_u64(&buf[offset..offset + 8]))
    }

    /// The TLV-bearing tail of the message body, for `tlv::parse_tlvs`.
    pub fn get_tlv_body(buf: &[u8]) -> ParseResult<&[u8]> {
        check_available(buf, HEADER_LEN + PREFIX_LEN, "Tracking")?;
        Ok(&buf[HEADER_LEN + PREFIX_LEN..])
    }
}

/// Server-to-monitor Tracking message: `TLV*` only. The monitor already
/// knows which device this stream belongs to.
pub mod tracking_to_monitor {
    use super::*;

    pub fn size(fields: &[TlvFieldOwned]) -> usize {
        HEADER_LEN + fields.iter().map(TlvFieldOwned::size).sum::<usize>()
    }

    pub fn encode(buf: &mut [u8], fields: &[TlvFieldOwned]) -> usize {
        let total = size(fields);
        header::write_header(buf, total as u16, MessageId::Tracking as u16);
        let mut pos = HEADER_LEN;
        for field in fields {
            pos = field.encode(buf, pos);
        }
        total
    }

    pub fn get_tlv_body(buf: &[u8]) -> &[u8] {
        &buf[HEADER_LEN.min(buf.len())..]
    }
}
