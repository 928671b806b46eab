use byteorder::{BigEndian, ByteOrder};

use crate::error::{ParseError, ParseResult};

/// Wire size in bytes of a delta-compressed list of `count` sequence
/// numbers: a first absolute `u64` followed by `count - 1` signed 32-bit
/// decrements. An empty partition writes nothing at all.
pub fn wire_size(count: usize) -> usize {
    if count == 0 {
        0
    } else {
        8 + 4 * (count - 1)
    }
}

/// Encodes `values` as `[first absolute, signed 32-bit decrements...]` at
/// `buf[offset..]`, returning the new write offset. Writes nothing if
/// `values` is empty.
pub fn encode_delta_list(buf: &mut [u8], offset: usize, values: &[u64]) -> usize {
    if values.is_empty() {
        return offset;
    }
    let mut pos = offset;
    BigEndian::write_u64(&mut buf[pos..pos + 8], values[0]);
    pos += 8;
    for pair in values.windows(2) {
        let delta = (pair[0] as i64).wrapping_sub(pair[1] as i64) as i32;
        BigEndian::write_i32(&mut buf[pos..pos + 4], delta);
        pos += 4;
    }
    pos
}

/// Decodes `count` delta-compressed sequence numbers starting at
/// `buf[offset..]`, returning the values and the new read offset. `count`
/// must already be known to be within the wire format's 255-entry limit.
pub fn decode_delta_list(buf: &[u8], offset: usize, count: u8) -> ParseResult<(Vec<u64>, usize)> {
    if count == 0 {
        return Ok((Vec::new(), offset));
    }
    let needed = wire_size(count as usize);
    if buf.len() < offset + needed {
        return Err(ParseError::BodyTooShort {
            what: "resync delta list",
            need: needed,
            got: buf.len().saturating_sub(offset),
        });
    }
    let mut pos = offset;
    let mut values = Vec::with_capacity(count as usize);
    values.push(BigEndian::read_u64(&buf[pos..pos + 8]));
    pos += 8;
    for _ in 1..count {
        let delta = BigEndian::read_i32(&buf[pos..pos + 4]) as i64;
        pos += 4;
        let prev = *values.last().expect("just pushed at least one value");
        values.push(((prev as i64).wrapping_sub(delta)) as u64);
    }
    Ok((values, pos))
}

/// Splits `requested` into the sequence numbers `is_member` accepts (ack)
/// and rejects (request), each preserving `requested`'s original order.
/// Pure and allocation-light so it is independently testable against the
/// partition law without touching `DeviceState`'s lock.
pub fn partition(requested: &[u64], is_member: impl Fn(u64) -> bool) -> (Vec<u64>, Vec<u64>) {
    let mut ack = Vec::new();
    let mut request = Vec::new();
    for &seq in requested {
        if is_member(seq) {
            ack.push(seq);
        } else {
            request.push(seq);
        }
    }
    (ack, request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn empty_list_writes_nothing() {
        let mut buf = [0xAAu8; 4];
        let end = encode_delta_list(&mut buf, 0, &[]);
        assert_eq!(end, 0);
        let (values, pos) = decode_delta_list(&buf, 0, 0).unwrap();
        assert!(values.is_empty());
        assert_eq!(pos, 0);
    }

    #[test]
    fn partition_matches_set_membership() {
        let received: HashSet<u64> = [10, 12, 15].into_iter().collect();
        let requested = [15u64, 12, 10, 5];
        let (ack, request) = partition(&requested, |v| received.contains(&v));
        assert_eq!(ack, vec![15, 12, 10]);
        assert_eq!(request, vec![5]);
    }

    proptest! {
        #[test]
        fn round_trips_for_any_first_and_deltas(
            first in any::<u64>(),
            deltas in proptest::collection::vec(any::<i32>(), 0..254),
        ) {
            let count = (deltas.len() + 1) as u8;
            let mut raw = vec![first];
            for &d in &deltas {
                let prev = *raw.last().unwrap();
                raw.push(((prev as i64).wrapping_sub(d as i64)) as u64);
            }

            let mut buf = vec![0u8; wire_size(count as usize)];
            encode_delta_list(&mut buf, 0, &raw);
            let (decoded, pos) = decode_delta_list(&buf, 0, count).unwrap();
            prop_assert_eq!(decoded, raw);
            prop_assert_eq!(pos, buf.len());
        }
    }
}
