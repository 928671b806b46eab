use crate::error::InvalidUtf8;

/// Reusable, session-owned UTF-8 decoder used only to render a `NetworkName`
/// for logging. The raw bytes are always what gets stored in
/// `DeviceState`, regardless of whether this succeeds.
///
/// The output buffer grows on overflow instead of being reallocated per
/// call, and a malformed sequence always yields [`InvalidUtf8`] rather than
/// a best-effort partial string.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    scratch: String,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes `bytes` into the reused scratch buffer and returns a
    /// borrowed view of it, or `InvalidUtf8` if `bytes` is not valid UTF-8.
    pub fn decode<'a>(&'a mut self, bytes: &[u8]) -> Result<&'a str, InvalidUtf8> {
        let text = std::str::from_utf8(bytes).map_err(|_| InvalidUtf8)?;
        if self.scratch.capacity() < text.len() {
            self.scratch.reserve(text.len() - self.scratch.capacity());
        }
        self.scratch.clear();
        self.scratch.push_str(text);
        Ok(&self.scratch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_valid_utf8() {
        let mut d = Utf8Decoder::new();
        assert_eq!(d.decode("home-wifi".as_bytes()).unwrap(), "home-wifi");
    }

    #[test]
    fn rejects_malformed_sequence_without_a_partial_result() {
        let mut d = Utf8Decoder::new();
        let bytes = [b'o', b'k', 0xFF, 0xFE];
        assert_eq!(d.decode(&bytes), Err(InvalidUtf8));
    }

    #[test]
    fn scratch_buffer_is_reused_across_calls() {
        let mut d = Utf8Decoder::new();
        d.decode(b"first-network-name").unwrap();
        let cap_after_first = d.scratch.capacity();
        let second = d.decode(b"abc").unwrap().to_string();
        assert_eq!(second, "abc");
        assert_eq!(d.scratch.capacity(), cap_after_first);
    }
}
