use thiserror::Error;

/// Errors raised while decoding a frame or a field inside it.
///
/// `Framing*` variants mean the containing message (or datagram) cannot be
/// trusted at all; `Field*`/`UnknownField` mean parsing of *this* message
/// should stop but whatever TLVs were already applied stand (see the
/// codec's TLV loop doc comment).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("header too short: need {need} bytes, got {got}")]
    HeaderTooShort { need: usize, got: usize },

    #[error("declared size {declared} exceeds protocol maximum {max}")]
    SizeTooLarge { declared: u16, max: u16 },

    #[error("declared size {declared} does not match available bytes {available}")]
    SizeMismatch { declared: usize, available: usize },

    #[error("unknown message id {0}")]
    UnknownMessageId(u16),

    #[error("body too short for {what}: need {need} bytes, got {got}")]
    BodyTooShort {
        what: &'static str,
        need: usize,
        got: usize,
    },

    #[error("TLV length byte was zero")]
    ZeroLengthField,

    #[error("TLV at offset {offset} declares length {declared} but only {remaining} bytes remain")]
    TruncatedField {
        offset: usize,
        declared: usize,
        remaining: usize,
    },

    #[error("resync list declared {declared} entries but wire size implies {computed}")]
    ResyncCountMismatch { declared: usize, computed: usize },

    #[error("resync list length {0} exceeds the 255-entry wire limit")]
    ResyncListTooLong(usize),
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Distinguished sentinel returned in place of a partially-decoded string.
/// Never constructed piecemeal: a malformed byte always yields this, not a
/// truncated prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidUtf8;
