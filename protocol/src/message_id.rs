use num_enum::TryFromPrimitive;

/// Message ids from the wire header's `id` field. Kept as a plain
/// `TryFromPrimitive` enum rather than a trait hierarchy per message: the
/// codec dispatches on this once and hands the raw buffer to the matching
/// `messages::*` module from there.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
pub enum MessageId {
    Ping = 1,
    RegisterRequest = 5,
    RegisterReply = 6,
    TrackerLinkRequest = 7,
    TrackerLinkReply = 8,
    MonitorLinkRequest = 9,
    MonitorLinkReply = 10,
    StreamOpenRequest = 11,
    ResyncRequest = 12,
    ResyncReply = 13,
    Tracking = 16,
}
