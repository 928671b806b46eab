use thiserror::Error;

/// Errors that can escape the ambient stack (CLI bootstrap, storage scan)
/// as a `Result`. In-session protocol errors never become one of these;
/// they are handled locally per the handler's own recovery policy.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Codec(#[from] tracker_relay_protocol::ParseError),
}

pub type Result<T> = std::result::Result<T, RelayError>;
