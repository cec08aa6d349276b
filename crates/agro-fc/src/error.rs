use thiserror::Error;

/// Transport-level failures. Recovered locally by the reconnect loop and
/// surfaced to the rest of the core only as link state changes.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to open {target}: {reason}")]
    OpenFailed { target: String, reason: String },

    #[error("read failed: {0}")]
    Read(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("link not connected")]
    NotConnected,

    #[error("link closed")]
    Closed,

    #[error("invalid transport config: {0}")]
    Config(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Error)]
pub enum CodecError {
    /// Bytes that looked like a frame but failed to parse. The codec has
    /// already skipped past them.
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}
