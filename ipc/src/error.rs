use std::time::Duration;

use chassis_protocol::ProcessRole;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("invalid channel address `{0}`")]
    InvalidAddress(String),

    #[error("failed to open channel {channel}: {source}")]
    OpenFailed {
        channel: String,
        #[source]
        source: std::io::Error,
    },

    #[error("handshake timed out after {timeout:?}")]
    HandshakeTimeout { timeout: Duration },

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("channel is closed")]
    Closed,

    /// The outgoing buffer is full; the frame was not queued.
    #[error("send buffer is full")]
    Backpressure,

    #[error("failed to spawn child process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("child exited before completing the handshake (exit code {code:?})")]
    ChildExited { code: Option<i32> },

    #[error("cannot spawn a child for the {0} role")]
    UnsupportedRole(ProcessRole),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
}
