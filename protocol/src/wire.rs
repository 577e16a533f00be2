//! Frames exchanged on a parent/child channel.
//!
//! Each frame is one JSON object carried in a length-delimited record. The
//! first frame on a channel is always the child's [`Hello`]; the parent
//! answers with [`HelloAck`] before anything else may be sent. After that the
//! engine's opaque payloads flow in both directions, the parent may send
//! `shutdown`, and the child's last frame is its `exit` report.

use serde::Deserialize;
use serde::Serialize;

use crate::ExitReport;
use crate::ProcessRole;

/// Bumped whenever the frame layout changes incompatibly.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: u32,
    pub pid: u32,
    pub role: ProcessRole,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloAck {
    pub protocol_version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Hello(Hello),
    HelloAck(HelloAck),
    Payload {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Shutdown {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Exit(ExitReport),
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello(_) => "hello",
            Frame::HelloAck(_) => "hello_ack",
            Frame::Payload { .. } => "payload",
            Frame::Shutdown { .. } => "shutdown",
            Frame::Exit(_) => "exit",
        }
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}
