use bytes::Bytes;
use bytes::BytesMut;
use chassis_protocol::wire::Frame;
use tokio_util::codec::Decoder;
use tokio_util::codec::Encoder;
use tokio_util::codec::LengthDelimitedCodec;

use crate::ChannelError;

/// A 4-byte big-endian length prefix followed by one JSON-encoded [`Frame`].
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        let inner = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .big_endian()
            .max_frame_length(max_frame_bytes)
            .new_codec();
        Self { inner }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ChannelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ChannelError> {
        match self.inner.decode(src)? {
            Some(record) => Ok(Some(serde_json::from_slice(&record)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ChannelError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ChannelError> {
        let record = serde_json::to_vec(&frame)?;
        self.inner.encode(Bytes::from(record), dst)?;
        Ok(())
    }
}
