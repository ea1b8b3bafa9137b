//! Byte-stream framing for bridge messages.
//!
//! On the wire a frame is a big-endian `u32` byte count followed by that many
//! bytes of UTF-8. The codec stops at text: a frame that is valid UTF-8 but
//! not a valid message still reaches the engine, which answers or drops it.

use std::io;

use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Outbound frames past this many bytes are logged at info.
const LARGE_FRAME_BYTES: usize = 100_000;

/// Text frames in, text frames out. Invalid UTF-8 is an `InvalidData` error.
pub struct TextFrameCodec {
    inner: LengthDelimitedCodec,
}

impl Default for TextFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl TextFrameCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .new_codec(),
        }
    }
}

impl Decoder for TextFrameCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let text = String::from_utf8(bytes.to_vec())
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(text))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<String> for TextFrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame_len = item.len();
        tracing::trace!(frame_size_bytes = frame_len, "Framing message");
        if frame_len > LARGE_FRAME_BYTES {
            tracing::info!(
                frame_size_bytes = frame_len,
                frame_size_kb = frame_len / 1024,
                "Oversized outbound frame"
            );
        }
        self.inner.encode(Bytes::from(item), dst)
    }
}
