//! Framed text codec for the instance channel.
//!
//! Uses LengthDelimitedCodec for framing. Partial reads accumulate in the
//! decoder buffer until a whole frame is present, so a message is only ever
//! delivered complete. Works over any AsyncRead/AsyncWrite.

use std::io;

use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Largest frame either side will accept. Environments are the bulk of a
/// request and stay far below this.
pub const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

/// Codec that frames UTF-8 messages with a 4-byte length prefix.
pub struct MessageCodec {
    inner: LengthDelimitedCodec,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
        }
    }
}

impl Decoder for MessageCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let message = String::from_utf8(bytes.to_vec())
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                tracing::trace!(frame_size_bytes = message.len(), "Decoded frame");
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<String> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = item.len();
        tracing::trace!(frame_size_bytes = len, "Encoding frame");
        if len > 100_000 {
            tracing::debug!(
                frame_size_bytes = len,
                frame_size_kb = len / 1024,
                "Large frame being encoded"
            );
        }
        self.inner.encode(Bytes::from(item), dst)
    }
}
