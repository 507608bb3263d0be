//! Length-prefixed framing: `[u32 BE length][length bytes of payload]`.

use crate::ChannelError;

/// Size of the length header in bytes.
pub const HEADER_LEN: usize = 4;

/// Default upper bound on a single frame payload (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Append one encoded frame for `payload` to `buf`.
pub fn encode_frame(payload: &[u8], max_len: usize, buf: &mut Vec<u8>) -> Result<(), ChannelError> {
    let len = payload.len();
    if len > max_len || len > u32::MAX as usize {
        return Err(ChannelError::FrameTooLarge { len, max: max_len });
    }
    buf.reserve(HEADER_LEN + len);
    buf.extend_from_slice(&(len as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(())
}

/// Incremental decoder for a byte stream.
///
/// Accumulates partial reads and yields every complete frame; the remainder
/// stays buffered for the next [`FrameDecoder::feed`].
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_len: usize,
}

impl FrameDecoder {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::with_capacity(8192),
            max_len,
        }
    }

    /// Feed received bytes and extract all complete frames, in order.
    ///
    /// A length header above the configured maximum is a protocol violation;
    /// the decoder is unusable afterwards and the connection must be dropped.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>, ChannelError> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        let mut offset = 0;

        loop {
            let rest = &self.buf[offset..];
            if rest.len() < HEADER_LEN {
                break;
            }

            let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            if len > self.max_len {
                return Err(ChannelError::FrameTooLarge { len, max: self.max_len });
            }

            let total = HEADER_LEN + len;
            if rest.len() < total {
                break;
            }

            frames.push(rest[HEADER_LEN..total].to_vec());
            offset += total;
        }

        self.buf.drain(..offset);
        Ok(frames)
    }

    /// Whether a partial frame is buffered.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}
