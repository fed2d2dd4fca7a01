//! Length-prefixed frame codec for tracker RPC connections.
//!
//! Each frame is a 4-byte big-endian payload length followed by the payload
//! (an encoded [`RpcRequest`](crate::wire::RpcRequest) or
//! [`RpcResponse`](crate::wire::RpcResponse)):
//!
//! ```text
//! ┌───────────────┬──────────────────────────────┐
//! │ 4 bytes (BE)  │  protobuf payload            │
//! │ payload len   │                              │
//! └───────────────┴──────────────────────────────┘
//! ```
//!
//! The length is validated against the frame cap before any allocation, so
//! a hostile peer cannot make the server reserve 4 GiB with one header.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::WireError;

/// Frame header length: u32 payload size.
const HEADER_LEN: usize = 4;

/// Default frame cap (16 MiB). A batch of a few thousand entries is well
/// under 1 MiB.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length-prefixed codec used with `tokio_util::codec::Framed`.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > self.max_frame_size {
            return Err(WireError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        let total = HEADER_LEN + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = WireError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), WireError> {
        if item.len() > self.max_frame_size {
            return Err(WireError::FrameTooLarge {
                size: item.len(),
                max: self.max_frame_size,
            });
        }
        dst.reserve(HEADER_LEN + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}
