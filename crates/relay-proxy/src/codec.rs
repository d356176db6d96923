//! Opaque-frame codec.
//!
//! Proxying must neither parse nor re-encode payloads. [`RawCodec`] plugs
//! into tonic's client codec seam and moves each message as a single byte
//! buffer; [`FrameDecoder`] and [`encode_frame`] handle the length-prefixed
//! gRPC wire framing on the listener side, which runs below tonic's
//! generated-service layer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::Status;

/// Upper bound on a single relayed message.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Length of the gRPC message prefix: compression flag + u32 length.
const FRAME_PREFIX_LEN: usize = 5;

/// One gRPC message as an uninterpreted byte buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame(pub Bytes);

/// A tonic codec that passes frame bytes through verbatim in both
/// directions. Typed messages never appear on the proxy path, so there is no
/// protobuf fallback here; tonic's own prost codec holds that role for
/// generated services.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    type Encode = Frame;
    type Decode = Frame;
    type Encoder = RawEncoder;
    type Decoder = RawDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        RawEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawDecoder
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RawEncoder;

impl Encoder for RawEncoder {
    type Item = Frame;
    type Error = Status;

    fn encode(&mut self, item: Frame, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        dst.put(item.0);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RawDecoder;

impl Decoder for RawDecoder {
    type Item = Frame;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let bytes = src.copy_to_bytes(src.remaining());
        Ok(Some(Frame(bytes)))
    }
}

/// Prefix a payload with the gRPC wire framing (uncompressed).
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_PREFIX_LEN + payload.len());
    buf.put_u8(0);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Incremental splitter for length-prefixed gRPC frames.
///
/// Feed arbitrary byte chunks with [`extend`](Self::extend) and drain
/// complete payloads with [`next_frame`](Self::next_frame). Compressed
/// frames are rejected: the relay forwards payloads untouched and does not
/// negotiate message compression.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete payload, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, Status> {
        if self.buf.len() < FRAME_PREFIX_LEN {
            return Ok(None);
        }

        if self.buf[0] != 0 {
            return Err(Status::unimplemented(
                "compressed grpc frames are not supported",
            ));
        }

        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(Status::resource_exhausted(format!(
                "frame of {len} bytes exceeds the {MAX_FRAME_SIZE} byte limit"
            )));
        }

        if self.buf.len() < FRAME_PREFIX_LEN + len {
            return Ok(None);
        }

        self.buf.advance(FRAME_PREFIX_LEN);
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// True when no partial frame remains buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
