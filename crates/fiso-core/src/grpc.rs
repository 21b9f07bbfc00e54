//! The fixed raw-bytes gRPC contract shared by the gRPC source and sink
//! (§4.2, §4.4, §6): one unary method, no protobuf schema on the payload.

use bytes::{Buf, BufMut};
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::Status;

/// The only method path the gRPC source/sink family recognizes.
pub const DELIVER_METHOD: &str = "/fiso.v1.EventService/Deliver";

/// A `tonic` codec that passes the wire bytes through untouched instead of
/// decoding a generated protobuf message — the payload is already a
/// CloudEvent-envelope byte string the pipeline built.
#[derive(Debug, Clone, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    type Encode = Vec<u8>;
    type Decode = Vec<u8>;
    type Encoder = RawBytesCodec;
    type Decoder = RawBytesCodec;

    fn encoder(&mut self) -> Self::Encoder {
        RawBytesCodec
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawBytesCodec
    }
}

#[derive(Debug, Clone, Default)]
pub struct RawBytesCodec;

impl Encoder for RawBytesCodec {
    type Item = Vec<u8>;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
        dst.put_slice(&item);
        Ok(())
    }
}

impl Decoder for RawBytesCodec {
    type Item = Vec<u8>;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Status> {
        if !src.has_remaining() {
            return Ok(None);
        }
        let mut buf = vec![0u8; src.remaining()];
        src.copy_to_slice(&mut buf);
        Ok(Some(buf))
    }
}
