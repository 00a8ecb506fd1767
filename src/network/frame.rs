//! Control-channel framing.
//!
//! Every message on the TLS control channel is a 1-byte type, a 24-bit
//! big-endian payload length, and the payload. Tunneled voice uses the same
//! framing with the raw UDP payload (no crypt header) as the body.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Protocol version announcement; `u32` payload.
pub const VERSION: u8 = 0;
/// A voice packet carried over the control channel.
pub const UDP_TUNNEL: u8 = 1;
/// Login request; UTF-8 display name, optionally `\n` and a password.
pub const AUTHENTICATE: u8 = 2;
/// Liveness probe; payload echoed verbatim.
pub const PING: u8 = 3;
/// Login refused; UTF-8 reason. The server closes afterwards.
pub const REJECT: u8 = 4;
/// Login complete; `u32` assigned session id.
pub const SERVER_SYNC: u8 = 5;
/// Datagram cipher material (server → client: 32-byte key, two u64
/// nonces); empty in either direction to solicit a resync.
pub const CRYPT_SETUP: u8 = 15;

/// Frame header: type byte + u24 length.
pub const HEADER_LEN: usize = 4;

/// Ceiling on a single control payload.
pub const MAX_PAYLOAD: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFrame {
    pub kind: u8,
    pub payload: Bytes,
}

impl ControlFrame {
    pub fn new(kind: u8, payload: Bytes) -> Self {
        Self { kind, payload }
    }
}

/// Codec for [`ControlFrame`]s over any byte stream.
#[derive(Debug, Default)]
pub struct ControlCodec;

impl ControlCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for ControlCodec {
    type Item = ControlFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ControlFrame>, io::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = usize::from(src[1]) << 16 | usize::from(src[2]) << 8 | usize::from(src[3]);
        if len > MAX_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("control frame of {len} bytes exceeds the limit"),
            ));
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }
        let kind = src[0];
        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(ControlFrame { kind, payload }))
    }
}

impl Encoder<ControlFrame> for ControlCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: ControlFrame, dst: &mut BytesMut) -> Result<(), io::Error> {
        let len = frame.payload.len();
        if len > MAX_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "control frame payload too large",
            ));
        }
        dst.reserve(HEADER_LEN + len);
        dst.put_u8(frame.kind);
        dst.put_u8((len >> 16) as u8);
        dst.put_u8((len >> 8) as u8);
        dst.put_u8(len as u8);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
