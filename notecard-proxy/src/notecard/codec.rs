//! Line framing for Notecard requests and replies.
//!
//! The Notecard speaks newline-delimited JSON on both transports: one request
//! line in, one reply line out.

use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use std::io;
use tokio_util::codec::Decoder;

use crate::error::DeviceError;

/// Longest reply we are willing to buffer.
pub const MAX_RESPONSE_LEN: usize = 1024 * 1024;

/// Decode reply lines, stripping the `\r\n` terminator and skipping blank
/// lines.
#[derive(Debug, Clone)]
pub struct ResponseCodec {
    max_len: usize,
    // Bytes already scanned for a newline without finding one.
    scanned: usize,
}

impl Default for ResponseCodec {
    fn default() -> Self {
        Self::new(MAX_RESPONSE_LEN)
    }
}

impl ResponseCodec {
    pub fn new(max_len: usize) -> Self {
        Self { max_len, scanned: 0 }
    }
}

impl Decoder for ResponseCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(offset) = src[self.scanned..].iter().position(|b| *b == b'\n') else {
                self.scanned = src.len();
                if src.len() > self.max_len {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        DeviceError::ResponseTooLong(self.max_len),
                    ));
                }
                return Ok(None);
            };

            let newline = self.scanned + offset;
            if newline > self.max_len {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    DeviceError::ResponseTooLong(self.max_len),
                ));
            }
            self.scanned = 0;
            let mut line = src.split_to(newline + 1);
            line.truncate(newline);
            while line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(line.freeze()));
        }
    }
}

/// Turn an opaque request body into exactly one request line.
///
/// Raw CR and LF bytes can only appear between JSON tokens, where any
/// whitespace is equivalent, so they are replaced with spaces. Nothing else is
/// touched: number literals and key order reach the device as sent.
pub fn frame_request(body: &[u8]) -> Bytes {
    let end = body
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    let mut line = BytesMut::with_capacity(end + 1);
    line.extend(body[..end].iter().map(|b| match *b {
        b'\r' | b'\n' => b' ',
        other => other,
    }));
    line.extend_from_slice(b"\n");
    line.freeze()
}

#[derive(Deserialize)]
struct RequestShape {
    req: Option<serde::de::IgnoredAny>,
    cmd: Option<serde::de::IgnoredAny>,
}

/// Whether the Notecard will answer this request.
///
/// `cmd` requests are fire-and-forget. Anything that is not a JSON object, or
/// that names `req`, is treated as expecting a reply.
pub fn expects_reply(body: &[u8]) -> bool {
    match serde_json::from_slice::<RequestShape>(body) {
        Ok(shape) => shape.req.is_some() || shape.cmd.is_none(),
        Err(_) => true,
    }
}

/// Pop the next reply line from a buffer filled by a transport.
pub(crate) fn next_reply(
    codec: &mut ResponseCodec,
    buffer: &mut BytesMut,
) -> Result<Option<Bytes>, DeviceError> {
    codec.decode(buffer).map_err(into_device_error)
}

/// Recover the [`DeviceError`] a decode failure carries, if any.
pub(crate) fn into_device_error(e: io::Error) -> DeviceError {
    if e.get_ref().is_some_and(|inner| inner.is::<DeviceError>()) {
        if let Some(Ok(device)) = e.into_inner().map(|inner| inner.downcast::<DeviceError>()) {
            return *device;
        }
        return DeviceError::Protocol("malformed reply".to_string());
    }
    DeviceError::Io(e)
}
