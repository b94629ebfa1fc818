//! Binary wire format.
//!
//! All integers are little-endian `u32`.
//!
//! ```text
//! Request:  total_len | arg_count | (arg_len | arg_bytes) * arg_count
//! Response: total_len | payload
//! ```
//!
//! Decoding is a pure function of the buffered bytes: a partial frame is
//! reported as `Incomplete` without consuming anything, so the caller simply
//! decodes again after the next read.

use bytes::{Buf, BufMut};
use std::fmt;

/// Size of the `total_len` prefix.
pub const HEADER_LEN: usize = 4;

/// Largest accepted `total_len` (32 MiB).
pub const MAX_MSG_SIZE: usize = 32 << 20;

/// Largest accepted `arg_count`.
pub const MAX_ARGS: usize = 200_000;

/// Protocol violations. Each one is fatal to the connection that sent it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// `total_len` exceeds [`MAX_MSG_SIZE`].
    TooLarge(usize),
    /// `arg_count` exceeds [`MAX_ARGS`].
    TooManyArgs(usize),
    /// A count or length field runs past the end of the frame.
    Truncated,
    /// Bytes left inside the frame after the last argument.
    TrailingBytes(usize),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::TooLarge(len) => {
                write!(f, "message too large: {} > {}", len, MAX_MSG_SIZE)
            }
            FrameError::TooManyArgs(count) => {
                write!(f, "too many arguments: {} > {}", count, MAX_ARGS)
            }
            FrameError::Truncated => write!(f, "argument runs past end of frame"),
            FrameError::TrailingBytes(n) => write!(f, "{} trailing bytes after arguments", n),
        }
    }
}

impl std::error::Error for FrameError {}

/// A decoded request borrowing its arguments from the input buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct Request<'a> {
    pub args: Vec<&'a [u8]>,
    /// Bytes to drop from the input once the request is handled.
    pub consumed: usize,
}

/// Outcome of [`try_decode_request`].
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded<'a> {
    /// Not enough bytes buffered yet.
    Incomplete,
    /// The buffered bytes can never form a valid request.
    Malformed(FrameError),
    /// One complete request at the head of the buffer.
    Frame(Request<'a>),
}

/// Length of the frame at the head of `buf`, if it is fully buffered.
///
/// Only the 4-byte header is inspected, so an oversized message is rejected
/// before any room is made for its body.
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>, FrameError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let total_len = (&buf[..HEADER_LEN]).get_u32_le() as usize;
    if total_len > MAX_MSG_SIZE {
        return Err(FrameError::TooLarge(total_len));
    }

    let frame_len = HEADER_LEN + total_len;
    if buf.len() < frame_len {
        Ok(None)
    } else {
        Ok(Some(frame_len))
    }
}

/// Try to decode one request from the head of `buf`.
pub fn try_decode_request(buf: &[u8]) -> Decoded<'_> {
    let frame_len = match frame_len(buf) {
        Ok(Some(len)) => len,
        Ok(None) => return Decoded::Incomplete,
        Err(e) => return Decoded::Malformed(e),
    };

    match parse_args(&buf[HEADER_LEN..frame_len]) {
        Ok(args) => Decoded::Frame(Request {
            args,
            consumed: frame_len,
        }),
        Err(e) => Decoded::Malformed(e),
    }
}

fn parse_args(mut payload: &[u8]) -> Result<Vec<&[u8]>, FrameError> {
    if payload.remaining() < 4 {
        return Err(FrameError::Truncated);
    }

    let arg_count = payload.get_u32_le() as usize;
    if arg_count > MAX_ARGS {
        return Err(FrameError::TooManyArgs(arg_count));
    }

    // Every argument needs at least its length prefix
    if arg_count > payload.remaining() / 4 {
        return Err(FrameError::Truncated);
    }

    let mut args = Vec::with_capacity(arg_count);
    for _ in 0..arg_count {
        if payload.remaining() < 4 {
            return Err(FrameError::Truncated);
        }
        let arg_len = payload.get_u32_le() as usize;
        if payload.remaining() < arg_len {
            return Err(FrameError::Truncated);
        }
        let (arg, rest) = payload.split_at(arg_len);
        args.push(arg);
        payload = rest;
    }

    if !payload.is_empty() {
        return Err(FrameError::TrailingBytes(payload.len()));
    }

    Ok(args)
}

/// Frame a response payload.
///
/// The payload size is the handler's responsibility and is not re-checked.
pub fn encode_response(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.put_u32_le(payload.len() as u32);
    out.put_slice(payload);
    out
}

/// Encode a request as a client would send it.
#[cfg(test)]
pub fn encode_request<A: AsRef<[u8]>>(args: &[A]) -> Vec<u8> {
    let body_len: usize = 4 + args.iter().map(|a| 4 + a.as_ref().len()).sum::<usize>();
    let mut out = Vec::with_capacity(HEADER_LEN + body_len);
    out.put_u32_le(body_len as u32);
    out.put_u32_le(args.len() as u32);
    for arg in args {
        let arg = arg.as_ref();
        out.put_u32_le(arg.len() as u32);
        out.put_slice(arg);
    }
    out
}
