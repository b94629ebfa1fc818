//! Echo handler.
//!
//! Responds with the request's argument list re-encoded in request payload
//! layout (`arg_count | (arg_len | bytes)*`). Useful for throughput testing
//! and for checking framing end to end without touching storage.

use super::Handler;
use bytes::BufMut;

#[derive(Debug, Default)]
pub struct EchoHandler;

impl Handler for EchoHandler {
    fn handle(&mut self, args: &[&[u8]]) -> Vec<u8> {
        let len = 4 + args.iter().map(|a| 4 + a.len()).sum::<usize>();
        let mut out = Vec::with_capacity(len);
        out.put_u32_le(args.len() as u32);
        for arg in args {
            out.put_u32_le(arg.len() as u32);
            out.put_slice(arg);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::codec;

    #[test]
    fn test_echo_matches_request_payload() {
        let request = codec::encode_request(&["set", "k", "v"]);
        let response = EchoHandler.handle(&[&b"set"[..], &b"k"[..], &b"v"[..]]);
        assert_eq!(response, &request[codec::HEADER_LEN..]);
    }

    #[test]
    fn test_echo_no_args() {
        assert_eq!(EchoHandler.handle(&[]), vec![0, 0, 0, 0]);
    }
}
