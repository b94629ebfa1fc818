//! Request handlers.
//!
//! The event loop frames requests; a handler decides what they mean.
//!
//! ## Handlers
//! - `kv`: get/set/del commands against in-memory storage
//! - `echo`: returns the request's arguments unchanged

pub mod echo;
pub mod kv;

/// Turns one decoded request into one response payload.
///
/// Called on the event-loop thread, so implementations must not block.
/// The argument slices borrow the connection's input buffer and are only
/// valid for the duration of the call.
pub trait Handler {
    fn handle(&mut self, args: &[&[u8]]) -> Vec<u8>;
}
