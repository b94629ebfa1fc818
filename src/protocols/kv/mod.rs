//! Key-value command protocol.
//!
//! Requests are argument lists whose first argument names the command:
//!
//! ```text
//! get <key>          -> OK <value> | NX
//! set <key> <value>  -> OK | ERR (memory cap)
//! del <key>          -> OK
//! ping [message]     -> OK PONG | OK <message>
//! ```
//!
//! ## Response Payload
//!
//! ```text
//! status (u32 LE) | data
//! ```
//!
//! where status is `0` (OK), `1` (ERR, data is a message) or `2` (NX, key
//! not found). Command names are case-insensitive; keys and values are raw
//! bytes.

pub mod command;
pub mod handler;

pub use handler::KvHandler;
