//! Single-threaded runtime for the length-prefixed protocol.
//!
//! One thread owns the listener, every connection and the handler. mio
//! reports readiness (epoll on Linux, kqueue on macOS) and the loop performs
//! non-blocking reads and writes in response.
//!
//! Building blocks:
//! - `ByteBuffer`: growable FIFO used for each connection's input and output
//! - `codec`: framing and request decoding
//! - `Connection`: per-connection read/dispatch/flush state machine
//! - `Listener`: non-blocking accept with error classification
//! - `EventLoop`: ties the above to the poller

mod buffer;
pub mod codec;
mod connection;
mod event_loop;
mod listener;

pub use event_loop::{EventLoop, LoopConfig};

use crate::config::{Config, ProtocolType};
use crate::protocols::echo::EchoHandler;
use crate::protocols::kv::KvHandler;
use crate::protocols::Handler;
use crate::storage::Storage;
use std::io;

/// Run the server with the configured handler until a fatal error.
pub fn run(config: Config) -> io::Result<()> {
    match config.protocol {
        ProtocolType::Kv => serve(&config, KvHandler::new(Storage::new(config.max_memory))),
        ProtocolType::Echo => serve(&config, EchoHandler),
    }
}

fn serve<H: Handler>(config: &Config, handler: H) -> io::Result<()> {
    let mut event_loop = EventLoop::bind(config.listen, LoopConfig::from_config(config), handler)?;
    event_loop.run()
}
