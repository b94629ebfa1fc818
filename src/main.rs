//! framed-kv: a single-threaded server for a length-prefixed binary protocol
//!
//! Every message is `len (u32 LE) | payload`; a request payload is an
//! argument list `count | (len | bytes)*` and a response payload is opaque
//! bytes produced by the selected handler.
//!
//! Features:
//! - Non-blocking I/O over mio with many concurrent clients on one thread
//! - Pipelined requests, partial reads and partial writes
//! - Key-value handler (get, set, del, ping) with a memory cap
//! - Idle connection timeout
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocols;
mod runtime;
mod storage;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        protocol = ?config.protocol,
        max_connections = config.max_connections,
        max_memory_mb = config.max_memory / 1024 / 1024,
        idle_timeout = ?config.idle_timeout,
        "Starting framed-kv server"
    );

    runtime::run(config)?;
    Ok(())
}
