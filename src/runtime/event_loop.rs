//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! ## Edge-Triggered Readiness
//!
//! mio only reports transitions, so each connection remembers the readiness
//! it was last told about until a syscall returns would-block. A connection
//! that stops early with readiness left over (back-pressure, or a frame
//! waiting for output space) is queued in `pending` and serviced again on
//! the next turn without waiting for a new event.
//!
//! ## One Turn
//!
//! 1. wait for readiness, bounded by the poll timeout (zero if work is pending)
//! 2. accept every queued connection if the listener fired
//! 3. service each ready connection: read, dispatch, flush
//! 4. sync poller interest with the connection's flags, or finalize it
//! 5. run the idle sweep when it is due

use crate::config::Config;
use crate::protocols::Handler;
use crate::runtime::connection::{BufferLimits, ConnId, Connection, ConnectionRegistry};
use crate::runtime::listener::{Listener, MAX_BACKLOG};
use mio::net::TcpStream;
use mio::{Events, Poll, Registry, Token};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Tuning for one event loop.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub max_connections: usize,
    /// Readiness events fetched per poll.
    pub batch_size: usize,
    /// Upper bound on a single readiness wait.
    pub poll_timeout: Duration,
    /// Connections idle this long are closed.
    pub idle_timeout: Option<Duration>,
    pub limits: BufferLimits,
}

impl LoopConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_connections: config.max_connections,
            batch_size: config.batch_size,
            poll_timeout: config.poll_timeout,
            idle_timeout: config.idle_timeout,
            limits: BufferLimits {
                read_chunk_size: config.read_chunk_size,
                max_pending_output: config.max_pending_output,
            },
        }
    }
}

/// Single-threaded server loop owning the listener and every connection.
pub struct EventLoop<H> {
    poll: Poll,
    events: Events,
    listener: Listener,
    connections: ConnectionRegistry<TcpStream>,
    handler: H,
    config: LoopConfig,
    /// Connections with work left over from the previous turn.
    pending: Vec<ConnId>,
    last_sweep: Instant,
}

impl<H: Handler> EventLoop<H> {
    /// Bind the listening socket and set up the poller.
    pub fn bind(addr: SocketAddr, config: LoopConfig, handler: H) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = Listener::bind(addr, MAX_BACKLOG, config.limits)?;
        listener.register(poll.registry(), LISTENER_TOKEN)?;

        Ok(Self {
            events: Events::with_capacity(config.batch_size),
            connections: ConnectionRegistry::new(config.max_connections),
            poll,
            listener,
            handler,
            config,
            pending: Vec::new(),
            last_sweep: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run until the listener or the poller fails.
    pub fn run(&mut self) -> io::Result<()> {
        info!(
            addr = %self.local_addr()?,
            max_connections = self.config.max_connections,
            idle_timeout = ?self.config.idle_timeout,
            "Event loop started"
        );

        loop {
            self.turn()?;
        }
    }

    /// One iteration: wait, accept, service ready connections, sweep.
    pub fn turn(&mut self) -> io::Result<()> {
        let timeout = if self.pending.is_empty() {
            self.next_timeout(Instant::now())
        } else {
            Duration::ZERO
        };

        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e);
        }

        let mut ready = std::mem::take(&mut self.pending);
        let mut accept = false;

        for event in self.events.iter() {
            if event.token() == LISTENER_TOKEN {
                accept = true;
                continue;
            }

            let id = ConnId::from_token(event.token());
            // Stale events for closed connections resolve to nothing
            if let Some(conn) = self.connections.get_mut(id) {
                // Errors and hangups surface through the next read or write
                let failed = event.is_error();
                conn.mark_ready(
                    event.is_readable() || event.is_read_closed() || failed,
                    event.is_writable() || event.is_write_closed() || failed,
                );
                ready.push(id);
            }
        }

        if accept {
            self.accept_connections()?;
        }

        ready.sort_unstable();
        ready.dedup();
        for id in ready {
            self.drive(id);
        }

        self.sweep_idle(Instant::now());
        Ok(())
    }

    fn next_timeout(&self, now: Instant) -> Duration {
        match self.config.idle_timeout {
            None => self.config.poll_timeout,
            Some(idle) => {
                let due = self.last_sweep + self.sweep_interval(idle);
                due.saturating_duration_since(now)
                    .min(self.config.poll_timeout)
            }
        }
    }

    fn sweep_interval(&self, idle: Duration) -> Duration {
        self.config.poll_timeout.min(idle)
    }

    /// Accept until the listener has nothing queued.
    fn accept_connections(&mut self) -> io::Result<()> {
        while let Some(conn) = self.listener.accept_one()? {
            let peer = conn.peer();

            let Some(id) = self.connections.insert(conn) else {
                warn!(peer = ?peer, "Connection limit reached");
                continue;
            };

            let registered = match self.connections.get_mut(id) {
                Some(conn) => sync_registration(self.poll.registry(), id, conn),
                None => continue,
            };

            match registered {
                Ok(()) => debug!(conn_id = %id, peer = ?peer, "Connection registered"),
                Err(e) => {
                    warn!(conn_id = %id, error = %e, "Failed to register connection");
                    self.close(id);
                }
            }
        }
        Ok(())
    }

    /// Service one connection and decide its fate.
    fn drive(&mut self, id: ConnId) {
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };

        if let Err(e) = conn.service(&mut self.handler) {
            debug!(conn_id = %id, peer = ?conn.peer(), error = %e, "Connection error");
            self.close(id);
            return;
        }

        if conn.is_finished() {
            self.close(id);
            return;
        }

        if let Err(e) = sync_registration(self.poll.registry(), id, conn) {
            debug!(conn_id = %id, error = %e, "Failed to update interest");
            self.close(id);
            return;
        }

        if conn.has_pending_work() {
            self.pending.push(id);
        }
    }

    /// Close connections that have been silent for longer than the idle timeout.
    ///
    /// A first pass stops reading and drops any partial request; a connection
    /// still idle at a later pass is not draining its output and is dropped.
    fn sweep_idle(&mut self, now: Instant) {
        let Some(idle_timeout) = self.config.idle_timeout else {
            return;
        };
        if now.saturating_duration_since(self.last_sweep) < self.sweep_interval(idle_timeout) {
            return;
        }
        self.last_sweep = now;

        let mut expired = Vec::new();
        for (id, conn) in self.connections.iter_mut() {
            if now.saturating_duration_since(conn.last_active()) < idle_timeout {
                continue;
            }

            if conn.want_close() {
                expired.push(id);
                continue;
            }

            debug!(conn_id = %id, peer = ?conn.peer(), "Idle timeout");
            conn.close_gracefully();
            if conn.is_finished() {
                expired.push(id);
            } else {
                self.pending.push(id);
            }
        }

        for id in expired {
            self.close(id);
        }
    }

    fn close(&mut self, id: ConnId) {
        if let Some(mut conn) = self.connections.remove(id) {
            if conn.registered().is_some() {
                let _ = self.poll.registry().deregister(conn.stream_mut());
            }
            debug!(conn_id = %id, peer = ?conn.peer(), "Connection closed");
        }
    }

    #[cfg(test)]
    fn handler(&self) -> &H {
        &self.handler
    }

    #[cfg(test)]
    fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

/// Make the poller watch exactly what the connection wants.
fn sync_registration(
    registry: &Registry,
    id: ConnId,
    conn: &mut Connection<TcpStream>,
) -> io::Result<()> {
    let desired = conn.desired_interest();
    if desired == conn.registered() {
        return Ok(());
    }

    match (conn.registered(), desired) {
        (None, Some(interest)) => registry.register(conn.stream_mut(), id.token(), interest)?,
        (Some(_), Some(interest)) => {
            registry.reregister(conn.stream_mut(), id.token(), interest)?
        }
        (Some(_), None) => registry.deregister(conn.stream_mut())?,
        (None, None) => {}
    }

    conn.set_registered(desired);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::echo::EchoHandler;
    use crate::protocols::kv::handler::{response, Status};
    use crate::protocols::kv::KvHandler;
    use crate::runtime::codec;
    use crate::runtime::connection::tests::Recorder;
    use crate::storage::Storage;
    use std::io::{Read, Write};
    use std::net::{Shutdown, TcpStream as StdTcpStream};
    use std::thread;

    const HELLO: &[u8] = b"\x0d\x00\x00\x00\x01\x00\x00\x00\x05\x00\x00\x00hello";

    fn test_config() -> LoopConfig {
        LoopConfig {
            max_connections: 16,
            batch_size: 64,
            poll_timeout: Duration::from_millis(10),
            idle_timeout: None,
            limits: BufferLimits {
                read_chunk_size: 4096,
                max_pending_output: 1 << 20,
            },
        }
    }

    fn start<H: Handler>(config: LoopConfig, handler: H) -> EventLoop<H> {
        EventLoop::bind("127.0.0.1:0".parse().unwrap(), config, handler).unwrap()
    }

    fn connect<H: Handler>(el: &EventLoop<H>) -> StdTcpStream {
        let client = StdTcpStream::connect(el.local_addr().unwrap()).unwrap();
        client.set_nonblocking(true).unwrap();
        client
    }

    /// Turn the loop until `client` has `want` bytes or sees EOF.
    fn pump_read<H: Handler>(
        el: &mut EventLoop<H>,
        client: &mut StdTcpStream,
        want: usize,
    ) -> (Vec<u8>, bool) {
        let mut got = Vec::new();
        let mut buf = [0u8; 64 * 1024];

        for _ in 0..2000 {
            el.turn().unwrap();
            loop {
                match client.read(&mut buf) {
                    Ok(0) => return (got, true),
                    Ok(n) => got.extend_from_slice(&buf[..n]),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => {
                        return (got, true)
                    }
                    Err(e) => panic!("client read failed: {e}"),
                }
            }
            if want > 0 && got.len() >= want {
                return (got, false);
            }
        }
        (got, false)
    }

    /// Send `data` from a background thread while the test drives the loop.
    fn spawn_writer(client: &StdTcpStream, data: Vec<u8>) -> thread::JoinHandle<()> {
        let mut writer = client.try_clone().unwrap();
        thread::spawn(move || {
            let mut sent = 0;
            while sent < data.len() {
                match writer.write(&data[sent..]) {
                    Ok(n) => sent += n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => panic!("client write failed: {e}"),
                }
            }
        })
    }

    fn turn_until<H: Handler>(el: &mut EventLoop<H>, mut done: impl FnMut(&EventLoop<H>) -> bool) {
        for _ in 0..500 {
            if done(el) {
                return;
            }
            el.turn().unwrap();
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_single_write_request() {
        let mut el = start(test_config(), Recorder::default());
        let mut client = connect(&el);

        client.write_all(HELLO).unwrap();
        let expected = codec::encode_response(b"hello");
        let (got, eof) = pump_read(&mut el, &mut client, expected.len());

        assert!(!eof);
        assert_eq!(got, expected);
        assert_eq!(el.handler().seen, vec![vec![b"hello".to_vec()]]);
    }

    #[test]
    fn test_request_split_across_arrivals() {
        let mut el = start(test_config(), Recorder::default());
        let mut client = connect(&el);

        client.write_all(&HELLO[..6]).unwrap();
        turn_until(&mut el, |el| el.connection_count() == 1);
        for _ in 0..5 {
            el.turn().unwrap();
        }
        assert!(el.handler().seen.is_empty());

        client.write_all(&HELLO[6..]).unwrap();
        let expected = codec::encode_response(b"hello");
        let (got, _) = pump_read(&mut el, &mut client, expected.len());

        assert_eq!(got, expected);
        assert_eq!(el.handler().seen, vec![vec![b"hello".to_vec()]]);
    }

    #[test]
    fn test_oversized_message_closes_connection() {
        let mut el = start(test_config(), Recorder::default());
        let mut client = connect(&el);

        client.write_all(&40_000_000u32.to_le_bytes()).unwrap();
        let (got, eof) = pump_read(&mut el, &mut client, 0);

        assert!(eof);
        assert!(got.is_empty());
        assert!(el.handler().seen.is_empty());
        assert_eq!(el.connection_count(), 0);
    }

    #[test]
    fn test_half_close_still_gets_response() {
        let mut el = start(test_config(), Recorder::default());
        let mut client = connect(&el);

        client.write_all(HELLO).unwrap();
        client.shutdown(Shutdown::Write).unwrap();
        let (got, eof) = pump_read(&mut el, &mut client, 0);

        assert!(eof);
        assert_eq!(got, codec::encode_response(b"hello"));
        assert_eq!(el.connection_count(), 0);
    }

    #[test]
    fn test_malformed_frame_closes_only_that_connection() {
        let mut el = start(test_config(), Recorder::default());
        let mut bad = connect(&el);
        let mut good = connect(&el);

        // One argument declared, but two bytes left over inside the frame
        let mut frame = HELLO.to_vec();
        frame[0] = 15;
        frame.extend_from_slice(b"!!");
        bad.write_all(&frame).unwrap();
        let (got, eof) = pump_read(&mut el, &mut bad, 0);
        assert!(eof);
        assert!(got.is_empty());

        good.write_all(HELLO).unwrap();
        let expected = codec::encode_response(b"hello");
        let (got, _) = pump_read(&mut el, &mut good, expected.len());
        assert_eq!(got, expected);
        assert_eq!(el.connection_count(), 1);
    }

    #[test]
    fn test_many_clients_interleaved() {
        let mut el = start(test_config(), Recorder::default());
        let mut clients: Vec<_> = (0..5).map(|_| connect(&el)).collect();

        for (i, client) in clients.iter_mut().enumerate() {
            client
                .write_all(&codec::encode_request(&[format!("client-{i}")]))
                .unwrap();
        }

        for (i, client) in clients.iter_mut().enumerate() {
            let expected = codec::encode_response(format!("client-{i}").as_bytes());
            let (got, _) = pump_read(&mut el, client, expected.len());
            assert_eq!(got, expected);
        }
        assert_eq!(el.handler().seen.len(), 5);
        assert_eq!(el.connection_count(), 5);
    }

    #[test]
    fn test_kv_pipelined_commands() {
        let mut el = start(test_config(), KvHandler::new(Storage::new(1 << 20)));
        let mut client = connect(&el);

        let mut requests = codec::encode_request(&["set", "greeting", "hello"]);
        requests.extend_from_slice(&codec::encode_request(&["get", "greeting"]));
        requests.extend_from_slice(&codec::encode_request(&["get", "missing"]));
        client.write_all(&requests).unwrap();

        let mut expected = codec::encode_response(&response(Status::Ok, b""));
        expected.extend_from_slice(&codec::encode_response(&response(Status::Ok, b"hello")));
        expected.extend_from_slice(&codec::encode_response(&response(Status::Nx, b"")));

        let (got, _) = pump_read(&mut el, &mut client, expected.len());
        assert_eq!(got, expected);
    }

    #[test]
    fn test_large_frame_partial_io() {
        let mut el = start(test_config(), EchoHandler);
        let mut client = connect(&el);

        let payload = vec![0x5Au8; 1 << 20];
        let sender = spawn_writer(&client, codec::encode_request(&[&payload]));

        let expected = codec::encode_response(&EchoHandler.handle(&[&payload[..]]));
        let (got, eof) = pump_read(&mut el, &mut client, expected.len());
        sender.join().unwrap();

        assert!(!eof);
        assert_eq!(got.len(), expected.len());
        assert!(got == expected);
    }

    #[test]
    fn test_idle_connection_closed() {
        let mut config = test_config();
        config.idle_timeout = Some(Duration::from_millis(50));
        let mut el = start(config, Recorder::default());
        let mut client = connect(&el);

        client.write_all(&HELLO[..7]).unwrap();
        turn_until(&mut el, |el| el.connection_count() == 1);

        thread::sleep(Duration::from_millis(100));
        let (got, eof) = pump_read(&mut el, &mut client, 0);

        assert!(eof);
        assert!(got.is_empty());
        assert!(el.handler().seen.is_empty());
        assert_eq!(el.connection_count(), 0);
    }

    #[test]
    fn test_idle_connection_with_stuck_output_force_closed() {
        let mut config = test_config();
        config.idle_timeout = Some(Duration::from_millis(100));
        let mut el = start(config, EchoHandler);

        // Tiny receive window and a client that never reads: the response
        // cannot fit in the socket buffers, so output stays queued
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )
        .unwrap();
        socket.set_recv_buffer_size(4096).unwrap();
        socket.connect(&el.local_addr().unwrap().into()).unwrap();
        let mut client: StdTcpStream = socket.into();
        client.set_nonblocking(true).unwrap();

        let payload = vec![0xA5u8; 16 << 20];
        let sender = spawn_writer(&client, codec::encode_request(&[&payload]));
        turn_until(&mut el, |el| el.connection_count() == 1);

        // First sweep stops reading, a later one drops the stalled connection
        turn_until(&mut el, |el| el.connection_count() == 0);
        sender.join().unwrap();

        let expected_len = codec::HEADER_LEN + EchoHandler.handle(&[&payload[..]]).len();
        let (got, eof) = pump_read(&mut el, &mut client, 0);
        assert!(eof);
        assert!(got.len() < expected_len);
    }

    #[test]
    fn test_connection_limit() {
        let mut config = test_config();
        config.max_connections = 1;
        let mut el = start(config, Recorder::default());

        let mut first = connect(&el);
        turn_until(&mut el, |el| el.connection_count() == 1);

        let mut second = connect(&el);
        let (_, eof) = pump_read(&mut el, &mut second, 0);
        assert!(eof);
        assert_eq!(el.connection_count(), 1);

        first.write_all(HELLO).unwrap();
        let expected = codec::encode_response(b"hello");
        let (got, _) = pump_read(&mut el, &mut first, expected.len());
        assert_eq!(got, expected);
    }
}
