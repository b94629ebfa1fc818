//! Key-value handler: executes commands against [`Storage`].

use super::command::Command;
use crate::protocols::Handler;
use crate::storage::{Storage, StorageResult};
use bytes::BufMut;
use tracing::debug;

/// Response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Ok = 0,
    Err = 1,
    Nx = 2,
}

/// Build a `status | data` response payload.
pub fn response(status: Status, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + data.len());
    out.put_u32_le(status as u32);
    out.put_slice(data);
    out
}

pub struct KvHandler {
    storage: Storage,
}

impl KvHandler {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    fn execute(&mut self, command: Command<'_>) -> Vec<u8> {
        match command {
            Command::Get { key } => match self.storage.get(key) {
                Some(value) => response(Status::Ok, value),
                None => response(Status::Nx, b""),
            },
            Command::Set { key, value } => match self.storage.set(key, value) {
                StorageResult::Stored => response(Status::Ok, b""),
                _ => response(Status::Err, b"out of memory"),
            },
            Command::Del { key } => {
                self.storage.delete(key);
                response(Status::Ok, b"")
            }
            Command::Ping { message } => response(Status::Ok, message.unwrap_or(b"PONG")),
        }
    }
}

impl Handler for KvHandler {
    fn handle(&mut self, args: &[&[u8]]) -> Vec<u8> {
        match Command::parse(args) {
            Ok(command) => self.execute(command),
            Err(e) => {
                debug!(error = %e, "rejected command");
                response(Status::Err, e.to_string().as_bytes())
            }
        }
    }
}
