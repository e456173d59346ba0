// Error types for the relay.
//
// One enum per concern, all derived with `thiserror`:
// - `PayloadError`:   shared payload allocation failures (`payload.rs`).
// - `TransportError`: anything the transport reports (`transport.rs`,
//                     `tcp_transport.rs`). Only a receive failure is fatal to
//                     the relay loop; the rest cost at most one connection.
// - `DispatchError`:  broken invariants seen while dispatching (`dispatch.rs`).
// - `ConfigError`:    loading or validating `RelayConfig` (`config.rs`).
// - `RelayError`:     what `server.rs` hands back to whoever runs the relay.
//
// Protocol-level problems (empty or unparseable payloads, unexpected message
// types) are not errors at this level: the dispatcher logs and drops them.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::transport::{ConnectionHandle, ConnectionState, PollGroup};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("shared payload size must be positive")]
    ZeroSize,
    #[error("failed to allocate {0} bytes for a shared payload")]
    AllocationFailed(usize),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to create listen socket: {0}")]
    Listen(#[source] io::Error),
    #[error("unknown connection {0}")]
    InvalidConnection(ConnectionHandle),
    #[error("connection {conn} is {state:?}")]
    InvalidState {
        conn: ConnectionHandle,
        state: ConnectionState,
    },
    #[error("unknown poll group {0:?}")]
    InvalidPollGroup(PollGroup),
    #[error("message too large: {len} bytes (max {max})")]
    MessageTooLarge { len: usize, max: usize },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("message from connection {0} which has no registry entry")]
    UnregisteredConnection(ConnectionHandle),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to listen: {0}")]
    Listen(#[source] TransportError),
    #[error("receiving on the poll group failed: {0}")]
    Receive(#[source] TransportError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("relay thread panicked")]
    Panicked,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
