// Contract between the relay core and the message transport underneath it.
//
// The relay does not care how bytes move. It needs a transport that:
// - listens on a port and reports connection status changes (strictly FIFO
//   per connection) for the relay to act on;
// - lets it accept or close individual connections;
// - batches inbound messages from many connections into a poll group so one
//   call drains them all;
// - sends whole messages, reliable or not, and drops (releases) each outbound
//   message exactly once when it is done with it.
//
// `Transport` captures exactly that. `tcp_transport.rs` implements it over
// plain TCP sockets; the unit tests use an in-memory double
// (`test_transport.rs`).
//
// Status changes are pulled, not pushed: `run_callbacks` drains the pending
// notifications and calls the handler with `&mut` access to the transport
// itself. Whatever state the handler needs travels in the closure, so there
// is no process-wide callback target and any number of relays can share a
// process.
//
// Handles (`ConnectionHandle`, `PollGroup`, `ListenSocket`) are opaque
// integers issued by the transport. Zero is never a valid handle.

use std::fmt;
use std::net::SocketAddr;
use std::ops::Deref;

use crate::error::TransportError;
use crate::payload::PayloadRef;

/// End reason for a connection closed by the application.
pub const END_REASON_APP_GENERIC: i32 = 1000;
/// End reason for a connection the transport gave up on.
pub const END_REASON_MISC_GENERIC: i32 = 5001;

/// Transport-issued identifier for one connection attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(pub u32);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A batch of connections whose inbound messages are received together.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PollGroup(pub u32);

/// A listening socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenSocket(pub u32);

/// Connection phase as reported by the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Destroyed; the handle is dead.
    None,
    /// A peer is knocking and waiting for accept/reject.
    Connecting,
    /// Accepted, route not yet established.
    FindingRoute,
    Connected,
    ClosedByPeer,
    ProblemDetectedLocally,
}

impl ConnectionState {
    /// True for the two states in which the application must close the
    /// handle.
    pub fn is_closed(self) -> bool {
        matches!(self, Self::ClosedByPeer | Self::ProblemDetectedLocally)
    }
}

/// Snapshot of a connection attached to a status change.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionInfo {
    pub state: ConnectionState,
    pub remote_addr: Option<SocketAddr>,
    pub description: String,
    pub end_reason: i32,
    pub end_debug: String,
}

/// A status change notification.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusChanged {
    pub conn: ConnectionHandle,
    pub old_state: ConnectionState,
    pub info: ConnectionInfo,
}

impl StatusChanged {
    pub fn new_state(&self) -> ConnectionState {
        self.info.state
    }
}

/// Reliability class of one outbound message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SendFlags {
    Unreliable,
    UnreliableNoNagle,
    Reliable,
    #[default]
    ReliableNoNagle,
}

impl SendFlags {
    pub fn is_reliable(self) -> bool {
        matches!(self, Self::Reliable | Self::ReliableNoNagle)
    }
}

/// A message received on a poll group. Dropping it releases it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub conn: ConnectionHandle,
    pub data: Vec<u8>,
    pub message_number: u64,
}

/// Bytes of an outbound message.
#[derive(Debug)]
pub enum Payload {
    /// Owned by this message alone.
    Owned(Vec<u8>),
    /// A reference to a `SharedPayload`, released when the message drops.
    Shared(PayloadRef),
}

impl Payload {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Self::Owned(bytes) => bytes,
            Self::Shared(shared) => shared.as_slice(),
        }
    }
}

impl Deref for Payload {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

/// A message to be sent to one connection.
#[derive(Debug)]
pub struct OutboundMessage {
    pub conn: ConnectionHandle,
    pub payload: Payload,
    pub flags: SendFlags,
}

impl OutboundMessage {
    pub fn new(conn: ConnectionHandle, payload: Payload, flags: SendFlags) -> Self {
        Self {
            conn,
            payload,
            flags,
        }
    }

    pub fn owned(conn: ConnectionHandle, data: Vec<u8>, flags: SendFlags) -> Self {
        Self::new(conn, Payload::Owned(data), flags)
    }
}

/// The operations the relay needs from a connection-oriented message
/// transport.
pub trait Transport {
    /// Start listening. Status changes for connections arriving on this
    /// socket are reported through `poll_status_changes`.
    fn create_listener(&mut self, addr: SocketAddr) -> Result<ListenSocket, TransportError>;

    /// Actual bound address (useful when port 0 was requested).
    fn listen_addr(&self, socket: ListenSocket) -> Option<SocketAddr>;

    /// Stop listening. Connections accepted from this socket are dropped.
    fn close_listener(&mut self, socket: ListenSocket) -> bool;

    /// Accept a connection that is in `Connecting`.
    fn accept_connection(&mut self, conn: ConnectionHandle) -> Result<(), TransportError>;

    /// Close a connection and free its handle. With `linger`, queued reliable
    /// output is flushed first. Returns false for an unknown handle.
    fn close_connection(
        &mut self,
        conn: ConnectionHandle,
        end_reason: i32,
        debug: &str,
        linger: bool,
    ) -> bool;

    fn create_poll_group(&mut self) -> PollGroup;

    fn destroy_poll_group(&mut self, group: PollGroup) -> bool;

    /// Route a connection's inbound messages to `group`.
    fn set_connection_poll_group(&mut self, conn: ConnectionHandle, group: PollGroup) -> bool;

    /// Take up to `max` pending inbound messages from `group`. An error means
    /// the transport itself is unusable.
    fn receive_messages_on_poll_group(
        &mut self,
        group: PollGroup,
        max: usize,
    ) -> Result<Vec<InboundMessage>, TransportError>;

    /// Send a batch. One result per message, in order: the message number on
    /// success. Every message is dropped (released) before this returns or
    /// once the transport is finished with it.
    fn send_messages(&mut self, messages: Vec<OutboundMessage>) -> Vec<Result<u64, TransportError>>;

    /// Drain pending status change notifications in delivery order.
    fn poll_status_changes(&mut self) -> Vec<StatusChanged>;

    /// Send one owned buffer to one connection.
    fn send_message_to_connection(
        &mut self,
        conn: ConnectionHandle,
        data: Vec<u8>,
        flags: SendFlags,
    ) -> Result<u64, TransportError> {
        self.send_messages(vec![OutboundMessage::owned(conn, data, flags)])
            .pop()
            .unwrap_or(Err(TransportError::InvalidConnection(conn)))
    }

    /// Dispatch every pending status change to `handler`, in order.
    fn run_callbacks<F>(&mut self, mut handler: F)
    where
        Self: Sized,
        F: FnMut(&mut Self, StatusChanged),
    {
        for event in self.poll_status_changes() {
            handler(self, event);
        }
    }
}
