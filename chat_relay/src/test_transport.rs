// In-memory `Transport` for unit tests.
//
// Connections are simulated: a test calls `connect` to queue a `Connecting`
// status change, `deliver` to put bytes on a poll group, `peer_closes` to
// queue a `ClosedByPeer`. Everything the relay does back (accepts, closes,
// poll group assignments, sends) is recorded for assertions. Sent messages are
// kept alive in `sent`, so shared payload references stay observable until
// the test calls `take_sent`.
//
// Failure knobs (`fail_accept`, `fail_poll_group`, `fail_receive`) let tests
// drive the recoverable and fatal error paths.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::SocketAddr;

use chat_relay_protocol::ChatProtocol;

use crate::error::TransportError;
use crate::transport::{
    ConnectionHandle, ConnectionInfo, ConnectionState, InboundMessage, ListenSocket,
    OutboundMessage, PollGroup, StatusChanged, Transport,
};

/// A `close_connection` call as seen by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseCall {
    pub conn: ConnectionHandle,
    pub end_reason: i32,
    pub debug: String,
    pub linger: bool,
}

#[derive(Default)]
pub struct TestTransport {
    next_handle: u32,
    listeners: HashMap<ListenSocket, SocketAddr>,
    groups: HashMap<PollGroup, VecDeque<InboundMessage>>,
    connections: BTreeMap<ConnectionHandle, (ConnectionState, Option<PollGroup>)>,
    pending_status: VecDeque<StatusChanged>,
    next_message_number: u64,

    pub sent: Vec<OutboundMessage>,
    pub closes: Vec<CloseCall>,
    pub accept_calls: Vec<ConnectionHandle>,
    pub fail_accept: HashSet<ConnectionHandle>,
    pub fail_poll_group: HashSet<ConnectionHandle>,
    pub fail_listen: bool,
    pub fail_receive: bool,
}

impl TestTransport {
    pub fn new() -> Self {
        Self {
            next_handle: 1,
            ..Self::default()
        }
    }

    fn issue(&mut self) -> u32 {
        let id = self.next_handle;
        self.next_handle += 1;
        id
    }

    /// A peer starts connecting. Queues a `Connecting` status change.
    pub fn connect(&mut self) -> ConnectionHandle {
        let conn = ConnectionHandle(self.issue());
        self.connections
            .insert(conn, (ConnectionState::Connecting, None));
        self.push_status(conn, ConnectionState::None, ConnectionState::Connecting);
        conn
    }

    /// The peer hangs up. Queues a `ClosedByPeer` status change.
    pub fn peer_closes(&mut self, conn: ConnectionHandle) {
        let old = match self.connections.get_mut(&conn) {
            Some((state, _)) => std::mem::replace(state, ConnectionState::ClosedByPeer),
            None => ConnectionState::Connected,
        };
        self.push_status(conn, old, ConnectionState::ClosedByPeer);
    }

    /// Queue an arbitrary status change, whether or not it makes sense.
    pub fn push_status(
        &mut self,
        conn: ConnectionHandle,
        old_state: ConnectionState,
        state: ConnectionState,
    ) {
        self.pending_status.push_back(StatusChanged {
            conn,
            old_state,
            info: ConnectionInfo {
                state,
                remote_addr: Some(SocketAddr::from(([127, 0, 0, 1], 50_000 + conn.0 as u16))),
                description: format!("#{conn} test peer"),
                end_reason: 0,
                end_debug: String::new(),
            },
        });
    }

    /// Put a message from `conn` on the poll group it is assigned to.
    pub fn deliver(&mut self, conn: ConnectionHandle, data: impl Into<Vec<u8>>) {
        let Some((_, Some(group))) = self.connections.get(&conn) else {
            panic!("connection {conn} is not in a poll group");
        };
        let group = *group;
        self.next_message_number += 1;
        let message = InboundMessage {
            conn,
            data: data.into(),
            message_number: self.next_message_number,
        };
        self.groups
            .get_mut(&group)
            .expect("poll group exists")
            .push_back(message);
    }

    /// Encode and deliver a protocol message.
    pub fn deliver_msg(&mut self, conn: ConnectionHandle, msg: &ChatProtocol) {
        self.deliver(conn, msg.encode().unwrap());
    }

    pub fn state(&self, conn: ConnectionHandle) -> Option<ConnectionState> {
        self.connections.get(&conn).map(|(state, _)| *state)
    }

    pub fn group_of(&self, conn: ConnectionHandle) -> Option<PollGroup> {
        self.connections.get(&conn).and_then(|(_, group)| *group)
    }

    /// Drain and return everything sent so far.
    pub fn take_sent(&mut self) -> Vec<OutboundMessage> {
        std::mem::take(&mut self.sent)
    }

    /// Decoded messages sent to `conn`, in order.
    pub fn sent_to(&self, conn: ConnectionHandle) -> Vec<ChatProtocol> {
        self.sent
            .iter()
            .filter(|msg| msg.conn == conn)
            .map(|msg| ChatProtocol::decode(&msg.payload).unwrap())
            .collect()
    }
}

impl Transport for TestTransport {
    fn create_listener(&mut self, addr: SocketAddr) -> Result<ListenSocket, TransportError> {
        if self.fail_listen {
            return Err(TransportError::Listen(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "test listener failure",
            )));
        }
        let socket = ListenSocket(self.issue());
        self.listeners.insert(socket, addr);
        Ok(socket)
    }

    fn listen_addr(&self, socket: ListenSocket) -> Option<SocketAddr> {
        self.listeners.get(&socket).copied()
    }

    fn close_listener(&mut self, socket: ListenSocket) -> bool {
        self.listeners.remove(&socket).is_some()
    }

    fn accept_connection(&mut self, conn: ConnectionHandle) -> Result<(), TransportError> {
        self.accept_calls.push(conn);
        let Some((state, _)) = self.connections.get_mut(&conn) else {
            return Err(TransportError::InvalidConnection(conn));
        };
        if *state != ConnectionState::Connecting || self.fail_accept.contains(&conn) {
            return Err(TransportError::InvalidState {
                conn,
                state: *state,
            });
        }
        *state = ConnectionState::Connected;
        self.push_status(conn, ConnectionState::Connecting, ConnectionState::Connected);
        Ok(())
    }

    fn close_connection(
        &mut self,
        conn: ConnectionHandle,
        end_reason: i32,
        debug: &str,
        linger: bool,
    ) -> bool {
        self.closes.push(CloseCall {
            conn,
            end_reason,
            debug: debug.to_owned(),
            linger,
        });
        for queue in self.groups.values_mut() {
            queue.retain(|msg| msg.conn != conn);
        }
        self.connections.remove(&conn).is_some()
    }

    fn create_poll_group(&mut self) -> PollGroup {
        let group = PollGroup(self.issue());
        self.groups.insert(group, VecDeque::new());
        group
    }

    fn destroy_poll_group(&mut self, group: PollGroup) -> bool {
        self.groups.remove(&group).is_some()
    }

    fn set_connection_poll_group(&mut self, conn: ConnectionHandle, group: PollGroup) -> bool {
        if self.fail_poll_group.contains(&conn) || !self.groups.contains_key(&group) {
            return false;
        }
        match self.connections.get_mut(&conn) {
            Some((_, slot)) => {
                *slot = Some(group);
                true
            }
            None => false,
        }
    }

    fn receive_messages_on_poll_group(
        &mut self,
        group: PollGroup,
        max: usize,
    ) -> Result<Vec<InboundMessage>, TransportError> {
        if self.fail_receive {
            return Err(TransportError::InvalidPollGroup(group));
        }
        let queue = self
            .groups
            .get_mut(&group)
            .ok_or(TransportError::InvalidPollGroup(group))?;
        let take = max.min(queue.len());
        Ok(queue.drain(..take).collect())
    }

    fn send_messages(&mut self, messages: Vec<OutboundMessage>) -> Vec<Result<u64, TransportError>> {
        messages
            .into_iter()
            .map(|msg| match self.connections.get(&msg.conn) {
                Some((ConnectionState::Connected, _)) => {
                    self.next_message_number += 1;
                    self.sent.push(msg);
                    Ok(self.next_message_number)
                }
                Some((state, _)) => Err(TransportError::InvalidState {
                    conn: msg.conn,
                    state: *state,
                }),
                None => Err(TransportError::InvalidConnection(msg.conn)),
            })
            .collect()
    }

    fn poll_status_changes(&mut self) -> Vec<StatusChanged> {
        self.pending_status.drain(..).collect()
    }
}
