// `Transport` over plain TCP sockets.
//
// Architecture: thread-per-reader feeding one `mpsc` channel.
//
// - **Listener thread** (one per listen socket): non-blocking `accept()` loop
//   with a 50 ms back-off. Each new stream is sent to the owning thread as
//   `NetEvent::Incoming`.
// - **Reader threads** (one per accepted connection): `read_message()` in a
//   loop, sending `NetEvent::Message` per frame. EOF becomes a
//   `ClosedByPeer` event, any other read error `ProblemDetectedLocally`.
// - **Owning thread** (whoever holds the `TcpTransport`, i.e. the relay
//   loop): drains the channel whenever status changes or messages are polled.
//   This is where handles are issued, status changes queued, and inbound
//   messages routed to poll groups. It is also the only thread that writes to
//   sockets, so there are never two writers on one stream.
//
// Messages that arrive between accept and poll group assignment wait on the
// connection and move to the group when it is assigned. Closing a connection
// discards its queued inbound messages; anything a reader thread delivers for
// a closed handle afterwards is ignored.
//
// Lingering close: the write half is flushed and shut down, but the socket is
// kept until the listener closes, so the peer can still read everything that
// was queued before the goodbye.
//
// Writes block for at most the write timeout. A write that fails or times
// out may leave a partial frame on the wire, so the connection is shut down
// and reported as `ProblemDetectedLocally`; the owner then closes it like any
// other dropped peer.
//
// TCP is always reliable and ordered; `SendFlags` are accepted but do not
// change delivery. Frames use `chat_relay_protocol::framing`.

use std::collections::{HashMap, VecDeque};
use std::io::{self, BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chat_relay_protocol::framing::{MAX_MESSAGE_SIZE, read_message, write_message};
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::transport::{
    ConnectionHandle, ConnectionInfo, ConnectionState, END_REASON_APP_GENERIC,
    END_REASON_MISC_GENERIC, InboundMessage, ListenSocket, OutboundMessage, PollGroup,
    StatusChanged, Transport,
};

/// How long the listener thread sleeps when no connection is waiting.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Default bound on one blocking write. A peer that stops reading costs the
/// relay at most this long once; then its connection is failed.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Events sent from listener/reader threads to the owning thread.
enum NetEvent {
    Incoming {
        listener: ListenSocket,
        stream: TcpStream,
        addr: SocketAddr,
    },
    Message {
        conn: ConnectionHandle,
        data: Vec<u8>,
    },
    Closed {
        conn: ConnectionHandle,
        state: ConnectionState,
        end_reason: i32,
        end_debug: String,
    },
}

struct Listener {
    addr: SocketAddr,
    keep_running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    /// Streams closed with linger, kept open for reading until the listener
    /// goes away.
    lingering: Vec<TcpStream>,
}

struct Connection {
    state: ConnectionState,
    listener: ListenSocket,
    remote_addr: SocketAddr,
    stream: TcpStream,
    writer: BufWriter<TcpStream>,
    /// Read half, handed to the reader thread on accept.
    reader: Option<TcpStream>,
    group: Option<PollGroup>,
    /// Inbound messages received before a poll group was assigned.
    pending: VecDeque<InboundMessage>,
}

impl Connection {
    fn info(&self, conn: ConnectionHandle, end_reason: i32, end_debug: String) -> ConnectionInfo {
        ConnectionInfo {
            state: self.state,
            remote_addr: Some(self.remote_addr),
            description: format!("#{conn} tcp {}", self.remote_addr),
            end_reason,
            end_debug,
        }
    }
}

/// TCP implementation of `Transport`.
pub struct TcpTransport {
    next_handle: u32,
    next_message_number: u64,
    events_tx: Sender<NetEvent>,
    events_rx: Receiver<NetEvent>,
    listeners: HashMap<ListenSocket, Listener>,
    connections: HashMap<ConnectionHandle, Connection>,
    groups: HashMap<PollGroup, VecDeque<InboundMessage>>,
    status: VecDeque<StatusChanged>,
    write_timeout: Duration,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            next_handle: 1,
            next_message_number: 0,
            events_tx,
            events_rx,
            listeners: HashMap::new(),
            connections: HashMap::new(),
            groups: HashMap::new(),
            status: VecDeque::new(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// Bound blocking writes on connections accepted from now on.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    fn issue(&mut self) -> u32 {
        let id = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        id
    }

    /// Number of open connections, in any state.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Move everything the background threads reported into transport state.
    fn pump(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                NetEvent::Incoming {
                    listener,
                    stream,
                    addr,
                } => self.on_incoming(listener, stream, addr),
                NetEvent::Message { conn, data } => self.on_message(conn, data),
                NetEvent::Closed {
                    conn,
                    state,
                    end_reason,
                    end_debug,
                } => self.on_closed(conn, state, end_reason, end_debug),
            }
        }
    }

    fn on_incoming(&mut self, listener: ListenSocket, stream: TcpStream, addr: SocketAddr) {
        if !self.listeners.contains_key(&listener) {
            // Listener closed while this stream was in flight.
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
        stream.set_nodelay(true).ok();
        stream.set_write_timeout(Some(self.write_timeout)).ok();
        let (writer, reader) = match (stream.try_clone(), stream.try_clone()) {
            (Ok(writer), Ok(reader)) => (writer, reader),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Dropping incoming connection from {addr}: {e}");
                return;
            }
        };

        let conn = ConnectionHandle(self.issue());
        let connection = Connection {
            state: ConnectionState::Connecting,
            listener,
            remote_addr: addr,
            stream,
            writer: BufWriter::new(writer),
            reader: Some(reader),
            group: None,
            pending: VecDeque::new(),
        };
        let info = connection.info(conn, 0, String::new());
        self.connections.insert(conn, connection);
        trace!(conn = %conn, "incoming connection from {addr}");
        self.status.push_back(StatusChanged {
            conn,
            old_state: ConnectionState::None,
            info,
        });
    }

    fn on_message(&mut self, conn: ConnectionHandle, data: Vec<u8>) {
        let Some(connection) = self.connections.get_mut(&conn) else {
            trace!(conn = %conn, "dropping message for closed connection");
            return;
        };
        if connection.state != ConnectionState::Connected {
            return;
        }
        self.next_message_number += 1;
        let message = InboundMessage {
            conn,
            data,
            message_number: self.next_message_number,
        };
        match connection.group.and_then(|group| self.groups.get_mut(&group)) {
            Some(queue) => queue.push_back(message),
            None => connection.pending.push_back(message),
        }
    }

    fn on_closed(
        &mut self,
        conn: ConnectionHandle,
        state: ConnectionState,
        end_reason: i32,
        end_debug: String,
    ) {
        let Some(connection) = self.connections.get_mut(&conn) else {
            return;
        };
        if connection.state.is_closed() {
            return;
        }
        let old_state = std::mem::replace(&mut connection.state, state);
        let info = connection.info(conn, end_reason, end_debug);
        self.status.push_back(StatusChanged {
            conn,
            old_state,
            info,
        });
    }

    fn purge_inbound(&mut self, conn: ConnectionHandle) {
        for queue in self.groups.values_mut() {
            queue.retain(|msg| msg.conn != conn);
        }
    }

    fn send_one(&mut self, msg: OutboundMessage) -> Result<u64, TransportError> {
        let len = msg.payload.len();
        if len > MAX_MESSAGE_SIZE as usize {
            return Err(TransportError::MessageTooLarge {
                len,
                max: MAX_MESSAGE_SIZE as usize,
            });
        }
        let connection = self
            .connections
            .get_mut(&msg.conn)
            .ok_or(TransportError::InvalidConnection(msg.conn))?;
        if connection.state != ConnectionState::Connected {
            return Err(TransportError::InvalidState {
                conn: msg.conn,
                state: connection.state,
            });
        }
        if let Err(e) = write_message(&mut connection.writer, &msg.payload) {
            // The stream may now end mid-frame, so nothing more can go out on
            // it. Fail the connection and let the owner close it.
            let _ = connection.stream.shutdown(Shutdown::Both);
            connection.state = ConnectionState::ProblemDetectedLocally;
            let info = connection.info(msg.conn, END_REASON_MISC_GENERIC, format!("Send failed: {e}"));
            warn!(conn = %msg.conn, "send failed, dropping connection: {e}");
            self.status.push_back(StatusChanged {
                conn: msg.conn,
                old_state: ConnectionState::Connected,
                info,
            });
            return Err(TransportError::Io(e));
        }
        self.next_message_number += 1;
        Ok(self.next_message_number)
    }
}

impl Transport for TcpTransport {
    fn create_listener(&mut self, addr: SocketAddr) -> Result<ListenSocket, TransportError> {
        let listener = TcpListener::bind(addr).map_err(TransportError::Listen)?;
        let local_addr = listener.local_addr().map_err(TransportError::Listen)?;
        listener
            .set_nonblocking(true)
            .map_err(TransportError::Listen)?;

        let socket = ListenSocket(self.issue());
        let keep_running = Arc::new(AtomicBool::new(true));
        let keep_running_thread = keep_running.clone();
        let tx = self.events_tx.clone();
        let thread = thread::spawn(move || {
            accept_loop(listener, socket, tx, keep_running_thread);
        });

        debug!("listening on {local_addr}");
        self.listeners.insert(
            socket,
            Listener {
                addr: local_addr,
                keep_running,
                thread: Some(thread),
                lingering: Vec::new(),
            },
        );
        Ok(socket)
    }

    fn listen_addr(&self, socket: ListenSocket) -> Option<SocketAddr> {
        self.listeners.get(&socket).map(|listener| listener.addr)
    }

    fn close_listener(&mut self, socket: ListenSocket) -> bool {
        let Some(mut listener) = self.listeners.remove(&socket) else {
            return false;
        };
        listener.keep_running.store(false, Ordering::SeqCst);
        if let Some(thread) = listener.thread.take() {
            let _ = thread.join();
        }
        for stream in listener.lingering.drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }

        let orphaned: Vec<ConnectionHandle> = self
            .connections
            .iter()
            .filter(|(_, connection)| connection.listener == socket)
            .map(|(conn, _)| *conn)
            .collect();
        for conn in orphaned {
            if let Some(connection) = self.connections.remove(&conn) {
                let _ = connection.stream.shutdown(Shutdown::Both);
            }
            self.purge_inbound(conn);
        }
        debug!("closed listener on {}", listener.addr);
        true
    }

    fn accept_connection(&mut self, conn: ConnectionHandle) -> Result<(), TransportError> {
        let connection = self
            .connections
            .get_mut(&conn)
            .ok_or(TransportError::InvalidConnection(conn))?;
        if connection.state != ConnectionState::Connecting {
            return Err(TransportError::InvalidState {
                conn,
                state: connection.state,
            });
        }
        let reader = connection
            .reader
            .take()
            .ok_or(TransportError::InvalidConnection(conn))?;

        let tx = self.events_tx.clone();
        thread::Builder::new()
            .name(format!("relay-reader-{conn}"))
            .spawn(move || reader_loop(BufReader::new(reader), conn, tx))?;

        connection.state = ConnectionState::Connected;
        let info = connection.info(conn, 0, String::new());
        self.status.push_back(StatusChanged {
            conn,
            old_state: ConnectionState::Connecting,
            info,
        });
        Ok(())
    }

    fn close_connection(
        &mut self,
        conn: ConnectionHandle,
        end_reason: i32,
        end_debug: &str,
        linger: bool,
    ) -> bool {
        let Some(mut connection) = self.connections.remove(&conn) else {
            return false;
        };
        self.purge_inbound(conn);
        trace!(conn = %conn, end_reason, linger, "closing connection: {end_debug}");

        let old_state = connection.state;
        let lingering = linger && old_state == ConnectionState::Connected;
        if lingering {
            if let Err(e) = connection.writer.flush() {
                debug!(conn = %conn, "flush before close failed: {e}");
            }
            let _ = connection.stream.shutdown(Shutdown::Write);
            if let Some(listener) = self.listeners.get_mut(&connection.listener) {
                listener.lingering.push(connection.stream);
            }
        } else {
            let _ = connection.stream.shutdown(Shutdown::Both);
        }

        let info = ConnectionInfo {
            state: ConnectionState::None,
            remote_addr: Some(connection.remote_addr),
            description: format!("#{conn} tcp {}", connection.remote_addr),
            end_reason,
            end_debug: end_debug.to_owned(),
        };
        self.status.push_back(StatusChanged {
            conn,
            old_state,
            info,
        });
        true
    }

    fn create_poll_group(&mut self) -> PollGroup {
        let group = PollGroup(self.issue());
        self.groups.insert(group, VecDeque::new());
        group
    }

    fn destroy_poll_group(&mut self, group: PollGroup) -> bool {
        if self.groups.remove(&group).is_none() {
            return false;
        }
        for connection in self.connections.values_mut() {
            if connection.group == Some(group) {
                connection.group = None;
            }
        }
        true
    }

    fn set_connection_poll_group(&mut self, conn: ConnectionHandle, group: PollGroup) -> bool {
        let Some(queue) = self.groups.get_mut(&group) else {
            return false;
        };
        let Some(connection) = self.connections.get_mut(&conn) else {
            return false;
        };
        connection.group = Some(group);
        queue.extend(connection.pending.drain(..));
        true
    }

    fn receive_messages_on_poll_group(
        &mut self,
        group: PollGroup,
        max: usize,
    ) -> Result<Vec<InboundMessage>, TransportError> {
        self.pump();
        let queue = self
            .groups
            .get_mut(&group)
            .ok_or(TransportError::InvalidPollGroup(group))?;
        let take = max.min(queue.len());
        Ok(queue.drain(..take).collect())
    }

    fn send_messages(&mut self, messages: Vec<OutboundMessage>) -> Vec<Result<u64, TransportError>> {
        messages.into_iter().map(|msg| self.send_one(msg)).collect()
    }

    fn poll_status_changes(&mut self) -> Vec<StatusChanged> {
        self.pump();
        self.status.drain(..).collect()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        let sockets: Vec<ListenSocket> = self.listeners.keys().copied().collect();
        for socket in sockets {
            self.close_listener(socket);
        }
        for (_, connection) in self.connections.drain() {
            let _ = connection.stream.shutdown(Shutdown::Both);
        }
    }
}

/// Listener thread: accept until told to stop or the owner goes away.
fn accept_loop(
    listener: TcpListener,
    socket: ListenSocket,
    tx: Sender<NetEvent>,
    keep_running: Arc<AtomicBool>,
) {
    while keep_running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, addr)) => {
                stream.set_nonblocking(false).ok();
                let event = NetEvent::Incoming {
                    listener: socket,
                    stream,
                    addr,
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_BACKOFF);
            }
            Err(e) => {
                warn!("accept failed: {e}");
                break;
            }
        }
    }
}

/// Reader thread for one connection. Runs until the stream ends.
fn reader_loop(mut reader: BufReader<TcpStream>, conn: ConnectionHandle, tx: Sender<NetEvent>) {
    loop {
        match read_message(&mut reader) {
            Ok(data) => {
                if tx.send(NetEvent::Message { conn, data }).is_err() {
                    break; // Transport dropped.
                }
            }
            Err(e) => {
                let (state, end_reason, end_debug) = if e.kind() == io::ErrorKind::UnexpectedEof {
                    (
                        ConnectionState::ClosedByPeer,
                        END_REASON_APP_GENERIC,
                        "Connection closed by peer".to_owned(),
                    )
                } else {
                    (
                        ConnectionState::ProblemDetectedLocally,
                        END_REASON_MISC_GENERIC,
                        e.to_string(),
                    )
                };
                let _ = tx.send(NetEvent::Closed {
                    conn,
                    state,
                    end_reason,
                    end_debug,
                });
                break;
            }
        }
    }
}
