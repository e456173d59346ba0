// Relay loop and the handle used to run it in the background.
//
// `RelayServer` owns everything the relay needs: the transport, its listen
// socket and poll group, the client registry, the lifecycle state machine and
// the dispatcher. It is generic over `Transport`, so unit tests drive it with
// the in-memory double and `start_relay` runs it over `TcpTransport`.
//
// One pass (`run_once`):
//   1. run transport callbacks: every pending status change goes through
//      `ConnectionLifecycle`;
//   2. receive up to `max_messages_per_receive` inbound messages from the
//      poll group;
//   3. dispatch each one, then drop it (which releases it).
// `run` repeats that with a short sleep until the keep-running flag clears.
// A receive failure or a dispatch invariant violation ends the loop with an
// error; everything else is logged and survived.
//
// Shutdown (`RelayHandle::stop`):
//   signal -> loop exits and closes every client with linger -> join
//   -> sleep linger -> close listener and destroy poll group.
// The listener closes last because closing it drops every connection
// accepted from it, and the goodbye traffic needs the linger to flush.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::config::RelayConfig;
use crate::dispatch::Dispatcher;
use crate::error::RelayError;
use crate::lifecycle::ConnectionLifecycle;
use crate::registry::ClientRegistry;
use crate::tcp_transport::TcpTransport;
use crate::transport::{END_REASON_APP_GENERIC, ListenSocket, PollGroup, Transport};

/// A relay bound to a transport.
pub struct RelayServer<T: Transport> {
    transport: T,
    listen_socket: ListenSocket,
    local_addr: SocketAddr,
    registry: ClientRegistry,
    lifecycle: ConnectionLifecycle,
    dispatcher: Dispatcher,
    max_messages_per_receive: usize,
    poll_interval: Duration,
}

impl<T: Transport> RelayServer<T> {
    /// Create the poll group and start listening.
    pub fn start(mut transport: T, config: &RelayConfig) -> Result<Self, RelayError> {
        config.validate()?;

        let poll_group = transport.create_poll_group();
        let listen_socket = match transport.create_listener(config.listen_addr()) {
            Ok(socket) => socket,
            Err(e) => {
                transport.destroy_poll_group(poll_group);
                error!("Failed to listen on {}: {e}", config.listen_addr());
                return Err(RelayError::Listen(e));
            }
        };
        let local_addr = transport
            .listen_addr(listen_socket)
            .unwrap_or_else(|| config.listen_addr());
        info!("Relay listening on {local_addr}");

        Ok(Self {
            transport,
            listen_socket,
            local_addr,
            registry: ClientRegistry::new(),
            lifecycle: ConnectionLifecycle::new(poll_group),
            dispatcher: Dispatcher::default(),
            max_messages_per_receive: config.max_messages_per_receive,
            poll_interval: config.poll_interval(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn listen_socket(&self) -> ListenSocket {
        self.listen_socket
    }

    pub fn poll_group(&self) -> PollGroup {
        self.lifecycle.poll_group()
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Process pending status changes. Returns how many there were.
    fn run_callbacks(&mut self) -> usize {
        let Self {
            transport,
            registry,
            lifecycle,
            ..
        } = self;
        let mut handled = 0;
        transport.run_callbacks(|transport, event| {
            lifecycle.on_status_changed(transport, registry, event);
            handled += 1;
        });
        handled
    }

    /// One loop pass. Returns the number of inbound messages handled.
    pub fn run_once(&mut self) -> Result<usize, RelayError> {
        self.run_callbacks();

        let messages = self
            .transport
            .receive_messages_on_poll_group(self.lifecycle.poll_group(), self.max_messages_per_receive)
            .map_err(|e| {
                error!("Receiving messages failed: {e}");
                RelayError::Receive(e)
            })?;

        let count = messages.len();
        for inbound in messages {
            let outcome = self
                .dispatcher
                .dispatch(&mut self.transport, &mut self.registry, &inbound)
                .map_err(|e| {
                    error!("Dispatch failed: {e}");
                    RelayError::from(e)
                })?;
            debug!(conn = %inbound.conn, ?outcome, "message #{} handled", inbound.message_number);
        }
        Ok(count)
    }

    /// Run until `keep_running` is cleared or a fatal error occurs.
    pub fn run(&mut self, keep_running: &AtomicBool) -> Result<(), RelayError> {
        while keep_running.load(Ordering::SeqCst) {
            self.run_once()?;
            thread::sleep(self.poll_interval);
        }
        Ok(())
    }

    /// Stop accepting and close every registered client with linger.
    pub fn begin_shutdown(&mut self) {
        self.lifecycle.begin_shutdown();
        info!("Closing connections...");
        for conn in self.registry.handles() {
            self.transport
                .close_connection(conn, END_REASON_APP_GENERIC, "Server shutdown", true);
        }
        self.registry.clear();
    }

    /// Wait out `linger`, then tear down the listener and poll group.
    /// Returns the transport.
    pub fn finish(mut self, linger: Duration) -> T {
        if !linger.is_zero() {
            thread::sleep(linger);
        }
        // Anything that connected during the linger is rejected here.
        self.lifecycle.begin_shutdown();
        self.run_callbacks();

        self.transport.close_listener(self.listen_socket);
        self.transport.destroy_poll_group(self.lifecycle.poll_group());
        self.registry.clear();
        info!("Relay stopped");
        self.transport
    }
}

/// Handle returned by `start_relay` to control the running relay.
pub struct RelayHandle {
    keep_running: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<RelayServer<TcpTransport>, RelayError>>>,
}

impl RelayHandle {
    /// Signal the relay to stop, wait for its loop to close all clients, give
    /// queued output `linger` to flush, then close the listener.
    ///
    /// Returns the error that ended the loop early, if any.
    pub fn stop(mut self, linger: Duration) -> Result<(), RelayError> {
        info!("Stopping the relay loop...");
        self.keep_running.store(false, Ordering::SeqCst);
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        let server = thread.join().map_err(|_| RelayError::Panicked)??;
        server.finish(linger);
        Ok(())
    }

    /// True once the loop thread has exited, by `stop` or by a fatal error.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|thread| thread.is_finished())
    }
}

/// Start a TCP relay on a background thread. Returns a handle for stopping
/// it and the actual bound address (useful when port 0 lets the OS pick).
pub fn start_relay(config: RelayConfig) -> Result<(RelayHandle, SocketAddr), RelayError> {
    let mut server = RelayServer::start(TcpTransport::new(), &config)?;
    let addr = server.local_addr();
    let keep_running = Arc::new(AtomicBool::new(true));
    let keep_running_loop = keep_running.clone();

    let thread = thread::Builder::new()
        .name("chat-relay".into())
        .spawn(move || match server.run(&keep_running_loop) {
            Ok(()) => {
                server.begin_shutdown();
                Ok(server)
            }
            Err(e) => {
                error!("Relay loop stopped: {e}");
                Err(e)
            }
        })?;

    Ok((
        RelayHandle {
            keep_running,
            thread: Some(thread),
        },
        addr,
    ))
}

#[cfg(test)]
mod tests {
    use chat_relay_protocol::ChatProtocol;

    use super::*;
    use crate::error::{DispatchError, TransportError};
    use crate::test_transport::TestTransport;
    use crate::transport::{ConnectionHandle, ConnectionState};

    fn test_config() -> RelayConfig {
        RelayConfig {
            port: 0,
            poll_interval_ms: 1,
            ..RelayConfig::default()
        }
    }

    fn server() -> RelayServer<TestTransport> {
        RelayServer::start(TestTransport::new(), &test_config()).unwrap()
    }

    /// Connect a client and run a pass so it is accepted.
    fn join(server: &mut RelayServer<TestTransport>) -> ConnectionHandle {
        let conn = server.transport_mut().connect();
        server.run_once().unwrap();
        assert!(server.registry().contains(conn));
        conn
    }

    fn chat(sender: &str, content: &str) -> ChatProtocol {
        ChatProtocol::chat(sender, content)
    }

    #[test]
    fn start_reports_bound_address() {
        let server = server();
        assert_eq!(server.local_addr(), test_config().listen_addr());
        assert!(server.registry().is_empty());
    }

    #[test]
    fn listen_failure_is_reported() {
        let mut transport = TestTransport::new();
        transport.fail_listen = true;
        let err = RelayServer::start(transport, &test_config()).err().unwrap();
        assert!(matches!(err, RelayError::Listen(TransportError::Listen(_))));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = RelayConfig {
            max_messages_per_receive: 0,
            ..test_config()
        };
        let err = RelayServer::start(TestTransport::new(), &config).err().unwrap();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn three_clients_chat_and_one_leaves() {
        let mut server = server();
        let a = join(&mut server);
        let b = join(&mut server);
        let c = join(&mut server);

        server
            .transport_mut()
            .deliver_msg(a, &ChatProtocol::name_change("alice"));
        server.transport_mut().deliver_msg(a, &chat("", "hi"));
        assert_eq!(server.run_once().unwrap(), 2);

        let transport = server.transport();
        assert_eq!(
            transport.sent_to(a),
            vec![chat("Server", "Your name is now alice")]
        );
        assert_eq!(transport.sent_to(b), vec![chat("alice", "hi")]);
        assert_eq!(transport.sent_to(c), vec![chat("alice", "hi")]);
        server.transport_mut().take_sent();

        // C leaves; B's next line only reaches A.
        server.transport_mut().peer_closes(c);
        server.transport_mut().deliver_msg(b, &chat("", "bye c"));
        server.run_once().unwrap();

        assert!(!server.registry().contains(c));
        assert_eq!(server.registry().len(), 2);
        let guest_b = format!("Guest#{b}");
        assert_eq!(server.transport().sent_to(a), vec![chat(&guest_b, "bye c")]);
        assert!(server.transport().sent_to(c).is_empty());
        assert!(server.transport().closes.iter().any(|close| close.conn == c));
    }

    #[test]
    fn batch_size_bounds_one_pass() {
        let config = RelayConfig {
            max_messages_per_receive: 2,
            ..test_config()
        };
        let mut server = RelayServer::start(TestTransport::new(), &config).unwrap();
        let a = join(&mut server);
        for n in 0..5 {
            server.transport_mut().deliver_msg(a, &chat("", &n.to_string()));
        }
        assert_eq!(server.run_once().unwrap(), 2);
        assert_eq!(server.run_once().unwrap(), 2);
        assert_eq!(server.run_once().unwrap(), 1);
        assert_eq!(server.run_once().unwrap(), 0);
    }

    #[test]
    fn receive_failure_is_fatal() {
        let mut server = server();
        join(&mut server);
        server.transport_mut().fail_receive = true;
        assert!(matches!(server.run_once(), Err(RelayError::Receive(_))));

        let keep_running = AtomicBool::new(true);
        assert!(matches!(
            server.run(&keep_running),
            Err(RelayError::Receive(_))
        ));
    }

    #[test]
    fn message_from_unregistered_handle_is_fatal() {
        let mut server = server();
        let group = server.poll_group();
        let transport = server.transport_mut();
        let conn = transport.connect();
        // Bypass the lifecycle: accept and group without registering.
        transport.poll_status_changes();
        transport.accept_connection(conn).unwrap();
        transport.poll_status_changes();
        assert!(transport.set_connection_poll_group(conn, group));
        transport.deliver_msg(conn, &chat("", "sneaky"));

        assert!(matches!(
            server.run_once(),
            Err(RelayError::Dispatch(DispatchError::UnregisteredConnection(c))) if c == conn
        ));
    }

    #[test]
    fn run_returns_when_flag_is_clear() {
        let mut server = server();
        let keep_running = AtomicBool::new(false);
        server.run(&keep_running).unwrap();
    }

    #[test]
    fn shutdown_closes_clients_with_linger_and_rejects_newcomers() {
        let mut server = server();
        let a = join(&mut server);
        let b = join(&mut server);

        server.begin_shutdown();
        assert!(server.registry().is_empty());
        let closes = &server.transport().closes;
        for conn in [a, b] {
            let close = closes.iter().find(|close| close.conn == conn).unwrap();
            assert!(close.linger);
            assert_eq!(close.debug, "Server shutdown");
        }

        let late = server.transport_mut().connect();
        server.run_once().unwrap();
        assert!(!server.registry().contains(late));
        assert!(!server.transport().accept_calls.contains(&late));
        let rejected = server
            .transport()
            .closes
            .iter()
            .find(|close| close.conn == late)
            .unwrap();
        assert!(!rejected.linger);
    }

    #[test]
    fn finish_tears_down_listener_and_poll_group() {
        let mut server = server();
        let socket = server.listen_socket();
        let group = server.poll_group();
        let a = join(&mut server);
        server.begin_shutdown();
        let late = server.transport_mut().connect();

        let mut transport = server.finish(Duration::ZERO);
        assert_eq!(transport.listen_addr(socket), None);
        assert!(!transport.destroy_poll_group(group));
        assert_eq!(transport.state(a), None);
        assert_eq!(transport.state(late), None);
        assert!(transport.closes.iter().any(|close| close.conn == late));
    }

    #[test]
    fn disconnected_handle_state_is_gone() {
        let mut server = server();
        let a = join(&mut server);
        assert_eq!(server.transport().state(a), Some(ConnectionState::Connected));
        server.transport_mut().peer_closes(a);
        server.run_once().unwrap();
        assert_eq!(server.transport().state(a), None);
    }
}
