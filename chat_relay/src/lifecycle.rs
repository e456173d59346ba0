// Connection lifecycle state machine.
//
// Each connection moves `Connecting -> Connected -> Closed` as the transport
// reports status changes (see `transport.rs`). `ConnectionLifecycle` reacts to
// each change and keeps the `ClientRegistry` in step with the transport:
//
// - **Connecting**: accept. On success register a fresh unnamed client, THEN
//   put the connection in the shared poll group, so a message can never
//   arrive for a handle the registry does not know. If the poll group
//   assignment fails, unregister and close: no half-registered client
//   survives. If the accept fails, close without ever registering. While
//   shutting down, every new connection is closed unaccepted.
// - **FindingRoute / Connected**: nothing to do on the server side.
// - **ClosedByPeer / ProblemDetectedLocally**: log who left and why, drop the
//   registry entry (a no-op if there is none), close the handle.
// - **None**: the transport has destroyed the handle. Nothing to do.
//
// Notifications are supposed to arrive FIFO per connection, but nothing here
// depends on it for safety: a repeated `Connecting` for a registered handle
// is not accepted twice, and a close for an unknown handle is harmless.
//
// Accept and poll group failures cost one connection and nothing else; the
// relay keeps serving everyone else.

use tracing::{debug, info, trace, warn};

use crate::registry::{ANONYMOUS_LABEL, ClientRegistry};
use crate::transport::{
    ConnectionHandle, ConnectionState, END_REASON_APP_GENERIC, PollGroup, StatusChanged,
    Transport,
};

/// What a status change did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Accepted, registered, and added to the poll group.
    Accepted,
    /// Closed unaccepted because the relay is shutting down.
    Rejected,
    /// The transport refused the accept; connection closed.
    AcceptFailed,
    /// Poll group assignment failed; registration undone, connection closed.
    PollGroupFailed,
    /// `Connecting` for a handle that is already registered; ignored.
    DuplicateConnecting,
    /// Connection established.
    Connected,
    /// Connection closed and unregistered. `name` is the client's chosen
    /// name, if it had one.
    Closed { name: Option<String> },
    /// Nothing to do.
    Ignored,
}

/// Drives registry and transport from connection status changes.
#[derive(Debug)]
pub struct ConnectionLifecycle {
    poll_group: PollGroup,
    shutting_down: bool,
}

impl ConnectionLifecycle {
    pub fn new(poll_group: PollGroup) -> Self {
        Self {
            poll_group,
            shutting_down: false,
        }
    }

    pub fn poll_group(&self) -> PollGroup {
        self.poll_group
    }

    /// Refuse all connections from now on.
    pub fn begin_shutdown(&mut self) {
        self.shutting_down = true;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Handle one status change.
    pub fn on_status_changed<T: Transport>(
        &mut self,
        transport: &mut T,
        registry: &mut ClientRegistry,
        event: StatusChanged,
    ) -> Transition {
        match event.new_state() {
            ConnectionState::None => {
                trace!(conn = %event.conn, "connection destroyed");
                Transition::Ignored
            }
            ConnectionState::Connecting => self.on_connecting(transport, registry, event.conn),
            ConnectionState::FindingRoute | ConnectionState::Connected => {
                debug!(
                    conn = %event.conn,
                    old_state = ?event.old_state,
                    "client #{} is {:?}",
                    event.conn,
                    event.new_state()
                );
                Transition::Connected
            }
            ConnectionState::ClosedByPeer | ConnectionState::ProblemDetectedLocally => {
                on_closed(transport, registry, &event)
            }
        }
    }

    fn on_connecting<T: Transport>(
        &mut self,
        transport: &mut T,
        registry: &mut ClientRegistry,
        conn: ConnectionHandle,
    ) -> Transition {
        if registry.contains(conn) {
            warn!(conn = %conn, "Connecting reported again for registered client #{conn}, ignoring");
            return Transition::DuplicateConnecting;
        }

        if self.shutting_down {
            transport.close_connection(conn, END_REASON_APP_GENERIC, "Server shutting down", false);
            info!(conn = %conn, "Rejected client #{conn}: server is shutting down");
            return Transition::Rejected;
        }

        if let Err(e) = transport.accept_connection(conn) {
            transport.close_connection(conn, END_REASON_APP_GENERIC, "Accept failure", false);
            warn!(conn = %conn, "Accept failed with {e}");
            return Transition::AcceptFailed;
        }

        // Register before joining the poll group; see module comment.
        registry.register(conn);

        if !transport.set_connection_poll_group(conn, self.poll_group) {
            registry.remove(conn);
            transport.close_connection(
                conn,
                END_REASON_APP_GENERIC,
                "Poll group assign failure",
                false,
            );
            warn!(conn = %conn, "Failed to assign poll group");
            return Transition::PollGroupFailed;
        }

        info!(conn = %conn, "New client #{conn} connected!");
        Transition::Accepted
    }
}

fn on_closed<T: Transport>(
    transport: &mut T,
    registry: &mut ClientRegistry,
    event: &StatusChanged,
) -> Transition {
    let removed = registry.remove(event.conn);
    let label = removed
        .as_ref()
        .map_or(ANONYMOUS_LABEL, |client| client.log_label());
    let addr = event
        .info
        .remote_addr
        .map_or_else(|| "unknown address".to_owned(), |addr| addr.to_string());
    let desc = if event.info.description.is_empty() {
        "(Invalid desc)"
    } else {
        event.info.description.as_str()
    };
    let dbg = if event.info.end_debug.is_empty() {
        "(Invalid dbg)"
    } else {
        event.info.end_debug.as_str()
    };
    let how = if event.new_state() == ConnectionState::ClosedByPeer {
        "closed by peer"
    } else {
        "problem detected locally"
    };
    info!(
        conn = %event.conn,
        "{label} ({addr}) {desc} ({how}), reason {}: {dbg}",
        event.info.end_reason
    );

    transport.close_connection(event.conn, END_REASON_APP_GENERIC, "", false);

    Transition::Closed {
        name: removed.and_then(|client| client.name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_transport::TestTransport;

    struct Fixture {
        transport: TestTransport,
        registry: ClientRegistry,
        lifecycle: ConnectionLifecycle,
    }

    impl Fixture {
        fn new() -> Self {
            let mut transport = TestTransport::new();
            let group = transport.create_poll_group();
            Self {
                transport,
                registry: ClientRegistry::new(),
                lifecycle: ConnectionLifecycle::new(group),
            }
        }

        /// Run status changes until none are pending (accepting queues a
        /// `Connected`), returning what each did.
        fn pump(&mut self) -> Vec<Transition> {
            let Self {
                transport,
                registry,
                lifecycle,
            } = self;
            let mut transitions = Vec::new();
            loop {
                let before = transitions.len();
                transport.run_callbacks(|transport, event| {
                    transitions.push(lifecycle.on_status_changed(transport, registry, event));
                });
                if transitions.len() == before {
                    return transitions;
                }
            }
        }
    }

    #[test]
    fn connecting_is_accepted_registered_and_grouped() {
        let mut f = Fixture::new();
        let conn = f.transport.connect();

        let transitions = f.pump();
        assert_eq!(transitions, vec![Transition::Accepted, Transition::Connected]);

        assert!(f.registry.contains(conn));
        assert_eq!(f.registry.get(conn).unwrap().name, None);
        assert_eq!(f.transport.group_of(conn), Some(f.lifecycle.poll_group()));
        assert_eq!(f.transport.state(conn), Some(ConnectionState::Connected));
        assert!(f.transport.closes.is_empty());
    }

    #[test]
    fn accept_failure_closes_without_registering() {
        let mut f = Fixture::new();
        let conn = f.transport.connect();
        f.transport.fail_accept.insert(conn);

        assert_eq!(f.pump(), vec![Transition::AcceptFailed]);
        assert!(!f.registry.contains(conn));
        assert_eq!(f.transport.closes.len(), 1);
        assert_eq!(f.transport.closes[0].conn, conn);
        assert_eq!(f.transport.closes[0].debug, "Accept failure");
    }

    #[test]
    fn poll_group_failure_undoes_registration() {
        let mut f = Fixture::new();
        let ok = f.transport.connect();
        let bad = f.transport.connect();
        f.transport.fail_poll_group.insert(bad);

        let transitions = f.pump();
        assert_eq!(transitions[0], Transition::Accepted);
        assert_eq!(transitions[1], Transition::PollGroupFailed);
        assert!(!f.registry.contains(bad));
        assert!(f.registry.contains(ok));
        assert_eq!(f.transport.closes.len(), 1);
        assert_eq!(f.transport.closes[0].conn, bad);
        assert_eq!(f.transport.closes[0].debug, "Poll group assign failure");
    }

    #[test]
    fn closed_by_peer_unregisters_and_closes() {
        let mut f = Fixture::new();
        let conn = f.transport.connect();
        f.pump();
        f.registry.get_mut(conn).unwrap().name = Some("alice".into());

        f.transport.peer_closes(conn);
        assert_eq!(
            f.pump(),
            vec![Transition::Closed {
                name: Some("alice".into())
            }]
        );
        assert!(!f.registry.contains(conn));
        assert_eq!(f.transport.state(conn), None);
        assert_eq!(f.transport.closes.last().unwrap().conn, conn);
    }

    #[test]
    fn problem_detected_locally_unregisters_anonymous_client() {
        let mut f = Fixture::new();
        let conn = f.transport.connect();
        f.pump();

        f.transport.push_status(
            conn,
            ConnectionState::Connected,
            ConnectionState::ProblemDetectedLocally,
        );
        assert_eq!(f.pump(), vec![Transition::Closed { name: None }]);
        assert!(f.registry.is_empty());
    }

    #[test]
    fn close_for_unknown_handle_is_harmless() {
        let mut f = Fixture::new();
        let conn = ConnectionHandle(404);
        f.transport
            .push_status(conn, ConnectionState::Connected, ConnectionState::ClosedByPeer);

        assert_eq!(f.pump(), vec![Transition::Closed { name: None }]);
        assert!(f.registry.is_empty());
        assert_eq!(f.transport.closes.len(), 1);
    }

    #[test]
    fn duplicate_close_is_idempotent() {
        let mut f = Fixture::new();
        let conn = f.transport.connect();
        f.pump();

        f.transport.peer_closes(conn);
        f.transport.peer_closes(conn);
        let transitions = f.pump();
        assert_eq!(transitions.len(), 2);
        assert!(f.registry.is_empty());
    }

    #[test]
    fn duplicate_connecting_is_not_accepted_twice() {
        let mut f = Fixture::new();
        let conn = f.transport.connect();
        f.pump();

        f.transport
            .push_status(conn, ConnectionState::None, ConnectionState::Connecting);
        assert_eq!(f.pump(), vec![Transition::DuplicateConnecting]);
        assert_eq!(f.transport.accept_calls, vec![conn]);
        assert!(f.registry.contains(conn));
    }

    #[test]
    fn stale_connecting_after_close_does_not_resurrect_client() {
        let mut f = Fixture::new();
        let conn = f.transport.connect();
        f.pump();
        f.transport.peer_closes(conn);
        f.pump();

        f.transport
            .push_status(conn, ConnectionState::None, ConnectionState::Connecting);
        assert_eq!(f.pump(), vec![Transition::AcceptFailed]);
        assert!(!f.registry.contains(conn));
    }

    #[test]
    fn connected_and_none_do_not_touch_registry() {
        let mut f = Fixture::new();
        let conn = ConnectionHandle(9);
        f.transport
            .push_status(conn, ConnectionState::Connecting, ConnectionState::Connected);
        f.transport
            .push_status(conn, ConnectionState::ClosedByPeer, ConnectionState::None);

        assert_eq!(f.pump(), vec![Transition::Connected, Transition::Ignored]);
        assert!(f.registry.is_empty());
        assert!(f.transport.closes.is_empty());
    }

    #[test]
    fn shutdown_rejects_new_connections() {
        let mut f = Fixture::new();
        f.lifecycle.begin_shutdown();
        let conn = f.transport.connect();

        assert_eq!(f.pump(), vec![Transition::Rejected]);
        assert!(f.transport.accept_calls.is_empty());
        assert!(!f.registry.contains(conn));
        assert_eq!(f.transport.closes[0].debug, "Server shutting down");
    }
}
