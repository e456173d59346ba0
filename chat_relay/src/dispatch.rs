// Message dispatcher: turns one inbound message into zero or more sends.
//
// Every inbound payload is decoded as a `ChatProtocol` and handled by type:
// - `Chat`: stamp it with the sender's display name (chosen name, or the
//   `Guest#<handle>` label) and send it to every registered client except the
//   sender. The line is serialized once into a `SharedPayload` and the same
//   buffer is attached to every recipient's message. No recipients, no
//   allocation.
// - `NameChange`: a non-empty name replaces the stored one; an empty name
//   changes nothing. Either way the sender alone gets a `Chat` from "Server"
//   confirming the name now in effect.
// - `Unknown`, empty, or unparseable payloads: logged and dropped. No state
//   change, no reply. The protocol has no error message to send back.
//
// A message from a handle with no registry entry cannot happen while the
// lifecycle keeps its invariant (register before joining the poll group,
// unregister on close, and the transport discards a closed connection's
// queued messages). If it does happen anyway it is reported as a
// `DispatchError`, which the relay loop treats as fatal.
//
// A failed send to one recipient is logged and does not stop the others.

use chat_relay_protocol::{ChatProtocol, ProtocolError, SERVER_SENDER_NAME};
use tracing::{debug, info, warn};

use crate::error::{DispatchError, TransportError};
use crate::payload::SharedPayload;
use crate::registry::ClientRegistry;
use crate::transport::{ConnectionHandle, InboundMessage, OutboundMessage, SendFlags, Transport};

/// How a chat line reaches its recipients.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BroadcastMode {
    /// One serialized buffer shared by every recipient's message.
    #[default]
    Shared,
    /// A separate copy per recipient.
    PerRecipient,
}

/// Why a message was dropped without effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    Empty,
    Malformed,
    UnexpectedVariant,
}

/// What dispatching one message did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A chat line went out to `recipients` other clients.
    Broadcast { recipients: usize },
    /// The sender got a reply.
    Replied,
    /// Nothing happened.
    Dropped(DropReason),
}

#[derive(Debug, Default)]
pub struct Dispatcher {
    mode: BroadcastMode,
}

impl Dispatcher {
    pub fn new(mode: BroadcastMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> BroadcastMode {
        self.mode
    }

    /// Handle one inbound message.
    pub fn dispatch<T: Transport>(
        &mut self,
        transport: &mut T,
        registry: &mut ClientRegistry,
        inbound: &InboundMessage,
    ) -> Result<DispatchOutcome, DispatchError> {
        let conn = inbound.conn;
        let msg = match ChatProtocol::decode(&inbound.data) {
            Ok(msg) => msg,
            Err(ProtocolError::Empty) => {
                warn!(conn = %conn, "Client sent an empty message");
                return Ok(DispatchOutcome::Dropped(DropReason::Empty));
            }
            Err(e) => {
                warn!(conn = %conn, "Client sent an invalid message: {e}");
                return Ok(DispatchOutcome::Dropped(DropReason::Malformed));
            }
        };

        let client = registry
            .get_mut(conn)
            .ok_or(DispatchError::UnregisteredConnection(conn))?;

        match msg {
            ChatProtocol::Chat(chat) => {
                let sender_name = client.display_name(conn);
                info!(conn = %conn, "{sender_name}: {}", chat.content);
                let line = ChatProtocol::chat(sender_name, chat.content);
                let recipients = self.broadcast(transport, registry, conn, &line);
                Ok(DispatchOutcome::Broadcast { recipients })
            }
            ChatProtocol::NameChange(change) => {
                if !change.name.is_empty() {
                    info!(conn = %conn, "Client #{conn} changed their name to {}", change.name);
                    client.name = Some(change.name);
                }
                let reply = ChatProtocol::chat(
                    SERVER_SENDER_NAME,
                    format!("Your name is now {}", client.display_name(conn)),
                );
                if let Some(bytes) = encode(&reply) {
                    let result = transport.send_message_to_connection(
                        conn,
                        bytes,
                        SendFlags::ReliableNoNagle,
                    );
                    log_send_failure(conn, result);
                }
                Ok(DispatchOutcome::Replied)
            }
            other @ ChatProtocol::Unknown => {
                warn!(conn = %conn, "Client sent an invalid message type: {}", other.kind());
                Ok(DispatchOutcome::Dropped(DropReason::UnexpectedVariant))
            }
        }
    }

    /// Send `msg` to every registered client except `sender`. Returns the
    /// number of recipients.
    fn broadcast<T: Transport>(
        &self,
        transport: &mut T,
        registry: &ClientRegistry,
        sender: ConnectionHandle,
        msg: &ChatProtocol,
    ) -> usize {
        let recipients: Vec<ConnectionHandle> = registry
            .handles()
            .into_iter()
            .filter(|conn| *conn != sender)
            .collect();
        if recipients.is_empty() {
            debug!(conn = %sender, "no other clients to receive the chat");
            return 0;
        }

        let Some(bytes) = encode(msg) else {
            return 0;
        };

        let messages: Vec<OutboundMessage> = match self.mode {
            BroadcastMode::Shared => {
                let payload = match SharedPayload::copy_from_slice(&bytes) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(conn = %sender, "Dropping chat broadcast: {e}");
                        return 0;
                    }
                };
                recipients
                    .iter()
                    .map(|conn| payload.attach(*conn, SendFlags::ReliableNoNagle))
                    .collect()
            }
            BroadcastMode::PerRecipient => recipients
                .iter()
                .map(|conn| OutboundMessage::owned(*conn, bytes.clone(), SendFlags::ReliableNoNagle))
                .collect(),
        };

        let results = transport.send_messages(messages);
        for (conn, result) in recipients.iter().zip(results) {
            log_send_failure(*conn, result);
        }
        recipients.len()
    }
}

fn encode(msg: &ChatProtocol) -> Option<Vec<u8>> {
    match msg.encode() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!("{e}");
            None
        }
    }
}

fn log_send_failure(conn: ConnectionHandle, result: Result<u64, TransportError>) {
    if let Err(e) = result {
        warn!(conn = %conn, "Failed to send to client #{conn}: {e}");
    }
}
