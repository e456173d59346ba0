// chat_relay: single-listener chat relay.
//
// The relay accepts connections on one listen socket, keeps a registry of
// connected clients, and relays chat lines from each client to all the
// others. Clients can pick a display name; everyone else is shown as
// `Guest#<handle>`. A chat line is serialized once and the same buffer is
// handed to every recipient's outbound message.
//
// Module overview:
// - `transport.rs`:     The `Transport` trait and its handle/message types.
//                       Everything above it is transport-agnostic.
// - `tcp_transport.rs`: `Transport` over TCP, thread-per-reader with an
//                       `mpsc` channel into the owning thread.
// - `payload.rs`:       `SharedPayload`, one buffer referenced by many
//                       outbound messages and freed with the last of them.
// - `registry.rs`:      Per-connection client state (display name).
// - `lifecycle.rs`:     Status change state machine: accept, register, join
//                       the poll group, close.
// - `dispatch.rs`:      Decodes inbound messages and broadcasts or replies.
// - `server.rs`:        `RelayServer` loop, `start_relay`, `RelayHandle`.
// - `config.rs`:        `RelayConfig` (defaults, JSON file, validation).
// - `client.rs`:        `ChatClient`, a blocking TCP client with a reader
//                       thread.
// - `error.rs`:         Error enums.
//
// Dependencies: `chat_relay_protocol` (message enum and framing).
//
// The relay can run as a standalone binary (`main.rs`) or be embedded via the
// library API (`start_relay`).

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod payload;
pub mod registry;
pub mod server;
pub mod tcp_transport;
pub mod transport;

#[cfg(test)]
mod test_transport;

pub use client::ChatClient;
pub use config::RelayConfig;
pub use error::RelayError;
pub use server::{RelayHandle, RelayServer, start_relay};
