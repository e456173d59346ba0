// chat_relay_protocol: wire protocol spoken between chat clients and the relay.
//
// Shared by the relay (`chat_relay`) and anything that talks to it. Has no
// dependency on the relay or on any transport.
//
// Module overview:
// - `message.rs`:  The `ChatProtocol` enum (`Chat`, `NameChange`, `Unknown`),
//                  its encode/decode helpers, and `ProtocolError`.
// - `framing.rs`:  Length-delimited framing over any `Read`/`Write` stream:
//                  4-byte big-endian length prefix, then the encoded message.
//
// Design decisions:
// - **JSON encoding.** Human-readable on the wire and easy to poke at with a
//   raw socket. The relay only cares about the discriminant and a few UTF-8
//   fields, so a schema compiler would buy nothing here.
// - **Unknown tags decode.** A well-formed message with an unrecognized type
//   becomes `ChatProtocol::Unknown` rather than an error, so the relay can tell
//   "valid but unexpected" apart from "unparseable" in its logs.
// - **No async runtime.** Framing uses `std::io::Read`/`Write`, compatible
//   with blocking sockets and buffered wrappers alike.

pub mod framing;
pub mod message;

pub use framing::{MAX_MESSAGE_SIZE, read_message, write_message};
pub use message::{Chat, ChatProtocol, NameChange, ProtocolError, SERVER_SENDER_NAME};
