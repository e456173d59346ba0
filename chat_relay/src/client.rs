// TCP client for talking to the relay.
//
// Architecture:
// - `connect()` opens the TCP stream on the calling thread, then spawns a
//   background reader thread.
// - The reader thread calls `read_message()` in a loop, decodes each frame as
//   a `ChatProtocol`, and pushes it into an `mpsc` channel. Frames that do not
//   decode are logged and skipped. The channel disconnects when the stream
//   ends, which is how callers notice the relay closed them.
// - The calling thread holds a `BufWriter<TcpStream>` for sending; every send
//   is flushed immediately.
//
// Used by the integration tests, and small enough to drive a relay by hand.

use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chat_relay_protocol::framing::{read_message, write_message};
use chat_relay_protocol::ChatProtocol;
use tracing::{debug, warn};

/// A connected chat client.
pub struct ChatClient {
    stream: TcpStream,
    writer: BufWriter<TcpStream>,
    inbox: Receiver<ChatProtocol>,
    reader_thread: Option<JoinHandle<()>>,
}

impl ChatClient {
    /// Connect to a relay and start the reader thread.
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        let writer = BufWriter::new(stream.try_clone()?);

        let (tx, rx) = mpsc::channel();
        let reader_thread = thread::spawn(move || reader_loop(reader, tx));

        Ok(Self {
            stream,
            writer,
            inbox: rx,
            reader_thread: Some(reader_thread),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    /// Send a chat line. The relay ignores any sender name, so none is set.
    pub fn send_chat(&mut self, content: &str) -> io::Result<()> {
        self.send(&ChatProtocol::chat("", content))
    }

    pub fn send_name_change(&mut self, name: &str) -> io::Result<()> {
        self.send(&ChatProtocol::name_change(name))
    }

    pub fn send(&mut self, msg: &ChatProtocol) -> io::Result<()> {
        let bytes = msg.encode().map_err(io::Error::other)?;
        self.send_raw(&bytes)
    }

    /// Send arbitrary bytes as one frame.
    pub fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        write_message(&mut self.writer, bytes)
    }

    /// Drain everything received so far without blocking.
    pub fn poll(&self) -> Vec<ChatProtocol> {
        self.inbox.try_iter().collect()
    }

    /// Wait up to `timeout` for the next message. `Disconnected` means the
    /// relay closed the connection and everything it sent has been read.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<ChatProtocol, RecvTimeoutError> {
        self.inbox.recv_timeout(timeout)
    }

    /// Close the connection and wait for the reader thread to exit.
    pub fn disconnect(mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(thread) = self.reader_thread.take() {
            let _ = thread.join();
        }
    }
}

fn reader_loop(mut reader: BufReader<TcpStream>, tx: mpsc::Sender<ChatProtocol>) {
    loop {
        let bytes = match read_message(&mut reader) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("client reader stopped: {e}");
                break;
            }
        };
        match ChatProtocol::decode(&bytes) {
            Ok(msg) => {
                if tx.send(msg).is_err() {
                    break; // Client dropped the receiver.
                }
            }
            Err(e) => warn!("Skipping undecodable message from relay: {e}"),
        }
    }
}
