// Reference-counted payload shared by many outbound messages.
//
// Broadcasting one chat line to N clients should not mean N serializations or
// N copies. `SharedPayload` is a byte buffer that the producer fills once and
// then attaches to as many `OutboundMessage`s as it likes; every message views
// the same bytes.
//
// Counting rules:
// - A freshly allocated payload has an attach count of zero. The producer's
//   handle is not a reference.
// - `attach` increments the count and hands the message a `PayloadRef`.
// - Dropping a `PayloadRef` (the message was sent, failed, or was discarded)
//   decrements it. Because release is `Drop`, a message cannot release twice
//   and cannot forget to release.
// - `force_release` consumes a payload that never went out. Calling it while
//   messages still reference the buffer is a bug and panics.
//
// The bytes themselves live behind an `Arc`, so the storage is freed exactly
// once: by the last `PayloadRef` to go away once the producer has finished
// fanning out, or by the producer if nothing was ever attached. The explicit
// attach count sits next to the data. It only moves with atomic operations
// because a transport may drop sent messages on a different thread than the
// one that attached them.
//
// The buffer is writable (`as_mut_slice`) only while nothing references it.
//
// See also: `transport.rs` for `Payload`/`OutboundMessage`, `dispatch.rs` for
// the chat broadcast that uses this.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::trace;

use crate::error::PayloadError;
use crate::transport::{ConnectionHandle, OutboundMessage, Payload, SendFlags};

struct Block {
    attached: AtomicUsize,
    data: Box<[u8]>,
}

/// Producer-side handle to a shared payload.
pub struct SharedPayload {
    block: Arc<Block>,
}

/// One message's reference to a shared payload. Released on drop.
pub struct PayloadRef {
    block: Arc<Block>,
}

impl SharedPayload {
    /// Allocate a zero-filled buffer of `size` bytes with an attach count of
    /// zero.
    pub fn allocate(size: usize) -> Result<Self, PayloadError> {
        if size == 0 {
            return Err(PayloadError::ZeroSize);
        }
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| PayloadError::AllocationFailed(size))?;
        data.resize(size, 0);
        Ok(Self::from_data(data))
    }

    /// Allocate a buffer holding a copy of `bytes`.
    pub fn copy_from_slice(bytes: &[u8]) -> Result<Self, PayloadError> {
        if bytes.is_empty() {
            return Err(PayloadError::ZeroSize);
        }
        let mut data = Vec::new();
        data.try_reserve_exact(bytes.len())
            .map_err(|_| PayloadError::AllocationFailed(bytes.len()))?;
        data.extend_from_slice(bytes);
        Ok(Self::from_data(data))
    }

    fn from_data(data: Vec<u8>) -> Self {
        Self {
            block: Arc::new(Block {
                attached: AtomicUsize::new(0),
                data: data.into_boxed_slice(),
            }),
        }
    }

    /// Writable view of the buffer. `None` while any message still
    /// references it.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        Arc::get_mut(&mut self.block).map(|block| &mut block.data[..])
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.block.data
    }

    pub fn len(&self) -> usize {
        self.block.data.len()
    }

    /// Always false: zero-sized payloads cannot be allocated.
    pub fn is_empty(&self) -> bool {
        self.block.data.is_empty()
    }

    /// Number of messages currently referencing the buffer.
    pub fn ref_count(&self) -> usize {
        self.block.attached.load(Ordering::Acquire)
    }

    /// Attach the buffer to a new outbound message for `conn`.
    pub fn attach(&self, conn: ConnectionHandle, flags: SendFlags) -> OutboundMessage {
        OutboundMessage::new(conn, Payload::Shared(self.share()), flags)
    }

    /// Take one more reference without building a message.
    pub fn share(&self) -> PayloadRef {
        self.block.attached.fetch_add(1, Ordering::Relaxed);
        PayloadRef {
            block: Arc::clone(&self.block),
        }
    }

    /// Free a payload that is not attached to anything, typically because an
    /// error stopped the fan-out before it began.
    ///
    /// # Panics
    ///
    /// If any message still references the buffer.
    pub fn force_release(self) {
        let attached = self.ref_count();
        assert_eq!(
            attached, 0,
            "force_release on a shared payload still attached to {attached} message(s)"
        );
        trace!(len = self.len(), "shared payload force-released");
    }
}

impl PayloadRef {
    pub fn as_slice(&self) -> &[u8] {
        &self.block.data
    }

    /// Address of the first byte. Equal for every reference to one payload.
    pub fn as_ptr(&self) -> *const u8 {
        self.block.data.as_ptr()
    }

    /// True if both references view the same payload.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.block, &b.block)
    }
}

impl Deref for PayloadRef {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.block.data
    }
}

impl Drop for PayloadRef {
    fn drop(&mut self) {
        let previous = self.block.attached.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "shared payload released more times than attached");
        if previous == 1 {
            trace!(len = self.block.data.len(), "last reference to shared payload released");
        }
    }
}

impl fmt::Debug for SharedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedPayload")
            .field("len", &self.len())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

impl fmt::Debug for PayloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadRef")
            .field("len", &self.block.data.len())
            .field("ptr", &self.as_ptr())
            .finish()
    }
}
