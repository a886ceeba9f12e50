//! Payload buffer pool for allocation-free message handling.
//!
//! Every inbound and outbound message is backed by a [`Payload`]: a byte
//! buffer rented from a [`PayloadPool`] and handed back to it when the
//! payload is dropped.
//!
//! # Design
//!
//! The pool is a fixed array of [`PAYLOAD_POOL_SIZE`] slots, each an
//! `AtomicPtr` that is either null (empty) or owns one boxed buffer:
//! - Renting swaps a non-null slot to null with compare-and-swap
//! - Returning swaps a null slot to the buffer with compare-and-swap
//! - An empty pool falls back to a fresh allocation
//! - A full pool drops the returned buffer
//!
//! No locks are taken on either path. Ownership of the buffer moves with the
//! `Payload`, so a buffer can be returned at most once and cannot be touched
//! after it went back to the pool.
//!
//! The standard library has no atomic cell for an owned `Box`, so a slot
//! stores the raw pointer from `Box::into_raw` and turns it back into a box
//! only after a successful swap made the caller its sole owner. The
//! `unsafe` blocks in [`PayloadPool`] rely on exactly that: a non-null slot
//! always holds a live box, and a pointer leaves a slot only through an
//! atomic swap. Dropping the pool frees whatever the slots still hold.
//!
//! # Usage
//!
//! ```
//! use streaminghub_client::protocol::PayloadPool;
//!
//! let payload = PayloadPool::shared().rent_or_create(b"\x92\x01\xc0");
//! assert_eq!(&payload[..], b"\x92\x01\xc0");
//! drop(payload); // buffer goes back to the pool
//! ```

use std::fmt;
use std::ops::Deref;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Number of buffers a pool retains.
pub const PAYLOAD_POOL_SIZE: usize = 4;

/// Byte written over returned buffers in debug builds.
pub const POISON_BYTE: u8 = 0xfe;

/// Buffers that grew beyond this capacity are not retained.
pub const MAX_POOLED_CAPACITY: usize = 1024 * 1024;

type Slot = AtomicPtr<Vec<u8>>;

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: Slot = AtomicPtr::new(ptr::null_mut());

static SHARED: PayloadPool = PayloadPool::new();

/// Lock-free pool of reusable payload buffers.
pub struct PayloadPool {
    slots: [Slot; PAYLOAD_POOL_SIZE],
}

impl PayloadPool {
    /// Create an empty pool.
    pub const fn new() -> Self {
        Self {
            slots: [EMPTY_SLOT; PAYLOAD_POOL_SIZE],
        }
    }

    /// The process-wide pool used by sessions.
    #[inline]
    pub fn shared() -> &'static PayloadPool {
        &SHARED
    }

    /// Rent a buffer and fill it with a copy of `source`.
    pub fn rent_or_create(&'static self, source: &[u8]) -> Payload {
        let mut payload = self.rent();
        payload.as_mut_vec().extend_from_slice(source);
        payload
    }

    /// Rent an empty buffer for in-place encoding.
    pub fn rent(&'static self) -> Payload {
        let buf = self.take().unwrap_or_default();
        Payload {
            buf: Some(buf),
            pool: self,
        }
    }

    /// Number of buffers currently parked in the pool.
    pub fn available(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| !slot.load(Ordering::Acquire).is_null())
            .count()
    }

    /// Claim a parked buffer, if any.
    fn take(&self) -> Option<Box<Vec<u8>>> {
        for slot in &self.slots {
            let current = slot.load(Ordering::Acquire);
            if current.is_null() {
                continue;
            }
            if slot
                .compare_exchange(current, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // SAFETY: the pointer came from `Box::into_raw` in `give`, and the
                // successful swap made this thread its only owner.
                return Some(unsafe { Box::from_raw(current) });
            }
        }
        None
    }

    /// Park a buffer. Returns false when every slot is occupied.
    fn give(&self, mut buf: Box<Vec<u8>>) -> bool {
        if buf.capacity() > MAX_POOLED_CAPACITY {
            return false;
        }

        #[cfg(debug_assertions)]
        buf.fill(POISON_BYTE);
        buf.clear();

        let raw = Box::into_raw(buf);
        for slot in &self.slots {
            if slot
                .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }

        // SAFETY: no slot accepted `raw`, so we still own it.
        drop(unsafe { Box::from_raw(raw) });
        false
    }
}

impl Default for PayloadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PayloadPool {
    fn drop(&mut self) {
        for slot in &self.slots {
            let raw = slot.swap(ptr::null_mut(), Ordering::AcqRel);
            if !raw.is_null() {
                // SAFETY: parked pointers are owned by the pool.
                drop(unsafe { Box::from_raw(raw) });
            }
        }
    }
}

impl fmt::Debug for PayloadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadPool")
            .field("available", &self.available())
            .finish()
    }
}

/// A pooled byte buffer holding one complete message.
///
/// Dereferences to the message bytes. Dropping the payload returns the
/// buffer to its pool.
pub struct Payload {
    // Always `Some` until drop.
    buf: Option<Box<Vec<u8>>>,
    pool: &'static PayloadPool,
}

impl Payload {
    /// Mutable access to the backing vector, for encoders appending in place.
    #[inline]
    pub fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        self.buf.get_or_insert_with(Box::default)
    }

    /// The message bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_deref().map(Vec::as_slice).unwrap_or_default()
    }
}

impl Deref for Payload {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for Payload {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl Drop for Payload {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.give(buf);
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload").field("len", &self.len()).finish()
    }
}
