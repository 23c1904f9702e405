//! Two-slot mailbox between the sampler and an external reader.
//!
//! The sampler must never wait on a slow or absent reader, so when both slots are full a newly
//! published buffer is thrown away instead of queued.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// The bytes written by one capture pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureBuffer {
    data: Vec<u8>,
}

impl CaptureBuffer {
    pub fn new(data: Vec<u8>) -> Self {
        CaptureBuffer { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Published {
    Stored,
    /// Both slots were full; the buffer has been released.
    Dropped,
}

#[derive(Default)]
struct Slots {
    a: Option<CaptureBuffer>,
    b: Option<CaptureBuffer>,
}

#[derive(Default)]
pub struct BufferExchange {
    slots: Mutex<Slots>,
    dropped: AtomicU64,
    lost_to_small_destination: AtomicU64,
}

impl BufferExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a slot is free right now.
    ///
    /// Nothing is reserved: the slot may be gone by the time the caller publishes.
    pub fn has_capacity(&self) -> bool {
        let slots = self.slots.lock();
        slots.a.is_none() || slots.b.is_none()
    }

    /// Stores `buffer` in the first free slot, or drops it if there is none.
    pub fn publish(&self, buffer: CaptureBuffer) -> Published {
        let rejected = {
            let mut slots = self.slots.lock();
            if slots.a.is_none() {
                slots.a = Some(buffer);
                None
            } else if slots.b.is_none() {
                slots.b = Some(buffer);
                None
            } else {
                Some(buffer)
            }
        };
        match rejected {
            None => Published::Stored,
            Some(buffer) => {
                drop(buffer);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Published::Dropped
            }
        }
    }

    /// Takes the oldest pending buffer.
    ///
    /// Slot A always holds the oldest one. Taking it moves slot B up, so a buffer published
    /// afterwards lands behind it.
    pub fn take(&self) -> Option<CaptureBuffer> {
        let mut slots = self.slots.lock();
        let oldest = slots.a.take();
        slots.a = slots.b.take();
        oldest
    }

    /// Moves the oldest pending buffer into `destination`.
    ///
    /// Returns the number of bytes copied, which is 0 when nothing is pending. A destination too
    /// small for the pending buffer also gets 0, and the buffer is lost: it is never delivered
    /// twice.
    pub fn consume_one(&self, destination: &mut [u8]) -> usize {
        let buffer = match self.take() {
            Some(buffer) => buffer,
            None => return 0,
        };
        let len = buffer.len();
        if destination.len() < len {
            self.lost_to_small_destination.fetch_add(1, Ordering::Relaxed);
            return 0;
        }
        destination[..len].copy_from_slice(buffer.as_bytes());
        len
    }

    pub fn pending(&self) -> usize {
        let slots = self.slots.lock();
        slots.a.is_some() as usize + slots.b.is_some() as usize
    }

    /// Buffers thrown away because both slots were full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Buffers lost because the reader's destination was too small.
    pub fn lost_to_small_destination(&self) -> u64 {
        self.lost_to_small_destination.load(Ordering::Relaxed)
    }
}
