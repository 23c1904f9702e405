//! Streaming writer for one capture batch.
//!
//! Layout of a buffer (all integers big-endian):
//!
//! ```text
//! BatchStart  := 0x01
//! SampleStart := 0x02, thread: i32, native id: i32, name: String
//! Frame       := code: i16                 (code > 0, reference to an earlier definition)
//!              | -code: i16, name: String  (new definition of code)
//! SampleEnd   := 0: i16
//! BatchEnd    := 0x06
//! String      := length: i32, length UTF-16 code units (2 bytes each)
//! ```
//!
//! Codes are scoped to one buffer. The writer never grows its buffer: a record that does not
//! fit is dropped whole, and so is every record after it, except the closing markers which
//! always have room kept back for them. A truncated buffer is therefore still well formed.

use std::collections::HashMap;

use crate::exchange::CaptureBuffer;
use crate::types::{MethodId, ThreadHandle, ThreadIdentity};

pub const BATCH_START: u8 = 0x01;
pub const SAMPLE_START: u8 = 0x02;
pub const BATCH_END: u8 = 0x06;
pub const SAMPLE_END: i16 = 0;

/// Largest code a buffer can assign.
pub const MAX_CODE: i16 = i16::MAX;

// SampleEnd + BatchEnd.
const CLOSING_RESERVE: usize = 3;

/// Smallest buffer that can hold a batch start and both closing markers.
pub const MIN_BUFFER_CAPACITY: usize = 1 + CLOSING_RESERVE;

pub struct BatchWriter {
    buf: Vec<u8>,
    capacity: usize,
    codes: HashMap<MethodId, i16>,
    in_sample: bool,
    truncated: bool,
    finished: bool,
    dropped_records: usize,
}

impl BatchWriter {
    /// Allocates the whole buffer up front. Do this before suspending anything.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_BUFFER_CAPACITY);
        BatchWriter {
            buf: Vec::with_capacity(capacity),
            capacity,
            codes: HashMap::new(),
            in_sample: false,
            truncated: false,
            finished: false,
            dropped_records: 0,
        }
    }

    pub fn start_batch(&mut self) {
        // Room for timestamp and format version goes here once the reader knows about them.
        self.write_record(&[BATCH_START]);
    }

    pub fn start_sample(&mut self, thread: ThreadHandle, identity: &ThreadIdentity) {
        debug_assert!(!self.in_sample, "start_sample inside an open sample");
        let name_len = string_len(&identity.name);
        if !self.reserve(1 + 4 + 4 + name_len) {
            return;
        }
        self.buf.push(SAMPLE_START);
        // The wire only carries the low 32 bits of the handle.
        self.put_i32(thread.0 as u32 as i32);
        self.put_i32(identity.native_id as i32);
        self.put_string(&identity.name);
        self.in_sample = true;
    }

    /// Records one frame of the open sample and returns whether it was written. `name` is only
    /// written the first time `method` shows up in this buffer.
    pub fn record_frame(&mut self, method: MethodId, name: &str) -> bool {
        if !self.in_sample {
            return false;
        }
        if let Some(&code) = self.codes.get(&method) {
            if !self.reserve(2) {
                return false;
            }
            self.put_i16(code);
            return true;
        }

        if self.codes.len() >= MAX_CODE as usize {
            // Out of code space; handled like running out of bytes.
            self.truncate();
            return false;
        }
        let code = self.codes.len() as i16 + 1;
        if !self.reserve(2 + string_len(name)) {
            return false;
        }
        self.put_i16(-code);
        self.put_string(name);
        self.codes.insert(method, code);
        true
    }

    pub fn end_sample(&mut self) {
        if !self.in_sample {
            return;
        }
        // Always fits: every other record leaves CLOSING_RESERVE bytes behind it.
        self.put_i16(SAMPLE_END);
        self.in_sample = false;
    }

    pub fn end_batch(&mut self) {
        if self.finished {
            return;
        }
        self.end_sample();
        self.buf.push(BATCH_END);
        self.finished = true;
    }

    pub fn position(&self) -> usize {
        self.buf.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether any record had to be dropped.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn dropped_records(&self) -> usize {
        self.dropped_records
    }

    /// Number of distinct methods given a code so far.
    pub fn code_count(&self) -> usize {
        self.codes.len()
    }

    /// Closes the batch if needed and hands over the written bytes.
    pub fn finish(mut self) -> CaptureBuffer {
        self.end_batch();
        CaptureBuffer::new(self.buf)
    }

    fn write_record(&mut self, bytes: &[u8]) {
        if self.reserve(bytes.len()) {
            self.buf.extend_from_slice(bytes);
        }
    }

    /// Returns true if a record of `len` bytes may be written now.
    fn reserve(&mut self, len: usize) -> bool {
        if self.finished {
            return false;
        }
        if self.truncated || self.buf.len() + len + CLOSING_RESERVE > self.capacity {
            self.truncate();
            return false;
        }
        true
    }

    fn truncate(&mut self) {
        self.truncated = true;
        self.dropped_records += 1;
    }

    fn put_i16(&mut self, value: i16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn put_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn put_string(&mut self, value: &str) {
        let units = value.encode_utf16().count();
        self.put_i32(units as i32);
        for unit in value.encode_utf16() {
            self.buf.extend_from_slice(&unit.to_be_bytes());
        }
    }
}

/// Encoded size of a string, length prefix included.
fn string_len(value: &str) -> usize {
    4 + 2 * value.encode_utf16().count()
}
