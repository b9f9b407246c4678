//! The client-supplied shared payload buffer.

use std::sync::Mutex;

/// Byte buffer shared between the engine and the client.
///
/// The mix context is the only writer; the client reads a region only after
/// the corresponding [`CapturePacket`](crate::CapturePacket) has been
/// delivered, so reader and writer never touch the same region at the same
/// time. The interior lock is held only for the duration of one copy.
#[derive(Debug)]
pub struct SharedBuffer {
    data: Mutex<Box<[u8]>>,
    len: usize,
}

impl SharedBuffer {
    /// Creates a zero-filled buffer of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u8; len].into_boxed_slice()),
            len,
        }
    }

    /// Size of the buffer in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies `bytes` into the buffer at `offset`.
    ///
    /// The engine validates regions at enqueue time; a caller passing an
    /// out-of-range region is a bug, so this panics rather than truncating.
    pub(crate) fn write_at(&self, offset: usize, bytes: &[u8]) {
        let mut data = self.data.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Fills `len` bytes at `offset` with `value`.
    pub(crate) fn fill(&self, offset: usize, len: usize, value: u8) {
        let mut data = self.data.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        data[offset..offset + len].fill(value);
    }

    /// Copies `len` bytes at `offset` out of the buffer.
    ///
    /// Client-side accessor for delivered regions.
    pub fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        let data = self.data.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        data[offset..offset + len].to_vec()
    }
}
