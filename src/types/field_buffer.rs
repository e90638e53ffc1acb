//! Fixed-capacity buffer for large-field reads

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};

/// A fixed-capacity byte buffer holding the part of a large value
/// retrieved so far.
///
/// `len() <= capacity()` always holds: [`append`](Self::append) refuses to
/// grow past the capacity, and the chunked reader stops before it would.
#[derive(Debug, Clone)]
pub struct FieldBuffer {
    /// The retrieved bytes
    data: BytesMut,
    /// Hard limit on `data.len()`
    capacity: usize,
}

impl FieldBuffer {
    /// Create an empty buffer with the given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Get the number of bytes held
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the buffer is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get the fixed capacity
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the remaining space
    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    /// Check if no more bytes fit
    #[inline]
    pub fn is_full(&self) -> bool {
        self.remaining() == 0
    }

    /// Append bytes, failing if they do not fit
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.remaining() {
            return Err(Error::BufferOverflow {
                needed: bytes.len(),
                available: self.remaining(),
            });
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Reset the cursor for a new retrieval
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Get the contents as a byte slice
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Copy the contents out as `Bytes`
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }

    /// Check whether the contents equal `expected` exactly
    pub fn matches(&self, expected: &[u8]) -> bool {
        self.as_slice() == expected
    }
}
