//! Large-field descriptor
//!
//! A [`Descriptor`] is the server's handle on one large (text/image) field
//! value at a point in time. It is captured while reading the value and
//! presented back, unmodified apart from the declared length and the log
//! flag, when the value is rewritten.

use std::fmt;

use bytes::Bytes;

/// Location and version token for one large field value.
///
/// The location and version are opaque to the client. A descriptor read
/// from row R, column C is good for exactly one write to (R, C): the write
/// path takes it by value, and a fresh one must be read before writing
/// again.
#[derive(Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Server-assigned location of the value (table, row, column)
    pub(crate) location: Bytes,
    /// Version token identifying the last-modified state
    pub(crate) version: Bytes,
    /// Length in bytes of the value the descriptor refers to
    pub(crate) total_length: usize,
    /// Ask the server to record the update in its change log
    pub(crate) log_change: bool,
}

impl Descriptor {
    /// Create a descriptor from raw parts
    pub fn new(location: Bytes, version: Bytes, total_length: usize) -> Self {
        Self {
            location,
            version,
            total_length,
            log_change: false,
        }
    }

    /// Get the opaque location bytes
    pub fn location(&self) -> &[u8] {
        &self.location
    }

    /// Get the opaque version token
    pub fn version(&self) -> &[u8] {
        &self.version
    }

    /// Get the declared total length
    pub fn total_length(&self) -> usize {
        self.total_length
    }

    /// Whether the update should be change-logged
    pub fn log_change(&self) -> bool {
        self.log_change
    }

    /// Declare the length of the value about to be written
    pub fn set_total_length(&mut self, total_length: usize) {
        self.total_length = total_length;
    }

    /// Request (or not) that the server log the update
    pub fn set_log_change(&mut self, log_change: bool) {
        self.log_change = log_change;
    }

    /// Bind a new version token returned by the server after a write
    pub(crate) fn set_version(&mut self, version: Bytes) {
        self.version = version;
    }

    /// Location rendered as hex, for logs and errors
    pub fn location_hex(&self) -> String {
        hex::encode(&self.location)
    }

    /// Version rendered as hex, for logs and errors
    pub fn version_hex(&self) -> String {
        hex::encode(&self.version)
    }

    /// Check that both tokens are present
    pub fn is_initialized(&self) -> bool {
        !self.location.is_empty() && !self.version.is_empty()
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("location", &self.location_hex())
            .field("version", &self.version_hex())
            .field("total_length", &self.total_length)
            .field("log_change", &self.log_change)
            .finish()
    }
}
