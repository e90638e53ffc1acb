//! Server replies and messages

use bytes::Bytes;

use crate::constants::{ResultKind, Severity, MAX_MSG};
use crate::row::{BoundRow, DataFormat};
use crate::types::Descriptor;

/// A message raised by the server: an informational echo or an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    /// Message number
    pub number: u32,
    /// Severity
    pub severity: Severity,
    /// Message text (at most [`MAX_MSG`] bytes)
    pub text: String,
    /// Name of the server that raised it
    pub server_name: String,
}

impl ServerMessage {
    /// Create a message, truncating the text to [`MAX_MSG`] bytes
    pub fn new(number: u32, severity: Severity, text: impl Into<String>) -> Self {
        let mut text = text.into();
        if text.len() > MAX_MSG {
            let mut cut = MAX_MSG;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
        }
        Self {
            number,
            severity,
            text,
            server_name: String::new(),
        }
    }

    /// Set the originating server name
    pub fn from_server(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    /// Whether this message reports a failure
    pub fn is_error(&self) -> bool {
        self.severity.is_error()
    }
}

/// One piece of a large field read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Bytes read by this call
    pub data: Bytes,
    /// True when these bytes end the item
    pub item_complete: bool,
}

/// Body of a reply
#[derive(Debug, Clone)]
pub enum Response {
    /// Request accepted, nothing to return
    Ok,
    /// Next result unit kind, `None` once results are exhausted
    Result(Option<ResultKind>),
    /// Column format
    Format(DataFormat),
    /// Fetched row, `None` once the result set has no more rows
    Row(Option<BoundRow>),
    /// Large-field piece
    Chunk(Chunk),
    /// Large-field descriptor
    Descriptor(Descriptor),
    /// Request rejected
    Error(ServerMessage),
}

/// A reply: the response plus any messages raised while producing it
#[derive(Debug, Clone)]
pub struct Reply {
    /// Messages raised by the server since the previous reply
    pub messages: Vec<ServerMessage>,
    /// The response body
    pub response: Response,
}

impl Reply {
    /// Create a reply without messages
    pub fn new(response: Response) -> Self {
        Self {
            messages: Vec::new(),
            response,
        }
    }

    /// Attach messages
    pub fn with_messages(mut self, messages: Vec<ServerMessage>) -> Self {
        self.messages = messages;
        self
    }
}
