//! Command handles
//!
//! [`CommandIo`] is the row-oriented command protocol the higher layers
//! drive: initiate a command, submit it, walk its result units, bind and
//! fetch rows, read unbound columns in pieces, and cancel what is left.
//! [`Command`] implements it on top of a [`Connection`].
//!
//! # Retrieval order
//!
//! Once any column of a row is bound, unbound columns can only be read with
//! [`CommandIo::get_chunk`] in ascending column order, and only columns that
//! come after every bound column. The server rejects anything else.

use bytes::BytesMut;

use crate::connection::Connection;
use crate::constants::{CancelScope, ResultKind};
use crate::error::{Error, Result};
use crate::messages::{Chunk, CommandKind, Request, Response, ServerMessage};
use crate::row::{BoundRow, DataFormat};
use crate::types::Descriptor;

/// The row-oriented command protocol
#[async_trait::async_trait]
pub trait CommandIo: Send {
    /// Initiate a language command
    async fn language(&mut self, text: &str) -> Result<()>;

    /// Initiate a large-field write; follow with [`set_descriptor`](Self::set_descriptor)
    async fn send_data_command(&mut self) -> Result<()>;

    /// Attach the descriptor of the field a `send_data_command` writes
    async fn set_descriptor(&mut self, descriptor: &Descriptor) -> Result<()>;

    /// Hand over one piece of the value being written
    async fn send_chunk(&mut self, data: &[u8]) -> Result<()>;

    /// Flush buffered pieces and submit the command
    async fn send(&mut self) -> Result<()>;

    /// Advance to the next result unit; `None` once results are exhausted
    async fn next_result(&mut self) -> Result<Option<ResultKind>>;

    /// Describe a column of the current result set
    async fn describe(&mut self, column: usize) -> Result<DataFormat>;

    /// Bind a column of the current result set
    async fn bind(&mut self, column: usize, format: &DataFormat) -> Result<()>;

    /// Fetch the next row; `None` once the result set has no more rows
    async fn fetch(&mut self) -> Result<Option<BoundRow>>;

    /// Read at most `max_len` bytes of an unbound column of the current row
    async fn get_chunk(&mut self, column: usize, max_len: usize) -> Result<Chunk>;

    /// Get the descriptor of the large field most recently read
    async fn get_descriptor(&mut self, column: usize) -> Result<Descriptor>;

    /// Discard the current result set or every remaining result
    async fn cancel(&mut self, scope: CancelScope) -> Result<()>;

    /// Release the command handle
    async fn release(&mut self) -> Result<()>;

    /// Take the most recent error message the server attached to a reply
    fn take_server_error(&mut self) -> Option<ServerMessage>;
}

#[async_trait::async_trait]
impl<T: CommandIo + ?Sized> CommandIo for &mut T {
    async fn language(&mut self, text: &str) -> Result<()> {
        (**self).language(text).await
    }

    async fn send_data_command(&mut self) -> Result<()> {
        (**self).send_data_command().await
    }

    async fn set_descriptor(&mut self, descriptor: &Descriptor) -> Result<()> {
        (**self).set_descriptor(descriptor).await
    }

    async fn send_chunk(&mut self, data: &[u8]) -> Result<()> {
        (**self).send_chunk(data).await
    }

    async fn send(&mut self) -> Result<()> {
        (**self).send().await
    }

    async fn next_result(&mut self) -> Result<Option<ResultKind>> {
        (**self).next_result().await
    }

    async fn describe(&mut self, column: usize) -> Result<DataFormat> {
        (**self).describe(column).await
    }

    async fn bind(&mut self, column: usize, format: &DataFormat) -> Result<()> {
        (**self).bind(column, format).await
    }

    async fn fetch(&mut self) -> Result<Option<BoundRow>> {
        (**self).fetch().await
    }

    async fn get_chunk(&mut self, column: usize, max_len: usize) -> Result<Chunk> {
        (**self).get_chunk(column, max_len).await
    }

    async fn get_descriptor(&mut self, column: usize) -> Result<Descriptor> {
        (**self).get_descriptor(column).await
    }

    async fn cancel(&mut self, scope: CancelScope) -> Result<()> {
        (**self).cancel(scope).await
    }

    async fn release(&mut self) -> Result<()> {
        (**self).release().await
    }

    fn take_server_error(&mut self) -> Option<ServerMessage> {
        (**self).take_server_error()
    }
}

/// A command handle allocated on a [`Connection`]
///
/// Holding a `Command` borrows its connection mutably, so a connection has
/// at most one command in flight. A command dropped without
/// [`release`](CommandIo::release) is released before the connection
/// allocates the next one.
pub struct Command<'c> {
    conn: &'c mut Connection,
    send_buffer: BytesMut,
    last_error: Option<ServerMessage>,
    released: bool,
}

impl<'c> Command<'c> {
    pub(crate) fn new(conn: &'c mut Connection) -> Self {
        let capacity = conn.config().packet_size;
        Self {
            conn,
            send_buffer: BytesMut::with_capacity(capacity),
            last_error: None,
            released: false,
        }
    }

    /// Id of the owning connection
    pub fn connection_id(&self) -> u32 {
        self.conn.id()
    }

    /// Whether the handle has been released
    pub fn is_released(&self) -> bool {
        self.released
    }

    async fn call(&mut self, request: Request) -> Result<Response> {
        if self.released {
            return Err(Error::Internal(format!(
                "{} on a released command",
                request.name()
            )));
        }
        let name = request.name();
        tracing::trace!(conn_id = self.conn.id(), request = name, "Command request");

        let reply = self.conn.round_trip(request).await?;
        if let Some(err) = reply.messages.iter().rev().find(|m| m.is_error()) {
            self.last_error = Some(err.clone());
        }
        match reply.response {
            Response::Error(msg) => {
                tracing::debug!(
                    request = name,
                    number = msg.number,
                    "Server rejected request: {}",
                    msg.text
                );
                self.last_error = Some(msg.clone());
                Err(Error::Server {
                    number: msg.number,
                    text: msg.text,
                })
            }
            response => Ok(response),
        }
    }

    async fn call_ok(&mut self, request: Request) -> Result<()> {
        let name = request.name();
        match self.call(request).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected(name, &other)),
        }
    }

    async fn flush(&mut self) -> Result<()> {
        if self.send_buffer.is_empty() {
            return Ok(());
        }
        let data = self.send_buffer.split().freeze();
        tracing::trace!(len = data.len(), "Flushing send buffer");
        self.call_ok(Request::SendChunk(data)).await
    }
}

fn unexpected(request: &str, response: &Response) -> Error {
    Error::protocol(format!("unexpected reply to {}: {:?}", request, response))
}

#[async_trait::async_trait]
impl CommandIo for Command<'_> {
    async fn language(&mut self, text: &str) -> Result<()> {
        self.call_ok(Request::Command(CommandKind::Language(text.to_string())))
            .await
    }

    async fn send_data_command(&mut self) -> Result<()> {
        self.send_buffer.clear();
        self.call_ok(Request::Command(CommandKind::SendData)).await
    }

    async fn set_descriptor(&mut self, descriptor: &Descriptor) -> Result<()> {
        self.call_ok(Request::SetDescriptor(descriptor.clone())).await
    }

    async fn send_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.send_buffer.extend_from_slice(data);
        if self.send_buffer.len() >= self.conn.config().packet_size {
            self.flush().await?;
        }
        Ok(())
    }

    async fn send(&mut self) -> Result<()> {
        self.flush().await?;
        self.call_ok(Request::Send).await
    }

    async fn next_result(&mut self) -> Result<Option<ResultKind>> {
        match self.call(Request::NextResult).await? {
            Response::Result(kind) => Ok(kind),
            other => Err(unexpected("next_result", &other)),
        }
    }

    async fn describe(&mut self, column: usize) -> Result<DataFormat> {
        match self.call(Request::Describe { column }).await? {
            Response::Format(format) => Ok(format),
            other => Err(unexpected("describe", &other)),
        }
    }

    async fn bind(&mut self, column: usize, format: &DataFormat) -> Result<()> {
        self.call_ok(Request::Bind {
            column,
            format: format.clone(),
        })
        .await
    }

    async fn fetch(&mut self) -> Result<Option<BoundRow>> {
        match self.call(Request::Fetch).await? {
            Response::Row(row) => Ok(row),
            other => Err(unexpected("fetch", &other)),
        }
    }

    async fn get_chunk(&mut self, column: usize, max_len: usize) -> Result<Chunk> {
        match self.call(Request::GetData { column, max_len }).await? {
            Response::Chunk(chunk) if chunk.data.len() <= max_len => Ok(chunk),
            Response::Chunk(chunk) => Err(Error::protocol(format!(
                "server returned {} bytes for a {} byte read",
                chunk.data.len(),
                max_len
            ))),
            other => Err(unexpected("get_data", &other)),
        }
    }

    async fn get_descriptor(&mut self, column: usize) -> Result<Descriptor> {
        match self.call(Request::GetDescriptor { column }).await? {
            Response::Descriptor(descriptor) => Ok(descriptor),
            other => Err(unexpected("get_descriptor", &other)),
        }
    }

    async fn cancel(&mut self, scope: CancelScope) -> Result<()> {
        self.call_ok(Request::Cancel(scope)).await
    }

    async fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        // Marked before the round trip: a failed drop is not retried.
        self.released = true;
        self.send_buffer.clear();
        let reply = self.conn.round_trip(Request::DropCommand).await?;
        match reply.response {
            Response::Ok => Ok(()),
            Response::Error(msg) => Err(Error::Server {
                number: msg.number,
                text: msg.text,
            }),
            other => Err(unexpected("drop_command", &other)),
        }
    }

    fn take_server_error(&mut self) -> Option<ServerMessage> {
        self.last_error.take()
    }
}

impl Drop for Command<'_> {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(
                conn_id = self.conn.id(),
                "Command dropped without release; releasing before next command"
            );
            self.conn.mark_orphaned();
        }
    }
}
