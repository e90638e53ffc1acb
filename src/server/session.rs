//! Per-connection session state machine
//!
//! A session owns at most one command handle. A command is initiated,
//! optionally fed a descriptor and data, sent, and then its result sets are
//! walked with `next_result`. Retrieval rules for the current row:
//!
//! - `get_data` only for columns after every bound column, in ascending
//!   order; repeated calls on the same column continue where the last
//!   one stopped;
//! - `get_descriptor` only for the large column most recently read.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::constants::{format_status, msg_number, CancelScope, ResultKind, Severity, VERSION_TOKEN_LEN};
use crate::messages::{Chunk, CommandKind, LoginInfo, Reply, Request, Response, ServerMessage};
use crate::row::{BoundRow, DataFormat, DataType, Value};
use crate::transport::Envelope;
use crate::types::Descriptor;

use super::events::{ErrorAction, ServerError, ServerEvents};
use super::procs::{ProcContext, ResultSet};
use super::store::ServerRow;
use super::ServerHandle;

/// A result set waiting to be walked
#[derive(Debug)]
struct Pending {
    kind: ResultKind,
    formats: Vec<DataFormat>,
    rows: VecDeque<ServerRow>,
    /// Error message delivered with a `CmdFail` unit
    error: Option<ServerMessage>,
}

impl Pending {
    fn bare(kind: ResultKind) -> Self {
        Self {
            kind,
            formats: Vec::new(),
            rows: VecDeque::new(),
            error: None,
        }
    }

    fn failed(error: ServerMessage) -> Self {
        Self {
            error: Some(error),
            ..Self::bare(ResultKind::CmdFail)
        }
    }

    fn from_set(set: ResultSet) -> Self {
        Self {
            kind: set.kind,
            formats: set.formats,
            rows: set.rows.into_iter().map(ServerRow::plain).collect(),
            error: None,
        }
    }
}

/// Read position inside the current row
#[derive(Debug, Clone, Copy)]
struct ReadCursor {
    column: usize,
    offset: usize,
}

/// The result set being walked
#[derive(Debug)]
struct Current {
    formats: Vec<DataFormat>,
    rows: VecDeque<ServerRow>,
    binds: BTreeMap<usize, DataFormat>,
    row: Option<ServerRow>,
    cursor: Option<ReadCursor>,
}

#[derive(Debug)]
enum Initiated {
    Language(String),
    SendData {
        descriptor: Option<Descriptor>,
        data: BytesMut,
    },
}

#[derive(Debug, Default)]
struct CommandState {
    initiated: Option<Initiated>,
    results: VecDeque<Pending>,
    current: Option<Current>,
}

impl CommandState {
    fn busy(&self) -> bool {
        self.current.is_some() || !self.results.is_empty()
    }
}

/// What the session does after handling a request
enum Control {
    Reply(Reply),
    /// Reply, then end the session
    Close(Reply),
    /// End the session without replying
    Abort,
}

type Handled = std::result::Result<Response, ServerError>;

fn reject(number: u32, text: impl Into<String>) -> ServerError {
    ServerError::error(number, text)
}

pub(crate) struct ServerSession {
    id: u32,
    server: ServerHandle,
    events: Arc<dyn ServerEvents>,
    login: LoginInfo,
    command: Option<CommandState>,
    /// Messages to attach to the next reply
    outbox: Vec<ServerMessage>,
}

impl ServerSession {
    pub fn new(
        id: u32,
        server: ServerHandle,
        events: Arc<dyn ServerEvents>,
        login: LoginInfo,
    ) -> Self {
        Self {
            id,
            server,
            events,
            login,
            command: None,
            outbox: Vec::new(),
        }
    }

    pub async fn run(mut self, mut requests: mpsc::Receiver<Envelope>) {
        let mut shutdown = self.server.shared.shutdown.subscribe();
        let mut closing = *shutdown.borrow();

        loop {
            if closing && self.command.is_none() {
                tracing::debug!(session = self.id, "Session closing for shutdown");
                break;
            }
            tokio::select! {
                biased;
                envelope = requests.recv() => {
                    let Some(Envelope { request, reply }) = envelope else {
                        tracing::debug!(session = self.id, "Client disconnected");
                        break;
                    };
                    match self.handle(request) {
                        Control::Reply(r) => {
                            let _ = reply.send(r);
                        }
                        Control::Close(r) => {
                            let _ = reply.send(r);
                            break;
                        }
                        Control::Abort => break,
                    }
                }
                changed = shutdown.changed(), if !closing => {
                    closing = changed.is_err() || *shutdown.borrow();
                }
            }
        }
    }

    fn handle(&mut self, request: Request) -> Control {
        let name = request.name();
        tracing::trace!(session = self.id, request = name, "Request");

        if let Request::Logout = request {
            tracing::debug!(session = self.id, user = %self.login.username, "Logout");
            return Control::Close(self.reply(Response::Ok));
        }

        match self.dispatch(request) {
            Ok(response) => Control::Reply(self.reply(response)),
            Err(error) => {
                let error = error.in_session(self.id);
                match self.events.on_error(&error) {
                    ErrorAction::NotifyClient => {
                        let msg = error.to_message(self.server.name());
                        Control::Reply(self.reply(Response::Error(msg)))
                    }
                    ErrorAction::EndSession => Control::Abort,
                    ErrorAction::Shutdown => {
                        self.server.stop();
                        Control::Abort
                    }
                }
            }
        }
    }

    fn reply(&mut self, response: Response) -> Reply {
        Reply::new(response).with_messages(std::mem::take(&mut self.outbox))
    }

    fn notify(&mut self, msg: ServerMessage) {
        self.outbox.push(msg.from_server(self.server.name()));
    }

    fn command_mut(&mut self) -> std::result::Result<&mut CommandState, ServerError> {
        self.command
            .as_mut()
            .ok_or_else(|| reject(msg_number::NO_COMMAND, "No command handle is allocated."))
    }

    fn current_mut(&mut self) -> std::result::Result<&mut Current, ServerError> {
        self.command_mut()?
            .current
            .as_mut()
            .ok_or_else(|| reject(msg_number::NO_RESULT_SET, "No current result set."))
    }

    fn dispatch(&mut self, request: Request) -> Handled {
        match request {
            Request::AllocCommand => {
                if self.command.is_some() {
                    return Err(reject(
                        msg_number::COMMAND_IN_PROGRESS,
                        "The command handle is already allocated.",
                    ));
                }
                self.command = Some(CommandState::default());
                Ok(Response::Ok)
            }
            Request::Command(kind) => {
                let cmd = self.command_mut()?;
                if cmd.busy() {
                    return Err(reject(
                        msg_number::RESULTS_PENDING,
                        "Results of the previous command are pending.",
                    ));
                }
                cmd.initiated = Some(match kind {
                    CommandKind::Language(text) => Initiated::Language(text),
                    CommandKind::SendData => Initiated::SendData {
                        descriptor: None,
                        data: BytesMut::new(),
                    },
                });
                Ok(Response::Ok)
            }
            Request::SetDescriptor(d) => match &mut self.command_mut()?.initiated {
                Some(Initiated::SendData { descriptor, .. }) => {
                    *descriptor = Some(d);
                    Ok(Response::Ok)
                }
                _ => Err(reject(
                    msg_number::BAD_DESCRIPTOR,
                    "A descriptor can only be attached to a send-data command.",
                )),
            },
            Request::SendChunk(bytes) => match &mut self.command_mut()?.initiated {
                Some(Initiated::SendData {
                    descriptor: Some(_),
                    data,
                }) => {
                    data.extend_from_slice(&bytes);
                    Ok(Response::Ok)
                }
                _ => Err(reject(
                    msg_number::BAD_DESCRIPTOR,
                    "Data can only be sent after a descriptor is attached.",
                )),
            },
            Request::Send => self.send(),
            Request::NextResult => self.next_result(),
            Request::Describe { column } => {
                let current = self.current_mut()?;
                current
                    .formats
                    .get(column)
                    .cloned()
                    .map(Response::Format)
                    .ok_or_else(|| bad_column(column))
            }
            Request::Bind { column, format } => {
                let current = self.current_mut()?;
                let declared = current.formats.get(column).ok_or_else(|| bad_column(column))?;
                if declared.datatype != format.datatype {
                    return Err(reject(
                        msg_number::TYPE_MISMATCH,
                        format!(
                            "Column {} is {}, cannot bind as {}.",
                            column,
                            declared.datatype.name(),
                            format.datatype.name()
                        ),
                    ));
                }
                current.binds.insert(column, format);
                Ok(Response::Ok)
            }
            Request::Fetch => {
                let current = self.current_mut()?;
                current.cursor = None;
                current.row = current.rows.pop_front();
                let bound = current.row.as_ref().map(|row| {
                    BoundRow::new(
                        current
                            .binds
                            .keys()
                            .map(|&c| (c, row.values.get(c).cloned().unwrap_or(Value::Null)))
                            .collect(),
                    )
                });
                Ok(Response::Row(bound))
            }
            Request::GetData { column, max_len } => self.get_data(column, max_len),
            Request::GetDescriptor { column } => {
                let current = self.current_mut()?;
                let row = current
                    .row
                    .as_ref()
                    .ok_or_else(|| reject(msg_number::NO_CURRENT_ROW, "No current row."))?;
                if current.cursor.map(|c| c.column) != Some(column) {
                    return Err(reject(
                        msg_number::NOT_CURRENT_ITEM,
                        format!("Column {} is not the item being read.", column),
                    ));
                }
                match row.descriptors.get(column) {
                    Some(Some(d)) => Ok(Response::Descriptor(d.clone())),
                    _ => Err(reject(
                        msg_number::NOT_LARGE_FIELD,
                        format!("Column {} has no descriptor.", column),
                    )),
                }
            }
            Request::Cancel(scope) => {
                // Cancelling with no command or no results is a no-op
                if let Some(cmd) = self.command.as_mut() {
                    cmd.current = None;
                    if scope == CancelScope::All {
                        cmd.results.clear();
                        cmd.initiated = None;
                    }
                }
                Ok(Response::Ok)
            }
            Request::DropCommand => {
                self.command
                    .take()
                    .ok_or_else(|| reject(msg_number::NO_COMMAND, "No command handle is allocated."))?;
                Ok(Response::Ok)
            }
            Request::Logout => Ok(Response::Ok),
        }
    }

    fn send(&mut self) -> Handled {
        let initiated = self
            .command_mut()?
            .initiated
            .take()
            .ok_or_else(|| reject(msg_number::NO_COMMAND, "No command was initiated."))?;

        let results = match initiated {
            Initiated::Language(text) => {
                if let Some(echo) = self.events.on_command(&text) {
                    self.notify(echo);
                }
                self.execute_language(&text)?
            }
            Initiated::SendData { descriptor, data } => {
                let descriptor = descriptor.ok_or_else(|| {
                    reject(msg_number::BAD_DESCRIPTOR, "No descriptor was attached.")
                })?;
                self.write(&descriptor, data.freeze())
            }
        };
        self.command_mut()?.results = results;
        Ok(Response::Ok)
    }

    fn write(&mut self, descriptor: &Descriptor, data: Bytes) -> VecDeque<Pending> {
        match self.server.with_store(|store| store.write(descriptor, data)) {
            Ok(version) => {
                let format = DataFormat::new("txts", DataType::Binary)
                    .with_max_length(VERSION_TOKEN_LEN)
                    .with_status(format_status::TIMESTAMP);
                VecDeque::from([
                    Pending {
                        kind: ResultKind::Param,
                        formats: vec![format],
                        rows: VecDeque::from([ServerRow::plain(vec![Value::Binary(version)])]),
                        error: None,
                    },
                    Pending::bare(ResultKind::CmdDone),
                ])
            }
            Err(msg) => {
                tracing::debug!(session = self.id, number = msg.number, "Write rejected: {}", msg.text);
                VecDeque::from([Pending::failed(msg)])
            }
        }
    }

    fn execute_language(&mut self, text: &str) -> std::result::Result<VecDeque<Pending>, ServerError> {
        let mut results = VecDeque::new();
        for statement in text.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let words: Vec<&str> = statement.split_whitespace().collect();
            let outcome = match words.as_slice() {
                [select, star, from, table]
                    if select.eq_ignore_ascii_case("select")
                        && *star == "*"
                        && from.eq_ignore_ascii_case("from") =>
                {
                    self.select(table)
                }
                [exec, name, args @ ..]
                    if exec.eq_ignore_ascii_case("exec") || exec.eq_ignore_ascii_case("execute") =>
                {
                    self.exec(name, args)?
                }
                _ => Err(self.error_message(
                    msg_number::UNKNOWN_COMMAND,
                    format!("Unknown command '{}'.", statement),
                )),
            };
            match outcome {
                Ok(sets) => results.extend(sets),
                Err(msg) => {
                    results.push_back(Pending::failed(msg));
                    break;
                }
            }
        }
        Ok(results)
    }

    fn error_message(&self, number: u32, text: String) -> ServerMessage {
        ServerMessage::new(number, Severity::Error, text).from_server(self.server.name())
    }

    fn select(&self, table: &str) -> std::result::Result<Vec<Pending>, ServerMessage> {
        match self.server.with_store(|store| store.select(table)) {
            Some((formats, rows)) => Ok(vec![
                Pending {
                    kind: ResultKind::Row,
                    formats,
                    rows: rows.into(),
                    error: None,
                },
                Pending::bare(ResultKind::CmdDone),
            ]),
            None => Err(self.error_message(
                msg_number::UNKNOWN_OBJECT,
                format!("Object '{}' not found.", table),
            )),
        }
    }

    /// Outer `Err` is a server error raised by the procedure; inner `Err`
    /// fails the command
    #[allow(clippy::type_complexity)]
    fn exec(
        &self,
        name: &str,
        args: &[&str],
    ) -> std::result::Result<std::result::Result<Vec<Pending>, ServerMessage>, ServerError> {
        let Some(procedure) = self.server.procedure(name) else {
            return Ok(Err(self.error_message(
                msg_number::UNKNOWN_PROCEDURE,
                format!("Procedure '{}' not found.", name),
            )));
        };
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let ctx = ProcContext {
            server: &self.server,
            session: self.id,
            user: &self.login.username,
            args: &args,
        };
        match procedure(&ctx) {
            Ok(result) => {
                let mut sets: Vec<Pending> = result.sets.into_iter().map(Pending::from_set).collect();
                if let Some(status) = result.status {
                    sets.push(Pending::from_set(ResultSet::status(status)));
                }
                sets.push(Pending::bare(ResultKind::CmdDone));
                Ok(Ok(sets))
            }
            Err(e) if e.severity >= Severity::FatalProcess => Err(e),
            Err(e) => Ok(Err(e.to_message(self.server.name()))),
        }
    }

    fn next_result(&mut self) -> Handled {
        let server_name = self.server.name().to_string();
        let cmd = self.command_mut()?;
        if let Some(current) = &cmd.current {
            if !current.rows.is_empty() {
                return Err(reject(
                    msg_number::RESULTS_PENDING,
                    "Rows of the current result set are pending; fetch or cancel them.",
                ));
            }
        }
        cmd.current = None;

        let Some(next) = cmd.results.pop_front() else {
            return Ok(Response::Result(None));
        };
        let kind = next.kind;
        let error = next.error;
        cmd.current = Some(Current {
            formats: next.formats,
            rows: next.rows,
            binds: BTreeMap::new(),
            row: None,
            cursor: None,
        });
        if let Some(msg) = error {
            self.outbox.push(msg.from_server(server_name));
        }
        tracing::trace!(session = self.id, ?kind, "Next result");
        Ok(Response::Result(Some(kind)))
    }

    fn get_data(&mut self, column: usize, max_len: usize) -> Handled {
        let current = self.current_mut()?;
        let row = current
            .row
            .as_ref()
            .ok_or_else(|| reject(msg_number::NO_CURRENT_ROW, "No current row."))?;
        let value = row.values.get(column).ok_or_else(|| bad_column(column))?;

        if let Some((&bound, _)) = current.binds.range(column..).next() {
            return Err(reject(
                msg_number::BIND_ORDER,
                format!(
                    "Column {} cannot be read after column {} was bound.",
                    column, bound
                ),
            ));
        }
        let offset = match current.cursor {
            Some(c) if c.column == column => c.offset,
            Some(c) if c.column > column => {
                return Err(reject(
                    msg_number::BIND_ORDER,
                    format!("Column {} was already passed; reading is at column {}.", column, c.column),
                ))
            }
            _ => 0,
        };

        let bytes = value.to_bytes();
        let end = offset.saturating_add(max_len).min(bytes.len());
        let data = bytes.slice(offset.min(end)..end);
        current.cursor = Some(ReadCursor {
            column,
            offset: end,
        });
        Ok(Response::Chunk(Chunk {
            data,
            item_complete: end == bytes.len(),
        }))
    }
}

fn bad_column(column: usize) -> ServerError {
    reject(msg_number::BAD_COLUMN, format!("Column {} does not exist.", column))
}
