//! Read-modify-write of large fields
//!
//! [`UpdateOrchestrator`] rewrites one large field under optimistic
//! concurrency control:
//!
//! 1. **Reading**: select the row, bind the key column, read the large
//!    field in chunks and capture its [`Descriptor`] right away.
//! 2. **Validating**: optionally compare the value with what the caller
//!    expects. A mismatch is reported, not raised.
//! 3. **Writing**: send the new value under the descriptor, with the new
//!    length and change logging on.
//! 4. **ConfirmingVersion**: bind the new version token the server returns
//!    as a parameter result.
//!
//! The server refuses the write if another session changed the field since
//! the descriptor was read ([`Error::StaleVersion`]).

use std::fmt;

use bytes::Bytes;

use crate::command::CommandIo;
use crate::config::Config;
use crate::constants::CancelScope;
use crate::error::{Error, Result};
use crate::row::{DataFormat, Value};
use crate::session::{CommandSession, Outcome, Submission};
use crate::stream::{CancelPolicy, Flow, ResultHandler};
use crate::transfer::{ChunkedTransfer, ReadStatus};
use crate::types::{Descriptor, FieldBuffer};

/// State of the update machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    /// Nothing in progress
    Idle,
    /// Selecting the row and reading the field
    Reading,
    /// Comparing the value read with the expected one
    Validating,
    /// Sending the new value
    Writing,
    /// Binding the version token returned by the write
    ConfirmingVersion,
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UpdateState::Idle => "idle",
            UpdateState::Reading => "reading",
            UpdateState::Validating => "validating",
            UpdateState::Writing => "writing",
            UpdateState::ConfirmingVersion => "confirming version",
        })
    }
}

/// An update step failed
#[derive(Debug, thiserror::Error)]
#[error("update failed while {state}: {error}")]
pub struct UpdateFailure {
    /// State the machine was in
    pub state: UpdateState,
    /// The underlying error
    #[source]
    pub error: Error,
}

/// Which large field to update and how to reach it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldTarget {
    table: String,
    key_column: usize,
    field_column: usize,
    trailing: Vec<usize>,
}

impl FieldTarget {
    /// Target `field_column` of `table`, binding `key_column` ahead of it
    ///
    /// Once a column is bound, only later columns can be read in pieces,
    /// so the key column must come before the large field.
    pub fn new(table: impl Into<String>, key_column: usize, field_column: usize) -> Result<Self> {
        let table = table.into();
        if table.trim().is_empty() {
            return Err(Error::InvalidArgument("table name is empty".to_string()));
        }
        if key_column >= field_column {
            return Err(Error::InvalidArgument(format!(
                "key column {} must precede large field column {}",
                key_column, field_column
            )));
        }
        Ok(Self {
            table,
            key_column,
            field_column,
            trailing: Vec::new(),
        })
    }

    /// Also read these columns after the large field, in ascending order
    pub fn with_trailing(mut self, columns: &[usize]) -> Result<Self> {
        let mut last = self.field_column;
        for &column in columns {
            if column <= last {
                return Err(Error::InvalidArgument(format!(
                    "trailing column {} is not after column {}",
                    column, last
                )));
            }
            last = column;
        }
        self.trailing = columns.to_vec();
        Ok(self)
    }

    /// Table name
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Bound column
    pub fn key_column(&self) -> usize {
        self.key_column
    }

    /// Large field column
    pub fn field_column(&self) -> usize {
        self.field_column
    }

    /// Command that selects the target rows
    pub fn select_command(&self) -> String {
        format!("select * from {}", self.table)
    }
}

/// One row as seen by a read
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Value of the bound key column
    pub key: Value,
    /// The large field, possibly truncated
    pub value: Bytes,
    /// Whether `value` is the whole field
    pub status: ReadStatus,
    /// Descriptor captured right after the field was read
    pub descriptor: Descriptor,
    /// Columns read after the large field
    pub trailing: Vec<TrailingValue>,
}

impl Snapshot {
    /// The field as text (lossy)
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }

    /// Whether the large field and every trailing column were read whole
    pub fn is_complete(&self) -> bool {
        self.status == ReadStatus::Complete
            && self.trailing.iter().all(|t| t.status == ReadStatus::Complete)
    }
}

/// A column read after the large field
#[derive(Debug, Clone, PartialEq)]
pub struct TrailingValue {
    /// Column index
    pub column: usize,
    /// Decoded value; a truncated character value ends on a whole character
    pub value: Value,
    /// Whether `value` is the whole column
    pub status: ReadStatus,
}

/// Result of comparing a read with the expected value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    /// The value matched
    Matched,
    /// The value differed
    Mismatch {
        /// What the caller expected
        expected: Bytes,
        /// What was read
        actual: Bytes,
    },
}

impl Validation {
    /// Check for a match
    pub fn is_match(&self) -> bool {
        matches!(self, Validation::Matched)
    }
}

/// What a full update cycle produced
#[derive(Debug, Clone)]
pub struct UpdateReport {
    /// The row before the write
    pub before: Snapshot,
    /// Validation of `before`, when an expected value was given
    pub validation: Option<Validation>,
    /// The descriptor as written, carrying the server's new version token
    pub descriptor: Descriptor,
}

/// Drives read, validate, write and confirm for one [`FieldTarget`]
#[derive(Debug)]
pub struct UpdateOrchestrator {
    target: FieldTarget,
    transfer: ChunkedTransfer,
    field_capacity: usize,
    policy: CancelPolicy,
    state: UpdateState,
}

impl UpdateOrchestrator {
    /// Create an orchestrator using the sizes and policy in `config`
    pub fn new(target: FieldTarget, config: &Config) -> Result<Self> {
        if config.field_capacity == 0 {
            return Err(Error::InvalidArgument(
                "field capacity must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            target,
            transfer: ChunkedTransfer::from_config(config)?,
            field_capacity: config.field_capacity,
            policy: config.cancel_policy,
            state: UpdateState::Idle,
        })
    }

    /// Current state
    pub fn state(&self) -> UpdateState {
        self.state
    }

    /// The target field
    pub fn target(&self) -> &FieldTarget {
        &self.target
    }

    fn enter(&mut self, state: UpdateState) {
        tracing::debug!(from = %self.state, to = %state, table = %self.target.table, "Update state");
        self.state = state;
    }

    fn fail(&mut self, state: UpdateState, error: Error) -> UpdateFailure {
        tracing::warn!(%state, table = %self.target.table, "Update failed: {}", error);
        self.state = UpdateState::Idle;
        UpdateFailure { state, error }
    }

    /// Read every row of the target table
    pub async fn read_all<C: CommandIo>(
        &mut self,
        cmd: C,
    ) -> std::result::Result<Vec<Snapshot>, UpdateFailure> {
        self.enter(UpdateState::Reading);
        let mut reader = FieldReader {
            target: &self.target,
            transfer: self.transfer,
            capacity: self.field_capacity,
            rows: Vec::new(),
        };
        let outcome = CommandSession::new(cmd, self.policy)
            .run(Submission::language(self.target.select_command()), &mut reader)
            .await;
        let rows = reader.rows;

        match outcome {
            Outcome::Succeeded => {
                self.enter(UpdateState::Idle);
                Ok(rows)
            }
            Outcome::Cancelled => Err(self.fail(
                UpdateState::Reading,
                Error::Internal("read stopped early".to_string()),
            )),
            Outcome::Failed { error, .. } => Err(self.fail(UpdateState::Reading, error)),
        }
    }

    /// Read the first row of the target table
    pub async fn read<C: CommandIo>(
        &mut self,
        cmd: C,
    ) -> std::result::Result<Snapshot, UpdateFailure> {
        let mut rows = self.read_all(cmd).await?;
        if rows.is_empty() {
            return Err(self.fail(
                UpdateState::Reading,
                Error::InvalidArgument(format!("table {} has no rows", self.target.table)),
            ));
        }
        Ok(rows.swap_remove(0))
    }

    /// Compare a read with the expected value
    pub fn validate(&mut self, snapshot: &Snapshot, expected: &[u8]) -> Validation {
        self.enter(UpdateState::Validating);
        let validation = if snapshot.value.as_ref() == expected {
            tracing::debug!(len = expected.len(), "Value matches");
            Validation::Matched
        } else {
            tracing::warn!(
                expected = %String::from_utf8_lossy(expected),
                actual = %snapshot.text(),
                "Value does not match"
            );
            Validation::Mismatch {
                expected: Bytes::copy_from_slice(expected),
                actual: snapshot.value.clone(),
            }
        };
        self.enter(UpdateState::Idle);
        validation
    }

    /// Write `new_value` under `descriptor` and bind the new version token
    ///
    /// Returns the descriptor with the server's new version.
    pub async fn write<C: CommandIo>(
        &mut self,
        cmd: C,
        mut descriptor: Descriptor,
        new_value: impl Into<Bytes>,
    ) -> std::result::Result<Descriptor, UpdateFailure> {
        let payload = new_value.into();
        self.enter(UpdateState::Writing);

        descriptor.set_total_length(payload.len());
        descriptor.set_log_change(true);
        let old_version = Bytes::copy_from_slice(descriptor.version());

        let mut confirmer = VersionConfirmer::default();
        let outcome = CommandSession::new(cmd, self.policy)
            .run(
                Submission::SendData {
                    descriptor: descriptor.clone(),
                    payload,
                    piece_size: self.transfer.piece_size(),
                },
                &mut confirmer,
            )
            .await;

        let failed_in = if confirmer.entered {
            UpdateState::ConfirmingVersion
        } else {
            UpdateState::Writing
        };
        match outcome {
            Outcome::Succeeded => {}
            Outcome::Failed { error, .. } => return Err(self.fail(failed_in, error)),
            Outcome::Cancelled => {
                return Err(self.fail(
                    failed_in,
                    Error::Internal("write stopped early".to_string()),
                ))
            }
        }

        let new_version = match confirmer.version {
            Some(version) if version == old_version => {
                return Err(self.fail(
                    UpdateState::ConfirmingVersion,
                    Error::protocol("write returned the old version token"),
                ))
            }
            Some(version) => version,
            None => {
                return Err(self.fail(
                    UpdateState::ConfirmingVersion,
                    Error::protocol("write returned no version token"),
                ))
            }
        };

        self.enter(UpdateState::ConfirmingVersion);
        descriptor.set_version(new_version);
        tracing::info!(
            location = %descriptor.location_hex(),
            old = %hex::encode(&old_version),
            new = %descriptor.version_hex(),
            "Large field updated"
        );
        self.enter(UpdateState::Idle);
        Ok(descriptor)
    }

    /// Read, optionally validate, then write `new_value`
    ///
    /// `reader` and `writer` must come from different connections or the
    /// reader must already be released; each is consumed.
    pub async fn update<R: CommandIo, W: CommandIo>(
        &mut self,
        reader: R,
        writer: W,
        expected: Option<&[u8]>,
        new_value: impl Into<Bytes>,
    ) -> std::result::Result<UpdateReport, UpdateFailure> {
        let before = self.read(reader).await?;
        let validation = expected.map(|expected| self.validate(&before, expected));
        let descriptor = self
            .write(writer, before.descriptor.clone(), new_value)
            .await?;
        Ok(UpdateReport {
            before,
            validation,
            descriptor,
        })
    }
}

/// Row handler for the read step
struct FieldReader<'t> {
    target: &'t FieldTarget,
    transfer: ChunkedTransfer,
    capacity: usize,
    rows: Vec<Snapshot>,
}

#[async_trait::async_trait]
impl ResultHandler for FieldReader<'_> {
    async fn on_row(&mut self, cmd: &mut dyn CommandIo) -> Result<Flow> {
        let key_column = self.target.key_column;
        let field_column = self.target.field_column;

        let key_format = cmd.describe(key_column).await?;
        let field_format = cmd.describe(field_column).await?;
        if !field_format.datatype.is_large() {
            return Err(Error::InvalidArgument(format!(
                "column {} ({}) is not a large field",
                field_column, field_format.name
            )));
        }
        let mut trailing_formats: Vec<(usize, DataFormat)> = Vec::new();
        for &column in &self.target.trailing {
            trailing_formats.push((column, cmd.describe(column).await?));
        }

        cmd.bind(key_column, &key_format).await?;

        while let Some(row) = cmd.fetch().await? {
            let key = row.get(key_column).cloned().unwrap_or(Value::Null);

            let mut buffer = FieldBuffer::new(self.capacity);
            let status = self
                .transfer
                .read_into(&mut *cmd, field_column, &mut buffer)
                .await?;
            let descriptor = cmd.get_descriptor(field_column).await?;

            let mut trailing = Vec::with_capacity(trailing_formats.len());
            for (column, format) in &trailing_formats {
                let capacity = match format.max_length {
                    0 => self.capacity,
                    declared => declared,
                };
                let mut small = FieldBuffer::new(capacity);
                let status = self
                    .transfer
                    .read_into(&mut *cmd, *column, &mut small)
                    .await?;
                let value = match status {
                    ReadStatus::Complete => Value::from_bytes(format.datatype, small.as_slice())?,
                    ReadStatus::Truncated => {
                        tracing::warn!(column = *column, capacity, "Trailing column truncated");
                        Value::from_truncated_bytes(format.datatype, small.as_slice())?
                    }
                };
                trailing.push(TrailingValue {
                    column: *column,
                    value,
                    status,
                });
            }

            tracing::debug!(
                ?key,
                len = buffer.len(),
                ?status,
                version = %descriptor.version_hex(),
                "Read large field"
            );
            self.rows.push(Snapshot {
                key,
                value: buffer.to_bytes(),
                status,
                descriptor,
                trailing,
            });
        }
        Ok(Flow::Continue)
    }
}

/// Parameter handler for the confirm step
#[derive(Default)]
struct VersionConfirmer {
    entered: bool,
    version: Option<Bytes>,
}

#[async_trait::async_trait]
impl ResultHandler for VersionConfirmer {
    async fn on_parameter(&mut self, cmd: &mut dyn CommandIo) -> Result<Flow> {
        self.entered = true;

        let format = cmd.describe(0).await?;
        if !format.is_timestamp() {
            return Err(Error::UnexpectedParameter {
                expected: "timestamp".to_string(),
                actual: format.describe_kind(),
            });
        }
        cmd.bind(0, &format).await?;

        let row = cmd
            .fetch()
            .await?
            .ok_or_else(|| Error::protocol("version parameter has no row"))?;
        let version = match row.get(0) {
            Some(Value::Binary(bytes)) if !bytes.is_empty() => bytes.clone(),
            other => {
                return Err(Error::UnexpectedParameter {
                    expected: "timestamp".to_string(),
                    actual: format!("{:?}", other),
                })
            }
        };
        cmd.cancel(CancelScope::Current).await?;

        self.version = Some(version);
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::mock::{ScriptedCommand, Unit};
    use crate::constants::{format_status, msg_number, ResultKind, Severity};
    use crate::messages::ServerMessage;
    use crate::row::{BoundRow, DataType};

    const INITIAL: &[u8] = b"This is the initial value of the text field";
    const UPDATED: &[u8] = b"This is the text value after the first update";

    fn descriptor() -> Descriptor {
        Descriptor::new(
            Bytes::from_static(&[0, 0, 0, 7, 0, 0, 0, 0, 0, 1]),
            Bytes::from_static(&[0, 0, 0, 0, 0, 0, 0, 1]),
            INITIAL.len(),
        )
    }

    fn target() -> FieldTarget {
        FieldTarget::new("text_table", 0, 1).unwrap()
    }

    fn orchestrator() -> UpdateOrchestrator {
        UpdateOrchestrator::new(target(), &Config::default()).unwrap()
    }

    fn select_result() -> Unit {
        Unit::rows(ResultKind::Row, vec![Value::Integer(1)])
            .with_format(DataFormat::new("t", DataType::Text))
    }

    fn version_param(status: u32, version: &'static [u8]) -> Unit {
        let mut unit = Unit::bare(ResultKind::Param).with_format(
            DataFormat::new("txts", DataType::Binary)
                .with_max_length(8)
                .with_status(status),
        );
        unit.rows = [BoundRow::new(vec![(0, Value::Binary(Bytes::from_static(version)))])].into();
        unit
    }

    #[test]
    fn test_target_rejects_key_after_field() {
        assert!(FieldTarget::new("t", 1, 1).is_err());
        assert!(FieldTarget::new("t", 2, 1).is_err());
        assert!(FieldTarget::new("", 0, 1).is_err());
        assert!(target().with_trailing(&[1]).is_err());
        assert!(target().with_trailing(&[3, 2]).is_err());
        assert!(target().with_trailing(&[2, 3]).is_ok());
        assert_eq!(target().select_command(), "select * from text_table");
    }

    #[tokio::test]
    async fn test_read_captures_descriptor() {
        let mut cmd = ScriptedCommand::new(vec![select_result()]).with_field(INITIAL);
        cmd.descriptor = Some(descriptor());
        let mut orch = orchestrator();
        let snapshot = orch.read(&mut cmd).await.unwrap();
        assert_eq!(snapshot.value.as_ref(), INITIAL);
        assert_eq!(snapshot.status, ReadStatus::Complete);
        assert_eq!(snapshot.key, Value::Integer(1));
        assert_eq!(snapshot.descriptor, descriptor());
        assert_eq!(orch.state(), UpdateState::Idle);

        let bind = cmd.calls.iter().position(|c| c == "bind").unwrap();
        let first_read = cmd.calls.iter().position(|c| c == "get_chunk").unwrap();
        let capture = cmd.calls.iter().position(|c| c == "get_descriptor").unwrap();
        assert!(bind < first_read && first_read < capture);
        assert_eq!(cmd.releases, 1);
    }

    #[tokio::test]
    async fn test_read_failure_names_reading() {
        let mut cmd = ScriptedCommand::new(vec![select_result()]).with_field(INITIAL);
        cmd.fail_on = Some("get_descriptor");
        let failure = orchestrator().read(&mut cmd).await.unwrap_err();
        assert_eq!(failure.state, UpdateState::Reading);
    }

    #[test]
    fn test_validate_reports_without_failing() {
        let mut orch = orchestrator();
        let snapshot = Snapshot {
            key: Value::Integer(1),
            value: Bytes::from_static(INITIAL),
            status: ReadStatus::Complete,
            descriptor: descriptor(),
            trailing: Vec::new(),
        };
        assert!(orch.validate(&snapshot, INITIAL).is_match());
        let mismatch = orch.validate(&snapshot, UPDATED);
        assert!(matches!(mismatch, Validation::Mismatch { .. }));
        assert_eq!(orch.state(), UpdateState::Idle);
    }

    #[tokio::test]
    async fn test_write_binds_new_version() {
        let mut cmd = ScriptedCommand::new(vec![
            version_param(format_status::TIMESTAMP, &[0, 0, 0, 0, 0, 0, 0, 2]),
            Unit::bare(ResultKind::CmdDone),
        ]);
        let written = orchestrator()
            .write(&mut cmd, descriptor(), UPDATED)
            .await
            .unwrap();
        assert_eq!(written.version(), &[0, 0, 0, 0, 0, 0, 0, 2]);
        assert_eq!(written.location(), descriptor().location());

        let sent = cmd.descriptor.as_ref().unwrap();
        assert_eq!(sent.total_length(), UPDATED.len());
        assert!(sent.log_change());
        assert_eq!(&cmd.sent[..], UPDATED);
        assert_eq!(cmd.count("send_chunk"), UPDATED.len());
        assert_eq!(cmd.count("cancel_current"), 1);
    }

    #[tokio::test]
    async fn test_wrong_parameter_kind_is_protocol_violation() {
        let mut cmd = ScriptedCommand::new(vec![version_param(
            format_status::NONE,
            &[0, 0, 0, 0, 0, 0, 0, 2],
        )]);
        let failure = orchestrator()
            .write(&mut cmd, descriptor(), UPDATED)
            .await
            .unwrap_err();
        assert_eq!(failure.state, UpdateState::ConfirmingVersion);
        assert!(matches!(failure.error, Error::UnexpectedParameter { .. }));
        assert!(failure.error.is_protocol_violation());
        assert_eq!(cmd.releases, 1);
    }

    #[tokio::test]
    async fn test_unchanged_version_is_protocol_violation() {
        let mut cmd = ScriptedCommand::new(vec![version_param(
            format_status::TIMESTAMP,
            &[0, 0, 0, 0, 0, 0, 0, 1],
        )]);
        let failure = orchestrator()
            .write(&mut cmd, descriptor(), UPDATED)
            .await
            .unwrap_err();
        assert_eq!(failure.state, UpdateState::ConfirmingVersion);
        assert!(failure.error.is_protocol_violation());
    }

    #[tokio::test]
    async fn test_missing_version_is_protocol_violation() {
        let mut cmd = ScriptedCommand::new(vec![Unit::bare(ResultKind::CmdSucceed)]);
        let failure = orchestrator()
            .write(&mut cmd, descriptor(), UPDATED)
            .await
            .unwrap_err();
        assert_eq!(failure.state, UpdateState::ConfirmingVersion);
    }

    #[tokio::test]
    async fn test_stale_write_fails_in_writing() {
        let mut cmd = ScriptedCommand::new(vec![Unit::bare(ResultKind::CmdFail)]);
        cmd.server_error = Some(ServerMessage::new(
            msg_number::STALE_VERSION,
            Severity::Error,
            "stale",
        ));
        let mut orch = orchestrator();
        let failure = orch
            .write(&mut cmd, descriptor(), UPDATED)
            .await
            .unwrap_err();
        assert_eq!(failure.state, UpdateState::Writing);
        assert!(failure.error.is_stale_version());
        assert_eq!(orch.state(), UpdateState::Idle);
        assert!(failure.to_string().contains("writing"));
    }
}
