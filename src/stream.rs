//! Result streams
//!
//! A command answers with an a-priori unknown sequence of result units.
//! [`ResultStream`] pulls them one at a time, classifies each into a
//! [`ResultUnit`] and, in [`ResultStream::drain`], dispatches it:
//!
//! | Unit | Action |
//! |------|--------|
//! | `Row` | [`ResultHandler::on_row`]; failure cancels all |
//! | `Parameter` | [`ResultHandler::on_parameter`]; failure cancels all |
//! | `Status` | cancel with [`CancelPolicy::on_status`], continue |
//! | `CommandSucceeded` / `CommandDone` | continue |
//! | `CommandFailed` | stop with an error |
//! | `Unclassified` | warn, cancel with [`CancelPolicy::on_unclassified`], continue |

use crate::command::CommandIo;
use crate::constants::{msg_number, CancelScope, ResultKind};
use crate::error::{Error, Result};

/// One classified item of a command's result stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultUnit {
    /// A row result set
    Row,
    /// A return parameter result set
    Parameter,
    /// A procedure return status
    Status,
    /// A command that returns no rows succeeded
    CommandSucceeded,
    /// One command of the batch is done
    CommandDone,
    /// The server failed to execute the command
    CommandFailed,
    /// Any other kind the stream does not handle
    Unclassified(ResultKind),
}

impl From<ResultKind> for ResultUnit {
    fn from(kind: ResultKind) -> Self {
        match kind {
            ResultKind::Row => ResultUnit::Row,
            ResultKind::Param => ResultUnit::Parameter,
            ResultKind::Status => ResultUnit::Status,
            ResultKind::CmdSucceed => ResultUnit::CommandSucceeded,
            ResultKind::CmdDone => ResultUnit::CommandDone,
            ResultKind::CmdFail => ResultUnit::CommandFailed,
            other => ResultUnit::Unclassified(other),
        }
    }
}

/// What a handler wants the stream to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep draining
    Continue,
    /// Cancel everything still pending and finish as cancelled
    Stop,
}

/// How a drain ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drained {
    /// The server reported the end of results
    Completed,
    /// A handler returned [`Flow::Stop`]
    Stopped,
}

/// Cancellation scopes used for units the stream does not hand to a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelPolicy {
    /// Scope cancelled when a status unit shows up
    pub on_status: CancelScope,
    /// Scope cancelled when an unclassified unit shows up
    pub on_unclassified: CancelScope,
}

impl Default for CancelPolicy {
    fn default() -> Self {
        Self {
            on_status: CancelScope::Current,
            on_unclassified: CancelScope::All,
        }
    }
}

/// Receives the units that carry data
///
/// A handler is called while the unit's result set is current and is
/// responsible for consuming it (bind and fetch rows, or cancel it). The
/// default implementations discard the result set.
#[async_trait::async_trait]
pub trait ResultHandler: Send {
    /// Handle a row result set
    async fn on_row(&mut self, cmd: &mut dyn CommandIo) -> Result<Flow> {
        cmd.cancel(CancelScope::Current).await?;
        Ok(Flow::Continue)
    }

    /// Handle a return parameter result set
    async fn on_parameter(&mut self, cmd: &mut dyn CommandIo) -> Result<Flow> {
        cmd.cancel(CancelScope::Current).await?;
        Ok(Flow::Continue)
    }
}

/// Handler that discards every result set
#[derive(Debug, Default, Clone, Copy)]
pub struct Discard;

impl ResultHandler for Discard {}

/// Pull-based iterator over the result units of one command
pub struct ResultStream<'a> {
    cmd: &'a mut dyn CommandIo,
    policy: CancelPolicy,
    location: Option<String>,
    finished: bool,
    units: usize,
}

impl<'a> ResultStream<'a> {
    /// Create a stream over a submitted command
    pub fn new(cmd: &'a mut dyn CommandIo, policy: CancelPolicy) -> Self {
        Self {
            cmd,
            policy,
            location: None,
            finished: false,
            units: 0,
        }
    }

    /// Name the large field a write targets, used in stale-version errors
    pub fn for_location(mut self, location_hex: impl Into<String>) -> Self {
        self.location = Some(location_hex.into());
        self
    }

    /// Number of units pulled so far
    pub fn units_seen(&self) -> usize {
        self.units
    }

    /// Whether the end of the stream (or a failure) has been reached
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Pull and classify the next unit; `None` at the end of results
    pub async fn next(&mut self) -> Result<Option<ResultUnit>> {
        if self.finished {
            return Ok(None);
        }
        match self.cmd.next_result().await {
            Ok(Some(kind)) => {
                self.units += 1;
                let unit = ResultUnit::from(kind);
                tracing::debug!(?unit, index = self.units, "Result unit");
                Ok(Some(unit))
            }
            Ok(None) => {
                self.finished = true;
                Ok(None)
            }
            Err(e) => {
                self.finished = true;
                Err(e)
            }
        }
    }

    /// Drive the stream to its end, dispatching units to `handler`
    ///
    /// On a handler error every remaining result is cancelled before the
    /// error is returned.
    pub async fn drain(&mut self, handler: &mut dyn ResultHandler) -> Result<Drained> {
        while let Some(unit) = self.next().await? {
            let flow = match unit {
                ResultUnit::Row | ResultUnit::Parameter => self.dispatch(handler, unit).await?,
                ResultUnit::Status => {
                    tracing::debug!(scope = ?self.policy.on_status, "Cancelling status result");
                    self.cmd.cancel(self.policy.on_status).await?;
                    Flow::Continue
                }
                ResultUnit::CommandSucceeded | ResultUnit::CommandDone => Flow::Continue,
                ResultUnit::CommandFailed => {
                    self.finished = true;
                    return Err(self.failure());
                }
                ResultUnit::Unclassified(kind) => {
                    tracing::warn!(
                        ?kind,
                        scope = ?self.policy.on_unclassified,
                        "Unexpected result kind, cancelling"
                    );
                    self.cmd.cancel(self.policy.on_unclassified).await?;
                    Flow::Continue
                }
            };

            if flow == Flow::Stop {
                tracing::debug!("Handler stopped the stream");
                self.cmd.cancel(CancelScope::All).await?;
                self.finished = true;
                return Ok(Drained::Stopped);
            }
        }
        Ok(Drained::Completed)
    }

    async fn dispatch(&mut self, handler: &mut dyn ResultHandler, unit: ResultUnit) -> Result<Flow> {
        let result = match unit {
            ResultUnit::Row => handler.on_row(&mut *self.cmd).await,
            ResultUnit::Parameter => handler.on_parameter(&mut *self.cmd).await,
            other => Err(Error::Internal(format!("no handler for {:?}", other))),
        };
        match result {
            Ok(flow) => Ok(flow),
            Err(e) => {
                tracing::debug!("Handler failed, cancelling all results: {}", e);
                if let Err(cancel_err) = self.cmd.cancel(CancelScope::All).await {
                    tracing::warn!("Cancel after handler failure failed: {}", cancel_err);
                }
                self.finished = true;
                Err(e)
            }
        }
    }

    fn failure(&mut self) -> Error {
        let msg = self.cmd.take_server_error();
        match msg {
            Some(m) if m.number == msg_number::STALE_VERSION => Error::StaleVersion {
                location: self
                    .location
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
            },
            other => Error::command_failed(other.as_ref()),
        }
    }
}
