//! Command sessions
//!
//! A [`CommandSession`] runs one command end to end: submit it, drain its
//! results through a [`ResultHandler`], and release the handle. Whatever
//! happens, the caller gets exactly one [`Outcome`] and the handle is
//! released exactly once.

use std::fmt;

use bytes::Bytes;

use crate::command::CommandIo;
use crate::constants::{CancelScope, DEFAULT_CHUNK_SIZE};
use crate::error::{Error, Result};
use crate::stream::{CancelPolicy, Drained, ResultHandler, ResultStream};
use crate::transfer::ChunkedTransfer;
use crate::types::Descriptor;

/// What a session submits
#[derive(Debug, Clone)]
pub enum Submission {
    /// A textual language command
    Language(String),
    /// A large-field write under `descriptor`
    SendData {
        /// Descriptor of the field being written, `total_length` set to
        /// the payload length
        descriptor: Descriptor,
        /// The new value
        payload: Bytes,
        /// Bytes handed over per call
        piece_size: usize,
    },
}

impl Submission {
    /// Shorthand for a language submission
    pub fn language(text: impl Into<String>) -> Self {
        Submission::Language(text.into())
    }
}

/// Where a session failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Initiating, streaming or submitting the command
    Submit,
    /// Draining the result stream
    Results,
    /// Releasing the command handle
    Release,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Submit => "submit",
            Stage::Results => "results",
            Stage::Release => "release",
        })
    }
}

/// The single result of a session
#[derive(Debug)]
pub enum Outcome {
    /// Every result was consumed
    Succeeded,
    /// The session failed in `stage`
    Failed {
        /// Stage that failed
        stage: Stage,
        /// The failure
        error: Error,
    },
    /// A handler stopped the stream early; the rest was cancelled
    Cancelled,
}

impl Outcome {
    /// Check if the session succeeded
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }

    /// The failing stage, if any
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Outcome::Failed { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// The failure, if any
    pub fn error(&self) -> Option<&Error> {
        match self {
            Outcome::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Turn a failure into `Err`; success and cancellation are `Ok`
    pub fn into_result(self) -> Result<()> {
        match self {
            Outcome::Failed { error, .. } => Err(error),
            Outcome::Succeeded | Outcome::Cancelled => Ok(()),
        }
    }
}

/// Runs one command to completion and releases it
pub struct CommandSession<C: CommandIo> {
    cmd: C,
    policy: CancelPolicy,
}

impl<C: CommandIo> CommandSession<C> {
    /// Wrap an allocated command handle
    pub fn new(cmd: C, policy: CancelPolicy) -> Self {
        Self { cmd, policy }
    }

    /// Submit, drain and release
    pub async fn run(mut self, submission: Submission, handler: &mut dyn ResultHandler) -> Outcome {
        let outcome = self.execute(submission, handler).await;

        match (outcome, self.cmd.release().await) {
            (outcome, Ok(())) => {
                tracing::debug!(?outcome, "Command session finished");
                outcome
            }
            (outcome @ Outcome::Failed { .. }, Err(e)) => {
                tracing::warn!("Release after failed command also failed: {}", e);
                outcome
            }
            (_, Err(e)) => Outcome::Failed {
                stage: Stage::Release,
                error: e,
            },
        }
    }

    async fn execute(&mut self, submission: Submission, handler: &mut dyn ResultHandler) -> Outcome {
        let location = match &submission {
            Submission::SendData { descriptor, .. } => Some(descriptor.location_hex()),
            Submission::Language(_) => None,
        };

        if let Err(error) = self.submit(submission).await {
            self.cancel_all().await;
            return Outcome::Failed {
                stage: Stage::Submit,
                error,
            };
        }

        let mut stream = ResultStream::new(&mut self.cmd, self.policy);
        if let Some(location) = location {
            stream = stream.for_location(location);
        }
        match stream.drain(handler).await {
            Ok(Drained::Completed) => Outcome::Succeeded,
            Ok(Drained::Stopped) => Outcome::Cancelled,
            Err(error) => {
                self.cancel_all().await;
                Outcome::Failed {
                    stage: Stage::Results,
                    error,
                }
            }
        }
    }

    async fn submit(&mut self, submission: Submission) -> Result<()> {
        match submission {
            Submission::Language(text) => {
                tracing::debug!(command = %text, "Submitting language command");
                self.cmd.language(&text).await?;
            }
            Submission::SendData {
                descriptor,
                payload,
                piece_size,
            } => {
                if !descriptor.is_initialized() {
                    return Err(Error::InvalidDescriptor(
                        "descriptor has no location or version".to_string(),
                    ));
                }
                if descriptor.total_length() != payload.len() {
                    return Err(Error::InvalidArgument(format!(
                        "descriptor declares {} bytes, payload has {}",
                        descriptor.total_length(),
                        payload.len()
                    )));
                }
                let transfer = ChunkedTransfer::new(DEFAULT_CHUNK_SIZE, piece_size)?;
                tracing::debug!(
                    location = %descriptor.location_hex(),
                    len = payload.len(),
                    log_change = descriptor.log_change(),
                    "Submitting large-field write"
                );
                self.cmd.send_data_command().await?;
                self.cmd.set_descriptor(&descriptor).await?;
                transfer.write_from(&mut self.cmd, &payload).await?;
            }
        }
        self.cmd.send().await
    }

    async fn cancel_all(&mut self) {
        if let Err(e) = self.cmd.cancel(CancelScope::All).await {
            tracing::debug!("Cancel all after failure: {}", e);
        }
    }
}
