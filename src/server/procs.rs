//! Registered procedures
//!
//! `exec <name> [args...]` runs a procedure registered on the server. A
//! procedure returns any number of result sets plus an optional return
//! status.

use std::sync::Arc;

use crate::constants::{ResultKind, STOP_PROCEDURE};
use crate::error::Result;
use crate::row::{DataFormat, DataType, Value};

use super::events::ServerError;
use super::ServerHandle;

/// A result set produced by a procedure
#[derive(Debug, Clone)]
pub struct ResultSet {
    /// Kind announced to the client
    pub kind: ResultKind,
    /// Column formats
    pub formats: Vec<DataFormat>,
    /// Rows, one value per column
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    /// A result set of any kind
    pub fn new(kind: ResultKind, formats: Vec<DataFormat>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            kind,
            formats,
            rows,
        }
    }

    /// A regular row result set
    pub fn rows(formats: Vec<DataFormat>, rows: Vec<Vec<Value>>) -> Self {
        Self::new(ResultKind::Row, formats, rows)
    }

    /// A result unit without columns (e.g. `CmdDone`)
    pub fn bare(kind: ResultKind) -> Self {
        Self::new(kind, Vec::new(), Vec::new())
    }

    /// The status result set for a procedure return status
    pub fn status(status: i64) -> Self {
        Self::new(
            ResultKind::Status,
            vec![DataFormat::new("status", DataType::Int)],
            vec![vec![Value::Integer(status)]],
        )
    }
}

/// What a procedure returns
#[derive(Debug, Clone, Default)]
pub struct ProcResult {
    /// Result sets, in order
    pub sets: Vec<ResultSet>,
    /// Return status, sent after the result sets
    pub status: Option<i64>,
}

impl ProcResult {
    /// No results
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add a result set
    pub fn with_set(mut self, set: ResultSet) -> Self {
        self.sets.push(set);
        self
    }

    /// Set the return status
    pub fn with_status(mut self, status: i64) -> Self {
        self.status = Some(status);
        self
    }
}

/// Context a procedure runs in
#[derive(Debug)]
pub struct ProcContext<'a> {
    /// The server the procedure runs on
    pub server: &'a ServerHandle,
    /// Session id of the caller
    pub session: u32,
    /// User name of the caller
    pub user: &'a str,
    /// Arguments after the procedure name
    pub args: &'a [String],
}

/// A registered procedure
pub type Procedure =
    Arc<dyn Fn(&ProcContext<'_>) -> std::result::Result<ProcResult, ServerError> + Send + Sync>;

/// Register the administrative stop procedure on `handle`
pub fn register_stop(handle: &ServerHandle) -> Result<()> {
    handle.register_procedure(STOP_PROCEDURE, |ctx: &ProcContext<'_>| {
        tracing::info!(
            server = %ctx.server.name(),
            session = ctx.session,
            user = ctx.user,
            "Stop requested"
        );
        ctx.server.stop();
        Ok(ProcResult::empty())
    })
}
