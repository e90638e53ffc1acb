//! Protocol constants
//!
//! Result kinds, cancellation scopes, message severities and numbers, and
//! the default sizes used for chunked transfer.

// =============================================================================
// Result Kinds
// =============================================================================

/// Kind of a result unit as announced by the server on `next_result`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultKind {
    /// Regular row results
    Row,
    /// Cursor row results
    Cursor,
    /// Return parameter results (e.g. a new version token)
    Param,
    /// Procedure return status
    Status,
    /// Informational message result set
    Message,
    /// Compute row results
    Compute,
    /// One command of a batch is done
    CmdDone,
    /// A command that returns no rows succeeded
    CmdSucceed,
    /// The server failed to execute a command
    CmdFail,
    /// Row format description only
    RowFormat,
    /// Compute format description only
    ComputeFormat,
    /// Describe results of a dynamic command
    Describe,
}

// =============================================================================
// Cancellation
// =============================================================================

/// How much of a command's pending results a cancel discards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelScope {
    /// Discard the rest of the current result set only
    Current,
    /// Discard every remaining result of the command
    All,
}

// =============================================================================
// Messages
// =============================================================================

/// Severity of a server message or server-side error
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Informational only
    Info,
    /// Something unusual, the command continues
    Warning,
    /// The request or command failed
    Error,
    /// Fatal to the client thread (session) that raised it
    FatalProcess,
    /// Fatal to the whole server
    FatalServer,
}

impl Severity {
    /// Whether the message reports a failure rather than information
    pub fn is_error(&self) -> bool {
        *self >= Severity::Error
    }
}

/// Server message numbers
#[allow(missing_docs)]
pub mod msg_number {
    pub const LOGIN_ECHO: u32 = 5555;
    pub const COMMAND_ECHO: u32 = 6666;
    pub const UNKNOWN_COMMAND: u32 = 7001;
    pub const UNKNOWN_OBJECT: u32 = 7002;
    pub const UNKNOWN_PROCEDURE: u32 = 7003;
    pub const NO_COMMAND: u32 = 7010;
    pub const COMMAND_IN_PROGRESS: u32 = 7011;
    pub const RESULTS_PENDING: u32 = 7012;
    pub const NO_RESULT_SET: u32 = 7013;
    pub const NO_CURRENT_ROW: u32 = 7014;
    pub const BAD_COLUMN: u32 = 7015;
    pub const BIND_ORDER: u32 = 7016;
    pub const NOT_CURRENT_ITEM: u32 = 7017;
    pub const NOT_LARGE_FIELD: u32 = 7018;
    pub const BAD_DESCRIPTOR: u32 = 7019;
    pub const LENGTH_MISMATCH: u32 = 7020;
    pub const STALE_VERSION: u32 = 7021;
    pub const TYPE_MISMATCH: u32 = 7022;
    pub const SESSION_LOST: u32 = 7030;
    pub const SERVER_FATAL: u32 = 7031;
}

// =============================================================================
// Data Format Status Flags
// =============================================================================

/// Status flags carried in a [`DataFormat`](crate::row::DataFormat)
#[allow(missing_docs)]
pub mod format_status {
    pub const NONE: u32 = 0x0000;
    pub const NULLABLE: u32 = 0x0001;
    pub const KEY: u32 = 0x0002;
    pub const UPDATABLE: u32 = 0x0004;
    /// The column is a version (timestamp) token
    pub const TIMESTAMP: u32 = 0x0010;
    pub const RETURN: u32 = 0x0020;
}

// =============================================================================
// Sizes and Names
// =============================================================================

/// Default chunk size for large-field reads. Kept small so that reads of
/// short values still go through several chunks.
pub const DEFAULT_CHUNK_SIZE: usize = 5;

/// Default piece size for large-field writes
pub const DEFAULT_PIECE_SIZE: usize = 1;

/// Default capacity of a [`FieldBuffer`](crate::types::FieldBuffer)
pub const DEFAULT_FIELD_CAPACITY: usize = 255;

/// Default client-side send buffer size before pieces are forwarded
pub const DEFAULT_PACKET_SIZE: usize = 512;

/// Maximum length of a server message text
pub const MAX_MSG: usize = 1024;

/// Length of the version tokens issued by the reference server
pub const VERSION_TOKEN_LEN: usize = 8;

/// Default server name
pub const DEFAULT_SERVER_NAME: &str = "rowproto_srv";

/// Name of the administrative stop procedure registered on start
pub const STOP_PROCEDURE: &str = "stop_srv";
