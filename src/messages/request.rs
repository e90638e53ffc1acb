//! Client requests

use std::fmt;

use bytes::Bytes;

use crate::constants::CancelScope;
use crate::row::DataFormat;
use crate::types::Descriptor;

/// Kind of command being initiated on a command handle
#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    /// A textual language command
    Language(String),
    /// A large-field write; a descriptor and the data follow
    SendData,
}

/// Identity presented when logging in
#[derive(Clone)]
pub struct LoginInfo {
    /// User name
    pub username: String,
    /// Password (never logged)
    password: String,
    /// Application name
    pub app_name: String,
}

impl LoginInfo {
    /// Create a login record
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        app_name: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            app_name: app_name.into(),
        }
    }

    /// Get the password
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for LoginInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginInfo")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("app_name", &self.app_name)
            .finish()
    }
}

/// A request on an established connection
#[derive(Debug, Clone)]
pub enum Request {
    /// Allocate the connection's command handle
    AllocCommand,
    /// Initiate a command on the handle
    Command(CommandKind),
    /// Attach the descriptor for a `SendData` command
    SetDescriptor(Descriptor),
    /// Forward buffered large-field data
    SendChunk(Bytes),
    /// Submit the initiated command for execution
    Send,
    /// Advance to the next result unit
    NextResult,
    /// Describe a column of the current result set
    Describe {
        /// Column index
        column: usize,
    },
    /// Bind a column of the current result set
    Bind {
        /// Column index
        column: usize,
        /// Format to bind with; its type must match the column
        format: DataFormat,
    },
    /// Fetch the next row of the current result set
    Fetch,
    /// Read up to `max_len` bytes of an unbound column of the current row
    GetData {
        /// Column index
        column: usize,
        /// Most bytes to return
        max_len: usize,
    },
    /// Get the descriptor of the large field most recently read
    GetDescriptor {
        /// Column index; must be the column most recently read
        column: usize,
    },
    /// Discard pending results
    Cancel(CancelScope),
    /// Release the command handle
    DropCommand,
    /// End the session
    Logout,
}

impl Request {
    /// Short request name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Request::AllocCommand => "alloc_command",
            Request::Command(_) => "command",
            Request::SetDescriptor(_) => "set_descriptor",
            Request::SendChunk(_) => "send_chunk",
            Request::Send => "send",
            Request::NextResult => "next_result",
            Request::Describe { .. } => "describe",
            Request::Bind { .. } => "bind",
            Request::Fetch => "fetch",
            Request::GetData { .. } => "get_data",
            Request::GetDescriptor { .. } => "get_descriptor",
            Request::Cancel(_) => "cancel",
            Request::DropCommand => "drop_command",
            Request::Logout => "logout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_debug_redacts_password() {
        let login = LoginInfo::new("sa", "secret", "getsend");
        let rendered = format!("{:?}", login);
        assert!(rendered.contains("sa"));
        assert!(!rendered.contains("secret"));
        assert_eq!(login.password(), "secret");
    }
}
