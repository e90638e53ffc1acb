//! Server lifecycle callbacks

use std::fmt;

use crate::constants::{msg_number, Severity};
use crate::error::Result;
use crate::messages::{LoginInfo, ServerMessage};

use super::{procs, ServerHandle};

/// An error raised inside the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// Message number
    pub number: u32,
    /// Severity, which decides what the server does about it
    pub severity: Severity,
    /// Description
    pub text: String,
    /// Session the error happened in, if any
    pub session: Option<u32>,
}

impl ServerError {
    /// Create an error with the given severity
    pub fn new(number: u32, severity: Severity, text: impl Into<String>) -> Self {
        Self {
            number,
            severity,
            text: text.into(),
            session: None,
        }
    }

    /// An ordinary error, reported to the client
    pub fn error(number: u32, text: impl Into<String>) -> Self {
        Self::new(number, Severity::Error, text)
    }

    /// An error that ends the session it happened in
    pub fn fatal_process(text: impl Into<String>) -> Self {
        Self::new(msg_number::SESSION_LOST, Severity::FatalProcess, text)
    }

    /// An error that stops the whole server
    pub fn fatal_server(text: impl Into<String>) -> Self {
        Self::new(msg_number::SERVER_FATAL, Severity::FatalServer, text)
    }

    pub(crate) fn in_session(mut self, session: u32) -> Self {
        self.session = Some(session);
        self
    }

    /// The message a client sees for this error
    pub fn to_message(&self, server_name: &str) -> ServerMessage {
        ServerMessage::new(self.number, self.severity, self.text.clone()).from_server(server_name)
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg {} ({:?}): {}", self.number, self.severity, self.text)
    }
}

impl From<ServerMessage> for ServerError {
    fn from(msg: ServerMessage) -> Self {
        Self::new(msg.number, msg.severity, msg.text)
    }
}

/// What the server does about an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Report it to the client and carry on
    NotifyClient,
    /// Log it and end the session
    EndSession,
    /// Stop the server
    Shutdown,
}

/// Callbacks the server loop invokes
///
/// All callbacks run on the server thread and must not block.
pub trait ServerEvents: Send + Sync + 'static {
    /// The server loop is up; register procedures here
    fn on_start(&self, handle: &ServerHandle) -> Result<()> {
        procs::register_stop(handle)
    }

    /// A client logged in; the returned message is sent back with the login
    fn on_connect(&self, _login: &LoginInfo) -> Option<ServerMessage> {
        None
    }

    /// A language command was submitted; the returned message goes back
    /// with the submit reply
    fn on_command(&self, _text: &str) -> Option<ServerMessage> {
        None
    }

    /// Classify an error raised while serving a session
    fn on_error(&self, error: &ServerError) -> ErrorAction {
        classify(error)
    }
}

/// Default severity classification
pub fn classify(error: &ServerError) -> ErrorAction {
    match error.severity {
        Severity::FatalServer => ErrorAction::Shutdown,
        Severity::FatalProcess => ErrorAction::EndSession,
        _ => ErrorAction::NotifyClient,
    }
}

/// Events that echo logins and commands back to the client
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoEvents;

impl ServerEvents for EchoEvents {
    fn on_connect(&self, login: &LoginInfo) -> Option<ServerMessage> {
        Some(ServerMessage::new(
            msg_number::LOGIN_ECHO,
            Severity::Info,
            format!("User '{}' logged in.", login.username),
        ))
    }

    fn on_command(&self, text: &str) -> Option<ServerMessage> {
        Some(ServerMessage::new(
            msg_number::COMMAND_ECHO,
            Severity::Info,
            format!("Language handler called with string '{}'.", text),
        ))
    }

    fn on_error(&self, error: &ServerError) -> ErrorAction {
        let action = classify(error);
        match action {
            ErrorAction::Shutdown => {
                tracing::error!(number = error.number, session = ?error.session, "Fatal server error: {}", error.text)
            }
            ErrorAction::EndSession => {
                tracing::error!(number = error.number, session = ?error.session, "Fatal session error: {}", error.text)
            }
            ErrorAction::NotifyClient => {
                tracing::debug!(number = error.number, session = ?error.session, "{}", error.text)
            }
        }
        action
    }
}
