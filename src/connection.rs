//! Client connections
//!
//! This module provides the [`Connection`] type: one logged-in session on a
//! server, owning its transport and the log of messages the server sent.
//!
//! # Example
//!
//! ```rust,ignore
//! use rowproto::{CommandIo, Config, Connection};
//!
//! let mut conn = Connection::connect(&connector, Config::new("srv", "sa", "")).await?;
//! let mut cmd = conn.command().await?;
//! cmd.language("select * from au_pix").await?;
//! cmd.send().await?;
//! ```

use std::sync::atomic::{AtomicU32, Ordering};

use crate::command::Command;
use crate::config::Config;
use crate::constants::{CancelScope, Severity};
use crate::error::{Error, Result};
use crate::messages::{Reply, Request, Response, ServerMessage};
use crate::transport::{Connector, Transport};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Logged in, commands may be allocated
    Ready,
    /// A transport failure left the session unusable
    Broken,
    /// Connection closed
    Closed,
}

/// Global counter for connection IDs
static CONNECTION_ID_COUNTER: AtomicU32 = AtomicU32::new(1);

/// A connection to a server
pub struct Connection {
    id: u32,
    state: ConnectionState,
    transport: Box<dyn Transport>,
    config: Config,
    messages: Vec<ServerMessage>,
    orphaned: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Log in to the server named by `config`
    ///
    /// Fails with [`Error::ConnectionTimeout`] when the login does not
    /// complete within `config.connect_timeout`.
    pub async fn connect(connector: &dyn Connector, config: Config) -> Result<Self> {
        config.validate()?;
        let login = config.login_info();

        let (transport, reply) = tokio::time::timeout(
            config.connect_timeout,
            connector.connect(&config.server_name, login),
        )
        .await
        .map_err(|_| Error::ConnectionTimeout(config.connect_timeout))??;

        let id = CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut conn = Self {
            id,
            state: ConnectionState::Ready,
            transport,
            config,
            messages: Vec::new(),
            orphaned: false,
        };
        conn.record(reply.messages);

        if let Response::Error(msg) = reply.response {
            conn.state = ConnectionState::Closed;
            return Err(Error::Server {
                number: msg.number,
                text: msg.text,
            });
        }

        tracing::debug!(
            conn_id = id,
            server = %conn.config.server_name,
            user = %conn.config.username,
            "Connected"
        );
        Ok(conn)
    }

    /// Get the connection ID
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Get the connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Check if the connection is closed
    pub fn is_closed(&self) -> bool {
        self.state != ConnectionState::Ready || !self.transport.is_connected()
    }

    /// Get the configuration the connection was opened with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Messages the server has sent on this connection, oldest first
    pub fn messages(&self) -> &[ServerMessage] {
        &self.messages
    }

    /// Take and clear the message log
    pub fn take_messages(&mut self) -> Vec<ServerMessage> {
        std::mem::take(&mut self.messages)
    }

    /// Allocate the command handle
    ///
    /// A handle dropped earlier without release is cancelled and released
    /// first.
    pub async fn command(&mut self) -> Result<Command<'_>> {
        if self.orphaned {
            self.release_orphan().await?;
        }
        match self.round_trip(Request::AllocCommand).await?.response {
            Response::Ok => Ok(Command::new(self)),
            Response::Error(msg) => Err(Error::Server {
                number: msg.number,
                text: msg.text,
            }),
            other => Err(Error::protocol(format!(
                "unexpected reply to alloc_command: {:?}",
                other
            ))),
        }
    }

    /// Log out and close the transport
    pub async fn close(&mut self) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        if self.state == ConnectionState::Ready {
            if let Err(e) = self.transport.round_trip(Request::Logout).await {
                tracing::debug!(conn_id = self.id, "Logout failed: {}", e);
            }
        }
        self.state = ConnectionState::Closed;
        self.transport.close().await
    }

    pub(crate) fn mark_orphaned(&mut self) {
        self.orphaned = true;
    }

    async fn release_orphan(&mut self) -> Result<()> {
        self.orphaned = false;
        for request in [Request::Cancel(CancelScope::All), Request::DropCommand] {
            let reply = self.round_trip(request).await?;
            if let Response::Error(msg) = reply.response {
                tracing::debug!(conn_id = self.id, "Orphaned command cleanup: {}", msg.text);
            }
        }
        Ok(())
    }

    /// Send one request and record the messages on its reply
    pub(crate) async fn round_trip(&mut self, request: Request) -> Result<Reply> {
        if self.state != ConnectionState::Ready {
            return Err(Error::ConnectionNotReady);
        }
        match self.transport.round_trip(request).await {
            Ok(reply) => {
                self.record(reply.messages.clone());
                Ok(reply)
            }
            Err(e) => {
                if e.is_connection_error() {
                    tracing::warn!(conn_id = self.id, "Connection lost: {}", e);
                    self.state = ConnectionState::Broken;
                }
                Err(e)
            }
        }
    }

    fn record(&mut self, messages: Vec<ServerMessage>) {
        for msg in messages {
            match msg.severity {
                Severity::Info => tracing::info!(
                    conn_id = self.id,
                    number = msg.number,
                    server = %msg.server_name,
                    "{}",
                    msg.text
                ),
                _ => tracing::warn!(
                    conn_id = self.id,
                    number = msg.number,
                    severity = ?msg.severity,
                    server = %msg.server_name,
                    "{}",
                    msg.text
                ),
            }
            self.messages.push(msg);
        }
    }
}
