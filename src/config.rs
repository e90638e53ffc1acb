//! Connection configuration
//!
//! This module provides configuration options for connecting to a server.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_FIELD_CAPACITY, DEFAULT_PACKET_SIZE, DEFAULT_PIECE_SIZE,
    DEFAULT_SERVER_NAME,
};
use crate::error::{Error, Result};
use crate::messages::LoginInfo;
use crate::stream::CancelPolicy;

/// Default application name sent at login
pub const DEFAULT_APP_NAME: &str = "rowproto";

/// Connection configuration
#[derive(Clone)]
pub struct Config {
    /// Name of the server to connect to
    pub server_name: String,
    /// Username for authentication
    pub username: String,
    /// Password for authentication (not displayed)
    password: String,
    /// Application name presented at login
    pub app_name: String,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Bytes requested per call when reading a large field
    pub chunk_size: usize,
    /// Bytes handed over per call when writing a large field
    pub send_piece_size: usize,
    /// Capacity of the buffer a large field is read into
    pub field_capacity: usize,
    /// Send pieces are buffered up to this many bytes before forwarding
    pub packet_size: usize,
    /// Cancellation scopes used while draining results
    pub cancel_policy: CancelPolicy,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("server_name", &self.server_name)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("app_name", &self.app_name)
            .field("connect_timeout", &self.connect_timeout)
            .field("chunk_size", &self.chunk_size)
            .field("send_piece_size", &self.send_piece_size)
            .field("field_capacity", &self.field_capacity)
            .field("packet_size", &self.packet_size)
            .field("cancel_policy", &self.cancel_policy)
            .finish()
    }
}

impl Config {
    /// Create a new configuration for the given server and credentials
    ///
    /// # Example
    ///
    /// ```rust
    /// use rowproto::Config;
    ///
    /// let config = Config::new("rowproto_srv", "sa", "secret");
    /// assert_eq!(config.chunk_size, 5);
    /// ```
    pub fn new(
        server_name: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            server_name: server_name.into(),
            username: username.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    /// Set connection timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the application name
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Set the read chunk size
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Set the write piece size
    pub fn send_piece_size(mut self, size: usize) -> Self {
        self.send_piece_size = size;
        self
    }

    /// Set the large-field buffer capacity
    pub fn field_capacity(mut self, capacity: usize) -> Self {
        self.field_capacity = capacity;
        self
    }

    /// Set the send packet size
    pub fn packet_size(mut self, size: usize) -> Self {
        self.packet_size = size;
        self
    }

    /// Set the cancellation policy
    pub fn cancel_policy(mut self, policy: CancelPolicy) -> Self {
        self.cancel_policy = policy;
        self
    }

    /// Get the password (for login)
    pub(crate) fn password(&self) -> &str {
        &self.password
    }

    /// Set the password
    pub fn set_password(&mut self, password: impl Into<String>) {
        self.password = password.into();
    }

    /// Build the login record presented to the server
    pub fn login_info(&self) -> LoginInfo {
        LoginInfo::new(&self.username, self.password(), &self.app_name)
    }

    /// Check sizes before they reach the protocol
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("chunk_size", self.chunk_size),
            ("send_piece_size", self.send_piece_size),
            ("field_capacity", self.field_capacity),
            ("packet_size", self.packet_size),
        ] {
            if value == 0 {
                return Err(Error::InvalidArgument(format!("{} must be at least 1", name)));
            }
        }
        if self.username.is_empty() {
            return Err(Error::InvalidArgument("username is empty".to_string()));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_name: DEFAULT_SERVER_NAME.to_string(),
            username: String::new(),
            password: String::new(),
            app_name: DEFAULT_APP_NAME.to_string(),
            connect_timeout: Duration::from_secs(10),
            chunk_size: DEFAULT_CHUNK_SIZE,
            send_piece_size: DEFAULT_PIECE_SIZE,
            field_capacity: DEFAULT_FIELD_CAPACITY,
            packet_size: DEFAULT_PACKET_SIZE,
            cancel_policy: CancelPolicy::default(),
        }
    }
}

/// Parse a connection string
///
/// Formats supported:
/// - `user@server`
/// - `user:password@server`
/// - `user` (default server name)
impl FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();

        if s.is_empty() {
            return Err(Error::InvalidConnectionString(
                "empty connection string".to_string(),
            ));
        }

        let (credentials, server) = match s.rsplit_once('@') {
            Some((_, "")) => {
                return Err(Error::InvalidConnectionString(
                    "missing server name after @".to_string(),
                ))
            }
            Some((credentials, server)) => (credentials, server),
            None => (s, DEFAULT_SERVER_NAME),
        };

        let (username, password) = credentials.split_once(':').unwrap_or((credentials, ""));

        if username.is_empty() {
            return Err(Error::InvalidConnectionString(
                "missing user name".to_string(),
            ));
        }

        Ok(Config::new(server, username, password))
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.username, self.server_name)
    }
}
