//! Transport layer for client connections
//!
//! Carries requests to a server session and brings back its replies. The
//! byte layout of any network protocol is out of scope; the provided
//! [`ChannelTransport`] moves typed messages over Tokio channels.

mod channel;

pub use channel::{ChannelTransport, Envelope};

use crate::error::Result;
use crate::messages::{LoginInfo, Reply, Request};

/// Trait for transport implementations
#[async_trait::async_trait]
pub trait Transport: Send {
    /// Send a request and wait for its reply
    async fn round_trip(&mut self, request: Request) -> Result<Reply>;

    /// Check if the transport is connected
    fn is_connected(&self) -> bool;

    /// Close the connection
    async fn close(&mut self) -> Result<()>;
}

/// Opens transports to a named server
///
/// The reply returned with the transport is the server's answer to the
/// login: `Response::Ok` plus any greeting messages, or `Response::Error`
/// when the login was refused.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Open a session on `server_name` for the given login
    async fn connect(
        &self,
        server_name: &str,
        login: LoginInfo,
    ) -> Result<(Box<dyn Transport>, Reply)>;
}
