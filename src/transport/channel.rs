//! Channel transport implementation
//!
//! Each request travels in an [`Envelope`] together with a one-shot reply
//! slot. The receiving half belongs to the server session task.

use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::messages::{Reply, Request};

use super::Transport;

/// A request paired with the slot its reply goes into
#[derive(Debug)]
pub struct Envelope {
    /// The request
    pub request: Request,
    /// Where the session sends the reply
    pub reply: oneshot::Sender<Reply>,
}

/// Transport over an in-memory request channel
pub struct ChannelTransport {
    /// Request sender; `None` once closed
    tx: Option<mpsc::Sender<Envelope>>,
}

impl ChannelTransport {
    /// Create a connected transport and the receiver a session reads from
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    fn sender(&self) -> Result<&mpsc::Sender<Envelope>> {
        self.tx.as_ref().ok_or(Error::ConnectionClosed)
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn round_trip(&mut self, request: Request) -> Result<Reply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let name = request.name();

        self.sender()?
            .send(Envelope {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        let reply = reply_rx.await.map_err(|_| {
            tracing::debug!(request = name, "Session dropped the reply slot");
            Error::ConnectionClosed
        })?;
        Ok(reply)
    }

    fn is_connected(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    async fn close(&mut self) -> Result<()> {
        self.tx.take();
        Ok(())
    }
}
