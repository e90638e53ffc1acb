//! Protocol messages
//!
//! This module contains the request and reply types exchanged between a
//! client [`Connection`](crate::Connection) and a server session. Each
//! request gets exactly one reply; server messages (informational echoes
//! and errors) ride along on the reply that produced them.

mod reply;
mod request;

pub use reply::{Chunk, Reply, Response, ServerMessage};
pub use request::{CommandKind, LoginInfo, Request};
