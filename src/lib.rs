#![warn(missing_docs)]

//! # rowproto
//!
//! An async client driver for row-oriented command/response servers.
//!
//! A client logs in, allocates a command handle, submits a command and walks
//! the sequence of result units the server answers with. Large text and
//! binary fields are read and written in chunks, and writes go through a
//! [`Descriptor`] whose version token gives optimistic concurrency: a write
//! under an outdated descriptor is rejected.
//!
//! ## Features
//!
//! - **Result streams** - every result unit is classified and dispatched;
//!   anything the caller did not ask for is cancelled at the right scope
//! - **Chunked transfer** - large fields are read into a bounded buffer in
//!   fixed-size chunks and written in small pieces
//! - **Optimistic concurrency** - read, validate, write and confirm the new
//!   version token in one [`UpdateOrchestrator`] cycle
//! - **Reference server** - an in-process [`server`] to run against
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rowproto::server::{Server, ServerConfig};
//! use rowproto::{Config, Connection, FieldTarget, UpdateOrchestrator};
//!
//! # async fn example() -> rowproto::Result<()> {
//! let server = Server::new(ServerConfig::default()).start().await?;
//! // ... create and seed a table on `server` ...
//!
//! let config = Config::new(server.name(), "sa", "");
//! let mut reader = Connection::connect(&server.connector(), config.clone()).await?;
//! let mut writer = Connection::connect(&server.connector(), config.clone()).await?;
//!
//! let target = FieldTarget::new("texttab", 0, 1)?;
//! let mut update = UpdateOrchestrator::new(target, &config)?;
//! let report = update
//!     .update(
//!         reader.command().await?,
//!         writer.command().await?,
//!         None,
//!         "This is the new value of the text field",
//!     )
//!     .await
//!     .map_err(|failure| failure.error)?;
//! println!("new version {}", report.descriptor.version_hex());
//! # Ok(())
//! # }
//! ```
//!
//! ## Lower level
//!
//! [`Connection::command`] hands out a [`Command`] implementing
//! [`CommandIo`]. Drive it directly, or wrap it in a [`CommandSession`] to
//! get a single [`Outcome`] and a guaranteed release:
//!
//! ```rust,no_run
//! use rowproto::{CancelPolicy, CommandSession, Connection, Discard, Submission};
//!
//! # async fn example(conn: &mut Connection) -> rowproto::Result<()> {
//! let outcome = CommandSession::new(conn.command().await?, CancelPolicy::default())
//!     .run(Submission::language("select * from texttab"), &mut Discard)
//!     .await;
//! outcome.into_result()?;
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod messages;
pub mod row;
pub mod server;
pub mod session;
pub mod stream;
pub mod transfer;
pub mod transport;
pub mod types;
pub mod update;

// Re-export commonly used types
pub use command::{Command, CommandIo};
pub use config::Config;
pub use connection::{Connection, ConnectionState};
pub use constants::{CancelScope, ResultKind, Severity};
pub use error::{Error, Result};
pub use messages::ServerMessage;
pub use row::{BoundRow, DataFormat, DataType, Value};
pub use session::{CommandSession, Outcome, Stage, Submission};
pub use stream::{CancelPolicy, Discard, Drained, Flow, ResultHandler, ResultStream, ResultUnit};
pub use transfer::{ChunkStatus, ChunkedTransfer, ReadStatus};
pub use types::{Descriptor, FieldBuffer};
pub use update::{
    FieldTarget, Snapshot, TrailingValue, UpdateFailure, UpdateOrchestrator, UpdateReport, UpdateState,
    Validation,
};
