//! In-process reference server
//!
//! Serves the row-oriented command protocol over in-memory channels so a
//! client can be exercised without a network. The server loop runs on its
//! own OS thread with its own current-thread Tokio runtime; client calls
//! never run on that thread.
//!
//! Supported commands, separated by `;`:
//!
//! - `select * from <table>`
//! - `exec <procedure> [args...]`
//!
//! # Example
//!
//! ```rust,no_run
//! use rowproto::server::{EchoEvents, Server, ServerConfig};
//! use rowproto::{Config, Connection};
//!
//! # async fn example() -> rowproto::Result<()> {
//! let server = Server::new(ServerConfig::default())
//!     .with_events(EchoEvents)
//!     .start()
//!     .await?;
//! let mut conn = Connection::connect(&server.connector(), Config::new(server.name(), "sa", "")).await?;
//! conn.close().await?;
//! server.stop();
//! server.wait_stopped().await;
//! # Ok(())
//! # }
//! ```

mod events;
mod procs;
mod session;
mod store;

pub use events::{classify, EchoEvents, ErrorAction, ServerError, ServerEvents};
pub use procs::{register_stop, ProcContext, ProcResult, Procedure, ResultSet};
pub use store::ChangeRecord;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;

use crate::constants::DEFAULT_SERVER_NAME;
use crate::error::{Error, Result};
use crate::messages::{LoginInfo, Reply, Response, ServerMessage};
use crate::row::{DataFormat, Value};
use crate::transport::{ChannelTransport, Connector, Envelope, Transport};

use session::ServerSession;
use store::Store;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name clients connect to
    pub name: String,
    /// How long sessions may keep running after a stop before they are aborted
    pub grace_period: Duration,
    /// Pending logins the accept queue holds
    pub accept_capacity: usize,
    /// Pending requests each session queue holds
    pub request_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_SERVER_NAME.to_string(),
            grace_period: Duration::from_secs(5),
            accept_capacity: 16,
            request_capacity: 8,
        }
    }
}

impl ServerConfig {
    /// Configuration for a server called `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the shutdown grace period
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }
}

/// A login waiting for the server loop
struct Accept {
    login: LoginInfo,
    requests: mpsc::Receiver<Envelope>,
    reply: oneshot::Sender<Reply>,
}

struct Shared {
    config: ServerConfig,
    store: Mutex<Store>,
    procedures: Mutex<HashMap<String, Procedure>>,
    accept_tx: mpsc::Sender<Accept>,
    shutdown: watch::Sender<bool>,
    stopped: watch::Sender<bool>,
    next_session: AtomicU32,
}

/// Handle on a running server
///
/// Cheap to clone. Used to seed tables, register procedures, open client
/// connections and stop the server.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("name", &self.shared.config.name)
            .field("stopping", &self.is_stopping())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ServerHandle {
    /// Server name
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// A connector for client connections to this server
    pub fn connector(&self) -> ServerConnector {
        ServerConnector {
            handle: self.clone(),
        }
    }

    /// Register (or replace) a procedure callable with `exec <name>`
    pub fn register_procedure<F>(&self, name: &str, procedure: F) -> Result<()>
    where
        F: Fn(&ProcContext<'_>) -> std::result::Result<ProcResult, ServerError>
            + Send
            + Sync
            + 'static,
    {
        let key = name.trim().to_ascii_lowercase();
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(Error::InvalidArgument(format!(
                "invalid procedure name '{}'",
                name
            )));
        }
        tracing::debug!(server = %self.name(), procedure = %key, "Registered procedure");
        lock(&self.shared.procedures).insert(key, Arc::new(procedure));
        Ok(())
    }

    pub(crate) fn procedure(&self, name: &str) -> Option<Procedure> {
        lock(&self.shared.procedures)
            .get(&name.to_ascii_lowercase())
            .cloned()
    }

    /// Create a table
    pub fn create_table(&self, name: &str, columns: Vec<DataFormat>) -> Result<()> {
        lock(&self.shared.store).create_table(name, columns)
    }

    /// Append a row; returns its index
    pub fn insert_row(&self, table: &str, values: Vec<Value>) -> Result<usize> {
        lock(&self.shared.store).insert_row(table, values)
    }

    /// Current value of a cell
    pub fn value(&self, table: &str, row: usize, column: usize) -> Option<Value> {
        lock(&self.shared.store).value(table, row, column)
    }

    /// Current version token of a large cell
    pub fn version(&self, table: &str, row: usize, column: usize) -> Option<Bytes> {
        lock(&self.shared.store).version(table, row, column)
    }

    /// Logged large-field updates, oldest first
    pub fn change_log(&self) -> Vec<ChangeRecord> {
        lock(&self.shared.store).change_log().to_vec()
    }

    pub(crate) fn with_store<R>(&self, f: impl FnOnce(&mut Store) -> R) -> R {
        f(&mut lock(&self.shared.store))
    }

    /// Ask the server to stop
    ///
    /// New logins are refused at once. Sessions finish their current
    /// command and end; any still running after the grace period are
    /// aborted.
    pub fn stop(&self) {
        if !self.shared.shutdown.send_replace(true) {
            tracing::info!(server = %self.name(), "Server stopping");
        }
    }

    /// Whether a stop has been requested
    pub fn is_stopping(&self) -> bool {
        *self.shared.shutdown.borrow()
    }

    /// Whether the server loop has exited
    pub fn is_stopped(&self) -> bool {
        *self.shared.stopped.borrow()
    }

    /// Wait until the server loop has exited
    pub async fn wait_stopped(&self) {
        let mut rx = self.shared.stopped.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    fn next_session_id(&self) -> u32 {
        self.shared.next_session.fetch_add(1, Ordering::Relaxed)
    }
}

/// Opens client connections to a [`ServerHandle`]'s server
#[derive(Debug, Clone)]
pub struct ServerConnector {
    handle: ServerHandle,
}

#[async_trait::async_trait]
impl Connector for ServerConnector {
    async fn connect(
        &self,
        server_name: &str,
        login: LoginInfo,
    ) -> Result<(Box<dyn Transport>, Reply)> {
        let shared = &self.handle.shared;
        if !server_name.eq_ignore_ascii_case(&shared.config.name) {
            return Err(Error::ServerUnavailable(format!(
                "unknown server '{}'",
                server_name
            )));
        }
        if self.handle.is_stopping() {
            return Err(Error::ServerUnavailable(format!(
                "server '{}' is stopping",
                server_name
            )));
        }

        let (transport, requests) = ChannelTransport::pair(shared.config.request_capacity);
        let (reply_tx, reply_rx) = oneshot::channel();
        let unavailable = || Error::ServerUnavailable(format!("server '{}' is not accepting", server_name));

        shared
            .accept_tx
            .send(Accept {
                login,
                requests,
                reply: reply_tx,
            })
            .await
            .map_err(|_| unavailable())?;
        let reply = reply_rx.await.map_err(|_| unavailable())?;
        Ok((Box::new(transport), reply))
    }
}

/// Builder for a server
pub struct Server {
    config: ServerConfig,
    events: Arc<dyn ServerEvents>,
}

impl Server {
    /// A server with the default [`EchoEvents`]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            events: Arc::new(EchoEvents),
        }
    }

    /// Use custom lifecycle callbacks
    pub fn with_events(mut self, events: impl ServerEvents) -> Self {
        self.events = Arc::new(events);
        self
    }

    /// Start the server thread and wait for `on_start` to finish
    pub async fn start(self) -> Result<ServerHandle> {
        let (accept_tx, accept_rx) = mpsc::channel(self.config.accept_capacity.max(1));
        let name = self.config.name.clone();
        let handle = ServerHandle {
            shared: Arc::new(Shared {
                store: Mutex::new(Store::new(&name)),
                config: self.config,
                procedures: Mutex::new(HashMap::new()),
                accept_tx,
                shutdown: watch::channel(false).0,
                stopped: watch::channel(false).0,
                next_session: AtomicU32::new(1),
            }),
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let thread_handle = handle.clone();
        let events = self.events;
        std::thread::Builder::new()
            .name(format!("{}-server", name))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(Error::Internal(format!(
                            "server runtime: {}",
                            e
                        ))));
                        thread_handle.shared.stopped.send_replace(true);
                        return;
                    }
                };
                runtime.block_on(serve(thread_handle, events, accept_rx, ready_tx));
            })
            .map_err(|e| Error::Internal(format!("server thread: {}", e)))?;

        ready_rx
            .await
            .map_err(|_| Error::Internal("server thread exited during start".to_string()))??;
        tracing::info!(server = %name, "Server started");
        Ok(handle)
    }
}

/// The accept/dispatch loop
async fn serve(
    handle: ServerHandle,
    events: Arc<dyn ServerEvents>,
    mut accept_rx: mpsc::Receiver<Accept>,
    ready: oneshot::Sender<Result<()>>,
) {
    if let Err(e) = events.on_start(&handle) {
        tracing::error!(server = %handle.name(), "Start callback failed: {}", e);
        handle.shared.stopped.send_replace(true);
        let _ = ready.send(Err(e));
        return;
    }
    let _ = ready.send(Ok(()));

    let mut shutdown = handle.shared.shutdown.subscribe();
    let mut sessions = JoinSet::new();

    while !*shutdown.borrow() {
        tokio::select! {
            _ = shutdown.changed() => break,
            accept = accept_rx.recv() => match accept {
                Some(accept) => login(&handle, &events, &mut sessions, accept),
                None => break,
            },
            Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = joined {
                    tracing::warn!(server = %handle.name(), "Session task failed: {}", e);
                }
            }
        }
    }

    accept_rx.close();
    while let Ok(accept) = accept_rx.try_recv() {
        drop(accept);
    }

    let grace = handle.shared.config.grace_period;
    let drained = tokio::time::timeout(grace, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            server = %handle.name(),
            remaining = sessions.len(),
            "Aborting sessions after grace period"
        );
        sessions.shutdown().await;
    }

    tracing::info!(server = %handle.name(), "Server stopped");
    handle.shared.stopped.send_replace(true);
}

fn login(
    handle: &ServerHandle,
    events: &Arc<dyn ServerEvents>,
    sessions: &mut JoinSet<()>,
    accept: Accept,
) {
    let Accept {
        login,
        requests,
        reply,
    } = accept;

    if login.username.trim().is_empty() {
        let refusal = ServerMessage::new(
            crate::constants::msg_number::SESSION_LOST,
            crate::constants::Severity::Error,
            "Login refused: empty user name.",
        )
        .from_server(handle.name());
        let _ = reply.send(Reply::new(Response::Error(refusal)));
        return;
    }

    let id = handle.next_session_id();
    let greeting: Vec<ServerMessage> = events
        .on_connect(&login)
        .map(|m| m.from_server(handle.name()))
        .into_iter()
        .collect();
    tracing::debug!(server = %handle.name(), session = id, user = %login.username, "Login");

    if reply
        .send(Reply::new(Response::Ok).with_messages(greeting))
        .is_err()
    {
        tracing::debug!(session = id, "Client gave up before login completed");
        return;
    }

    let session = ServerSession::new(id, handle.clone(), Arc::clone(events), login);
    sessions.spawn(session.run(requests));
}
