pub(crate) mod auth;
mod executor;
pub(crate) mod session;

use std::{sync::Arc, time::Duration};

use crate::{
    cmap::{establish::ConnectionEstablisher, options::ConnectionPoolOptions, ConnectionPool},
    db::Database,
    error::{Error, Result},
    operation,
    options::ClientOptions,
    runtime,
    trace::SESSION_TRACING_EVENT_TARGET,
};
use session::{
    ClientSession,
    ServerSession,
    ServerSessionPool,
    DEFAULT_LOGICAL_SESSION_TIMEOUT,
};

const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// `endSessions` accepts at most this many ids per command.
const END_SESSIONS_BATCH_SIZE: usize = 10_000;

/// The entry point to the driver: owns the per-host connection pools and the pool of server
/// sessions. `Client` is cheap to clone; every clone is a handle to the same state.
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    pools: Vec<ConnectionPool>,
    session_pool: ServerSessionPool,
}

impl Client {
    /// Creates a `Client` by parsing the given connection string.
    pub fn with_uri_str(uri: &str) -> Result<Self> {
        Self::with_options(ClientOptions::parse(uri)?)
    }

    /// Creates a `Client` with the given options.
    pub fn with_options(options: ClientOptions) -> Result<Self> {
        if options.hosts.is_empty() {
            return Err(Error::invalid_argument("a client requires at least one host"));
        }

        let establisher = ConnectionEstablisher::from_client_options(&options)?;
        let pool_options = ConnectionPoolOptions::from_client_options(&options);

        let pools = options
            .hosts
            .iter()
            .map(|address| {
                ConnectionPool::new(address.clone(), establisher.clone(), pool_options.clone())
            })
            .collect();

        let inner = Arc::new(ClientInner {
            pools,
            session_pool: ServerSessionPool::new(),
        });

        // The sweeper holds only a weak handle, so it winds down once the last clone of the
        // client is dropped.
        let weak = Arc::downgrade(&inner);
        runtime::spawn_cleanup(async move {
            loop {
                tokio::time::sleep(SESSION_SWEEP_INTERVAL).await;
                match weak.upgrade() {
                    Some(inner) => {
                        let evicted = inner
                            .session_pool
                            .sweep(DEFAULT_LOGICAL_SESSION_TIMEOUT)
                            .await;
                        if evicted > 0 {
                            tracing::debug!(
                                target: SESSION_TRACING_EVENT_TARGET,
                                evicted,
                                "evicted idle server sessions",
                            );
                        }
                    }
                    None => break,
                }
            }
        });

        Ok(Self { inner })
    }

    /// Gets a handle to a database with the provided name.
    pub fn database(&self, name: &str) -> Database {
        Database::new(self.clone(), name)
    }

    /// Starts a new [`ClientSession`], reusing a pooled server session when one is available.
    pub async fn start_session(&self) -> ClientSession {
        let server_session = self
            .inner
            .session_pool
            .check_out(DEFAULT_LOGICAL_SESSION_TIMEOUT)
            .await;
        ClientSession::new(server_session, self.clone())
    }

    pub(crate) async fn start_implicit_session(&self) -> ClientSession {
        self.start_session().await
    }

    pub(crate) async fn check_in_server_session(&self, session: ServerSession) {
        self.inner
            .session_pool
            .check_in(session, DEFAULT_LOGICAL_SESSION_TIMEOUT)
            .await;
    }

    /// This driver performs no server monitoring, so every command is routed to the first
    /// configured host.
    pub(crate) fn primary_pool(&self) -> &ConnectionPool {
        &self.inner.pools[0]
    }

    /// Shuts the client down: pooled server sessions are reported to the server via
    /// `endSessions` in batches, and every connection pool is closed.
    pub async fn shutdown(self) {
        let session_ids = self.inner.session_pool.drain_ids().await;
        for chunk in session_ids.chunks(END_SESSIONS_BATCH_SIZE) {
            let mut command = match operation::end_sessions(chunk) {
                Ok(command) => command,
                Err(_) => continue,
            };
            let db = command.target_db.clone();
            command.body.insert("$db", db);

            match self.primary_pool().check_out().await {
                Ok(mut conn) => {
                    let _ = conn.execute(command).await;
                }
                Err(_) => break,
            }
        }

        for pool in &self.inner.pools {
            pool.shutdown();
        }
    }
}
