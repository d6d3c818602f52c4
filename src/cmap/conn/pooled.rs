use std::{
    ops::{Deref, DerefMut},
    sync::{Arc, Weak},
};

use tokio::sync::Mutex as AsyncMutex;

use super::{Command, CommandResponse, Connection};
use crate::{cmap::ConnectionPoolInner, error::Result};

/// A `Connection` checked out of a pool. Dropping the handle returns the connection to its
/// pool (or discards it, if it was poisoned while checked out).
#[derive(Debug)]
pub(crate) struct PooledConnection {
    /// `None` only transiently, while the drop impl hands the connection back.
    connection: Option<Connection>,
    pool: Weak<ConnectionPoolInner>,
}

impl PooledConnection {
    pub(crate) fn new(connection: Connection, pool: Weak<ConnectionPoolInner>) -> Self {
        Self {
            connection: Some(connection),
            pool,
        }
    }

    pub(crate) async fn execute(&mut self, command: Command) -> Result<CommandResponse> {
        self.connection.as_mut().unwrap().execute(command).await
    }

    /// Converts this handle into one that can be shared between a transaction (or cursor) and
    /// the operations running inside it. Commands on the pinned handle serialize behind an
    /// async lock; the connection returns to its pool when the last replica is dropped.
    pub(crate) fn pin(self) -> PinnedConnectionHandle {
        let id = self.id;
        PinnedConnectionHandle {
            id,
            inner: Arc::new(AsyncMutex::new(self)),
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.connection.as_ref().unwrap()
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection.as_mut().unwrap()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            if let Some(pool) = self.pool.upgrade() {
                pool.check_in(connection);
            }
        }
    }
}

/// A shareable reference to a checked-out connection.
///
/// Replicas refer to the same underlying connection; the object identity is observable through
/// [`PinnedConnectionHandle::id`].
#[derive(Debug)]
pub(crate) struct PinnedConnectionHandle {
    id: u32,
    inner: Arc<AsyncMutex<PooledConnection>>,
}

impl PinnedConnectionHandle {
    /// Make a new `PinnedConnectionHandle` that refers to the same connection as this one.
    pub(crate) fn replicate(&self) -> Self {
        Self {
            id: self.id,
            inner: self.inner.clone(),
        }
    }

    pub(crate) async fn execute(&self, command: Command) -> Result<CommandResponse> {
        let mut connection = self.inner.lock().await;
        connection.execute(command).await
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }
}
