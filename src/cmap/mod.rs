pub(crate) mod conn;
pub(crate) mod establish;
pub(crate) mod options;

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
        Mutex,
    },
};

use tokio::sync::Semaphore;

pub(crate) use self::conn::{
    Command,
    CommandResponse,
    Connection,
    PinnedConnectionHandle,
    PooledConnection,
    StreamDescription,
};
use self::{establish::ConnectionEstablisher, options::ConnectionPoolOptions};
use crate::{
    error::{Error, ErrorKind, Result, TimeoutScope},
    options::ServerAddress,
    runtime::{self, DEFAULT_CONNECT_TIMEOUT},
    trace::CONNECTION_TRACING_EVENT_TARGET,
};

/// A bounded pool of connections to a single host.
///
/// Checkouts proceed in first-come, first-served order: a fair semaphore hands out one permit
/// per connection slot, so a saturated pool blocks new checkouts until a connection is checked
/// back in or the connect timeout passes. Connections are established lazily, on the first
/// checkout that finds the pool empty.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionPool {
    inner: Arc<ConnectionPoolInner>,
}

#[derive(Debug)]
pub(crate) struct ConnectionPoolInner {
    address: ServerAddress,
    options: ConnectionPoolOptions,
    establisher: ConnectionEstablisher,

    /// Fair FIFO wait queue; the number of available permits is the number of free
    /// connection slots.
    wait_queue: Semaphore,

    /// Idle connections, most recently used at the back.
    available: Mutex<VecDeque<Connection>>,

    next_id: AtomicU32,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub(crate) fn new(
        address: ServerAddress,
        establisher: ConnectionEstablisher,
        options: ConnectionPoolOptions,
    ) -> Self {
        let max_pool_size = match options.max_pool_size {
            Some(0) => Semaphore::MAX_PERMITS,
            Some(size) => size as usize,
            None => options::DEFAULT_MAX_POOL_SIZE as usize,
        };

        Self {
            inner: Arc::new(ConnectionPoolInner {
                address,
                options,
                establisher,
                wait_queue: Semaphore::new(max_pool_size),
                available: Mutex::new(VecDeque::new()),
                next_id: AtomicU32::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Checks out a connection, establishing a new one if no idle connection is available and
    /// the pool is not at capacity. Waits at most `connect_timeout` for a free slot.
    pub(crate) async fn check_out(&self) -> Result<PooledConnection> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(self.pool_closed_error());
        }

        let connect_timeout = self
            .inner
            .options
            .connect_timeout
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);

        let permit = match runtime::timeout(
            connect_timeout,
            TimeoutScope::Checkout,
            self.inner.wait_queue.acquire(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            // The semaphore only closes on shutdown.
            Ok(Err(_)) => return Err(self.pool_closed_error()),
            Err(_) => {
                tracing::debug!(
                    target: CONNECTION_TRACING_EVENT_TARGET,
                    address = %self.inner.address,
                    "checkout timed out waiting for a free connection slot",
                );
                return Err(ErrorKind::PoolExhausted {
                    address: self.inner.address.clone(),
                }
                .into());
            }
        };

        // The slot is released manually on check-in or on establishment failure.
        permit.forget();

        let result = self.acquire_or_establish().await;
        if result.is_err() {
            self.inner.wait_queue.add_permits(1);
        }

        result.map(|connection| PooledConnection::new(connection, Arc::downgrade(&self.inner)))
    }

    async fn acquire_or_establish(&self) -> Result<Connection> {
        loop {
            let idle = self.inner.available.lock().unwrap().pop_back();
            match idle {
                Some(connection) if connection.is_poisoned() => {
                    tracing::debug!(
                        target: CONNECTION_TRACING_EVENT_TARGET,
                        connection_id = connection.id,
                        address = %self.inner.address,
                        "discarding poisoned idle connection",
                    );
                    continue;
                }
                Some(connection) => return Ok(connection),
                None => break,
            }
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let connection = self
            .inner
            .establisher
            .establish_connection(
                id,
                &self.inner.address,
                self.inner.options.credential.as_ref(),
                self.inner.options.socket_timeout,
            )
            .await?;

        tracing::debug!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            connection_id = id,
            address = %self.inner.address,
            "connection established",
        );

        Ok(connection)
    }

    /// Closes the pool: pending and future checkouts fail, and idle connections are dropped.
    pub(crate) fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.wait_queue.close();
        self.inner.available.lock().unwrap().clear();
    }

    fn pool_closed_error(&self) -> Error {
        ErrorKind::PoolClosed {
            address: self.inner.address.clone(),
        }
        .into()
    }
}

impl ConnectionPoolInner {
    /// Returns a connection to the pool, or discards it if it can no longer serve commands.
    pub(crate) fn check_in(&self, connection: Connection) {
        if connection.is_poisoned() || self.closed.load(Ordering::SeqCst) {
            tracing::debug!(
                target: CONNECTION_TRACING_EVENT_TARGET,
                connection_id = connection.id,
                address = %self.address,
                "discarding connection instead of pooling it",
            );
            drop(connection);
        } else {
            self.available.lock().unwrap().push_back(connection);
        }

        self.wait_queue.add_permits(1);
    }
}
