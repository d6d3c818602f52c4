mod cluster_time;
pub(crate) mod pool;
mod transaction;

use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::{
    bson::{doc, spec::BinarySubtype, Binary, Bson, Document, Timestamp},
    error::{Error, Result, UNKNOWN_TRANSACTION_COMMIT_RESULT},
    operation,
    runtime,
    Client,
};
pub use cluster_time::ClusterTime;
pub(crate) use pool::ServerSessionPool;
pub use transaction::TransactionState;
pub(crate) use transaction::Transaction;

/// How long the server keeps an idle session alive when the handshake does not say otherwise.
pub(crate) const DEFAULT_LOGICAL_SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// A MongoDB client session. This struct represents a logical session used for ordering
/// sequential operations, and it acts as a handle to a pooled server session.
///
/// Sessions are held by value; operations that participate in one borrow it mutably, which
/// serializes the session's operations without any locking.
#[derive(Debug)]
pub struct ClientSession {
    cluster_time: Option<ClusterTime>,
    operation_time: Option<Timestamp>,
    server_session: Option<ServerSession>,
    client: Client,
    pub(crate) transaction: Transaction,
}

impl ClientSession {
    pub(crate) fn new(server_session: ServerSession, client: Client) -> Self {
        Self {
            cluster_time: None,
            operation_time: None,
            server_session: Some(server_session),
            client,
            transaction: Transaction::new(),
        }
    }

    /// The id of this session, as sent in the `lsid` field of commands.
    pub fn id(&self) -> &Document {
        &self.server_session().id
    }

    /// The highest cluster time this session has seen so far, if any.
    pub fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    /// The `operationTime` of the most recent operation on this session, used for causally
    /// consistent reads.
    pub(crate) fn operation_time(&self) -> Option<Timestamp> {
        self.operation_time
    }

    /// The state of this session's transaction.
    pub fn transaction_state(&self) -> TransactionState {
        self.transaction.state
    }

    /// The number of the current (or most recent) transaction on this session.
    pub fn transaction_number(&self) -> i64 {
        self.transaction.number
    }

    /// Set the cluster time to the provided one if it is greater than this session's highest
    /// seen cluster time or if this session's cluster time is `None`.
    pub(crate) fn advance_cluster_time(&mut self, to: &ClusterTime) {
        if self.cluster_time().map(|ct| ct < to).unwrap_or(true) {
            self.cluster_time = Some(to.clone());
        }
    }

    pub(crate) fn advance_operation_time(&mut self, to: Timestamp) {
        let newer = match self.operation_time {
            Some(current) => (to.time, to.increment) > (current.time, current.increment),
            None => true,
        };
        if newer {
            self.operation_time = Some(to);
        }
    }

    /// Mark this session (and the underlying server session) as dirty so it will not be reused
    /// once checked back in.
    pub(crate) fn mark_dirty(&mut self) {
        self.server_session_mut().dirty = true;
    }

    /// Updates the date that the underlying server session was last used as part of an
    /// operation sent to the server.
    pub(crate) fn update_last_use(&mut self) {
        self.server_session_mut().last_use = Instant::now();
    }

    /// Starts a new transaction on this session with a fresh transaction number.
    ///
    /// The transaction does not touch the server until the first operation runs inside it.
    pub fn start_transaction(&mut self) -> Result<()> {
        if self.transaction.is_active() {
            return Err(Error::invalid_argument(
                "transaction already in progress on this session",
            ));
        }
        self.transaction.begin();
        Ok(())
    }

    /// Commits the transaction in progress on this session.
    ///
    /// If no operation ran inside the transaction, the server was never told about it and the
    /// commit completes locally.
    pub async fn commit_transaction(&mut self) -> Result<()> {
        match self.transaction.state {
            TransactionState::None => Err(Error::invalid_argument(
                "no transaction started on this session",
            )),
            TransactionState::Committed => Err(Error::invalid_argument(
                "the transaction was already committed",
            )),
            TransactionState::Aborted => Err(Error::invalid_argument(
                "cannot commit an aborted transaction",
            )),
            TransactionState::Starting => {
                self.transaction.finish(TransactionState::Committed);
                Ok(())
            }
            TransactionState::InProgress => {
                let client = self.client.clone();
                let result = client
                    .execute_command(operation::commit_transaction(), self)
                    .await;
                match result {
                    Ok(_) => {
                        self.transaction.finish(TransactionState::Committed);
                        Ok(())
                    }
                    // The executor already moved the transaction to `Aborted` when the error
                    // carried a transient label. A commit lost to the network may or may not
                    // have applied; the label tells the caller which retry is safe.
                    Err(mut error) => {
                        if error.is_network_error() {
                            error.add_label(UNKNOWN_TRANSACTION_COMMIT_RESULT);
                        }
                        Err(error)
                    }
                }
            }
        }
    }

    /// Aborts the transaction in progress on this session.
    ///
    /// Server-side failures to abort are ignored: the server will eventually clean the
    /// transaction up on its own, and the session moves to `Aborted` either way.
    pub async fn abort_transaction(&mut self) -> Result<()> {
        match self.transaction.state {
            TransactionState::None => Err(Error::invalid_argument(
                "no transaction started on this session",
            )),
            TransactionState::Committed => Err(Error::invalid_argument(
                "cannot abort a committed transaction",
            )),
            TransactionState::Aborted => Err(Error::invalid_argument(
                "the transaction was already aborted",
            )),
            TransactionState::Starting => {
                self.transaction.finish(TransactionState::Aborted);
                Ok(())
            }
            TransactionState::InProgress => {
                let client = self.client.clone();
                let _ = client
                    .execute_command(operation::abort_transaction(), self)
                    .await;
                self.transaction.finish(TransactionState::Aborted);
                Ok(())
            }
        }
    }

    fn server_session(&self) -> &ServerSession {
        self.server_session.as_ref().unwrap()
    }

    fn server_session_mut(&mut self) -> &mut ServerSession {
        self.server_session.as_mut().unwrap()
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if let Some(mut server_session) = self.server_session.take() {
            // A session dropped with an open transaction cannot be reused safely.
            if self.transaction.is_active() {
                server_session.dirty = true;
            }

            let client = self.client.clone();
            runtime::spawn_cleanup(async move {
                client.check_in_server_session(server_session).await;
            });
        }
    }
}

/// Client-side abstraction of a server session. These are pooled and may be associated with
/// multiple `ClientSession`s over the course of their lifetime.
#[derive(Debug)]
pub(crate) struct ServerSession {
    /// The id of the server session to which this corresponds.
    pub(crate) id: Document,

    /// The last time an operation was executed with this session.
    pub(crate) last_use: Instant,

    /// Whether a network error was encountered while using this session.
    pub(crate) dirty: bool,
}

impl ServerSession {
    /// Creates a new session, generating the id client side.
    pub(crate) fn new() -> Self {
        let binary = Bson::Binary(Binary {
            subtype: BinarySubtype::Uuid,
            bytes: Uuid::new_v4().as_bytes().to_vec(),
        });

        Self {
            id: doc! { "id": binary },
            last_use: Instant::now(),
            dirty: false,
        }
    }

    /// Determines if this server session is about to expire in a short amount of time (1
    /// minute).
    pub(crate) fn is_about_to_expire(&self, logical_session_timeout: Duration) -> bool {
        let expiration_date = self.last_use + logical_session_timeout;
        expiration_date < Instant::now() + Duration::from_secs(60)
    }
}
