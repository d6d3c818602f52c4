use crate::{
    bson::Bson,
    bson_util,
    client::session::TransactionState,
    cmap::{Command, CommandResponse, PinnedConnectionHandle},
    cursor::{Cursor, CursorInformation, CursorSpecification},
    db::Namespace,
    error::{Result, TRANSIENT_TRANSACTION_ERROR},
    operation::{self, CursorBody, GetMoreBody, GetMoreResult},
    trace::{COMMAND_TRACING_EVENT_TARGET, CONNECTION_TRACING_EVENT_TARGET},
    Client,
    ClientSession,
};

impl Client {
    /// Executes a command with the given session, routing it through the session's pinned
    /// connection when a transaction is active and through the pool otherwise.
    pub(crate) async fn execute_command(
        &self,
        command: Command,
        session: &mut ClientSession,
    ) -> Result<CommandResponse> {
        self.execute_command_on(command, session, None).await
    }

    /// Like [`execute_command`](Client::execute_command), but with an explicit connection
    /// override. Cursors use this to keep their `getMore`s on the originating connection.
    pub(crate) async fn execute_command_on(
        &self,
        mut command: Command,
        session: &mut ClientSession,
        connection: Option<&PinnedConnectionHandle>,
    ) -> Result<CommandResponse> {
        attach_session_metadata(&mut command, session)?;
        let txn_active = session.transaction.is_active();

        let result = match connection {
            Some(handle) => handle.execute(command).await,
            None => match session.transaction.pinned_connection() {
                Some(handle) => handle.execute(command).await,
                None if txn_active => {
                    // The first operation of a transaction pins the connection it ran on;
                    // the handle is kept even if the operation fails so that the abort goes
                    // to the same server.
                    let conn = self.primary_pool().check_out().await?;
                    let handle = conn.pin();
                    tracing::debug!(
                        target: CONNECTION_TRACING_EVENT_TARGET,
                        connection_id = handle.id(),
                        txn_number = session.transaction.number,
                        "transaction pinned to connection",
                    );
                    let result = handle.execute(command).await;
                    session.transaction.pin_connection(handle);
                    result
                }
                None => {
                    let mut conn = self.primary_pool().check_out().await?;
                    conn.execute(command).await
                }
            },
        };

        process_result(result, session)
    }

    /// Runs a cursor-producing command on a freshly pinned connection and wraps the reply's
    /// `cursor` document into a [`Cursor`] owning an implicit session.
    pub(crate) async fn execute_cursor_command(&self, command: Command) -> Result<Cursor> {
        let batch_size = command
            .body
            .get("batchSize")
            .and_then(bson_util::get_int)
            .and_then(|size| u32::try_from(size).ok());

        let mut session = self.start_implicit_session().await;

        let conn = self.primary_pool().check_out().await?;
        let handle = conn.pin();

        let response = self
            .execute_command_on(command, &mut session, Some(&handle))
            .await?;
        let body: CursorBody = response.typed_body()?;

        let spec = CursorSpecification {
            info: CursorInformation {
                ns: Namespace::from_wire(&body.cursor.ns)?,
                id: body.cursor.id,
                batch_size,
            },
            initial_buffer: body.cursor.first_batch,
        };

        Ok(Cursor::new(self.clone(), spec, handle, session))
    }

    /// Fetches the next batch for a cursor on its pinned connection.
    pub(crate) async fn execute_get_more(
        &self,
        info: &CursorInformation,
        connection: &PinnedConnectionHandle,
        session: &mut ClientSession,
    ) -> Result<GetMoreResult> {
        let command = operation::get_more(&info.ns, info.id, info.batch_size);
        let response = self
            .execute_command_on(command, session, Some(connection))
            .await?;
        let body: GetMoreBody = response.typed_body()?;
        Ok(body.into())
    }

    /// Kills a server-side cursor on its originating connection. `killCursors` is one of the
    /// few commands that never carries a session id.
    pub(crate) async fn execute_kill_cursors(
        &self,
        ns: &Namespace,
        cursor_id: i64,
        connection: &PinnedConnectionHandle,
    ) -> Result<()> {
        let mut command = operation::kill_cursors(ns, &[cursor_id])?;
        let db = command.target_db.clone();
        command.body.insert("$db", db);

        let response = connection.execute(command).await?;
        response.validate()?;
        Ok(())
    }
}

/// Assembles the outgoing body: the command name is already the first key, and `$db`, `lsid`,
/// `$clusterTime`, and the transaction fields are appended behind it. `autocommit` is omitted
/// entirely when no transaction is attached.
fn attach_session_metadata(command: &mut Command, session: &ClientSession) -> Result<()> {
    let db = command.target_db.clone();
    let supports_read_concern = command.supports_read_concern;
    let body = &mut command.body;

    body.insert("$db", db);
    body.insert("lsid", session.id().clone());
    if let Some(cluster_time) = session.cluster_time() {
        body.insert("$clusterTime", bson::to_bson(cluster_time)?);
    }

    match session.transaction.state {
        TransactionState::Starting => {
            body.insert("txnNumber", session.transaction.number);
            body.insert("autocommit", false);
            body.insert("startTransaction", true);
        }
        TransactionState::InProgress => {
            body.insert("txnNumber", session.transaction.number);
            body.insert("autocommit", false);
        }
        _ => {
            // Causally consistent reads outside of transactions carry the session's last
            // observed operation time.
            if supports_read_concern {
                if let Some(operation_time) = session.operation_time() {
                    let mut read_concern = body
                        .get_document("readConcern")
                        .cloned()
                        .unwrap_or_default();
                    read_concern.insert("afterClusterTime", Bson::Timestamp(operation_time));
                    body.insert("readConcern", read_concern);
                }
            }
        }
    }

    Ok(())
}

/// Applies a command's outcome to its session: refresh its use time, advance its cluster
/// time, drive the transaction state machine, and label transient transaction failures.
fn process_result(
    result: Result<CommandResponse>,
    session: &mut ClientSession,
) -> Result<CommandResponse> {
    let txn_active = session.transaction.is_active();

    match result {
        Ok(response) => {
            tracing::debug!(
                target: COMMAND_TRACING_EVENT_TARGET,
                address = %response.source,
                succeeded = response.is_success(),
                exhaust_frames = response.trailing.len(),
                "command reply received",
            );

            session.update_last_use();
            if let Some(cluster_time) = response.cluster_time() {
                session.advance_cluster_time(&cluster_time);
            }
            if let Some(operation_time) = response.operation_time() {
                session.advance_operation_time(operation_time);
            }

            match response.validate() {
                Ok(()) => {
                    if session.transaction.state == TransactionState::Starting {
                        session.transaction.state = TransactionState::InProgress;
                    }
                    Ok(response)
                }
                Err(error) => {
                    if txn_active && error.contains_label(TRANSIENT_TRANSACTION_ERROR) {
                        session.transaction.finish(TransactionState::Aborted);
                    }
                    Err(error)
                }
            }
        }
        Err(mut error) => {
            if error.is_network_error() {
                session.mark_dirty();
                if txn_active {
                    error.add_label(TRANSIENT_TRANSACTION_ERROR);
                    session.transaction.finish(TransactionState::Aborted);
                }
            }
            Err(error)
        }
    }
}
