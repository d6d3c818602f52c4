use std::collections::VecDeque;

use crate::{
    bson::Document,
    cmap::PinnedConnectionHandle,
    db::Namespace,
    runtime,
    trace::COMMAND_TRACING_EVENT_TARGET,
    Client,
    ClientSession,
};

/// Static information about a cursor, threaded through every `getMore`.
#[derive(Clone, Debug)]
pub(crate) struct CursorInformation {
    pub(crate) ns: Namespace,

    /// The server-assigned cursor id; 0 once the cursor is exhausted.
    pub(crate) id: i64,

    pub(crate) batch_size: Option<u32>,
}

/// Specification used to create a new cursor from a command reply.
#[derive(Debug)]
pub(crate) struct CursorSpecification {
    pub(crate) info: CursorInformation,
    pub(crate) initial_buffer: VecDeque<Document>,
}

/// Kills a server-side cursor in the background. Failures are logged and otherwise ignored;
/// the server reaps abandoned cursors on its own schedule.
pub(super) fn kill_cursor(
    client: Client,
    ns: Namespace,
    cursor_id: i64,
    connection: PinnedConnectionHandle,
    session: Option<ClientSession>,
) {
    runtime::spawn_cleanup(async move {
        if let Err(error) = client
            .execute_kill_cursors(&ns, cursor_id, &connection)
            .await
        {
            tracing::debug!(
                target: COMMAND_TRACING_EVENT_TARGET,
                cursor_id,
                error = %error,
                "failed to kill cursor",
            );
        }
        drop(session);
    });
}
