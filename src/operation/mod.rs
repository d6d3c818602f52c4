//! Builders for the commands the core itself issues, and typed views of their replies.
//!
//! Anything not covered here reaches the server through the raw-document escape hatch on
//! [`Database`](crate::Database).

use std::collections::VecDeque;

use serde::Deserialize;

use crate::{
    bson::{doc, Document},
    cmap::Command,
    db::Namespace,
    error::{CannotFormCommandReason, ErrorKind, Result},
};

/// The server rejects batch sizes outside of this range.
const MIN_BATCH_SIZE: u32 = 1;
const MAX_BATCH_SIZE: u32 = 1_000_000;

pub(crate) fn clamp_batch_size(batch_size: u32) -> i32 {
    batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE) as i32
}

/// Builds a `getMore` command fetching the next batch of the given cursor.
pub(crate) fn get_more(ns: &Namespace, cursor_id: i64, batch_size: Option<u32>) -> Command {
    let mut body = doc! {
        "getMore": cursor_id,
        "collection": ns.coll.clone(),
    };
    if let Some(batch_size) = batch_size {
        body.insert("batchSize", clamp_batch_size(batch_size));
    }

    Command::new("getMore", ns.db.clone(), body)
}

/// Builds a `killCursors` command for the given cursor ids.
pub(crate) fn kill_cursors(ns: &Namespace, cursor_ids: &[i64]) -> Result<Command> {
    if cursor_ids.is_empty() {
        return Err(ErrorKind::CannotFormCommand {
            reason: CannotFormCommandReason::NothingToDo,
        }
        .into());
    }

    let body = doc! {
        "killCursors": ns.coll.clone(),
        "cursors": cursor_ids.to_vec(),
    };

    Ok(Command::new("killCursors", ns.db.clone(), body))
}

/// Builds an `endSessions` command reporting the given session ids as finished.
pub(crate) fn end_sessions(session_ids: &[Document]) -> Result<Command> {
    if session_ids.is_empty() {
        return Err(ErrorKind::CannotFormCommand {
            reason: CannotFormCommandReason::NothingToDo,
        }
        .into());
    }

    let body = doc! {
        "endSessions": session_ids.to_vec(),
    };

    Ok(Command::new("endSessions", "admin", body))
}

pub(crate) fn commit_transaction() -> Command {
    Command::new("commitTransaction", "admin", doc! { "commitTransaction": 1 })
}

pub(crate) fn abort_transaction() -> Command {
    Command::new("abortTransaction", "admin", doc! { "abortTransaction": 1 })
}

/// The shape of any reply that opens a cursor (`find`, `aggregate`, `listCollections`,
/// `listIndexes`, change streams).
#[derive(Debug, Deserialize)]
pub(crate) struct CursorBody {
    pub(crate) cursor: CursorInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CursorInfo {
    pub(crate) id: i64,
    pub(crate) ns: String,
    #[serde(default)]
    pub(crate) first_batch: VecDeque<Document>,
}

/// The shape of a `getMore` reply.
#[derive(Debug, Deserialize)]
pub(crate) struct GetMoreBody {
    pub(crate) cursor: GetMoreCursorInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GetMoreCursorInfo {
    pub(crate) id: i64,
    #[serde(default)]
    pub(crate) next_batch: VecDeque<Document>,
}

/// The outcome of a single `getMore`, as consumed by the cursor engine.
#[derive(Debug)]
pub(crate) struct GetMoreResult {
    pub(crate) batch: VecDeque<Document>,
    pub(crate) id: i64,
    pub(crate) exhausted: bool,
}

impl From<GetMoreBody> for GetMoreResult {
    fn from(body: GetMoreBody) -> Self {
        Self {
            batch: body.cursor.next_batch,
            id: body.cursor.id,
            exhausted: body.cursor.id == 0,
        }
    }
}
