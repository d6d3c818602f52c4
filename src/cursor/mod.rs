mod common;

use std::{
    collections::VecDeque,
    marker::PhantomData,
    pin::Pin,
    task::{ready, Context, Poll},
};

use derivative::Derivative;
use futures_core::{future::BoxFuture, Stream};
use futures_util::future::poll_fn;
use serde::de::DeserializeOwned;

use crate::{
    bson::Document,
    cmap::PinnedConnectionHandle,
    error::{Error, Result},
    operation::GetMoreResult,
    Client,
    ClientSession,
};
pub(crate) use common::{CursorInformation, CursorSpecification};

type GetMoreFuture = BoxFuture<'static, (Result<GetMoreResult>, ClientSession)>;

/// A pull-based stream over the results of a cursor-producing command.
///
/// The cursor buffers one batch at a time and issues a `getMore` on its originating
/// connection whenever the buffer runs dry, so consumers set the pace. It implements
/// [`Stream`], which is where combinators like `map` and `filter` come from:
///
/// ```ignore
/// use futures_util::stream::TryStreamExt;
///
/// let names: Vec<String> = db
///     .run_cursor_command(doc! { "find": "users" })
///     .await?
///     .map_ok(|doc| doc.get_str("name").unwrap_or_default().to_string())
///     .try_collect()
///     .await?;
/// ```
///
/// A dropped cursor whose server-side half is still alive issues a best-effort
/// `killCursors` in the background.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Cursor<T = Document>
where
    T: DeserializeOwned,
{
    client: Client,
    info: CursorInformation,
    buffer: VecDeque<Document>,
    current: Option<Document>,

    /// The connection the cursor was opened on. `getMore`s must go to the same server, so
    /// the connection stays checked out (pinned) until the cursor is exhausted.
    pinned_connection: Option<PinnedConnectionHandle>,

    /// The implicit session the cursor was opened with; `getMore`s carry its lsid. Taken
    /// while a `getMore` is in flight.
    session: Option<ClientSession>,

    /// The single outstanding `getMore`, if one is running.
    #[derivative(Debug = "ignore")]
    pending_get_more: Option<GetMoreFuture>,

    /// Cleared when the pinned connection hits a network error, which also makes the
    /// drop-time `killCursors` pointless.
    connection_valid: bool,

    _phantom: PhantomData<fn() -> T>,
}

impl Cursor<Document> {
    pub(crate) fn new(
        client: Client,
        spec: CursorSpecification,
        connection: PinnedConnectionHandle,
        session: ClientSession,
    ) -> Self {
        let pinned_connection = if spec.info.id == 0 {
            // Single-batch result: the server already closed the cursor, so the connection
            // can go straight back to the pool.
            None
        } else {
            Some(connection)
        };

        Self {
            client,
            info: spec.info,
            buffer: spec.initial_buffer,
            current: None,
            pinned_connection,
            session: Some(session),
            pending_get_more: None,
            connection_valid: true,
            _phantom: Default::default(),
        }
    }
}

impl<T> Cursor<T>
where
    T: DeserializeOwned,
{
    /// The server-assigned id of this cursor; 0 once it is exhausted.
    pub fn id(&self) -> i64 {
        self.info.id
    }

    /// Moves the cursor forward to the next document, fetching a new batch from the server
    /// if the buffered one is spent. Returns `false` once the cursor is exhausted.
    pub async fn advance(&mut self) -> Result<bool> {
        poll_fn(|cx| self.poll_advance(cx)).await
    }

    /// The document the cursor is currently positioned on, if any.
    pub fn current(&self) -> Option<&Document> {
        self.current.as_ref()
    }

    /// Deserializes the current document into this cursor's item type.
    pub fn deserialize_current(&self) -> Result<T> {
        match self.current {
            Some(ref doc) => Ok(bson::from_document(doc.clone())?),
            None => Err(Error::invalid_argument(
                "the cursor is not positioned on a document; call advance first",
            )),
        }
    }

    /// Advances the cursor and deserializes the next document, or returns `None` once the
    /// cursor is exhausted.
    pub async fn next(&mut self) -> Option<Result<T>> {
        match self.advance().await {
            Ok(true) => Some(self.deserialize_current()),
            Ok(false) => None,
            Err(error) => Some(Err(error)),
        }
    }

    /// Drives the cursor to exhaustion, invoking `f` on every document. Iteration stops on
    /// the first error `f` returns, and the server-side cursor is killed.
    pub async fn for_each<F>(mut self, mut f: F) -> Result<()>
    where
        F: FnMut(T) -> Result<()>,
    {
        while self.advance().await? {
            f(self.deserialize_current()?)?;
        }
        Ok(())
    }

    /// Re-types this cursor, so that future documents deserialize into `D`. Buffered
    /// documents and server-side state carry over.
    pub fn with_type<D: DeserializeOwned>(mut self) -> Cursor<D> {
        let info = self.info.clone();
        // Disarm this handle's kill-on-drop; the re-typed cursor owns the server cursor now.
        self.info.id = 0;

        Cursor {
            client: self.client.clone(),
            info,
            buffer: std::mem::take(&mut self.buffer),
            current: self.current.take(),
            pinned_connection: self.pinned_connection.take(),
            session: self.session.take(),
            pending_get_more: self.pending_get_more.take(),
            connection_valid: self.connection_valid,
            _phantom: Default::default(),
        }
    }

    fn poll_advance(&mut self, cx: &mut Context<'_>) -> Poll<Result<bool>> {
        loop {
            if let Some(future) = self.pending_get_more.as_mut() {
                let (result, session) = ready!(future.as_mut().poll(cx));
                self.pending_get_more = None;
                self.session = Some(session);

                match result {
                    Ok(get_more) => {
                        self.info.id = get_more.id;
                        self.buffer = get_more.batch;
                        if get_more.exhausted {
                            self.pinned_connection = None;
                        }
                    }
                    Err(error) => {
                        if error.is_network_error() {
                            // The connection can no longer serve a killCursors either.
                            self.connection_valid = false;
                        }
                        return Poll::Ready(Err(error));
                    }
                }
            }

            if let Some(doc) = self.buffer.pop_front() {
                self.current = Some(doc);
                return Poll::Ready(Ok(true));
            }
            self.current = None;

            if self.info.id == 0 || !self.connection_valid {
                return Poll::Ready(Ok(false));
            }

            let client = self.client.clone();
            let info = self.info.clone();
            let connection = match self.pinned_connection.as_ref() {
                Some(handle) => handle.replicate(),
                None => {
                    return Poll::Ready(Err(Error::internal(
                        "live cursor lost its pinned connection",
                    )))
                }
            };
            let mut session = match self.session.take() {
                Some(session) => session,
                None => {
                    return Poll::Ready(Err(Error::internal("live cursor lost its session")))
                }
            };

            self.pending_get_more = Some(Box::pin(async move {
                let result = client
                    .execute_get_more(&info, &connection, &mut session)
                    .await;
                (result, session)
            }));
        }
    }
}

impl<T> Stream for Cursor<T>
where
    T: DeserializeOwned,
{
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = Pin::into_inner(self);
        match ready!(this.poll_advance(cx)) {
            Ok(true) => Poll::Ready(Some(this.deserialize_current())),
            Ok(false) => Poll::Ready(None),
            Err(error) => Poll::Ready(Some(Err(error))),
        }
    }
}

impl<T: DeserializeOwned> Drop for Cursor<T> {
    fn drop(&mut self) {
        if self.info.id != 0 && self.connection_valid {
            if let Some(connection) = self.pinned_connection.take() {
                common::kill_cursor(
                    self.client.clone(),
                    self.info.ns.clone(),
                    self.info.id,
                    connection,
                    self.session.take(),
                );
            }
        }
    }
}
