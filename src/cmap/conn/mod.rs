mod command;
mod pooled;
mod stream_description;
pub(crate) mod wire;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use tokio::{
    io::{ReadHalf, WriteHalf},
    sync::{oneshot, Mutex as AsyncMutex},
};

use self::wire::{Message, MessageFlags, Query, QueryFlags, ReplyFrame};
use crate::{
    bson_util,
    error::{Error, ErrorKind, Result, TimeoutScope},
    options::ServerAddress,
    runtime::{self, AsyncStream},
    trace::CONNECTION_TRACING_EVENT_TARGET,
};
pub(crate) use command::{Command, CommandResponse};
pub(crate) use pooled::{PinnedConnectionHandle, PooledConnection};
pub(crate) use stream_description::StreamDescription;

/// A single established stream to a server, along with the machinery to serialize commands onto
/// it and to correlate the replies coming back.
///
/// A background reader task owns the read half of the stream for the connection's whole life;
/// `execute` only ever touches the write half and then waits on a oneshot channel keyed by the
/// request id it allocated.
#[derive(Debug)]
pub(crate) struct Connection {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,

    /// The cached StreamDescription from the connection's handshake.
    stream_description: Option<StreamDescription>,

    inner: Arc<ConnectionInner>,
    reader_handle: tokio::task::JoinHandle<()>,
}

#[derive(Debug)]
struct ConnectionInner {
    id: u32,
    address: ServerAddress,

    /// Request ids are drawn per connection and wrap modulo 2^31.
    next_request_id: AtomicI32,

    /// Exclusive access to the write half guarantees frame atomicity.
    write: AsyncMutex<WriteHalf<AsyncStream>>,

    /// One waiter per in-flight request id. Guarded by a plain mutex; no I/O happens while it
    /// is held.
    in_flight: Mutex<HashMap<i32, oneshot::Sender<Result<Vec<ReplyFrame>>>>>,

    /// The first unrecoverable error this connection encountered, if any. A poisoned
    /// connection fails all of its waiters and refuses further commands.
    poison: Mutex<Option<Error>>,

    max_message_size_bytes: AtomicI32,
    socket_timeout: Option<Duration>,
}

impl Connection {
    pub(crate) fn new(
        id: u32,
        address: ServerAddress,
        stream: AsyncStream,
        socket_timeout: Option<Duration>,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);

        let inner = Arc::new(ConnectionInner {
            id,
            address: address.clone(),
            next_request_id: AtomicI32::new(0),
            write: AsyncMutex::new(write_half),
            in_flight: Mutex::new(HashMap::new()),
            poison: Mutex::new(None),
            max_message_size_bytes: AtomicI32::new(wire::DEFAULT_MAX_MESSAGE_SIZE_BYTES),
            socket_timeout,
        });

        let reader_handle = tokio::spawn(read_loop(inner.clone(), read_half));

        Self {
            id,
            address,
            stream_description: None,
            inner,
            reader_handle,
        }
    }

    pub(crate) fn set_stream_description(&mut self, description: StreamDescription) {
        self.inner
            .max_message_size_bytes
            .store(description.max_message_size_bytes, Ordering::Relaxed);
        self.stream_description = Some(description);
    }

    /// Whether this connection has encountered an unrecoverable error. Poisoned connections
    /// must be discarded rather than returned to the pool.
    pub(crate) fn is_poisoned(&self) -> bool {
        self.inner.poison.lock().unwrap().is_some()
    }

    /// Executes a `Command`, correlating the reply by request id.
    ///
    /// An `Ok(..)` only means a reply arrived; `ok: 0` replies are surfaced through
    /// [`CommandResponse::validate`].
    pub(crate) async fn execute(&mut self, command: Command) -> Result<CommandResponse> {
        if self.is_poisoned() {
            return Err(ErrorKind::ConnectionClosed.into());
        }

        let use_op_msg = self
            .stream_description
            .as_ref()
            .map(StreamDescription::supports_op_msg)
            .unwrap_or(false);

        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::SeqCst) & i32::MAX;

        let (sender, receiver) = oneshot::channel();
        self.inner
            .in_flight
            .lock()
            .unwrap()
            .insert(request_id, sender);

        let exchange = self
            .inner
            .send_and_wait(command, request_id, use_op_msg, receiver);
        let result = match self.inner.socket_timeout {
            Some(timeout) => {
                match runtime::timeout(timeout, TimeoutScope::Socket, exchange).await {
                    Ok(result) => result,
                    Err(elapsed) => Err(elapsed),
                }
            }
            None => exchange.await,
        };

        let response = result
            .and_then(|frames| {
                frames
                    .into_iter()
                    .map(ReplyFrame::into_command_body)
                    .collect::<Result<Vec<_>>>()
            })
            .and_then(|bodies| CommandResponse::new(self.address.clone(), bodies));

        if let Err(ref error) = response {
            if error.is_network_error() {
                self.inner.in_flight.lock().unwrap().remove(&request_id);
                self.inner.poison(error);
            }
        }

        response
    }

    #[cfg(test)]
    pub(crate) fn new_testing(stream: AsyncStream, socket_timeout: Option<Duration>) -> Self {
        let mut conn = Self::new(
            1,
            crate::options::ServerAddress::parse("localhost").unwrap(),
            stream,
            socket_timeout,
        );
        conn.set_stream_description(StreamDescription::new_testing());
        conn
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

impl ConnectionInner {
    async fn send_and_wait(
        &self,
        command: Command,
        request_id: i32,
        use_op_msg: bool,
        receiver: oneshot::Receiver<Result<Vec<ReplyFrame>>>,
    ) -> Result<Vec<ReplyFrame>> {
        let Command {
            target_db,
            mut body,
            document_sequences,
            exhaust_allowed,
            ..
        } = command;

        {
            let mut write = self.write.lock().await;
            if use_op_msg {
                // Every OP_MSG body names its database; the dispatcher usually attached it
                // already, but commands executed directly (handshake, auth) have not.
                if !body.contains_key("$db") {
                    body.insert("$db", target_db);
                }

                let mut flags = MessageFlags::empty();
                if exhaust_allowed {
                    flags |= MessageFlags::EXHAUST_ALLOWED;
                }

                let message = Message {
                    request_id,
                    response_to: 0,
                    flags,
                    document_payload: bson_util::to_raw_document_buf(&body)?,
                    document_sequences: document_sequences
                        .iter()
                        .map(|(identifier, documents)| {
                            Ok(wire::DocumentSequence {
                                identifier: identifier.clone(),
                                documents: documents
                                    .iter()
                                    .map(bson_util::to_raw_document_buf)
                                    .collect::<Result<Vec<_>>>()?,
                            })
                        })
                        .collect::<Result<Vec<_>>>()?,
                    checksum: None,
                };
                message.write_to(&mut *write).await?;
            } else {
                // Servers that predate OP_MSG receive commands as queries against the
                // database's virtual $cmd collection. Sequences and $db have no legacy
                // equivalent: the former are folded back into the body and the latter is
                // carried by the collection name.
                body.remove("$db");
                for (identifier, documents) in document_sequences {
                    body.insert(identifier, documents);
                }

                let query = Query {
                    request_id,
                    flags: QueryFlags::empty(),
                    full_collection_name: format!("{}.$cmd", target_db),
                    num_to_skip: 0,
                    num_to_return: 1,
                    query: body,
                };
                query.write_to(&mut *write).await?;
            }
        }

        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(ErrorKind::ConnectionClosed.into()),
        }
    }

    fn poison(&self, error: &Error) {
        {
            let mut poison = self.poison.lock().unwrap();
            if poison.is_some() {
                return;
            }
            *poison = Some(error.clone());
        }

        tracing::warn!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            connection_id = self.id,
            address = %self.address,
            error = %error,
            "connection poisoned; failing all in-flight operations",
        );

        let waiters: Vec<_> = {
            let mut in_flight = self.in_flight.lock().unwrap();
            in_flight.drain().map(|(_, sender)| sender).collect()
        };
        for sender in waiters {
            let _ = sender.send(Err(error.clone()));
        }
    }
}

/// Demultiplexes reply frames by `responseTo` until the stream fails.
///
/// Frames flagged `moreToCome` are accumulated and delivered together once the final frame of
/// the exhaust stream arrives.
async fn read_loop(inner: Arc<ConnectionInner>, mut reader: ReadHalf<AsyncStream>) {
    let mut accumulated: HashMap<i32, Vec<ReplyFrame>> = HashMap::new();

    loop {
        let max_size = inner.max_message_size_bytes.load(Ordering::Relaxed);
        let frame = match ReplyFrame::read_from(&mut reader, max_size).await {
            Ok(frame) => frame,
            Err(error) => {
                inner.poison(&error);
                return;
            }
        };

        let response_to = frame.response_to();
        if !inner.in_flight.lock().unwrap().contains_key(&response_to) {
            inner.poison(&Error::protocol(format!(
                "reply correlates to unknown request id {}",
                response_to
            )));
            return;
        }

        let more_to_come = frame.more_to_come();
        accumulated.entry(response_to).or_default().push(frame);

        if !more_to_come {
            let frames = accumulated.remove(&response_to).unwrap_or_default();
            if let Some(sender) = inner.in_flight.lock().unwrap().remove(&response_to) {
                let _ = sender.send(Ok(frames));
            }
        }
    }
}

