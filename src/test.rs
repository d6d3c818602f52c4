//! An in-process mock server speaking just enough of the wire protocol to exercise the
//! connection, pool, session, transaction, and cursor machinery over real sockets.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
};

use crate::{
    bson::{doc, Document},
    bson_util,
    cmap::conn::wire::{Header, Message, MessageFlags, OpCode},
    error::{ErrorKind, Result, TimeoutScope},
    Client,
    TransactionState,
};

/// What the mock server should do with a command it received.
pub(crate) enum MockReply {
    /// Reply with this document; `ok: 1` and a `mockConnectionId` marker are added
    /// automatically.
    Doc(Document),

    /// Close the connection without replying.
    CloseConnection,

    /// Keep the connection open but never reply, to force client-side timeouts.
    Ignore,
}

pub(crate) type Handler = Arc<dyn Fn(u32, &Document) -> MockReply + Send + Sync>;

pub(crate) struct MockServer {
    pub(crate) address: SocketAddr,
    accept_loop: tokio::task::JoinHandle<()>,
}

impl MockServer {
    pub(crate) async fn start(handler: Handler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let accept_loop = tokio::spawn(async move {
            let mut connection_number = 0u32;
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => break,
                };
                connection_number += 1;
                tokio::spawn(serve_connection(stream, handler.clone(), connection_number));
            }
        });

        Self {
            address,
            accept_loop,
        }
    }

    fn client(&self, options: &str) -> Client {
        Client::with_uri_str(&format!("mongodb://{}/?{}", self.address, options)).unwrap()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

pub(crate) fn hello_reply() -> Document {
    doc! {
        "ismaster": true,
        "minWireVersion": 0,
        "maxWireVersion": 8,
        "maxBsonObjectSize": 16 * 1024 * 1024,
        "maxMessageSizeBytes": 48 * 1024 * 1024,
        "maxWriteBatchSize": 100_000,
        "logicalSessionTimeoutMinutes": 30,
    }
}

async fn serve_connection(mut stream: TcpStream, handler: Handler, connection_number: u32) {
    loop {
        let (request_id, command, legacy) = match read_client_command(&mut stream).await {
            Ok(Some(read)) => read,
            _ => return,
        };

        let mut response = match handler(connection_number, &command) {
            MockReply::Doc(response) => response,
            MockReply::CloseConnection => return,
            MockReply::Ignore => continue,
        };

        if !response.contains_key("ok") {
            response.insert("ok", 1);
        }
        response.insert("mockConnectionId", connection_number as i32);

        let written = if legacy {
            write_op_reply(&mut stream, request_id, &response).await
        } else {
            write_op_msg(&mut stream, request_id, &response, MessageFlags::empty()).await
        };
        if written.is_err() {
            return;
        }
    }
}

/// Reads one client frame, returning `(request_id, command, was_legacy)`. `None` indicates
/// the client hung up.
async fn read_client_command(
    stream: &mut TcpStream,
) -> Result<Option<(i32, Document, bool)>> {
    let header = match Header::read_from(stream).await {
        Ok(header) => header,
        Err(_) => return Ok(None),
    };

    let mut buf = vec![0u8; header.length as usize - Header::LENGTH];
    tokio::io::AsyncReadExt::read_exact(stream, &mut buf).await?;

    match header.op_code {
        OpCode::Query => {
            // flags + $cmd collection name + numberToSkip + numberToReturn + document
            let mut slice = &buf[4..];
            bson_util::read_cstring(&mut slice)?;
            let mut slice = &slice[8..];
            let command = Document::from_reader(&mut slice)?;
            Ok(Some((header.request_id, command, true)))
        }
        OpCode::Message => {
            let message = Message::read_from_slice(&buf, &header)?;
            let mut command = bson_util::raw_to_document(&message.document_payload)?;
            for sequence in message.document_sequences {
                let documents = sequence
                    .documents
                    .iter()
                    .map(|raw| bson_util::raw_to_document(raw))
                    .collect::<Result<Vec<_>>>()?;
                command.insert(sequence.identifier, documents);
            }
            Ok(Some((header.request_id, command, false)))
        }
        OpCode::Reply => Ok(None),
    }
}

async fn write_op_reply(
    stream: &mut TcpStream,
    response_to: i32,
    response: &Document,
) -> Result<()> {
    let mut document_bytes = Vec::new();
    response.to_writer(&mut document_bytes)?;

    let mut frame = Vec::new();
    frame.extend(((Header::LENGTH + 20 + document_bytes.len()) as i32).to_le_bytes());
    frame.extend(0i32.to_le_bytes()); // requestId
    frame.extend(response_to.to_le_bytes());
    frame.extend((OpCode::Reply as i32).to_le_bytes());
    frame.extend(0u32.to_le_bytes()); // responseFlags
    frame.extend(0i64.to_le_bytes()); // cursorId
    frame.extend(0i32.to_le_bytes()); // startingFrom
    frame.extend(1i32.to_le_bytes()); // numberReturned
    frame.extend(document_bytes);

    stream.write_all(&frame).await?;
    Ok(())
}

async fn write_op_msg(
    stream: &mut TcpStream,
    response_to: i32,
    response: &Document,
    flags: MessageFlags,
) -> Result<()> {
    let message = Message {
        request_id: 0,
        response_to,
        flags,
        document_payload: bson_util::to_raw_document_buf(response)?,
        document_sequences: Vec::new(),
        checksum: None,
    };
    message.write_to(stream).await
}

type CommandLog = Arc<Mutex<Vec<(u32, Document)>>>;

/// A handler that answers the handshake, records every command it sees, and delegates the
/// rest to `f`.
fn logging_handler<F>(log: CommandLog, f: F) -> Handler
where
    F: Fn(&str, &Document) -> MockReply + Send + Sync + 'static,
{
    Arc::new(move |connection_number, command| {
        log.lock().unwrap().push((connection_number, command.clone()));
        match bson_util::first_key(command).unwrap_or("") {
            "isMaster" | "hello" => MockReply::Doc(hello_reply()),
            name => f(name, command),
        }
    })
}

fn logged_commands(log: &CommandLog, name: &str) -> Vec<(u32, Document)> {
    log.lock()
        .unwrap()
        .iter()
        .filter(|(_, command)| bson_util::first_key(command) == Some(name))
        .cloned()
        .collect()
}

#[tokio::test]
async fn ping_attaches_routing_and_session_metadata() {
    let log: CommandLog = Default::default();
    let server = MockServer::start(logging_handler(log.clone(), |_, _| {
        MockReply::Doc(doc! {})
    }))
    .await;

    let client = server.client("maxConnections=2");
    let reply = client
        .database("admin")
        .run_command(doc! { "ping": 1 })
        .await
        .unwrap();
    assert_eq!(reply.get("ok").and_then(bson_util::get_int), Some(1));

    let pings = logged_commands(&log, "ping");
    assert_eq!(pings.len(), 1);
    let (_, ping) = &pings[0];
    assert_eq!(bson_util::first_key(ping), Some("ping"));
    assert_eq!(ping.get_str("$db").unwrap(), "admin");
    assert!(ping.get_document("lsid").unwrap().contains_key("id"));
    // No transaction attached, so autocommit must be absent entirely.
    assert!(!ping.contains_key("autocommit"));
    assert!(!ping.contains_key("txnNumber"));
}

#[tokio::test]
async fn replies_correlate_under_concurrency() {
    let log: CommandLog = Default::default();
    let server = MockServer::start(logging_handler(log.clone(), |name, command| {
        if name == "echo" {
            let n = command.get_i32("echo").unwrap_or(-1);
            MockReply::Doc(doc! { "n": n })
        } else {
            MockReply::Doc(doc! {})
        }
    }))
    .await;

    let client = server.client("maxConnections=2");
    let db = client.database("test");

    let handles: Vec<_> = (0..8)
        .map(|n| {
            let db = db.clone();
            tokio::spawn(async move { (n, db.run_command(doc! { "echo": n }).await.unwrap()) })
        })
        .collect();

    for handle in handles {
        let (n, reply) = handle.await.unwrap();
        assert_eq!(reply.get_i32("n").unwrap(), n);
    }
}

#[tokio::test]
async fn socket_timeout_poisons_the_connection() {
    let log: CommandLog = Default::default();
    let server = MockServer::start(logging_handler(log.clone(), |name, _| {
        if name == "block" {
            MockReply::Ignore
        } else {
            MockReply::Doc(doc! {})
        }
    }))
    .await;

    let client = server.client("socketTimeoutMS=200");
    let db = client.database("test");

    let start = Instant::now();
    let error = db.run_command(doc! { "block": 1 }).await.unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(
        *error.kind,
        ErrorKind::Timeout {
            scope: TimeoutScope::Socket
        }
    ));
    assert!(elapsed >= Duration::from_millis(200), "elapsed: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(500), "elapsed: {:?}", elapsed);

    // The poisoned connection is discarded; the next command handshakes a fresh one.
    db.run_command(doc! { "ping": 1 }).await.unwrap();
    let connections: std::collections::HashSet<u32> = log
        .lock()
        .unwrap()
        .iter()
        .map(|(connection, _)| *connection)
        .collect();
    assert_eq!(connections.len(), 2);
}

#[tokio::test]
async fn server_errors_surface_code_and_labels() {
    let log: CommandLog = Default::default();
    let server = MockServer::start(logging_handler(log.clone(), |name, _| {
        if name == "failme" {
            MockReply::Doc(doc! {
                "ok": 0,
                "code": 112,
                "codeName": "WriteConflict",
                "errmsg": "please retry",
                "errorLabels": ["TransientTransactionError"],
            })
        } else {
            MockReply::Doc(doc! {})
        }
    }))
    .await;

    let client = server.client("");
    let error = client
        .database("test")
        .run_command(doc! { "failme": 1 })
        .await
        .unwrap_err();

    assert_eq!(error.code(), Some(112));
    assert!(error.contains_label("TransientTransactionError"));
    match *error.kind {
        ErrorKind::Command(ref command_error) => {
            assert_eq!(command_error.code_name, "WriteConflict");
            assert_eq!(command_error.message, "please retry");
        }
        ref other => panic!("expected Command error, got {:?}", other),
    }
}

#[tokio::test]
async fn cursor_yields_all_documents_in_order() {
    let log: CommandLog = Default::default();
    let get_mores = Arc::new(Mutex::new(0i32));
    let get_mores_handler = get_mores.clone();

    let server = MockServer::start(logging_handler(
        log.clone(),
        move |name, command| match name {
            "find" => MockReply::Doc(doc! {
                "cursor": {
                    "id": 99i64,
                    "ns": "test.items",
                    "firstBatch": [{ "n": 0 }, { "n": 1 }],
                },
            }),
            "getMore" => {
                assert_eq!(command.get_i64("getMore").unwrap(), 99);
                assert_eq!(command.get_str("collection").unwrap(), "items");
                assert_eq!(command.get_i32("batchSize").unwrap(), 2);

                let mut count = get_mores_handler.lock().unwrap();
                *count += 1;
                match *count {
                    1 => MockReply::Doc(doc! {
                        "cursor": { "id": 99i64, "ns": "test.items", "nextBatch": [{ "n": 2 }] },
                    }),
                    // An empty batch from a still-live cursor; the driver must keep going.
                    2 => MockReply::Doc(doc! {
                        "cursor": { "id": 99i64, "ns": "test.items", "nextBatch": [] },
                    }),
                    _ => MockReply::Doc(doc! {
                        "cursor": {
                            "id": 0i64,
                            "ns": "test.items",
                            "nextBatch": [{ "n": 3 }, { "n": 4 }],
                        },
                    }),
                }
            }
            _ => MockReply::Doc(doc! {}),
        },
    ))
    .await;

    let client = server.client("");
    let cursor = client
        .database("test")
        .run_cursor_command(doc! { "find": "items", "batchSize": 2 })
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = seen.clone();
    cursor
        .for_each(move |doc: Document| {
            seen_cb.lock().unwrap().push(doc.get_i32("n").unwrap());
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    assert_eq!(*get_mores.lock().unwrap(), 3);

    // An exhausted cursor has nothing left to kill.
    assert!(logged_commands(&log, "killCursors").is_empty());
}

#[tokio::test]
async fn single_batch_cursors_release_their_connection_immediately() {
    let log: CommandLog = Default::default();
    let server = MockServer::start(logging_handler(log.clone(), |name, _| match name {
        "find" => MockReply::Doc(doc! {
            "cursor": {
                "id": 0i64,
                "ns": "test.items",
                "firstBatch": [{ "n": 0 }, { "n": 1 }],
            },
        }),
        _ => MockReply::Doc(doc! {}),
    }))
    .await;

    let client = server.client("");
    let cursor = client
        .database("test")
        .run_cursor_command(doc! { "find": "items" })
        .await
        .unwrap();
    assert_eq!(cursor.id(), 0);

    let docs: Vec<Document> = futures_util::TryStreamExt::try_collect(cursor).await.unwrap();
    let ns: Vec<i32> = docs.iter().map(|d| d.get_i32("n").unwrap()).collect();
    assert_eq!(ns, vec![0, 1]);

    assert!(logged_commands(&log, "getMore").is_empty());
    assert!(logged_commands(&log, "killCursors").is_empty());
}

#[tokio::test]
async fn dropped_cursor_kills_server_cursor() {
    let log: CommandLog = Default::default();
    let server = MockServer::start(logging_handler(log.clone(), |name, _| match name {
        "find" => MockReply::Doc(doc! {
            "cursor": {
                "id": 7i64,
                "ns": "test.items",
                "firstBatch": [{ "n": 0 }],
            },
        }),
        _ => MockReply::Doc(doc! {}),
    }))
    .await;

    let client = server.client("");
    let cursor = client
        .database("test")
        .run_cursor_command(doc! { "find": "items" })
        .await
        .unwrap();
    assert_eq!(cursor.id(), 7);
    drop(cursor);

    // The kill is spawned in the background; poll until the mock has seen it.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let kills = logged_commands(&log, "killCursors");
        if let Some((_, kill)) = kills.first() {
            assert_eq!(kill.get_str("killCursors").unwrap(), "items");
            assert_eq!(kill.get_array("cursors").unwrap().len(), 1);
            // killCursors never carries a session id.
            assert!(!kill.contains_key("lsid"));
            break;
        }
        assert!(Instant::now() < deadline, "killCursors never arrived");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn transactions_pin_their_connection() {
    let log: CommandLog = Default::default();
    let server = MockServer::start(logging_handler(log.clone(), |_, _| {
        MockReply::Doc(doc! {})
    }))
    .await;

    let client = server.client("maxConnections=4");
    let db = client.database("test");
    let mut session = client.start_session().await;

    session.start_transaction().unwrap();
    assert_eq!(session.transaction_state(), TransactionState::Starting);

    let first = db
        .run_command_with_session(doc! { "count": "items" }, &mut session)
        .await
        .unwrap();
    assert_eq!(session.transaction_state(), TransactionState::InProgress);

    let second = db
        .run_command_with_session(doc! { "count": "items" }, &mut session)
        .await
        .unwrap();

    // Both operations must have run on the same connection.
    assert_eq!(
        first.get_i32("mockConnectionId").unwrap(),
        second.get_i32("mockConnectionId").unwrap(),
    );

    session.commit_transaction().await.unwrap();
    assert_eq!(session.transaction_state(), TransactionState::Committed);

    let counts = logged_commands(&log, "count");
    assert_eq!(counts.len(), 2);
    let (_, first_command) = &counts[0];
    assert_eq!(first_command.get_i64("txnNumber").unwrap(), 1);
    assert_eq!(first_command.get_bool("autocommit").unwrap(), false);
    assert_eq!(first_command.get_bool("startTransaction").unwrap(), true);
    let (_, second_command) = &counts[1];
    assert!(!second_command.contains_key("startTransaction"));

    let commits = logged_commands(&log, "commitTransaction");
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].1.get_str("$db").unwrap(), "admin");
}

#[tokio::test]
async fn network_errors_in_transactions_are_labeled_transient() {
    let log: CommandLog = Default::default();
    let server = MockServer::start(logging_handler(log.clone(), |name, _| {
        if name == "boom" {
            MockReply::CloseConnection
        } else {
            MockReply::Doc(doc! {})
        }
    }))
    .await;

    let client = server.client("");
    let db = client.database("test");
    let mut session = client.start_session().await;

    session.start_transaction().unwrap();
    assert_eq!(session.transaction_number(), 1);

    let error = db
        .run_command_with_session(doc! { "boom": 1 }, &mut session)
        .await
        .unwrap_err();

    assert!(error.contains_label("TransientTransactionError"));
    assert_eq!(session.transaction_state(), TransactionState::Aborted);

    // The caller may retry with a whole new transaction, which gets a fresh number.
    session.start_transaction().unwrap();
    assert_eq!(session.transaction_number(), 2);
    session.abort_transaction().await.unwrap();
}

#[tokio::test]
async fn committing_an_unused_transaction_is_local() {
    let log: CommandLog = Default::default();
    let server = MockServer::start(logging_handler(log.clone(), |_, _| {
        MockReply::Doc(doc! {})
    }))
    .await;

    let client = server.client("");
    let mut session = client.start_session().await;

    session.start_transaction().unwrap();
    session.commit_transaction().await.unwrap();
    assert_eq!(session.transaction_state(), TransactionState::Committed);

    // Double-commit and abort-after-commit are rejected client side.
    assert!(session.commit_transaction().await.is_err());
    assert!(session.abort_transaction().await.is_err());

    assert!(logged_commands(&log, "commitTransaction").is_empty());
}

#[tokio::test]
async fn shutdown_reports_pooled_sessions() {
    let log: CommandLog = Default::default();
    let server = MockServer::start(logging_handler(log.clone(), |_, _| {
        MockReply::Doc(doc! {})
    }))
    .await;

    let client = server.client("");
    client
        .database("test")
        .run_command(doc! { "ping": 1 })
        .await
        .unwrap();

    // The implicit session is checked back in from a background task.
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.shutdown().await;

    let ends = logged_commands(&log, "endSessions");
    assert_eq!(ends.len(), 1);
    assert_eq!(ends[0].1.get_array("endSessions").unwrap().len(), 1);
}

#[tokio::test]
async fn more_to_come_replies_are_accumulated() {
    use crate::{
        cmap::conn::{Command, Connection},
        options::ServerAddress,
        runtime::AsyncStream,
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        if let Ok(Some((request_id, _, _))) = read_client_command(&mut stream).await {
            let _ = write_op_msg(
                &mut stream,
                request_id,
                &doc! { "seq": 0, "ok": 1 },
                MessageFlags::MORE_TO_COME,
            )
            .await;
            let _ = write_op_msg(
                &mut stream,
                request_id,
                &doc! { "seq": 1, "ok": 1 },
                MessageFlags::empty(),
            )
            .await;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let server_address = ServerAddress::parse(&address.to_string()).unwrap();
    let stream = AsyncStream::connect(&server_address, None).await.unwrap();
    let mut conn = Connection::new_testing(stream, None);

    let response = conn
        .execute(Command::new("ping", "admin", doc! { "ping": 1 }))
        .await
        .unwrap();

    assert_eq!(response.body.get_i32("seq").unwrap(), 0);
    assert_eq!(response.trailing.len(), 1);
    assert_eq!(response.trailing[0].get_i32("seq").unwrap(), 1);
}

#[tokio::test]
async fn unknown_response_ids_poison_the_connection() {
    use crate::{
        cmap::conn::{Command, Connection},
        options::ServerAddress,
        runtime::AsyncStream,
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        if let Ok(Some((request_id, _, _))) = read_client_command(&mut stream).await {
            // Reply to a request id that was never issued.
            let _ = write_op_msg(
                &mut stream,
                request_id.wrapping_add(999),
                &doc! { "ok": 1 },
                MessageFlags::empty(),
            )
            .await;
        }
        // Keep the socket open so the client fails on correlation, not on EOF.
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let server_address = ServerAddress::parse(&address.to_string()).unwrap();
    let stream = AsyncStream::connect(&server_address, None).await.unwrap();
    let mut conn = Connection::new_testing(stream, None);

    let error = conn
        .execute(Command::new("ping", "admin", doc! { "ping": 1, "$db": "admin" }))
        .await
        .unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::Protocol { .. }));
    assert!(conn.is_poisoned());

    let error = conn
        .execute(Command::new("ping", "admin", doc! { "ping": 1, "$db": "admin" }))
        .await
        .unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::ConnectionClosed));
}
