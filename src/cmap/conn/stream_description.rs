use std::time::Duration;

use crate::{cmap::conn::wire::DEFAULT_MAX_MESSAGE_SIZE_BYTES, hello::HelloCommandResponse};

/// Contains the results of the handshake, which dictate how the connection may be used.
#[derive(Clone, Debug)]
pub(crate) struct StreamDescription {
    /// The maximum wire version that the server understands. OP_MSG requires at least 6.
    pub(crate) max_wire_version: i32,

    /// The maximum permitted size of a BSON object in bytes.
    pub(crate) max_bson_object_size: i64,

    /// The maximum permitted size of a wire protocol frame.
    pub(crate) max_message_size_bytes: i32,

    /// The maximum number of write operations permitted in a write batch.
    pub(crate) max_write_batch_size: i64,

    /// How long the server keeps an idle logical session alive.
    pub(crate) logical_session_timeout: Option<Duration>,
}

impl StreamDescription {
    /// Constructs a new StreamDescription from a `hello` or legacy `isMaster` reply.
    pub(crate) fn from_hello_response(reply: &HelloCommandResponse) -> Self {
        Self {
            max_wire_version: reply.max_wire_version.unwrap_or(0),
            max_bson_object_size: reply.max_bson_object_size.unwrap_or(16 * 1024 * 1024),
            max_message_size_bytes: reply
                .max_message_size_bytes
                .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES),
            max_write_batch_size: reply.max_write_batch_size.unwrap_or(100_000),
            logical_session_timeout: reply
                .logical_session_timeout_minutes
                .map(|mins| Duration::from_secs(mins as u64 * 60)),
        }
    }

    /// Whether this connection may frame commands as OP_MSG.
    pub(crate) fn supports_op_msg(&self) -> bool {
        self.max_wire_version >= 6
    }

    /// Gets a description of a stream for a 4.x server, for testing.
    #[cfg(test)]
    pub(crate) fn new_testing() -> Self {
        Self {
            max_wire_version: 8,
            max_bson_object_size: 16 * 1024 * 1024,
            max_message_size_bytes: DEFAULT_MAX_MESSAGE_SIZE_BYTES,
            max_write_batch_size: 100_000,
            logical_session_timeout: Some(Duration::from_secs(30 * 60)),
        }
    }
}
