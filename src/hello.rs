use serde::Deserialize;

/// The legacy version of the `hello` command, deprecated in 5.0 but understood by every server
/// the driver can talk to. To limit usages of the legacy name in the codebase, this constant
/// should be used wherever possible.
pub(crate) const LEGACY_HELLO_COMMAND_NAME: &str = "isMaster";

/// The portion of a `hello` (or legacy `isMaster`) reply that dictates how the connection may
/// be used.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HelloCommandResponse {
    /// The maximum wire version that the server supports.
    pub(crate) max_wire_version: Option<i32>,

    /// The maximum permitted size of a BSON object in bytes.
    pub(crate) max_bson_object_size: Option<i64>,

    /// The maximum permitted size of a wire protocol frame.
    pub(crate) max_message_size_bytes: Option<i32>,

    /// The maximum number of write operations permitted in a write batch.
    pub(crate) max_write_batch_size: Option<i64>,

    /// The time in minutes that a session remains active after its most recent use.
    pub(crate) logical_session_timeout_minutes: Option<i64>,
}
