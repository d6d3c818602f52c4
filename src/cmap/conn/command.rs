use serde::de::DeserializeOwned;

use crate::{
    bson::Document,
    bson_util,
    client::session::ClusterTime,
    error::{CommandError, Error, ErrorKind, Result},
    options::ServerAddress,
};

/// A driver-side abstraction of a server command, containing everything needed to serialize it
/// to a wire frame.
///
/// The first key of `body` is always the command name; the dispatcher appends routing and
/// session metadata behind it.
#[derive(Clone, Debug)]
pub(crate) struct Command {
    pub(crate) name: String,
    pub(crate) target_db: String,
    pub(crate) body: Document,
    pub(crate) document_sequences: Vec<(String, Vec<Document>)>,
    pub(crate) exhaust_allowed: bool,

    /// Whether the command accepts a `readConcern`, which is where causally consistent
    /// sessions carry `afterClusterTime`.
    pub(crate) supports_read_concern: bool,
}

impl Command {
    pub(crate) fn new(
        name: impl Into<String>,
        target_db: impl Into<String>,
        body: Document,
    ) -> Self {
        Self {
            name: name.into(),
            target_db: target_db.into(),
            body,
            document_sequences: Vec::new(),
            exhaust_allowed: false,
            supports_read_concern: false,
        }
    }

    /// Attaches a payload type 1 document sequence, used to batch `documents`, `updates`, and
    /// `deletes` without growing the body document.
    pub(crate) fn add_document_sequence(
        &mut self,
        identifier: impl Into<String>,
        documents: Vec<Document>,
    ) {
        self.document_sequences.push((identifier.into(), documents));
    }
}

/// The server's reply to a command, decoded as far as the enclosing document.
///
/// An `Ok` response simply means the server received the command and replied; whether the
/// command itself succeeded is a property of `body`.
#[derive(Clone, Debug)]
pub(crate) struct CommandResponse {
    pub(crate) source: ServerAddress,
    pub(crate) body: Document,

    /// Documents delivered by `moreToCome` continuation frames (exhaust mode). Empty for the
    /// ordinary one-reply-per-request flow.
    pub(crate) trailing: Vec<Document>,
}

impl CommandResponse {
    pub(crate) fn new(source: ServerAddress, bodies: Vec<Document>) -> Result<Self> {
        let mut bodies = bodies.into_iter();
        let body = bodies
            .next()
            .ok_or_else(|| Error::internal("a reply completed with no frames"))?;

        Ok(Self {
            source,
            body,
            trailing: bodies.collect(),
        })
    }

    /// Whether this response indicates success, i.e. `ok: 1` in any numeric width.
    pub(crate) fn is_success(&self) -> bool {
        self.body
            .get("ok")
            .and_then(bson_util::get_int)
            .map(|ok| ok >= 1)
            .unwrap_or(false)
    }

    /// Returns an error if this response corresponds to a command failure.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.is_success() {
            return Ok(());
        }

        let command_error: CommandError = bson::from_document(self.body.clone())
            .map_err(|_| Error::invalid_response("an `ok: 0` reply could not be decoded"))?;

        let labels = match self.body.get_array("errorLabels") {
            Ok(labels) => labels
                .iter()
                .filter_map(|label| label.as_str().map(String::from))
                .collect(),
            Err(_) => Vec::new(),
        };

        Err(Error::new(ErrorKind::Command(command_error), labels))
    }

    /// Deserializes the body of the response, failing with the command error on `ok: 0`.
    pub(crate) fn typed_body<T: DeserializeOwned>(&self) -> Result<T> {
        self.validate()?;
        Ok(bson::from_document(self.body.clone())?)
    }

    /// The `$clusterTime` the server gossiped on this reply, if any.
    pub(crate) fn cluster_time(&self) -> Option<ClusterTime> {
        self.body
            .get_document("$clusterTime")
            .ok()
            .and_then(|doc| bson::from_document(doc.clone()).ok())
    }

    /// The `operationTime` the server reported for this reply, if any.
    pub(crate) fn operation_time(&self) -> Option<crate::bson::Timestamp> {
        match self.body.get("operationTime") {
            Some(crate::bson::Bson::Timestamp(ts)) => Some(*ts),
            _ => None,
        }
    }
}
