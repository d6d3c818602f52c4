use lazy_static::lazy_static;

use crate::{
    bson::{doc, Document},
    cmap::conn::{Command, Connection},
    error::Result,
    hello::{HelloCommandResponse, LEGACY_HELLO_COMMAND_NAME},
};

lazy_static! {
    /// Contains the basic handshake information that can be statically determined. This
    /// document (potentially with additional fields added) can be cloned and put in the
    /// `client` field of the `isMaster` command.
    static ref BASE_CLIENT_METADATA: Document = {
        doc! {
            "driver": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "os": {
                "type": std::env::consts::OS,
                "architecture": std::env::consts::ARCH,
            },
        }
    };
}

#[derive(Clone, Debug, Default)]
pub(crate) struct HandshakerOptions {
    /// The application name specified by the user, sent to the server as
    /// `client.application.name`.
    pub(crate) app_name: Option<String>,
}

/// Contains the logic needed to handshake a connection.
#[derive(Clone, Debug)]
pub(crate) struct Handshaker {
    /// The hello command to send when handshaking a connection.
    command_body: Document,
}

impl Handshaker {
    /// Creates a new Handshaker.
    pub(crate) fn new(options: HandshakerOptions) -> Self {
        let mut metadata = BASE_CLIENT_METADATA.clone();
        if let Some(name) = options.app_name {
            metadata.insert("application", doc! { "name": name });
        }

        // The handshake always uses the legacy command name over OP_QUERY, since the server's
        // wire version is not known until it answers.
        let command_body = doc! {
            LEGACY_HELLO_COMMAND_NAME: 1,
            "helloOk": true,
            "client": metadata,
            "compression": [],
        };

        Self { command_body }
    }

    /// Handshakes the given connection, returning the server's reply.
    pub(crate) async fn handshake(&self, conn: &mut Connection) -> Result<HelloCommandResponse> {
        let command = Command::new(LEGACY_HELLO_COMMAND_NAME, "admin", self.command_body.clone());
        let response = conn.execute(command).await?;
        response.typed_body()
    }
}
