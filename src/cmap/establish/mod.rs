pub(crate) mod handshake;

use std::time::Duration;

use self::handshake::{Handshaker, HandshakerOptions};
use super::conn::{Connection, StreamDescription};
use crate::{
    client::auth::{self, Credential},
    error::{Result, TimeoutScope},
    options::{ClientOptions, ServerAddress},
    runtime::{self, AsyncStream, TlsConfig, DEFAULT_CONNECT_TIMEOUT},
    trace::CONNECTION_TRACING_EVENT_TARGET,
};

/// Contains the logic to establish a connection, including handshaking and authenticating.
#[derive(Clone)]
pub(crate) struct ConnectionEstablisher {
    handshaker: Handshaker,

    /// Cached configuration needed to create TLS streams, if TLS is enabled.
    tls_config: Option<TlsConfig>,

    connect_timeout: Duration,
}

impl std::fmt::Debug for ConnectionEstablisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEstablisher")
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl ConnectionEstablisher {
    /// Creates a new ConnectionEstablisher from the given client options.
    pub(crate) fn from_client_options(options: &ClientOptions) -> Result<Self> {
        let tls_config = match options.tls {
            Some(ref tls_options) => Some(TlsConfig::new(tls_options)?),
            None => None,
        };

        Ok(Self {
            handshaker: Handshaker::new(HandshakerOptions {
                app_name: options.app_name.clone(),
            }),
            tls_config,
            connect_timeout: options.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
        })
    }

    /// Establishes a connection: opens the stream, performs the handshake, and authenticates
    /// if a credential was provided.
    ///
    /// Authentication happens here, before the connection ever enters the pool, and attaches
    /// no session or transaction metadata.
    pub(crate) async fn establish_connection(
        &self,
        id: u32,
        address: &ServerAddress,
        credential: Option<&Credential>,
        socket_timeout: Option<Duration>,
    ) -> Result<Connection> {
        let stream = runtime::timeout(
            self.connect_timeout,
            TimeoutScope::Connect,
            AsyncStream::connect(address, self.tls_config.as_ref()),
        )
        .await??;

        let mut connection = Connection::new(id, address.clone(), stream, socket_timeout);

        let hello_reply = self.handshaker.handshake(&mut connection).await?;
        let description = StreamDescription::from_hello_response(&hello_reply);
        tracing::debug!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            connection_id = id,
            address = %address,
            max_wire_version = description.max_wire_version,
            max_bson_object_size = description.max_bson_object_size,
            max_message_size_bytes = description.max_message_size_bytes,
            max_write_batch_size = description.max_write_batch_size,
            logical_session_timeout = ?description.logical_session_timeout,
            "connection handshake completed",
        );
        connection.set_stream_description(description);

        if let Some(credential) = credential {
            auth::authenticate_connection(&mut connection, credential).await?;
        }

        Ok(connection)
    }
}
