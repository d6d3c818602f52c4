use std::time::Duration;

use crate::{client::auth::Credential, options::ClientOptions};

/// The default maximum number of connections a per-host pool may own.
pub(crate) const DEFAULT_MAX_POOL_SIZE: u32 = 10;

/// Contains the options for creating a connection pool.
#[derive(Clone, Debug, Default)]
pub(crate) struct ConnectionPoolOptions {
    /// The maximum number of connections the pool may have live at once. `0` means unbounded.
    pub(crate) max_pool_size: Option<u32>,

    /// How long a checkout may wait, and how long stream establishment may take.
    pub(crate) connect_timeout: Option<Duration>,

    /// The per-command socket deadline applied to every connection from this pool.
    pub(crate) socket_timeout: Option<Duration>,

    /// The credential new connections authenticate with during establishment.
    pub(crate) credential: Option<Credential>,
}

impl ConnectionPoolOptions {
    pub(crate) fn from_client_options(options: &ClientOptions) -> Self {
        Self {
            max_pool_size: options.max_pool_size,
            connect_timeout: options.connect_timeout,
            socket_timeout: options.socket_timeout,
            credential: options.credential.clone(),
        }
    }
}
