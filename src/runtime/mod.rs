mod stream;
mod tls;

use std::{future::Future, time::Duration};

pub(crate) use self::{stream::AsyncStream, tls::TlsConfig};
use crate::error::{ErrorKind, Result, TimeoutScope};

pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Awaits `future`, failing with `ErrorKind::Timeout` in the given scope if it does not
/// complete within `duration`.
pub(crate) async fn timeout<F: Future>(
    duration: Duration,
    scope: TimeoutScope,
    future: F,
) -> Result<F::Output> {
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| ErrorKind::Timeout { scope }.into())
}

/// Spawns `future` on the current tokio runtime if one exists.
///
/// `Drop` impls use this to run async cleanup (pool check-in, `killCursors`, session
/// check-in). Outside a runtime the cleanup is skipped, which only forfeits best-effort
/// server-side tidying.
pub(crate) fn spawn_cleanup<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(future);
    }
}
