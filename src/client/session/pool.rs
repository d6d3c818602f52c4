use std::{collections::VecDeque, time::Duration};

use tokio::sync::Mutex;

use super::ServerSession;
use crate::bson::Document;

/// A pool of server sessions, reused in last-in-first-out order so that the sessions most
/// likely to still be alive server-side are handed out first.
#[derive(Debug, Default)]
pub(crate) struct ServerSessionPool {
    pool: Mutex<VecDeque<ServerSession>>,
}

impl ServerSessionPool {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    /// Checks out a server session from the pool, discarding any session it skips over that is
    /// about to expire. If no reusable session remains, a new one is created.
    pub(crate) async fn check_out(&self, logical_session_timeout: Duration) -> ServerSession {
        let mut pool = self.pool.lock().await;
        while let Some(session) = pool.pop_front() {
            if session.is_about_to_expire(logical_session_timeout) {
                continue;
            }
            return session;
        }
        ServerSession::new()
    }

    /// Checks a server session back into the pool. Dirty and nearly-expired sessions are
    /// discarded instead of pooled.
    pub(crate) async fn check_in(
        &self,
        session: ServerSession,
        logical_session_timeout: Duration,
    ) {
        let mut pool = self.pool.lock().await;
        while let Some(pooled_session) = pool.pop_back() {
            if pooled_session.is_about_to_expire(logical_session_timeout) {
                continue;
            }
            pool.push_back(pooled_session);
            break;
        }

        if !session.dirty && !session.is_about_to_expire(logical_session_timeout) {
            pool.push_front(session);
        }
    }

    /// Drops every pooled session that is within a minute of expiring server-side.
    pub(crate) async fn sweep(&self, logical_session_timeout: Duration) -> usize {
        let mut pool = self.pool.lock().await;
        let before = pool.len();
        pool.retain(|session| !session.is_about_to_expire(logical_session_timeout));
        before - pool.len()
    }

    /// Empties the pool, returning the ids of all sessions it held so they can be reported via
    /// `endSessions`.
    pub(crate) async fn drain_ids(&self) -> Vec<Document> {
        let mut pool = self.pool.lock().await;
        pool.drain(..).map(|session| session.id).collect()
    }

    #[cfg(test)]
    pub(crate) async fn contains(&self, id: &Document) -> bool {
        self.pool.lock().await.iter().any(|s| &s.id == id)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::ServerSessionPool;
    use crate::client::session::ServerSession;

    const TIMEOUT: Duration = Duration::from_secs(30 * 60);

    #[tokio::test]
    async fn sessions_are_reused_most_recent_first() {
        let pool = ServerSessionPool::new();

        let first = ServerSession::new();
        let second = ServerSession::new();
        let first_id = first.id.clone();
        let second_id = second.id.clone();

        pool.check_in(first, TIMEOUT).await;
        pool.check_in(second, TIMEOUT).await;

        let reused = pool.check_out(TIMEOUT).await;
        assert_eq!(reused.id, second_id);
        let reused = pool.check_out(TIMEOUT).await;
        assert_eq!(reused.id, first_id);

        // Pool empty now, so a fresh session is created.
        let fresh = pool.check_out(TIMEOUT).await;
        assert_ne!(fresh.id, first_id);
        assert_ne!(fresh.id, second_id);
    }

    #[tokio::test]
    async fn dirty_sessions_are_not_pooled() {
        let pool = ServerSessionPool::new();

        let mut session = ServerSession::new();
        session.dirty = true;
        let id = session.id.clone();
        pool.check_in(session, TIMEOUT).await;

        assert!(!pool.contains(&id).await);
    }

    #[tokio::test]
    async fn expired_sessions_are_swept() {
        let pool = ServerSessionPool::new();
        pool.check_in(ServerSession::new(), TIMEOUT).await;

        // With a tiny timeout, every session counts as about to expire.
        let evicted = pool.sweep(Duration::from_millis(1)).await;
        assert_eq!(evicted, 1);
        assert_eq!(pool.sweep(Duration::from_millis(1)).await, 0);
    }
}
