use crate::cmap::PinnedConnectionHandle;

/// The state of a session's transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum TransactionState {
    /// There is no transaction in progress.
    None,

    /// A transaction has been started, but no operation has been sent to the server yet.
    Starting,

    /// A transaction is in progress.
    InProgress,

    /// The transaction was committed.
    Committed,

    /// The transaction was aborted, either explicitly or because an operation inside it hit a
    /// transient error.
    Aborted,
}

/// The per-session transaction record.
///
/// Transaction numbers strictly increase over the session's lifetime and are never reused;
/// once an operation has run inside the transaction, all further operations are pinned to the
/// connection the first one used.
#[derive(Debug)]
pub(crate) struct Transaction {
    pub(crate) state: TransactionState,
    pub(crate) number: i64,
    pub(crate) pinned_connection: Option<PinnedConnectionHandle>,
}

impl Transaction {
    pub(crate) fn new() -> Self {
        Self {
            state: TransactionState::None,
            number: 0,
            pinned_connection: None,
        }
    }

    pub(crate) fn begin(&mut self) {
        self.number += 1;
        self.state = TransactionState::Starting;
        self.pinned_connection = None;
    }

    pub(crate) fn is_active(&self) -> bool {
        matches!(
            self.state,
            TransactionState::Starting | TransactionState::InProgress
        )
    }

    pub(crate) fn pin_connection(&mut self, handle: PinnedConnectionHandle) {
        self.pinned_connection = Some(handle);
    }

    pub(crate) fn pinned_connection(&self) -> Option<PinnedConnectionHandle> {
        self.pinned_connection
            .as_ref()
            .map(PinnedConnectionHandle::replicate)
    }

    /// Moves the transaction into a terminal state, releasing the pinned connection back to
    /// its pool.
    pub(crate) fn finish(&mut self, state: TransactionState) {
        self.state = state;
        self.pinned_connection = None;
    }
}

#[cfg(test)]
mod test {
    use super::{Transaction, TransactionState};

    #[test]
    fn transaction_numbers_strictly_increase() {
        let mut transaction = Transaction::new();
        assert_eq!(transaction.state, TransactionState::None);

        transaction.begin();
        assert_eq!(transaction.state, TransactionState::Starting);
        assert_eq!(transaction.number, 1);

        transaction.finish(TransactionState::Aborted);
        transaction.begin();
        assert_eq!(transaction.number, 2);

        transaction.finish(TransactionState::Committed);
        transaction.begin();
        assert_eq!(transaction.number, 3);
    }
}
