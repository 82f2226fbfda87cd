//! Optimistic local mutation with rollback.
//!
//! The pattern is always the same: snapshot the state, apply the change
//! locally so the UI reflects it at once, try to commit remotely, and put
//! the snapshot back if the commit fails. [`LocalTransaction`] holds the
//! snapshot; [`apply_optimistic`] runs the whole sequence when the caller
//! has nothing to do between the local apply and the remote commit.

use std::future::Future;

/// A snapshot taken before an optimistic change.
///
/// Dropping it (or calling [`commit`](Self::commit)) keeps the change.
#[derive(Debug, Clone)]
pub struct LocalTransaction<T: Clone> {
    snapshot: T,
}

impl<T: Clone> LocalTransaction<T> {
    /// Deep-copy `state` so it can be restored later.
    pub fn begin(state: &T) -> Self {
        Self {
            snapshot: state.clone(),
        }
    }

    pub fn snapshot(&self) -> &T {
        &self.snapshot
    }

    /// Put the snapshot back, discarding everything applied since `begin`.
    pub fn rollback(self, state: &mut T) {
        *state = self.snapshot;
    }

    pub fn commit(self) {}
}

/// Snapshot `state`, apply `mutate`, then run `commit` on its output.
///
/// `mutate` returns `None` when there is nothing to commit; the state is
/// then restored in case the closure touched it, and `Ok(None)` comes
/// back. When `commit` fails the state is restored and the error is
/// returned.
pub async fn apply_optimistic<T, R, E, M, C, Fut>(
    state: &mut T,
    mutate: M,
    commit: C,
) -> Result<Option<R>, E>
where
    T: Clone,
    R: Clone,
    M: FnOnce(&mut T) -> Option<R>,
    C: FnOnce(R) -> Fut,
    Fut: Future<Output = Result<(), E>>,
{
    let txn = LocalTransaction::begin(state);
    let Some(change) = mutate(state) else {
        txn.rollback(state);
        return Ok(None);
    };

    match commit(change.clone()).await {
        Ok(()) => {
            txn.commit();
            Ok(Some(change))
        }
        Err(e) => {
            txn.rollback(state);
            Err(e)
        }
    }
}
