//! Per-instance "operation in flight" set.
//!
//! Membership means a start/stop/delete/repair/reinstall request for that
//! id has not settled yet; a second request for the same id is dropped.

use std::collections::BTreeSet;

use tokio::sync::watch;

pub struct OperationGuard {
    tx: watch::Sender<BTreeSet<String>>,
}

impl Default for OperationGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationGuard {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(BTreeSet::new());
        Self { tx }
    }

    /// Test-and-insert in one step. Returns `false` if `id` was already guarded.
    pub fn try_acquire(&self, id: &str) -> bool {
        self.tx.send_if_modified(|set| set.insert(id.to_string()))
    }

    /// Returns whether `id` was guarded.
    pub fn release(&self, id: &str) -> bool {
        let released = self.tx.send_if_modified(|set| set.remove(id));
        if released {
            tracing::debug!("Operation guard cleared for {id}");
        }
        released
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tx.borrow().contains(id)
    }

    pub fn is_empty(&self) -> bool {
        self.tx.borrow().is_empty()
    }

    pub fn len(&self) -> usize {
        self.tx.borrow().len()
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.tx.borrow().iter().cloned().collect()
    }

    pub fn subscribe(&self) -> watch::Receiver<BTreeSet<String>> {
        self.tx.subscribe()
    }
}
