//! Observable id → [`Instance`] map. Single source of truth for rendering.
//!
//! The map lives inside a `tokio::sync::watch` channel: every write goes
//! through the sender's internal lock, so concurrent patches to the same id
//! are serialized (last applied wins on the touched fields), and every
//! subscriber sees the new snapshot.

use std::collections::BTreeMap;

use tokio::sync::watch;

use super::{Instance, InstancePatch, InstanceStatus};

pub type InstanceMap = BTreeMap<String, Instance>;

pub struct InstanceStore {
    tx: watch::Sender<InstanceMap>,
}

impl Default for InstanceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(InstanceMap::new());
        Self { tx }
    }

    pub fn get(&self, id: &str) -> Option<Instance> {
        self.tx.borrow().get(id).cloned()
    }

    pub fn status(&self, id: &str) -> Option<InstanceStatus> {
        self.tx.borrow().get(id).map(|i| i.status)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tx.borrow().contains_key(id)
    }

    /// All records. Order is by id; presentation re-sorts as it likes.
    pub fn list(&self) -> Vec<Instance> {
        self.tx.borrow().values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.tx.borrow().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tx.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.borrow().is_empty()
    }

    /// Insert or fully replace the record with the same id.
    pub fn upsert(&self, instance: Instance) {
        self.tx.send_if_modified(|map| {
            let id = instance.id.clone();
            match map.get(&id) {
                Some(existing) if *existing == instance => false,
                _ => {
                    map.insert(id, instance);
                    true
                }
            }
        });
    }

    /// Insert only if no record with this id exists. Returns whether it was inserted.
    pub fn insert_if_absent(&self, instance: Instance) -> bool {
        self.tx.send_if_modified(|map| {
            if map.contains_key(&instance.id) {
                return false;
            }
            map.insert(instance.id.clone(), instance);
            true
        })
    }

    /// Merge `patch` into the record. Returns `false` if the id is unknown.
    pub fn patch(&self, id: &str, patch: &InstancePatch) -> bool {
        let mut found = false;
        self.tx.send_if_modified(|map| match map.get_mut(id) {
            Some(instance) => {
                found = true;
                patch.apply(instance)
            }
            None => false,
        });
        found
    }

    pub fn set_status(&self, id: &str, status: InstanceStatus) -> bool {
        self.patch(id, &InstancePatch::status(status))
    }

    pub fn remove(&self, id: &str) -> Option<Instance> {
        let mut removed = None;
        self.tx.send_if_modified(|map| {
            removed = map.remove(id);
            removed.is_some()
        });
        removed
    }

    /// Replace the whole map (initial load).
    pub fn replace_all(&self, instances: Vec<Instance>) {
        let map: InstanceMap = instances
            .into_iter()
            .map(|i| (i.id.clone(), i))
            .collect();
        self.tx.send_replace(map);
    }

    /// Subscribe to snapshots. The receiver is read-only by construction.
    pub fn subscribe(&self) -> watch::Receiver<InstanceMap> {
        self.tx.subscribe()
    }
}
