use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;

use crate::component::{ComponentKind, ComponentState};
use crate::router::MeshCall;

/// One live registry entry. State sits behind its own lock so failure
/// transitions on one component never contend with routing to another.
pub struct ComponentEntry {
    name: String,
    kind: ComponentKind,
    state: Mutex<ComponentState>,
    mailbox: mpsc::Sender<MeshCall>,
}

impl ComponentEntry {
    pub(crate) fn new(name: String, kind: ComponentKind, mailbox: mpsc::Sender<MeshCall>) -> Self {
        Self {
            name,
            kind,
            state: Mutex::new(ComponentState::Registered),
            mailbox,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    pub fn state(&self) -> ComponentState {
        *self.state.lock().expect("Mutex poisoned")
    }

    pub(crate) fn set_state(&self, state: ComponentState) {
        *self.state.lock().expect("Mutex poisoned") = state;
    }

    pub(crate) fn mailbox(&self) -> &mpsc::Sender<MeshCall> {
        &self.mailbox
    }
}

/// Registry of live components, owned by the host and shared by reference.
///
/// The outer map is only written on registration and removal; call routing
/// takes the read lock, clones the entry handle, and drops the lock before
/// touching the mailbox.
#[derive(Default)]
pub struct ComponentRegistry {
    entries: RwLock<HashMap<String, Arc<ComponentEntry>>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, entry: Arc<ComponentEntry>) {
        let mut entries = self.entries.write().expect("RwLock poisoned");
        entries.insert(entry.name().to_string(), entry);
    }

    pub fn get(&self, name: &str) -> Option<Arc<ComponentEntry>> {
        let entries = self.entries.read().expect("RwLock poisoned");
        entries.get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut entries = self.entries.write().expect("RwLock poisoned");
        entries.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        let entries = self.entries.read().expect("RwLock poisoned");
        entries.contains_key(name)
    }

    /// Snapshot of (name, kind, state) for every entry, for observability.
    pub fn list(&self) -> Vec<(String, ComponentKind, ComponentState)> {
        let entries = self.entries.read().expect("RwLock poisoned");
        let mut listing: Vec<_> = entries
            .values()
            .map(|entry| (entry.name().to_string(), entry.kind(), entry.state()))
            .collect();
        listing.sort_by(|a, b| a.0.cmp(&b.0));
        listing
    }
}
