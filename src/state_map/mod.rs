use crate::protocol::StateEntry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Lowercased state name to protocol state id, as last reported by veadotube.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateMap {
    ids: HashMap<String, String>,
}

impl StateMap {
    /// Later entries win when two names collide after lowercasing.
    pub fn from_entries(entries: &[StateEntry]) -> Self {
        let mut ids = HashMap::with_capacity(entries.len());
        for entry in entries {
            let name = entry.name.to_lowercase();
            if let Some(previous) = ids.insert(name.clone(), entry.id.clone()) {
                tracing::debug!(
                    state = %name,
                    previous_id = %previous,
                    id = %entry.id,
                    "state name collision, keeping later entry"
                );
            }
        }
        Self { ids }
    }

    pub fn resolve(&self, name: &str) -> Option<&str> {
        self.ids.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Entries sorted by name.
    pub fn entries(&self) -> Vec<(&str, &str)> {
        let mut entries: Vec<_> = self
            .ids
            .iter()
            .map(|(name, id)| (name.as_str(), id.as_str()))
            .collect();
        entries.sort_unstable();
        entries
    }
}

pub type StateMapSnapshot = Option<Arc<StateMap>>;

/// Publishes whole-map replacements; readers always see a complete map.
#[derive(Debug)]
pub struct StateMapCell {
    tx: watch::Sender<StateMapSnapshot>,
}

impl StateMapCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn rebuild(&self, entries: &[StateEntry]) -> Arc<StateMap> {
        let map = Arc::new(StateMap::from_entries(entries));
        self.tx.send_replace(Some(map.clone()));
        tracing::info!(states = ?map.entries(), "built state map");
        map
    }

    pub fn current(&self) -> StateMapSnapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StateMapSnapshot> {
        self.tx.subscribe()
    }
}

impl Default for StateMapCell {
    fn default() -> Self {
        Self::new()
    }
}
