use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Session identity as seen by the connector.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentitySnapshot {
    pub access_token: Option<String>,
    pub session_id: Option<String>,
}

pub trait IdentityStore: Send + Sync {
    fn access_token(&self) -> Option<String>;

    fn session_id(&self) -> Option<String>;

    /// Push notifications for identity changes. Stores that return `None`
    /// are polled instead.
    fn watch(&self) -> Option<watch::Receiver<IdentitySnapshot>>;

    fn snapshot(&self) -> IdentitySnapshot {
        IdentitySnapshot {
            access_token: self.access_token(),
            session_id: self.session_id(),
        }
    }
}

pub type SharedIdentityStore = Arc<dyn IdentityStore>;

#[derive(Debug)]
pub struct MemoryIdentityStore {
    state: watch::Sender<IdentitySnapshot>,
}

impl Default for MemoryIdentityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        let (state, _) = watch::channel(IdentitySnapshot::default());
        Self { state }
    }

    pub fn with_identity(access_token: &str, session_id: &str) -> Self {
        let store = Self::new();
        store.set_access_token(Some(access_token.to_string()));
        store.set_session_id(Some(session_id.to_string()));
        store
    }

    pub fn set_access_token(&self, token: Option<String>) {
        self.state.send_if_modified(|snapshot| {
            let changed = snapshot.access_token != token;
            snapshot.access_token = token;
            changed
        });
    }

    pub fn set_session_id(&self, session_id: Option<String>) {
        self.state.send_if_modified(|snapshot| {
            let changed = snapshot.session_id != session_id;
            snapshot.session_id = session_id;
            changed
        });
    }

    pub fn clear(&self) {
        self.state.send_if_modified(|snapshot| {
            let changed = *snapshot != IdentitySnapshot::default();
            *snapshot = IdentitySnapshot::default();
            changed
        });
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn access_token(&self) -> Option<String> {
        self.state.borrow().access_token.clone()
    }

    fn session_id(&self) -> Option<String> {
        self.state.borrow().session_id.clone()
    }

    fn watch(&self) -> Option<watch::Receiver<IdentitySnapshot>> {
        Some(self.state.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updates_notify_only_on_change() {
        let store = MemoryIdentityStore::new();
        let mut changes = store.watch().unwrap();

        store.set_access_token(Some("a".into()));
        assert!(changes.has_changed().unwrap());
        changes.mark_unchanged();

        store.set_access_token(Some("a".into()));
        assert!(!changes.has_changed().unwrap());

        store.set_session_id(Some("s".into()));
        assert_eq!(
            store.snapshot(),
            IdentitySnapshot {
                access_token: Some("a".into()),
                session_id: Some("s".into()),
            }
        );
        store.clear();
        assert_eq!(store.snapshot(), IdentitySnapshot::default());
    }
}
