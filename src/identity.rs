//! User and group identity, mirrored into the persistent store.

use crate::store::{keys, KvStore};
use std::sync::{Arc, RwLock};

/// Mutable user/group identity. Every change is written through to the
/// store; reads prefer the in-memory value and fall back to the persisted
/// one, so a fresh engine instance picks up identity set on a previous page.
pub struct IdentityHandle {
    store: Arc<dyn KvStore>,
    user_id: RwLock<String>,
    group_id: RwLock<String>,
}

impl IdentityHandle {
    /// Load any persisted user/group ids from the store.
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        let user_id = store.get(keys::USER_ID).unwrap_or_default();
        let group_id = store.get(keys::GROUP_ID).unwrap_or_default();
        Self {
            store,
            user_id: RwLock::new(user_id),
            group_id: RwLock::new(group_id),
        }
    }

    /// Set the user id in memory and in the store. Empty ids are ignored.
    pub fn set_user_id(&self, user_id: &str) {
        if user_id.is_empty() {
            return;
        }
        *self.user_id.write().expect("identity lock poisoned") = user_id.to_string();
        self.store
            .set(keys::USER_ID, user_id, Some(keys::IDENTITY_TTL));
    }

    /// Set the group id in memory and in the store. Empty ids are ignored.
    pub fn set_group_id(&self, group_id: &str) {
        if group_id.is_empty() {
            return;
        }
        *self.group_id.write().expect("identity lock poisoned") = group_id.to_string();
        self.store
            .set(keys::GROUP_ID, group_id, Some(keys::IDENTITY_TTL));
    }

    /// Instance value, else the store fallback, else empty.
    pub fn current_user_id(&self) -> String {
        let user_id = self.user_id.read().expect("identity lock poisoned");
        if !user_id.is_empty() {
            return user_id.clone();
        }
        self.store.get(keys::USER_ID).unwrap_or_default()
    }

    /// Instance value, else the store fallback, else empty.
    pub fn current_group_id(&self) -> String {
        let group_id = self.group_id.read().expect("identity lock poisoned");
        if !group_id.is_empty() {
            return group_id.clone();
        }
        self.store.get(keys::GROUP_ID).unwrap_or_default()
    }

    /// The user id as currently persisted, used for the idempotent
    /// short-circuit in `set_user`.
    pub fn persisted_user_id(&self) -> Option<String> {
        self.store.get(keys::USER_ID)
    }

    /// The group id as currently persisted.
    pub fn persisted_group_id(&self) -> Option<String> {
        self.store.get(keys::GROUP_ID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn starts_empty_without_persisted_ids() {
        let identity = IdentityHandle::new(Arc::new(MemoryStore::new()));
        assert_eq!(identity.current_user_id(), "");
        assert_eq!(identity.current_group_id(), "");
    }

    #[test]
    fn loads_persisted_ids() {
        let store = Arc::new(MemoryStore::new());
        store.set(keys::USER_ID, "user-1", None);
        store.set(keys::GROUP_ID, "acct-1", None);

        let identity = IdentityHandle::new(store);
        assert_eq!(identity.current_user_id(), "user-1");
        assert_eq!(identity.current_group_id(), "acct-1");
    }

    #[test]
    fn set_user_id_mirrors_to_store() {
        let store = Arc::new(MemoryStore::new());
        let identity = IdentityHandle::new(store.clone());

        identity.set_user_id("user-2");
        assert_eq!(identity.current_user_id(), "user-2");
        assert_eq!(store.get(keys::USER_ID), Some("user-2".to_string()));
    }

    #[test]
    fn set_group_id_mirrors_to_store() {
        let store = Arc::new(MemoryStore::new());
        let identity = IdentityHandle::new(store.clone());

        identity.set_group_id("acct-2");
        assert_eq!(identity.current_group_id(), "acct-2");
        assert_eq!(store.get(keys::GROUP_ID), Some("acct-2".to_string()));
    }

    #[test]
    fn empty_ids_are_ignored() {
        let store = Arc::new(MemoryStore::new());
        let identity = IdentityHandle::new(store.clone());

        identity.set_user_id("user-3");
        identity.set_user_id("");
        assert_eq!(identity.current_user_id(), "user-3");
        assert_eq!(store.get(keys::USER_ID), Some("user-3".to_string()));
    }

    #[test]
    fn falls_back_to_store_when_instance_empty() {
        let store = Arc::new(MemoryStore::new());
        let identity = IdentityHandle::new(store.clone());
        // Simulate another writer persisting identity after construction.
        store.set(keys::USER_ID, "late-user", None);
        assert_eq!(identity.current_user_id(), "late-user");
    }
}
