//! Per-user authorization membership and linked control-plane sessions.
//!
//! Mutated only by the command router. A user absent from the store is
//! implicitly unauthorized, and revocation clears the linked session in the
//! same step so no link can outlive its authorization.

use std::{collections::HashMap, sync::Mutex};

#[derive(Debug, Clone, Default)]
struct UserAccess {
    authorized: bool,
    session_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct AccessStore {
    users: Mutex<HashMap<String, UserAccess>>,
}

impl AccessStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_authorized(&self, user_id: &str) -> bool {
        let users = self.lock_users();
        users
            .get(user_id)
            .map(|record| record.authorized)
            .unwrap_or(false)
    }

    pub fn authorize(&self, user_id: &str) {
        let mut users = self.lock_users();
        users.entry(user_id.to_string()).or_default().authorized = true;
    }

    /// Clears authorization and any linked session atomically.
    pub fn revoke(&self, user_id: &str) {
        let mut users = self.lock_users();
        users.remove(user_id);
    }

    /// Links `user_id` to a control-plane session, overwriting any prior
    /// link. Returns false when the user is not authorized; a link must never
    /// exist without authorization.
    pub fn link_session(&self, user_id: &str, session_id: &str) -> bool {
        let mut users = self.lock_users();
        match users.get_mut(user_id) {
            Some(record) if record.authorized => {
                record.session_id = Some(session_id.to_string());
                true
            }
            _ => false,
        }
    }

    pub fn unlink_session(&self, user_id: &str) {
        let mut users = self.lock_users();
        if let Some(record) = users.get_mut(user_id) {
            record.session_id = None;
        }
    }

    pub fn session_for(&self, user_id: &str) -> Option<String> {
        let users = self.lock_users();
        users.get(user_id).and_then(|record| record.session_id.clone())
    }

    pub fn authorized_count(&self) -> usize {
        let users = self.lock_users();
        users.values().filter(|record| record.authorized).count()
    }

    fn lock_users(&self) -> std::sync::MutexGuard<'_, HashMap<String, UserAccess>> {
        self.users
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_absent_user_is_implicitly_unauthorized() {
        let store = AccessStore::new();
        assert!(!store.is_authorized("u1"));
        assert_eq!(store.session_for("u1"), None);
    }

    #[test]
    fn unit_authorize_then_link_then_unlink() {
        let store = AccessStore::new();
        store.authorize("u1");
        assert!(store.is_authorized("u1"));
        assert_eq!(store.session_for("u1"), None);

        assert!(store.link_session("u1", "abc123"));
        assert_eq!(store.session_for("u1"), Some("abc123".to_string()));

        assert!(store.link_session("u1", "def456"));
        assert_eq!(store.session_for("u1"), Some("def456".to_string()));

        store.unlink_session("u1");
        assert!(store.is_authorized("u1"));
        assert_eq!(store.session_for("u1"), None);
    }

    #[test]
    fn unit_link_refused_for_unauthorized_user() {
        let store = AccessStore::new();
        assert!(!store.link_session("u1", "abc123"));
        assert_eq!(store.session_for("u1"), None);
    }

    #[test]
    fn regression_revoke_clears_authorization_and_link_atomically() {
        let store = AccessStore::new();
        store.authorize("u1");
        store.link_session("u1", "abc123");
        store.revoke("u1");
        assert!(!store.is_authorized("u1"));
        assert_eq!(store.session_for("u1"), None);
    }

    #[test]
    fn unit_authorized_count_tracks_memberships() {
        let store = AccessStore::new();
        assert_eq!(store.authorized_count(), 0);
        store.authorize("u1");
        store.authorize("u2");
        store.revoke("u1");
        assert_eq!(store.authorized_count(), 1);
    }
}
