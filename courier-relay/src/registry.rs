use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use courier_core::models::NotificationPayload;

/// Message sender for a live session
pub type PayloadSender = mpsc::UnboundedSender<NotificationPayload>;

/// Which directory a session lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    User,
    Admin,
}

/// One live connection, owned by the registry for its lifetime.
///
/// The registry holds only the sender half; socket I/O happens in the
/// connection's own task draining the paired receiver, so no registry
/// operation ever blocks on a slow peer.
#[derive(Debug, Clone)]
pub struct Session {
    pub identity: String,
    pub sender: PayloadSender,
}

/// In-memory directory of live client sessions.
///
/// Two independent directories (regular users and admins), keyed by a
/// caller-supplied identity. All operations are safe under arbitrary
/// concurrent invocation. Sessions are transient: nothing here survives
/// a restart.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    users: Arc<DashMap<String, Session>>,
    admins: Arc<DashMap<String, Session>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn directory(&self, audience: Audience) -> &DashMap<String, Session> {
        match audience {
            Audience::User => &self.users,
            Audience::Admin => &self.admins,
        }
    }

    /// Register a session and return the receiver its connection task
    /// should drain.
    ///
    /// Registering an identity that is already present replaces the old
    /// mapping (last writer wins); the displaced session's receiver
    /// closes, which ends its socket task.
    pub fn register(
        &self,
        audience: Audience,
        identity: &str,
    ) -> mpsc::UnboundedReceiver<NotificationPayload> {
        let (tx, rx) = mpsc::unbounded_channel();

        let replaced = self
            .directory(audience)
            .insert(
                identity.to_string(),
                Session {
                    identity: identity.to_string(),
                    sender: tx,
                },
            )
            .is_some();

        info!(
            identity = %identity,
            audience = ?audience,
            replaced = replaced,
            "Session registered"
        );

        rx
    }

    /// Remove a session; no-op if the identity is not registered.
    pub fn remove(&self, audience: Audience, identity: &str) {
        if self.directory(audience).remove(identity).is_some() {
            info!(identity = %identity, audience = ?audience, "Session removed");
        } else {
            debug!(
                identity = %identity,
                audience = ?audience,
                "Attempted to remove unknown session"
            );
        }
    }

    /// Send a payload to one user session.
    ///
    /// Best-effort: an unregistered identity is a silent no-op and the
    /// notification is dropped. Returns whether a session accepted the
    /// payload. A session whose receiver is gone is evicted.
    pub fn send_to_user(&self, identity: &str, payload: NotificationPayload) -> bool {
        let send_failed = match self.users.get(identity) {
            Some(session) => session.sender.send(payload).is_err(),
            None => {
                debug!(identity = %identity, "No session for identity, dropping notification");
                return false;
            }
        };

        if send_failed {
            // Receiver dropped without deregistering; clean up the entry.
            warn!(identity = %identity, "Session channel closed, evicting");
            self.users.remove(identity);
            return false;
        }

        true
    }

    /// Broadcast a payload to every currently-registered admin session.
    ///
    /// Sessions added or removed while the broadcast runs may or may not
    /// receive it. Returns the number of sessions that accepted the
    /// payload; dead sessions found along the way are evicted.
    pub fn broadcast_to_admins(&self, payload: &NotificationPayload) -> usize {
        let mut sent_count = 0;
        let mut dead_sessions = Vec::new();

        for entry in self.admins.iter() {
            if entry.sender.send(payload.clone()).is_ok() {
                sent_count += 1;
            } else {
                dead_sessions.push(entry.identity.clone());
            }
        }

        for identity in dead_sessions {
            warn!(identity = %identity, "Admin session channel closed, evicting");
            self.admins.remove(&identity);
        }

        sent_count
    }

    /// Number of registered user sessions
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Number of registered admin sessions
    #[must_use]
    pub fn admin_count(&self) -> usize {
        self.admins.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(json: &str) -> NotificationPayload {
        json.parse().unwrap()
    }

    #[tokio::test]
    async fn test_register_and_send() {
        let registry = ConnectionRegistry::new();
        let mut rx = registry.register(Audience::User, "u1");

        assert_eq!(registry.user_count(), 1);
        assert!(registry.send_to_user("u1", payload(r#"{"msg":"hi"}"#)));

        let received = rx.recv().await.unwrap();
        assert_eq!(received, payload(r#"{"msg":"hi"}"#));
    }

    #[tokio::test]
    async fn test_send_after_remove_is_noop() {
        let registry = ConnectionRegistry::new();
        let mut rx = registry.register(Audience::User, "u1");
        registry.remove(Audience::User, "u1");

        assert!(!registry.send_to_user("u1", payload(r#"{"msg":"hi"}"#)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_routes_to_exact_identity_only() {
        let registry = ConnectionRegistry::new();
        let mut rx1 = registry.register(Audience::User, "u1");
        let mut rx2 = registry.register(Audience::User, "u2");

        assert!(registry.send_to_user("u1", payload(r#"{"n":1}"#)));

        assert_eq!(rx1.recv().await.unwrap(), payload(r#"{"n":1}"#));
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_unknown_identity_is_silent() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.send_to_user("ghost", payload(r#"{"msg":"hi"}"#)));
    }

    #[tokio::test]
    async fn test_register_same_identity_replaces() {
        let registry = ConnectionRegistry::new();
        let mut old_rx = registry.register(Audience::User, "u1");
        let mut new_rx = registry.register(Audience::User, "u1");

        assert_eq!(registry.user_count(), 1);
        assert!(registry.send_to_user("u1", payload(r#"{"msg":"hi"}"#)));

        // Only the newest session receives; the displaced channel is closed.
        assert_eq!(new_rx.recv().await.unwrap(), payload(r#"{"msg":"hi"}"#));
        assert!(old_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_to_admins() {
        let registry = ConnectionRegistry::new();
        let mut rx1 = registry.register(Audience::Admin, "a1");
        let mut rx2 = registry.register(Audience::Admin, "a2");
        let mut user_rx = registry.register(Audience::User, "u1");

        let sent = registry.broadcast_to_admins(&payload(r#"{"alert":"x"}"#));
        assert_eq!(sent, 2);

        assert_eq!(rx1.recv().await.unwrap(), payload(r#"{"alert":"x"}"#));
        assert_eq!(rx2.recv().await.unwrap(), payload(r#"{"alert":"x"}"#));
        // Admin broadcasts never reach the user directory.
        assert!(user_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dead_session_evicted_on_send() {
        let registry = ConnectionRegistry::new();
        let rx = registry.register(Audience::User, "u1");
        drop(rx);

        assert!(!registry.send_to_user("u1", payload(r#"{"msg":"hi"}"#)));
        assert_eq!(registry.user_count(), 0);
    }

    #[tokio::test]
    async fn test_dead_admin_evicted_on_broadcast() {
        let registry = ConnectionRegistry::new();
        let rx1 = registry.register(Audience::Admin, "a1");
        let mut rx2 = registry.register(Audience::Admin, "a2");
        drop(rx1);

        let sent = registry.broadcast_to_admins(&payload(r#"{"alert":"x"}"#));
        assert_eq!(sent, 1);
        assert_eq!(registry.admin_count(), 1);
        assert_eq!(rx2.recv().await.unwrap(), payload(r#"{"alert":"x"}"#));
    }

    #[tokio::test]
    async fn test_directories_are_independent() {
        let registry = ConnectionRegistry::new();
        let mut admin_rx = registry.register(Audience::Admin, "same-id");
        let mut user_rx = registry.register(Audience::User, "same-id");

        assert!(registry.send_to_user("same-id", payload(r#"{"n":1}"#)));
        assert_eq!(user_rx.recv().await.unwrap(), payload(r#"{"n":1}"#));
        assert!(admin_rx.try_recv().is_err());

        registry.remove(Audience::Admin, "same-id");
        assert_eq!(registry.user_count(), 1);
        assert_eq!(registry.admin_count(), 0);
    }
}
