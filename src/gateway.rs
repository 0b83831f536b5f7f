use std::sync::Arc;

use tracing::{debug, warn};

use crate::auth::{AuthError, Directory, TokenVerifier};
use crate::model::{CallerIdentity, VerifiedIdentity};
use crate::rooms::{ConnId, Room, RoomRegistry};

/// A refused room join; membership is unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRefused {
    pub room: Room,
    pub reason: String,
}

impl std::fmt::Display for JoinRefused {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "forbidden to join {}: {}", self.room, self.reason)
    }
}

impl std::error::Error for JoinRefused {}

/// Authenticates connections once and authorizes every room join against
/// the directory's current view of the caller.
pub struct Gateway {
    verifier: Arc<dyn TokenVerifier>,
    directory: Arc<dyn Directory>,
    rooms: Arc<RoomRegistry>,
}

impl Gateway {
    pub fn new(
        verifier: Arc<dyn TokenVerifier>,
        directory: Arc<dyn Directory>,
        rooms: Arc<RoomRegistry>,
    ) -> Self {
        Self {
            verifier,
            directory,
            rooms,
        }
    }

    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }

    pub async fn authenticate(&self, token: &str) -> Result<VerifiedIdentity, AuthError> {
        self.verifier.verify(token).await.inspect_err(|_| {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
        })
    }

    /// Current role and tenant for `subject_id`, or None if it has no record.
    pub async fn resolve(&self, subject_id: &str) -> Option<CallerIdentity> {
        self.directory.lookup(subject_id).await
    }

    pub async fn join_tenant(
        &self,
        conn: ConnId,
        subject_id: &str,
        tenant_id: &str,
    ) -> Result<Room, JoinRefused> {
        let room = Room::Tenant(tenant_id.to_string());
        let caller = self.caller_for(subject_id, &room).await?;
        if !caller.can_access_tenant(tenant_id) {
            return Err(self.refuse(room, subject_id, "not a member of this clinic"));
        }
        self.admit(conn, room)
    }

    pub async fn join_privileged(&self, conn: ConnId, subject_id: &str) -> Result<Room, JoinRefused> {
        let room = Room::Privileged;
        let caller = self.caller_for(subject_id, &room).await?;
        if !caller.role.is_privileged() {
            return Err(self.refuse(room, subject_id, "privileged role required"));
        }
        self.admit(conn, room)
    }

    async fn caller_for(&self, subject_id: &str, room: &Room) -> Result<CallerIdentity, JoinRefused> {
        match self.resolve(subject_id).await {
            Some(caller) => Ok(caller),
            None => Err(self.refuse(room.clone(), subject_id, "no user record")),
        }
    }

    fn admit(&self, conn: ConnId, room: Room) -> Result<Room, JoinRefused> {
        if self.rooms.join(conn, room.clone()) {
            debug!("connection {conn} joined {room}");
        }
        Ok(room)
    }

    fn refuse(&self, room: Room, subject_id: &str, reason: &str) -> JoinRefused {
        warn!("forbidden join of {room} by {subject_id}: {reason}");
        metrics::counter!(crate::observability::FORBIDDEN_JOINS_TOTAL).increment(1);
        JoinRefused {
            room,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenVerifier;
    use crate::model::{EntityKind, Role};
    use crate::store::DocumentStore;
    use serde_json::json;
    use tokio::sync::mpsc;

    async fn setup() -> (Gateway, Arc<DocumentStore>) {
        let store = Arc::new(DocumentStore::in_memory());
        for (id, role, tenant) in [
            ("root", "SUPER_ADMIN", None),
            ("root-c1", "SUPER_ADMIN", Some("C1")),
            ("staff-c1", "STAFF", Some("C1")),
            ("staff-none", "STAFF", None),
        ] {
            store
                .put_document(EntityKind::User, id, json!({"role": role, "tenantId": tenant}))
                .await
                .unwrap();
        }
        let verifier = StaticTokenVerifier::new().with_token("good", "staff-c1");
        let gateway = Gateway::new(Arc::new(verifier), store.clone(), Arc::new(RoomRegistry::new()));
        (gateway, store)
    }

    fn connect(gateway: &Gateway) -> ConnId {
        let (tx, _rx) = mpsc::channel(4);
        gateway.rooms().register(tx)
    }

    #[tokio::test]
    async fn invalid_token_is_unauthorized() {
        let (gateway, _) = setup().await;
        assert_eq!(gateway.authenticate("good").await.unwrap().subject_id, "staff-c1");
        assert!(matches!(
            gateway.authenticate("bad").await,
            Err(AuthError::InvalidToken)
        ));
    }

    /// role × requested room × tenant match
    #[tokio::test]
    async fn authorization_matrix() {
        let (gateway, _) = setup().await;
        let cases = [
            // subject, privileged room?, tenant requested, allowed
            ("staff-c1", false, "C1", true),
            ("staff-c1", false, "C2", false),
            ("staff-c1", true, "C1", false),
            ("staff-c1", true, "C2", false),
            ("root-c1", false, "C1", true),
            ("root-c1", false, "C2", true),
            ("root-c1", true, "C1", true),
            ("root-c1", true, "C2", true),
        ];
        for (subject, privileged, tenant, allowed) in cases {
            let conn = connect(&gateway);
            let result = if privileged {
                gateway.join_privileged(conn, subject).await
            } else {
                gateway.join_tenant(conn, subject, tenant).await
            };
            assert_eq!(result.is_ok(), allowed, "{subject} privileged={privileged} tenant={tenant}");
            assert_eq!(gateway.rooms().rooms_of(conn).len(), allowed as usize);
        }
    }

    #[tokio::test]
    async fn forbidden_join_leaves_membership_unchanged() {
        let (gateway, _) = setup().await;
        let conn = connect(&gateway);
        gateway.join_tenant(conn, "staff-c1", "C1").await.unwrap();

        let err = gateway.join_tenant(conn, "staff-c1", "C2").await.unwrap_err();
        assert!(matches!(err, JoinRefused { room: Room::Tenant(ref t), .. } if t == "C2"));
        assert_eq!(gateway.rooms().rooms_of(conn), vec![Room::Tenant("C1".into())]);
        assert!(gateway.rooms().members(&Room::Tenant("C2".into())).is_empty());
    }

    #[tokio::test]
    async fn tenantless_users() {
        let (gateway, _) = setup().await;
        let conn = connect(&gateway);
        assert!(gateway.join_tenant(conn, "staff-none", "C1").await.is_err());
        assert!(gateway.join_tenant(conn, "root", "C7").await.is_ok());
        assert!(gateway.join_privileged(conn, "root").await.is_ok());
    }

    #[tokio::test]
    async fn subject_without_record_is_forbidden() {
        let (gateway, _) = setup().await;
        let conn = connect(&gateway);
        assert!(matches!(
            gateway.join_tenant(conn, "ghost", "C1").await,
            Err(JoinRefused { ref reason, .. }) if reason == "no user record"
        ));
    }

    #[tokio::test]
    async fn role_is_rechecked_on_every_join() {
        let (gateway, store) = setup().await;
        let conn = connect(&gateway);
        gateway.join_privileged(conn, "root-c1").await.unwrap();

        store
            .put_document(EntityKind::User, "root-c1", json!({"role": "STAFF", "tenantId": "C1"}))
            .await
            .unwrap();
        assert_eq!(gateway.resolve("root-c1").await.unwrap().role, Role::Staff);
        assert!(gateway.join_tenant(conn, "root-c1", "C2").await.is_err());
        assert!(gateway.join_tenant(conn, "root-c1", "C1").await.is_ok());
    }
}
