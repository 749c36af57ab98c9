use crate::error::{ServiceError, ServiceResult};
use crate::models::{Role, User};
use crate::store::{from_document, server_timestamp, to_document, Document, DocumentStore, Query, SetMode, USERS};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

pub const GUEST_NAME: &str = "Guest";
const UNKNOWN_NAME: &str = "Unknown";

/// Authenticated identity as reported by the provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, rename = "photoURL")]
    pub photo_url: Option<String>,
}

impl Principal {
    pub fn anonymous(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            email: None,
            photo_url: None,
        }
    }
}

pub trait IdentityProvider: Send + Sync {
    /// Completes an interactive sign-in with the profile the UI obtained.
    fn sign_in_interactive(&self, profile: Principal) -> BoxFuture<'static, anyhow::Result<Principal>>;

    fn sign_in_anonymous(&self) -> BoxFuture<'static, anyhow::Result<Principal>>;

    fn sign_out(&self) -> BoxFuture<'static, anyhow::Result<()>>;

    fn current_principal(&self) -> Option<Principal>;
}

/// Single-session provider for the local sidecar: trusts the profile handed
/// over by the UI and mints random ids for anonymous sessions.
#[derive(Clone, Default)]
pub struct LocalIdentityProvider {
    session: Arc<Mutex<Option<Principal>>>,
    anonymous_calls: Arc<AtomicUsize>,
}

impl LocalIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many anonymous sign-ins reached the provider.
    pub fn anonymous_sign_in_count(&self) -> usize {
        self.anonymous_calls.load(Ordering::SeqCst)
    }

    fn session(&self) -> MutexGuard<'_, Option<Principal>> {
        match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl IdentityProvider for LocalIdentityProvider {
    fn sign_in_interactive(&self, profile: Principal) -> BoxFuture<'static, anyhow::Result<Principal>> {
        let provider = self.clone();
        Box::pin(async move {
            if profile.id.trim().is_empty() {
                anyhow::bail!("profile id must not be empty");
            }
            *provider.session() = Some(profile.clone());
            Ok(profile)
        })
    }

    fn sign_in_anonymous(&self) -> BoxFuture<'static, anyhow::Result<Principal>> {
        let provider = self.clone();
        Box::pin(async move {
            provider.anonymous_calls.fetch_add(1, Ordering::SeqCst);
            // Yield so concurrent callers really overlap with this request.
            tokio::task::yield_now().await;
            let principal = Principal::anonymous(uuid::Uuid::new_v4().simple().to_string());
            *provider.session() = Some(principal.clone());
            Ok(principal)
        })
    }

    fn sign_out(&self) -> BoxFuture<'static, anyhow::Result<()>> {
        let provider = self.clone();
        Box::pin(async move {
            provider.session().take();
            Ok(())
        })
    }

    fn current_principal(&self) -> Option<Principal> {
        self.session().clone()
    }
}

type PendingSignIn = Shared<BoxFuture<'static, Result<Principal, String>>>;

/// Maps principals to application users and runs the admin user actions.
#[derive(Clone)]
pub struct IdentityResolver {
    store: Arc<dyn DocumentStore>,
    provider: Arc<dyn IdentityProvider>,
    anonymous_sign_in: Arc<Mutex<Option<PendingSignIn>>>,
}

fn parse_user(id: &str, data: &Document) -> ServiceResult<User> {
    let mut user: User = from_document(data).map_err(|e| ServiceError::Malformed {
        entity: "user",
        id: id.to_string(),
        reason: e.to_string(),
    })?;
    user.id = id.to_string();
    Ok(user)
}

/// Role and approval for a principal seen for the first time.
pub fn provisioning_policy(intended: Role, is_first_user: bool) -> (Role, bool) {
    match intended {
        Role::Guest => (Role::Guest, true),
        Role::Student => (Role::Student, false),
        Role::Admin | Role::Leader | Role::Teacher if is_first_user => (Role::Admin, true),
        Role::Admin | Role::Leader | Role::Teacher => (Role::Teacher, false),
    }
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn DocumentStore>, provider: Arc<dyn IdentityProvider>) -> Self {
        Self {
            store,
            provider,
            anonymous_sign_in: Arc::new(Mutex::new(None)),
        }
    }

    fn pending_slot(&self) -> MutexGuard<'_, Option<PendingSignIn>> {
        match self.anonymous_sign_in.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub async fn has_any_users(&self) -> ServiceResult<bool> {
        let found = self.store.query(&Query::collection(USERS).limit(1)).await?;
        Ok(!found.is_empty())
    }

    /// Returns the stored user, creating one on first sight. A stored record
    /// always wins over `intended` and the fresh principal attributes.
    pub async fn resolve_or_create_user(&self, principal: &Principal, intended: Role) -> ServiceResult<User> {
        if let Some(snapshot) = self.store.get(USERS, &principal.id).await? {
            debug!("user {} already provisioned", principal.id);
            return parse_user(&snapshot.id, &snapshot.data);
        }

        let teacher_path = matches!(intended, Role::Admin | Role::Leader | Role::Teacher);
        // Evaluated on every call; two simultaneous first sign-ins can both see an empty collection.
        let is_first_user = teacher_path && !self.has_any_users().await?;
        let (role, is_approved) = provisioning_policy(intended, is_first_user);

        let fallback_name = if role == Role::Guest { GUEST_NAME } else { UNKNOWN_NAME };
        let user = User {
            id: principal.id.clone(),
            name: principal
                .display_name
                .clone()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| fallback_name.to_string()),
            email: principal.email.clone(),
            avatar: principal.photo_url.clone(),
            role,
            is_approved,
            class_ids: None,
            created_at: None,
            updated_at: None,
        };

        let mut data = to_document(&user)?;
        data.insert("createdAt".into(), server_timestamp());
        data.insert("updatedAt".into(), server_timestamp());
        self.store.set(USERS, &user.id, data, SetMode::Overwrite).await?;

        match self.store.get(USERS, &user.id).await? {
            Some(snapshot) => {
                let stored = parse_user(&snapshot.id, &snapshot.data)?;
                info!(user_id = %stored.id, role = ?stored.role, approved = stored.is_approved, "user provisioned");
                Ok(stored)
            }
            None => Err(ServiceError::not_found("user", &user.id)),
        }
    }

    pub async fn sign_in_teacher(&self, profile: Principal) -> ServiceResult<User> {
        let principal = self
            .provider
            .sign_in_interactive(profile)
            .await
            .map_err(|e| ServiceError::Identity(e.to_string()))?;
        self.resolve_or_create_user(&principal, Role::Teacher).await
    }

    pub async fn sign_in_student(&self, profile: Principal) -> ServiceResult<User> {
        let principal = self
            .provider
            .sign_in_interactive(profile)
            .await
            .map_err(|e| ServiceError::Identity(e.to_string()))?;
        self.resolve_or_create_user(&principal, Role::Student).await
    }

    /// Returns the session principal, signing in anonymously when there is
    /// none. Concurrent callers share one in-flight provider request.
    pub async fn ensure_guest_signed_in(&self) -> ServiceResult<Principal> {
        if let Some(principal) = self.provider.current_principal() {
            return Ok(principal);
        }

        let pending = {
            let mut slot = self.pending_slot();
            match slot.as_ref() {
                Some(pending) => pending.clone(),
                None => {
                    let resolver = self.clone();
                    let fresh: PendingSignIn = async move {
                        let principal = resolver
                            .provider
                            .sign_in_anonymous()
                            .await
                            .map_err(|e| e.to_string())?;
                        resolver
                            .resolve_or_create_user(&principal, Role::Guest)
                            .await
                            .map_err(|e| e.to_string())?;
                        Ok(principal)
                    }
                    .boxed()
                    .shared();
                    *slot = Some(fresh.clone());
                    fresh
                }
            }
        };

        let outcome = pending.clone().await;
        {
            let mut slot = self.pending_slot();
            if slot.as_ref().is_some_and(|current| current.ptr_eq(&pending)) {
                slot.take();
            }
        }
        outcome.map_err(ServiceError::Identity)
    }

    pub async fn sign_out(&self) -> ServiceResult<()> {
        self.provider
            .sign_out()
            .await
            .map_err(|e| ServiceError::Identity(e.to_string()))
    }

    pub fn current_principal(&self) -> Option<Principal> {
        self.provider.current_principal()
    }

    /// User record of the session principal, if both exist.
    pub async fn current_user(&self) -> ServiceResult<Option<User>> {
        let Some(principal) = self.provider.current_principal() else {
            return Ok(None);
        };
        self.get_user(&principal.id).await
    }

    pub async fn get_user(&self, user_id: &str) -> ServiceResult<Option<User>> {
        match self.store.get(USERS, user_id).await? {
            Some(snapshot) => parse_user(&snapshot.id, &snapshot.data).map(Some),
            None => Ok(None),
        }
    }

    pub async fn is_admin(&self, user_id: &str) -> ServiceResult<bool> {
        Ok(self
            .get_user(user_id)
            .await?
            .map(|u| u.role.is_admin())
            .unwrap_or(false))
    }

    pub async fn list_users(&self) -> ServiceResult<Vec<User>> {
        let docs = self.store.query(&Query::collection(USERS)).await?;
        docs.iter().map(|s| parse_user(&s.id, &s.data)).collect()
    }

    pub async fn list_pending_users(&self) -> ServiceResult<Vec<User>> {
        let docs = self
            .store
            .query(&Query::collection(USERS).where_eq("isApproved", false))
            .await?;
        docs.iter().map(|s| parse_user(&s.id, &s.data)).collect()
    }

    pub async fn approve(&self, user_id: &str) -> ServiceResult<()> {
        let mut fields = Document::new();
        fields.insert("isApproved".into(), Value::Bool(true));
        fields.insert("updatedAt".into(), server_timestamp());
        self.store.update(USERS, user_id, fields).await?;
        info!(user_id, "user approved");
        Ok(())
    }

    /// Deletes the user record; rejecting an unknown user is a no-op.
    pub async fn reject(&self, user_id: &str) -> ServiceResult<()> {
        self.store.delete(USERS, user_id).await?;
        info!(user_id, "user rejected");
        Ok(())
    }

    pub async fn set_role(&self, user_id: &str, role: Role) -> ServiceResult<()> {
        let mut fields = Document::new();
        fields.insert("role".into(), serde_json::to_value(role).map_err(crate::store::StoreError::from)?);
        fields.insert("updatedAt".into(), server_timestamp());
        self.store.update(USERS, user_id, fields).await?;
        info!(user_id, role = ?role, "user role changed");
        Ok(())
    }
}
