//! Session controller
//!
//! Orchestrates the token manager, entitlement cache, and cross-context
//! synchronizer behind one state machine. UI consumers read immutable
//! snapshots and subscribe to changes; every mutation goes through the
//! public operations here.
//!
//! States and transitions:
//! - `Uninitialized` to `Authenticating` when a persisted pair exists,
//!   otherwise straight to `Unauthenticated`
//! - `Authenticating` to `Authenticated` on remote verification, or
//!   degraded on a verification network failure with a cached profile
//! - `Authenticating` to `Unauthenticated` on an explicit 401
//! - `Authenticated` to `Refreshing` and back on a mid-request 401
//! - any state to `Unauthenticated` on `logout`

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use gymflow_auth::api::{self, Credentials, EntitlementStatus, SessionUser};
use gymflow_auth::constants::USER_KEY;
use gymflow_auth::{KvStore, TokenManager};

use crate::config::SessionConfig;
use crate::entitlement::EntitlementCache;
use crate::error::{Error, Result};
use crate::sync::{BroadcastMessage, SyncEvent, TabChannel, TabSync};

/// Controller states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Authenticating,
    Authenticated,
    Unauthenticated,
    Refreshing,
}

impl SessionState {
    /// State label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Authenticating => "authenticating",
            SessionState::Authenticated => "authenticated",
            SessionState::Unauthenticated => "unauthenticated",
            SessionState::Refreshing => "refreshing",
        }
    }
}

/// Read-only view handed to consumers; never a live reference into
/// controller state.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub user: Option<SessionUser>,
    pub entitlement: Option<EntitlementStatus>,
}

impl SessionSnapshot {
    pub fn is_authenticated(&self) -> bool {
        matches!(
            self.state,
            SessionState::Authenticated | SessionState::Refreshing
        )
    }

    /// Feature gate for billing-restricted capability. A missing
    /// entitlement counts as entitled only for roles that carry no
    /// subscription of their own.
    pub fn entitled(&self) -> bool {
        if let Some(status) = &self.entitlement {
            return status.entitled();
        }
        self.user
            .as_ref()
            .map(|u| !u.role.requires_billing())
            .unwrap_or(false)
    }
}

/// Uniform response for [`SessionController::authenticated_request`].
/// Callers branch on [`ApiResponse::success`], never on ad-hoc body
/// shapes.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The backend's `message` field, when present.
    pub fn message(&self) -> Option<&str> {
        self.body.get("message").and_then(Value::as_str)
    }
}

/// Orchestrator for one context's session.
pub struct SessionController {
    config: SessionConfig,
    client: reqwest::Client,
    store: Arc<KvStore>,
    tokens: TokenManager,
    entitlements: EntitlementCache,
    sync: TabSync,
    snapshot: watch::Sender<SessionSnapshot>,
    /// Timestamp of the newest applied session mutation, local or
    /// remote. Remote merges older than this are discarded.
    last_applied: AtomicU64,
    /// Cancellation handle for the degraded-verification retry task,
    /// torn down on logout so it never fires against a dead session.
    retry_task: StdMutex<Option<JoinHandle<()>>>,
    /// Handle to this controller for the tasks it spawns; they must not
    /// keep a dropped controller alive.
    weak_self: Weak<SessionController>,
}

impl SessionController {
    /// Build a controller over a persistent store, optionally attached
    /// to a cross-context channel. The HTTP client is supplied by the
    /// caller (build it with the config's request timeout). Spawns the
    /// channel listener, which holds only a weak handle.
    pub fn new(
        config: SessionConfig,
        store: Arc<KvStore>,
        client: reqwest::Client,
        channel: Option<&TabChannel>,
    ) -> Arc<Self> {
        let sync = match channel {
            Some(channel) => TabSync::connected(channel),
            None => TabSync::detached(),
        };
        let entitlements = EntitlementCache::new(
            client.clone(),
            config.api_base_url.clone(),
            config.entitlement_max_age(),
        );
        let tokens = TokenManager::new(store.clone(), client.clone(), config.api_base_url.clone());
        let (snapshot, _) = watch::channel(SessionSnapshot {
            state: SessionState::Uninitialized,
            user: None,
            entitlement: None,
        });

        let controller = Arc::new_cyclic(|weak| Self {
            config,
            client,
            store,
            tokens,
            entitlements,
            sync,
            snapshot,
            last_applied: AtomicU64::new(0),
            retry_task: StdMutex::new(None),
            weak_self: weak.clone(),
        });
        controller.spawn_sync_listener();
        controller
    }

    /// Observer interface: yields the current snapshot immediately and
    /// on every change.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Resolve the persisted session on startup.
    ///
    /// With no persisted pair the controller lands in `Unauthenticated`
    /// immediately. Otherwise the token is verified remotely, bounded by
    /// the configured timeout; a verification that cannot complete falls
    /// back to the cached profile (degraded session, one background
    /// re-verification scheduled) rather than hanging or logging out.
    pub async fn initialize(&self) -> SessionSnapshot {
        let Some(access) = self.tokens.access_token().await else {
            debug!("no persisted session");
            self.set_state(SessionState::Unauthenticated);
            return self.snapshot();
        };
        self.set_state(SessionState::Authenticating);

        let verify = api::verify_token(&self.client, &self.config.api_base_url, &access);
        match timeout(self.config.verify_timeout(), verify).await {
            Ok(Ok(true)) => {
                let user = self.resolve_profile(&access).await;
                self.mark_applied();
                self.snapshot.send_modify(|s| {
                    s.user = user.clone();
                    s.state = SessionState::Authenticated;
                });
                info!("persisted session verified");
                if let Some(user) = &user {
                    if user.role.requires_billing() {
                        self.refresh_entitlement(&access, &user.id, false).await;
                    }
                }
            }
            Ok(Ok(false)) => {
                info!("persisted token rejected, clearing session");
                self.tokens.clear().await;
                self.remove_cached_profile().await;
                self.set_state(SessionState::Unauthenticated);
            }
            Ok(Err(e)) => self.degraded_start(e.to_string()).await,
            Err(_) => {
                self.degraded_start(format!(
                    "verification timed out after {}s",
                    self.config.verify_timeout_secs
                ))
                .await
            }
        }
        self.snapshot()
    }

    /// Authenticate with email and password.
    ///
    /// Fields are validated before any network call. On success the pair
    /// is stored, the profile cached, the mutation broadcast, and, for
    /// billing-gated roles, the entitlement checked.
    pub async fn login(&self, credentials: &Credentials) -> Result<SessionUser> {
        credentials.validate()?;
        self.set_state(SessionState::Authenticating);

        let outcome = match api::login(&self.client, &self.config.api_base_url, credentials).await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "login failed");
                self.set_state(SessionState::Unauthenticated);
                return Err(e.into());
            }
        };

        let access = outcome.access.clone();
        if let Err(e) = self.tokens.set_tokens(outcome.access, outcome.refresh).await {
            self.set_state(SessionState::Unauthenticated);
            return Err(e.into());
        }
        if let Err(e) = self.store.set(USER_KEY, &outcome.user).await {
            warn!(error = %e, "failed to cache profile");
        }

        self.mark_applied();
        self.snapshot.send_modify(|s| {
            s.user = Some(outcome.user.clone());
            s.state = SessionState::Authenticated;
        });
        info!(role = outcome.user.role.label(), "login succeeded");
        self.sync.publish(SyncEvent::SessionUpdated {
            user: outcome.user.clone(),
        });

        if outcome.user.role.requires_billing() {
            self.refresh_entitlement(&access, &outcome.user.id, true).await;
        }

        Ok(outcome.user)
    }

    /// Issue an authenticated request against the API.
    ///
    /// Attaches the current access token. On a 401 the controller runs
    /// exactly one coalesced refresh-and-retry cycle; a 401 that
    /// persists through it tears the session down and surfaces
    /// `SessionExpired`. Never loops further.
    pub async fn authenticated_request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<ApiResponse> {
        let Some(access) = self.tokens.access_token().await else {
            return Err(Error::AuthRequired("no session held".into()));
        };

        let response = self.send_with_token(&method, path, body, &access).await?;
        if response.status != 401 {
            return Ok(response);
        }

        debug!(path, "request rejected with 401, refreshing");
        self.set_state(SessionState::Refreshing);
        let pair = match self.tokens.refresh(&access).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "refresh failed, tearing down session");
                self.teardown_local().await;
                self.sync.publish(SyncEvent::Logout);
                return Err(Error::SessionExpired(format!("token refresh failed: {e}")));
            }
        };
        self.set_state(SessionState::Authenticated);

        let retried = self.send_with_token(&method, path, body, &pair.access).await?;
        if retried.status == 401 {
            warn!(path, "401 persisted after refresh, tearing down session");
            self.teardown_local().await;
            self.sync.publish(SyncEvent::Logout);
            return Err(Error::SessionExpired(
                "request rejected again after refresh".into(),
            ));
        }
        Ok(retried)
    }

    /// Send one request with a bearer token, folding the reply into the
    /// uniform response shape. A reply body that is not JSON reads as
    /// `Null`.
    async fn send_with_token(
        &self,
        method: &reqwest::Method,
        path: &str,
        body: Option<&Value>,
        access: &str,
    ) -> Result<ApiResponse> {
        let url = format!("{}{}", self.config.api_base_url, path);
        let mut request = self.client.request(method.clone(), url).bearer_auth(access);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::Network(format!("request to {path} failed: {e}")))?;
        let status = response.status().as_u16();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok(ApiResponse { status, body })
    }

    /// End the session.
    ///
    /// Local teardown is unconditional and immediate; the server
    /// notification is fire-and-forget, and sibling contexts are told to
    /// converge without waiting to discover it through failed requests
    /// of their own. Idempotent.
    pub async fn logout(&self) {
        let access = self.tokens.access_token().await;
        self.teardown_local().await;
        self.sync.publish(SyncEvent::Logout);

        if let Some(access) = access {
            let client = self.client.clone();
            let base_url = self.config.api_base_url.clone();
            tokio::spawn(async move {
                if let Err(e) = api::logout(&client, &base_url, &access).await {
                    debug!(error = %e, "server logout notification failed, ignored");
                }
            });
        }
        info!("logged out");
    }

    /// Entitlement for the current session user, from cache unless stale
    /// or `force` is set. `None` when signed out or never successfully
    /// checked.
    pub async fn entitlement(&self, force: bool) -> Option<EntitlementStatus> {
        let access = self.tokens.access_token().await?;
        let user = self.snapshot.borrow().user.clone()?;
        self.refresh_entitlement(&access, &user.id, force).await;
        self.snapshot.borrow().entitlement.clone()
    }

    /// Optimistic local profile update (e.g. after a membership
    /// renewal): persisted, reflected in the snapshot, and broadcast.
    /// No network call.
    pub async fn update_profile(&self, user: SessionUser) {
        if let Err(e) = self.store.set(USER_KEY, &user).await {
            warn!(error = %e, "failed to persist profile update");
        }
        self.mark_applied();
        self.snapshot.send_modify(|s| s.user = Some(user.clone()));
        self.sync.publish(SyncEvent::SessionUpdated { user });
    }

    fn set_state(&self, state: SessionState) {
        self.snapshot.send_modify(|s| {
            if s.state != state {
                debug!(from = s.state.label(), to = state.label(), "session state transition");
                s.state = state;
            }
        });
    }

    /// Cached profile, or a fetch when the cache is empty.
    async fn resolve_profile(&self, access: &str) -> Option<SessionUser> {
        if let Some(user) = self.store.get::<SessionUser>(USER_KEY).await {
            return Some(user);
        }
        match api::fetch_profile(&self.client, &self.config.api_base_url, access).await {
            Ok(user) => {
                if let Err(e) = self.store.set(USER_KEY, &user).await {
                    warn!(error = %e, "failed to cache profile");
                }
                Some(user)
            }
            Err(e) => {
                warn!(error = %e, "profile fetch failed after verification");
                None
            }
        }
    }

    /// Availability over consistency: verification could not complete,
    /// so the session proceeds on the cached profile with one scheduled
    /// re-verification. Without a cached profile there is nothing to
    /// proceed on.
    async fn degraded_start(&self, reason: String) {
        match self.store.get::<SessionUser>(USER_KEY).await {
            Some(user) => {
                warn!(reason = %reason, "verification unavailable, continuing on cached profile");
                self.mark_applied();
                self.snapshot.send_modify(|s| {
                    s.user = Some(user);
                    s.state = SessionState::Authenticated;
                });
                self.schedule_reverify();
            }
            None => {
                warn!(reason = %reason, "verification unavailable and no cached profile");
                self.set_state(SessionState::Unauthenticated);
            }
        }
    }

    /// One-shot background re-verification for a degraded session. The
    /// handle is kept so logout can cancel it before it fires against a
    /// torn-down session.
    fn schedule_reverify(&self) {
        let weak = self.weak_self.clone();
        let delay = self.config.retry_delay();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(controller) = weak.upgrade() else {
                return;
            };
            let Some(access) = controller.tokens.access_token().await else {
                return;
            };
            let verify =
                api::verify_token(&controller.client, &controller.config.api_base_url, &access);
            match timeout(controller.config.verify_timeout(), verify).await {
                Ok(Ok(true)) => info!("degraded session re-verified"),
                Ok(Ok(false)) => {
                    warn!("degraded session rejected on re-verification, logging out");
                    controller.teardown_local().await;
                    controller.sync.publish(SyncEvent::Logout);
                }
                Ok(Err(e)) => warn!(error = %e, "re-verification still unavailable"),
                Err(_) => warn!("re-verification timed out"),
            }
        });
        if let Ok(mut slot) = self.retry_task.lock() {
            if let Some(old) = slot.replace(handle) {
                old.abort();
            }
        }
    }

    fn cancel_reverify(&self) {
        if let Ok(mut slot) = self.retry_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }

    /// Opportunistic entitlement refresh; failures degrade silently
    /// inside the cache.
    async fn refresh_entitlement(&self, access: &str, user_id: &str, force: bool) {
        if let Some(status) = self.entitlements.check(access, user_id, force).await {
            self.snapshot.send_modify(|s| s.entitlement = Some(status.clone()));
            self.sync.publish(SyncEvent::EntitlementUpdated { status });
        }
    }

    /// Clear every locally held artifact of the session. Idempotent.
    async fn teardown_local(&self) {
        self.cancel_reverify();
        self.tokens.clear().await;
        self.remove_cached_profile().await;
        self.entitlements.clear().await;
        self.mark_applied();
        self.snapshot.send_modify(|s| {
            s.user = None;
            s.entitlement = None;
            s.state = SessionState::Unauthenticated;
        });
    }

    async fn remove_cached_profile(&self) {
        if let Err(e) = self.store.remove(USER_KEY).await {
            warn!(error = %e, "failed to remove cached profile");
        }
    }

    fn mark_applied(&self) {
        self.last_applied
            .store(common::now_millis(), Ordering::Release);
    }

    fn spawn_sync_listener(&self) {
        let Some(mut rx) = self.sync.subscribe() else {
            debug!("cross-context sync unavailable, running detached");
            return;
        };
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            loop {
                let message = match rx.recv().await {
                    Ok(message) => message,
                    // Dropped messages are safe to skip: merges are
                    // idempotent and the store remains the cold-start
                    // source of truth.
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "sync receiver lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(controller) = weak.upgrade() else {
                    break;
                };
                controller.apply_remote(message).await;
            }
        });
    }

    /// Apply a mutation observed from a sibling context.
    async fn apply_remote(&self, message: BroadcastMessage) {
        if self.sync.is_self(&message) {
            return;
        }
        match message.event {
            SyncEvent::Logout => {
                info!(origin = %message.origin, "logout observed from sibling context");
                // No re-broadcast: every sibling got the same message.
                self.teardown_local().await;
            }
            SyncEvent::SessionUpdated { user } => {
                let last = self.last_applied.load(Ordering::Acquire);
                if message.sent_at < last {
                    debug!("stale sibling session update discarded");
                    return;
                }
                self.last_applied.store(message.sent_at, Ordering::Release);
                // The sibling persisted its tokens to the shared store
                // before broadcasting; adopt them.
                let pair = self.tokens.rehydrate().await;
                self.snapshot.send_modify(|s| {
                    s.user = Some(user);
                    if pair.is_some() {
                        s.state = SessionState::Authenticated;
                    }
                });
                debug!(origin = %message.origin, "session update merged from sibling context");
            }
            SyncEvent::EntitlementUpdated { status } => {
                self.entitlements.merge(status).await;
                let merged = self.entitlements.last_known().await;
                self.snapshot.send_modify(|s| s.entitlement = merged);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gymflow_auth::api::Role;

    fn user(role: &str) -> SessionUser {
        serde_json::from_value(serde_json::json!({
            "_id": "u1",
            "name": "Dana",
            "email": "dana@gym.test",
            "role": role
        }))
        .unwrap()
    }

    #[test]
    fn state_labels_are_stable() {
        assert_eq!(SessionState::Uninitialized.label(), "uninitialized");
        assert_eq!(SessionState::Refreshing.label(), "refreshing");
    }

    #[test]
    fn snapshot_authenticated_includes_refreshing() {
        let snapshot = SessionSnapshot {
            state: SessionState::Refreshing,
            user: Some(user("member")),
            entitlement: None,
        };
        assert!(snapshot.is_authenticated());

        let snapshot = SessionSnapshot {
            state: SessionState::Authenticating,
            user: None,
            entitlement: None,
        };
        assert!(!snapshot.is_authenticated());
    }

    #[test]
    fn snapshot_entitled_follows_status_when_present() {
        let snapshot = SessionSnapshot {
            state: SessionState::Authenticated,
            user: Some(user("gym-owner")),
            entitlement: Some(EntitlementStatus {
                has_active_subscription: false,
                requires_subscription: true,
                plan: "basic".into(),
                days_remaining: 0,
                checked_at: 1,
            }),
        };
        assert!(!snapshot.entitled());
    }

    #[test]
    fn snapshot_entitled_without_status_depends_on_role() {
        let mut snapshot = SessionSnapshot {
            state: SessionState::Authenticated,
            user: Some(user("member")),
            entitlement: None,
        };
        assert!(snapshot.entitled(), "members carry no subscription");

        snapshot.user = Some(user("gym-owner"));
        assert!(
            !snapshot.entitled(),
            "an unchecked gym owner is not assumed entitled"
        );

        snapshot.user = None;
        assert!(!snapshot.entitled());
    }

    #[test]
    fn api_response_discriminates_on_status() {
        let ok = ApiResponse {
            status: 204,
            body: Value::Null,
        };
        assert!(ok.success());

        let err = ApiResponse {
            status: 403,
            body: serde_json::json!({"message": "forbidden"}),
        };
        assert!(!err.success());
        assert_eq!(err.message(), Some("forbidden"));
    }

    #[test]
    fn roles_route_billing_checks() {
        assert!(user("gym-owner").role.requires_billing());
        assert!(!user("trainer").role.requires_billing());
        assert_eq!(user("gym-owner").role, Role::GymOwner);
    }
}
