//! Access/refresh token pair lifecycle
//!
//! Owns the in-memory pair, hydrates it once from the persistent store
//! on first read (cold start or a fresh tab), and performs coalesced
//! refresh: the pair lock is held across the refresh call, and late
//! arrivals compare the access token they observed failing against the
//! held one, so only the first caller issues the network request and
//! everyone else receives its result.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use common::now_millis;

use crate::api::{self, RefreshResponse};
use crate::constants::{ACCESS_TOKEN_KEY, LEGACY_TOKEN_KEY, REFRESH_TOKEN_KEY};
use crate::error::{Error, Result};
use crate::storage::KvStore;

/// The unit of token persistence. An access token without a refresh
/// token is usable but not renewable; the pair is always replaced
/// wholesale.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenPair {
    pub access: String,
    pub refresh: Option<String>,
    /// Unix milliseconds at which this pair was minted locally. Pairs
    /// hydrated from the store carry 0 (mint time unknown here).
    pub issued_at: u64,
}

struct TokenState {
    pair: Option<TokenPair>,
    /// One-time hydration flag. The store is consulted at most once per
    /// context, on the first read that finds nothing in memory; a
    /// cleared session must not resurrect from disk.
    hydrated: bool,
}

/// Token pair owner for one context.
pub struct TokenManager {
    store: Arc<KvStore>,
    client: reqwest::Client,
    base_url: String,
    state: Mutex<TokenState>,
}

impl TokenManager {
    pub fn new(store: Arc<KvStore>, client: reqwest::Client, base_url: String) -> Self {
        Self {
            store,
            client,
            base_url,
            state: Mutex::new(TokenState {
                pair: None,
                hydrated: false,
            }),
        }
    }

    /// Store a freshly minted pair.
    ///
    /// The state lock is held across the persistent write, so no reader
    /// observes memory and store disagreeing; the store write itself is
    /// a single atomic multi-key operation.
    pub async fn set_tokens(&self, access: String, refresh: Option<String>) -> Result<TokenPair> {
        let mut state = self.state.lock().await;
        let pair = TokenPair {
            access,
            refresh,
            issued_at: now_millis(),
        };
        self.persist(&pair).await?;
        state.pair = Some(pair.clone());
        state.hydrated = true;
        debug!("token pair replaced");
        Ok(pair)
    }

    /// Current access token, if any. Hydrates from the store on the
    /// first miss so a fresh context picks up a pair persisted by a
    /// sibling or an earlier run.
    pub async fn access_token(&self) -> Option<String> {
        let mut state = self.state.lock().await;
        if state.pair.is_none() && !state.hydrated {
            state.pair = self.hydrate().await;
            state.hydrated = true;
        }
        state.pair.as_ref().map(|p| p.access.clone())
    }

    /// Drop the in-memory pair and re-read the store. Used when a
    /// sibling context is known to have rotated tokens.
    pub async fn rehydrate(&self) -> Option<TokenPair> {
        let mut state = self.state.lock().await;
        state.pair = self.hydrate().await;
        state.hydrated = true;
        state.pair.clone()
    }

    /// Refresh the pair.
    ///
    /// `stale_access` is the access token the caller observed failing.
    /// If the held pair (or the shared store) already carries a
    /// different access token, a concurrent refresh won the race and
    /// that pair is returned without a second network call.
    ///
    /// A rejected or absent refresh token is terminal: all token state
    /// is cleared and `AuthExpired` raised. Never retried.
    pub async fn refresh(&self, stale_access: &str) -> Result<TokenPair> {
        let mut state = self.state.lock().await;
        if state.pair.is_none() && !state.hydrated {
            state.pair = self.hydrate().await;
            state.hydrated = true;
        }

        if let Some(pair) = &state.pair {
            if pair.access != stale_access {
                debug!("refresh coalesced: pair already replaced");
                return Ok(pair.clone());
            }
        }

        // A sibling context may have rotated the pair through the shared
        // store while we held only the stale token.
        if let Some(stored) = self.hydrate().await {
            if stored.access != stale_access {
                debug!("refresh coalesced: store already holds a newer pair");
                state.pair = Some(stored.clone());
                return Ok(stored);
            }
        }

        let Some(refresh) = state.pair.as_ref().and_then(|p| p.refresh.clone()) else {
            warn!("no refresh token held, session cannot be renewed");
            self.wipe(&mut state).await;
            return Err(Error::AuthExpired("no refresh token held".into()));
        };

        match api::refresh_token(&self.client, &self.base_url, &refresh).await {
            Ok(RefreshResponse {
                access_token,
                refresh_token,
            }) => {
                // A rotating backend returns a new refresh token;
                // otherwise the held one stays valid.
                let pair = TokenPair {
                    access: access_token,
                    refresh: refresh_token.or(Some(refresh)),
                    issued_at: now_millis(),
                };
                if let Err(e) = self.persist(&pair).await {
                    warn!(error = %e, "failed to persist refreshed tokens");
                }
                state.pair = Some(pair.clone());
                info!("token refresh succeeded");
                Ok(pair)
            }
            Err(Error::AuthExpired(msg)) => {
                warn!(error = %msg, "refresh token rejected, clearing session tokens");
                self.wipe(&mut state).await;
                Err(Error::AuthExpired(msg))
            }
            Err(e) => Err(e),
        }
    }

    /// Drop all token state. Memory is wiped unconditionally; store
    /// removal is best-effort and never surfaces an error.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        self.wipe(&mut state).await;
    }

    async fn persist(&self, pair: &TokenPair) -> Result<()> {
        let mut entries = vec![
            (
                ACCESS_TOKEN_KEY,
                serde_json::Value::String(pair.access.clone()),
            ),
            // Kept in step with the access key for stores written before
            // the access/refresh split.
            (
                LEGACY_TOKEN_KEY,
                serde_json::Value::String(pair.access.clone()),
            ),
        ];
        if let Some(refresh) = &pair.refresh {
            entries.push((REFRESH_TOKEN_KEY, serde_json::Value::String(refresh.clone())));
        }
        self.store.set_many(&entries).await
    }

    async fn hydrate(&self) -> Option<TokenPair> {
        let access: Option<String> = match self.store.get(ACCESS_TOKEN_KEY).await {
            Some(access) => Some(access),
            None => self.store.get(LEGACY_TOKEN_KEY).await,
        };
        let access = access?;
        let refresh: Option<String> = self.store.get(REFRESH_TOKEN_KEY).await;
        debug!("hydrated token pair from store");
        Some(TokenPair {
            access,
            refresh,
            issued_at: 0,
        })
    }

    async fn wipe(&self, state: &mut TokenState) {
        state.pair = None;
        state.hydrated = true;
        if let Err(e) = self
            .store
            .remove_many(&[ACCESS_TOKEN_KEY, LEGACY_TOKEN_KEY, REFRESH_TOKEN_KEY])
            .await
        {
            warn!(error = %e, "failed to clear persisted tokens");
        }
        debug!("token state cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Json;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;

    async fn open_store(dir: &tempfile::TempDir) -> Arc<KvStore> {
        Arc::new(KvStore::open(dir.path().join("store.json")).await.unwrap())
    }

    fn manager(store: Arc<KvStore>, base_url: &str) -> TokenManager {
        TokenManager::new(store, reqwest::Client::new(), base_url.to_string())
    }

    /// Serve a refresh endpoint that counts hits and mints `at_new`.
    async fn spawn_refresh_backend(reject: bool) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let state = hits.clone();
        let app = axum::Router::new()
            .route(
                "/auth/refresh-token",
                post(
                    move |State(hits): State<Arc<AtomicUsize>>, Json(body): Json<serde_json::Value>| async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        if reject || body["refreshToken"] != "rt_1" {
                            return (
                                StatusCode::UNAUTHORIZED,
                                Json(serde_json::json!({"message": "refresh token invalid"})),
                            );
                        }
                        (
                            StatusCode::OK,
                            Json(serde_json::json!({
                                "accessToken": "at_new",
                                "refreshToken": "rt_2"
                            })),
                        )
                    },
                ),
            )
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), hits)
    }

    #[tokio::test]
    async fn set_then_get_returns_access() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = manager(open_store(&dir).await, "http://unused");

        tokens
            .set_tokens("at_1".into(), Some("rt_1".into()))
            .await
            .unwrap();
        assert_eq!(tokens.access_token().await.as_deref(), Some("at_1"));
    }

    #[tokio::test]
    async fn fresh_manager_hydrates_from_shared_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        let first = manager(store.clone(), "http://unused");
        first
            .set_tokens("at_1".into(), Some("rt_1".into()))
            .await
            .unwrap();

        // A fresh in-memory state over the same persistent store
        let second = manager(store, "http://unused");
        assert_eq!(second.access_token().await.as_deref(), Some("at_1"));
    }

    #[tokio::test]
    async fn hydration_falls_back_to_legacy_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        store.set(LEGACY_TOKEN_KEY, &"at_old").await.unwrap();

        let tokens = manager(store, "http://unused");
        assert_eq!(tokens.access_token().await.as_deref(), Some("at_old"));
    }

    #[tokio::test]
    async fn clear_wipes_memory_and_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        let tokens = manager(store.clone(), "http://unused");
        tokens
            .set_tokens("at_1".into(), Some("rt_1".into()))
            .await
            .unwrap();
        tokens.clear().await;

        assert!(tokens.access_token().await.is_none());
        assert!(!store.contains(ACCESS_TOKEN_KEY).await);
        assert!(!store.contains(LEGACY_TOKEN_KEY).await);
        assert!(!store.contains(REFRESH_TOKEN_KEY).await);
    }

    #[tokio::test]
    async fn cleared_session_does_not_rehydrate_stale_memory() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        let tokens = manager(store.clone(), "http://unused");
        tokens.set_tokens("at_1".into(), None).await.unwrap();
        tokens.clear().await;

        // Even a sneaky direct store write must not surface: the
        // hydration is one-time and already spent.
        store.set(ACCESS_TOKEN_KEY, &"at_ghost").await.unwrap();
        assert!(tokens.access_token().await.is_none());
    }

    #[tokio::test]
    async fn refresh_without_refresh_token_is_auth_expired() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = manager(open_store(&dir).await, "http://unused");
        tokens.set_tokens("at_1".into(), None).await.unwrap();

        let err = tokens.refresh("at_1").await.unwrap_err();
        assert!(matches!(err, Error::AuthExpired(_)), "got: {err:?}");
        assert!(tokens.access_token().await.is_none());
    }

    #[tokio::test]
    async fn concurrent_refreshes_issue_one_network_call() {
        let dir = tempfile::tempdir().unwrap();
        let (base_url, hits) = spawn_refresh_backend(false).await;

        let tokens = Arc::new(manager(open_store(&dir).await, &base_url));
        tokens
            .set_tokens("at_stale".into(), Some("rt_1".into()))
            .await
            .unwrap();

        let mut handles = vec![];
        for _ in 0..5 {
            let tokens = tokens.clone();
            handles.push(tokio::spawn(
                async move { tokens.refresh("at_stale").await },
            ));
        }

        for h in handles {
            let pair = h.await.unwrap().unwrap();
            assert_eq!(pair.access, "at_new");
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1, "exactly one refresh call");
    }

    #[tokio::test]
    async fn refresh_persists_rotated_pair() {
        let dir = tempfile::tempdir().unwrap();
        let (base_url, _hits) = spawn_refresh_backend(false).await;

        let store = open_store(&dir).await;
        let tokens = manager(store.clone(), &base_url);
        tokens
            .set_tokens("at_stale".into(), Some("rt_1".into()))
            .await
            .unwrap();

        let pair = tokens.refresh("at_stale").await.unwrap();
        assert_eq!(pair.access, "at_new");
        assert_eq!(pair.refresh.as_deref(), Some("rt_2"));

        assert_eq!(
            store.get::<String>(ACCESS_TOKEN_KEY).await.as_deref(),
            Some("at_new")
        );
        assert_eq!(
            store.get::<String>(REFRESH_TOKEN_KEY).await.as_deref(),
            Some("rt_2")
        );
    }

    #[tokio::test]
    async fn rejected_refresh_clears_everything() {
        let dir = tempfile::tempdir().unwrap();
        let (base_url, hits) = spawn_refresh_backend(true).await;

        let store = open_store(&dir).await;
        let tokens = manager(store.clone(), &base_url);
        tokens
            .set_tokens("at_stale".into(), Some("rt_1".into()))
            .await
            .unwrap();

        let err = tokens.refresh("at_stale").await.unwrap_err();
        assert!(matches!(err, Error::AuthExpired(_)), "got: {err:?}");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Rejection is terminal: nothing survives, nothing is retried
        assert!(tokens.access_token().await.is_none());
        assert!(!store.contains(REFRESH_TOKEN_KEY).await);
    }

    #[tokio::test]
    async fn refresh_adopts_pair_rotated_by_sibling_store_writer() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        // Sibling context already rotated the pair through the store
        let sibling = manager(store.clone(), "http://unused");
        sibling
            .set_tokens("at_new".into(), Some("rt_2".into()))
            .await
            .unwrap();

        // This context still holds the stale pair in memory
        let tokens = manager(store, "http://unused");
        {
            let mut state = tokens.state.lock().await;
            state.pair = Some(TokenPair {
                access: "at_stale".into(),
                refresh: Some("rt_1".into()),
                issued_at: 0,
            });
            state.hydrated = true;
        }

        let pair = tokens.refresh("at_stale").await.unwrap();
        assert_eq!(pair.access, "at_new", "adopted without a network call");
    }
}
