//! Entitlement cache
//!
//! Wraps the remote subscription-status check in a time-boxed cache so
//! protected actions do not re-query billing state on every call.
//! Staleness is evaluated at access time, never polled. A remote failure
//! degrades to the last known value instead of failing the caller;
//! billing checks must never block the UI on a transient network issue.

use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use common::now_millis;
use gymflow_auth::api::{self, EntitlementStatus};

/// A cached value and its expiry, unix milliseconds. Owned exclusively
/// by the cache; callers receive clones.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub expires_at: u64,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, max_age: Duration) -> Self {
        Self {
            value,
            expires_at: now_millis() + max_age.as_millis() as u64,
        }
    }

    pub fn is_fresh(&self) -> bool {
        now_millis() < self.expires_at
    }
}

/// Time-boxed cache over the subscription-status endpoint.
pub struct EntitlementCache {
    client: reqwest::Client,
    base_url: String,
    max_age: Duration,
    /// Lock held across the remote check, so concurrent callers for the
    /// same user coalesce onto one request: the first fetches, the rest
    /// find a fresh entry once they acquire the lock.
    entry: Mutex<Option<CacheEntry<EntitlementStatus>>>,
}

impl EntitlementCache {
    pub fn new(client: reqwest::Client, base_url: String, max_age: Duration) -> Self {
        Self {
            client,
            base_url,
            max_age,
            entry: Mutex::new(None),
        }
    }

    /// Current entitlement for `user_id`.
    ///
    /// Serves the cached value while fresh unless `force` is set. On a
    /// remote failure the last known value is returned even when stale;
    /// `None` only when there has never been a successful check.
    pub async fn check(
        &self,
        access: &str,
        user_id: &str,
        force: bool,
    ) -> Option<EntitlementStatus> {
        let mut entry = self.entry.lock().await;

        if !force {
            if let Some(cached) = entry.as_ref() {
                if cached.is_fresh() {
                    debug!("entitlement served from cache");
                    return Some(cached.value.clone());
                }
            }
        }

        match api::subscription_status(&self.client, &self.base_url, access, user_id).await {
            Ok(mut status) => {
                status.checked_at = now_millis();
                debug!(
                    plan = %status.plan,
                    entitled = status.entitled(),
                    days_remaining = status.days_remaining,
                    "entitlement refreshed"
                );
                let value = status.clone();
                *entry = Some(CacheEntry::new(status, self.max_age));
                Some(value)
            }
            Err(e) => {
                warn!(error = %e, "entitlement check failed, serving last known value");
                entry.as_ref().map(|cached| cached.value.clone())
            }
        }
    }

    /// Apply a status observed from a sibling context. Last-write-wins
    /// on `checked_at`; an older status than the held one is discarded.
    pub async fn merge(&self, status: EntitlementStatus) {
        let mut entry = self.entry.lock().await;
        let newer = entry
            .as_ref()
            .is_none_or(|cached| status.checked_at >= cached.value.checked_at);
        if newer {
            let expires_at = status.checked_at + self.max_age.as_millis() as u64;
            debug!("entitlement merged from sibling context");
            *entry = Some(CacheEntry {
                value: status,
                expires_at,
            });
        } else {
            debug!("stale sibling entitlement discarded");
        }
    }

    /// Last successfully checked status, fresh or not.
    pub async fn last_known(&self) -> Option<EntitlementStatus> {
        let entry = self.entry.lock().await;
        entry.as_ref().map(|cached| cached.value.clone())
    }

    /// Forget everything; part of logout teardown.
    pub async fn clear(&self) {
        let mut entry = self.entry.lock().await;
        *entry = None;
    }
}
