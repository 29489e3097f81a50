//! Store keys and API paths for the GymFlow backend
//!
//! Store keys are namespaced under a stable prefix so several profiles
//! can share one durable store without collisions. The legacy token key
//! predates the access/refresh split and is kept in step with the access
//! key so older deployments keep hydrating.

/// Namespace prefix for every persisted key.
pub const STORAGE_PREFIX: &str = "gymflow_";

/// Cached profile of the signed-in user.
pub const USER_KEY: &str = "gymflow_user";

/// Single-token key written by older deployments. Read as a fallback,
/// written alongside the access key.
pub const LEGACY_TOKEN_KEY: &str = "gymflow_token";

/// Current access token.
pub const ACCESS_TOKEN_KEY: &str = "gymflow_access_token";

/// Refresh token, when the backend issued one.
pub const REFRESH_TOKEN_KEY: &str = "gymflow_refresh_token";

/// Password login.
pub const LOGIN_PATH: &str = "/auth/login";

/// Access-token probe, 200 or 401.
pub const VERIFY_TOKEN_PATH: &str = "/auth/verify-token";

/// Refresh-token exchange.
pub const REFRESH_TOKEN_PATH: &str = "/auth/refresh-token";

/// Best-effort server-side logout notification.
pub const LOGOUT_PATH: &str = "/auth/logout";

/// Profile of the bearer.
pub const PROFILE_PATH: &str = "/users/me";

/// Subscription status, suffixed with `/{user_id}`.
pub const SUBSCRIPTION_STATUS_PATH: &str = "/subscriptions/status";

/// Minimum accepted password length, checked before any network call.
pub const MIN_PASSWORD_LEN: usize = 6;
