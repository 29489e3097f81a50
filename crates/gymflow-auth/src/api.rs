//! REST client for the GymFlow backend
//!
//! Free functions over a shared `reqwest::Client`, one per consumed
//! endpoint, plus the typed wire shapes they exchange. Status triage
//! happens here (401 on login is a credential problem, 401 on refresh is
//! a dead session); retry, caching, and state policy belong to the
//! session crate.

use serde::{Deserialize, Serialize};

use common::Secret;

use crate::constants::{
    LOGIN_PATH, LOGOUT_PATH, MIN_PASSWORD_LEN, PROFILE_PATH, REFRESH_TOKEN_PATH,
    SUBSCRIPTION_STATUS_PATH, VERIFY_TOKEN_PATH,
};
use crate::error::{Error, Result};

/// Login credentials. Transient: the password is redacted in logs and
/// never persisted beyond the login call.
#[derive(Debug)]
pub struct Credentials {
    pub email: String,
    pub password: Secret<String>,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: Secret::new(password.into()),
        }
    }

    /// Field checks performed before any network call.
    pub fn validate(&self) -> Result<()> {
        if self.email.trim().is_empty() {
            return Err(Error::Validation("email is required".into()));
        }
        if !self.email.contains('@') {
            return Err(Error::Validation("email is not a valid address".into()));
        }
        if self.password.is_empty() {
            return Err(Error::Validation("password is required".into()));
        }
        if self.password.len() < MIN_PASSWORD_LEN {
            return Err(Error::Validation(format!(
                "password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }
        Ok(())
    }
}

/// Account roles known to the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    SuperAdmin,
    GymOwner,
    Trainer,
    Member,
    /// Roles introduced server-side that this client predates.
    #[serde(other)]
    Unknown,
}

impl Role {
    /// Whether feature access for this role is gated on a billing
    /// subscription. Only gym owners carry one; staff and members
    /// inherit access through their gym.
    pub fn requires_billing(&self) -> bool {
        matches!(self, Role::GymOwner)
    }

    pub fn is_super_admin(&self) -> bool {
        matches!(self, Role::SuperAdmin)
    }

    pub fn is_gym_owner(&self) -> bool {
        matches!(self, Role::GymOwner)
    }

    pub fn is_trainer(&self) -> bool {
        matches!(self, Role::Trainer)
    }

    pub fn is_member(&self) -> bool {
        matches!(self, Role::Member)
    }

    /// Role label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Role::SuperAdmin => "super-admin",
            Role::GymOwner => "gym-owner",
            Role::Trainer => "trainer",
            Role::Member => "member",
            Role::Unknown => "unknown",
        }
    }
}

/// Denormalized profile cached alongside the token pair so consumers can
/// render before the profile endpoint answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUser {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gym_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub membership_end_date: Option<String>,
}

/// Subscription/billing status gating gym-owner feature access.
///
/// `checked_at` is stamped client-side when the value is received (the
/// wire omits it) and drives every staleness decision: a status older
/// than the configured window must not be trusted without a refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementStatus {
    pub has_active_subscription: bool,
    pub requires_subscription: bool,
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub days_remaining: i64,
    #[serde(default)]
    pub checked_at: u64,
}

impl EntitlementStatus {
    /// The consumer-facing gate: an active subscription, or a plan that
    /// does not require one.
    pub fn entitled(&self) -> bool {
        self.has_active_subscription || !self.requires_subscription
    }
}

#[derive(Debug, Deserialize)]
struct UserEnvelope {
    user: SessionUser,
}

/// Wire shape of a successful login. Newer deployments return
/// `accessToken`, older ones `token`; either satisfies the contract.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    data: UserEnvelope,
}

/// A successful login: the minted pair plus the profile to cache.
#[derive(Debug)]
pub struct LoginOutcome {
    pub access: String,
    pub refresh: Option<String>,
    pub user: SessionUser,
}

/// Wire shape of a refresh exchange.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusEnvelope {
    data: EntitlementStatus,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// Pull the backend's `message` field out of an error body, falling back
/// to the raw text.
async fn error_message(response: reqwest::Response) -> String {
    let text = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"));
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(ErrorBody { message: Some(m) }) => m,
        _ => text,
    }
}

/// Authenticate with email and password.
///
/// Credentials are validated before the request goes out. A 401 maps to
/// `InvalidCredentials`, any other failure status to `Server`.
pub async fn login(
    client: &reqwest::Client,
    base_url: &str,
    credentials: &Credentials,
) -> Result<LoginOutcome> {
    credentials.validate()?;

    let response = client
        .post(format!("{base_url}{LOGIN_PATH}"))
        .json(&serde_json::json!({
            "email": credentials.email,
            "password": credentials.password.expose(),
        }))
        .send()
        .await
        .map_err(|e| Error::Http(format!("login request failed: {e}")))?;

    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(Error::InvalidCredentials(error_message(response).await));
    }
    if !status.is_success() {
        return Err(Error::Server {
            status: status.as_u16(),
            message: error_message(response).await,
        });
    }

    let body: LoginResponse = response
        .json()
        .await
        .map_err(|e| Error::Parse(format!("invalid login response: {e}")))?;
    let access = body
        .access_token
        .or(body.token)
        .ok_or_else(|| Error::Parse("login response carries no access token".into()))?;

    Ok(LoginOutcome {
        access,
        refresh: body.refresh_token,
        user: body.data.user,
    })
}

/// Probe the verification endpoint with an access token.
///
/// `Ok(true)` on success, `Ok(false)` on an explicit 401 rejection, and
/// an error for anything else so callers can tell a rejected token apart
/// from a backend that could not answer.
pub async fn verify_token(client: &reqwest::Client, base_url: &str, access: &str) -> Result<bool> {
    let response = client
        .get(format!("{base_url}{VERIFY_TOKEN_PATH}"))
        .bearer_auth(access)
        .send()
        .await
        .map_err(|e| Error::Http(format!("token verification request failed: {e}")))?;

    let status = response.status();
    if status.is_success() {
        Ok(true)
    } else if status == reqwest::StatusCode::UNAUTHORIZED {
        Ok(false)
    } else {
        Err(Error::Server {
            status: status.as_u16(),
            message: error_message(response).await,
        })
    }
}

/// Exchange a refresh token for a new access token.
///
/// A 401/403 means the refresh token itself is rejected; that is
/// terminal for the session and reported as `AuthExpired`.
pub async fn refresh_token(
    client: &reqwest::Client,
    base_url: &str,
    refresh: &str,
) -> Result<RefreshResponse> {
    let response = client
        .post(format!("{base_url}{REFRESH_TOKEN_PATH}"))
        .json(&serde_json::json!({ "refreshToken": refresh }))
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if status.as_u16() == 401 || status.as_u16() == 403 {
        let body = error_message(response).await;
        return Err(Error::AuthExpired(format!(
            "refresh token rejected ({status}): {body}"
        )));
    }
    if !status.is_success() {
        return Err(Error::Server {
            status: status.as_u16(),
            message: error_message(response).await,
        });
    }

    response
        .json::<RefreshResponse>()
        .await
        .map_err(|e| Error::Parse(format!("invalid refresh response: {e}")))
}

/// Fetch the bearer's profile.
pub async fn fetch_profile(
    client: &reqwest::Client,
    base_url: &str,
    access: &str,
) -> Result<SessionUser> {
    let response = client
        .get(format!("{base_url}{PROFILE_PATH}"))
        .bearer_auth(access)
        .send()
        .await
        .map_err(|e| Error::Http(format!("profile request failed: {e}")))?;

    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(Error::AuthExpired("profile request rejected".into()));
    }
    if !status.is_success() {
        return Err(Error::Server {
            status: status.as_u16(),
            message: error_message(response).await,
        });
    }

    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|e| Error::Parse(format!("invalid profile response: {e}")))?;
    let user = body
        .get("data")
        .and_then(|d| d.get("user"))
        .cloned()
        .ok_or_else(|| Error::Parse("profile response carries no user".into()))?;
    serde_json::from_value(user).map_err(|e| Error::Parse(format!("invalid profile shape: {e}")))
}

/// Fetch the subscription status for a user.
pub async fn subscription_status(
    client: &reqwest::Client,
    base_url: &str,
    access: &str,
    user_id: &str,
) -> Result<EntitlementStatus> {
    let response = client
        .get(format!("{base_url}{SUBSCRIPTION_STATUS_PATH}/{user_id}"))
        .bearer_auth(access)
        .send()
        .await
        .map_err(|e| Error::Http(format!("subscription status request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::Server {
            status: status.as_u16(),
            message: error_message(response).await,
        });
    }

    response
        .json::<StatusEnvelope>()
        .await
        .map(|envelope| envelope.data)
        .map_err(|e| Error::Parse(format!("invalid subscription status response: {e}")))
}

/// Best-effort server-side logout notification. Callers discard the
/// error; local teardown never waits on this.
pub async fn logout(client: &reqwest::Client, base_url: &str, access: &str) -> Result<()> {
    let response = client
        .post(format!("{base_url}{LOGOUT_PATH}"))
        .bearer_auth(access)
        .send()
        .await
        .map_err(|e| Error::Http(format!("logout request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::Server {
            status: status.as_u16(),
            message: error_message(response).await,
        });
    }
    Ok(())
}
