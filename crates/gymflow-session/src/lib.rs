//! GymFlow client session core
//!
//! The session and entitlement heart of the GymFlow dashboard client:
//! token lifecycle with coalesced refresh, subscription-gated capability
//! behind a time-boxed cache, and convergence across sibling contexts
//! over a broadcast channel. UI layers hold a [`SessionController`],
//! read its snapshots, and subscribe to changes; nothing else in the
//! dashboard mutates session state.
//!
//! Session lifecycle:
//! 1. `SessionController::initialize()` resolves any persisted session
//! 2. `login()` mints and stores a token pair, caches the profile
//! 3. `authenticated_request()` attaches the token, handling one
//!    refresh-and-retry cycle on 401
//! 4. `logout()` tears local state down immediately and tells siblings

pub mod config;
pub mod controller;
pub mod entitlement;
pub mod error;
pub mod sync;

pub use config::SessionConfig;
pub use controller::{ApiResponse, SessionController, SessionSnapshot, SessionState};
pub use entitlement::{CacheEntry, EntitlementCache};
pub use error::{Error, Result};
pub use sync::{BroadcastMessage, SyncEvent, TabChannel, TabSync};

// Wire types consumers handle directly.
pub use gymflow_auth::api::{Credentials, EntitlementStatus, Role, SessionUser};
