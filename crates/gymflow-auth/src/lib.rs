//! GymFlow authentication wire and persistence layer
//!
//! Everything that touches the backend or the durable store lives here;
//! policy (caching, state machine, cross-context sync) lives in the
//! session crate on top. This crate is a standalone library with no
//! dependency on any UI surface.
//!
//! Session flow:
//! 1. UI submits credentials, `api::login()` mints a token pair
//! 2. `TokenManager::set_tokens()` persists the pair atomically
//! 3. Requests read `TokenManager::access_token()`
//! 4. A 401 triggers `TokenManager::refresh()`, coalesced across callers
//! 5. A rejected refresh clears everything and ends the session

pub mod api;
pub mod constants;
pub mod error;
pub mod storage;
pub mod token;

pub use api::{Credentials, EntitlementStatus, LoginOutcome, Role, SessionUser};
pub use constants::*;
pub use error::{Error, Result};
pub use storage::KvStore;
pub use token::{TokenManager, TokenPair};
