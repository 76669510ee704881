//! Session handling for the remote platform.
//!
//! Two modes are supported:
//! - password login, which yields session cookies that expire
//! - a static API token, sent as a bearer header with no handshake

mod manager;
pub mod types;

pub use manager::{
    next_keepalive_delay, AuthManager, KEEPALIVE_FALLBACK, KEEPALIVE_MIN_DELAY,
    KEEPALIVE_SAFETY_BUFFER,
};
pub(crate) use manager::server_message;
pub use types::{LoginOutcome, SessionState, SessionToken};
