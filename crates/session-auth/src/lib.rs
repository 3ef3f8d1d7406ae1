//! Session persistence and authentication handshakes
//!
//! Stores one opaque session token per resource name so restarts can resume
//! without re-authenticating, and implements the client-credentials handshake
//! the relay's HTTP connector uses.
//!
//! Session flow:
//! 1. Rotator calls `SessionStore::load()` for the resource it selected
//! 2. A stored token is checked with `handshake::validate()`
//! 3. Missing or rejected tokens trigger `handshake::authenticate()`
//! 4. The new token is persisted via `SessionStore::save()`

pub mod error;
pub mod handshake;
pub mod store;

pub use error::{Error, Result};
pub use handshake::{TokenResponse, authenticate, validate};
pub use store::SessionStore;
