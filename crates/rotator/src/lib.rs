//! Multi-credential resource rotator
//!
//! Manages several interchangeable authenticated connections to one upstream,
//! tracks their health, quarantines any that get rate limited, and hands out
//! the best usable one for each unit of work. Sessions are established through
//! a `connector::Connector` and persisted in a `session_auth::SessionStore` so
//! restarts resume without a new handshake.
//!
//! Resource lifecycle:
//! 1. Configured credential → resource usable, no session
//! 2. First `acquire()` (or the warm task) establishes and persists a session
//! 3. Caller reports each request outcome via `report()` / `report_failure()`
//! 4. Rate limited → quarantined for the upstream's wait, other resources serve
//! 5. Quarantine runs out → usable again on next selection
//! 6. Authentication rejected → disabled permanently, persisted token removed

pub mod classify;
pub mod error;
pub mod resource;
pub mod rotator;
pub mod warm;

pub use classify::{DEFAULT_RATE_LIMIT_WAIT, classify_status, rate_limit_wait};
pub use error::{Error, Result};
pub use resource::{Resource, ResourceStats};
pub use rotator::{Acquired, Rotator};
pub use warm::spawn_warm_task;
