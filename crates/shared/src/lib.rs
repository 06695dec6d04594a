#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Kabuscope Shared Types
//!
//! Primitives used by the billing core, the API server and the worker:
//! resource kinds, the clock abstraction and database bootstrapping.

pub mod clock;
pub mod db;
pub mod resource;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use db::{create_pool, run_migrations};
pub use resource::{ParseResourceKindError, ResourceKind};
