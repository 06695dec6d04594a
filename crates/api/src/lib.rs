// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError::QuotaExceeded carries the reset timestamp
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Kabuscope API Library
//!
//! HTTP surface for subscriptions, daily quotas and AI stock analysis.

pub mod analysis;
pub mod auth;
pub mod config;
pub mod error;
pub mod quota;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
