// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError wraps BillingError
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Billsync API Library
//!
//! HTTP surface over the billing crate: checkout start and finalization,
//! signed webhook intake, manual refresh and user cancellation.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
