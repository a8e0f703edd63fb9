//! Warp upstream identity library
//!
//! Handles the three identity-plane interactions with app.warp.dev:
//! token refresh (exchanging a long-lived refresh token for a short-lived
//! JWT), the client login handshake (which yields session cookies), and the
//! optional GraphQL request-limit query. This crate is a standalone library
//! with no dependency on the gateway binary — it can be tested and used
//! independently.
//!
//! Credential flow:
//! 1. An account is created from a refresh token (admin add or directory load)
//! 2. Gateway calls `refresh_access_token()` when the JWT is absent/expiring
//! 3. Gateway calls `client_login()` once per process to obtain session cookies
//! 4. `fetch_request_limits()` optionally populates quota counters

pub mod constants;
pub mod error;
pub mod login;
pub mod token;
pub mod usage;

pub use constants::*;
pub use error::{Error, Result};
pub use login::{ExperimentParams, client_login, generate_experiment_params};
pub use token::{TokenResponse, refresh_access_token};
pub use usage::{RequestLimitInfo, fetch_request_limits};
