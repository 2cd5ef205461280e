//! REST API client module for the creditdesk admin backend.
//!
//! This module provides the `ApiClient` used for every call the admin panel
//! makes to `/api/...` routes. Requests are authenticated with the bearer
//! token from the stored session; expired tokens are refreshed once through
//! `/api/auth/refresh-token` and shared by all requests waiting on it.

pub mod client;
pub mod error;
pub mod policy;
pub mod refresh;

pub use client::{ApiClient, ApiRequest, ClientConfig, REFRESH_TOKEN_PATH, SIGN_IN_ROUTE};
pub use error::{ApiError, RefreshError};
pub use policy::{decide, Disposition};
pub use refresh::{RefreshCoordinator, RefreshGuard, RefreshOutcome, RefreshTicket, RefreshWaiter};
