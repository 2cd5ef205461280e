//! Core library for creditdesk.
//!
//! Provides the authenticated HTTP client the admin panel uses to reach the
//! billing/credits backend, together with session storage and configuration.

pub mod api;
pub mod auth;
pub mod config;

pub use api::{ApiClient, ApiError, ApiRequest, ClientConfig};
pub use auth::{Session, SessionData, SessionStore, SignInNavigator};
pub use config::Config;
