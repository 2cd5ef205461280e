//! Session management for the admin API.
//!
//! This module provides:
//! - `Session`: the persisted session behind the `"user"` storage key
//! - `SessionStore`: storage port with file, keychain and in-memory backends
//! - `SignInNavigator`: the redirect performed when a session cannot be recovered

pub mod credentials;
pub mod navigator;
pub mod session;
pub mod store;

pub use credentials::KeyringSessionStore;
pub use navigator::{LogNavigator, RecordingNavigator, SignInNavigator};
pub use session::{Session, SessionData, SESSION_KEY};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore};
