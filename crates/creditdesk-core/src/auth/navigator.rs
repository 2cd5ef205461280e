use std::sync::{Mutex, PoisonError};

use tracing::warn;

/// Sends the user back to sign-in once a session is beyond recovery.
///
/// Implementations should drop any in-memory state tied to the old session;
/// the client has already cleared the persisted session when this runs.
pub trait SignInNavigator: Send + Sync {
    fn navigate_to_sign_in(&self, route: &str);
}

/// Only logs the redirect. Default for hosts without a UI.
#[derive(Debug, Default)]
pub struct LogNavigator;

impl SignInNavigator for LogNavigator {
    fn navigate_to_sign_in(&self, route: &str) {
        warn!(route = route, "Session ended, sign-in required");
    }
}

/// Remembers every redirect it was asked to perform.
#[derive(Debug, Default)]
pub struct RecordingNavigator {
    visits: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn visits(&self) -> Vec<String> {
        self.visits.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl SignInNavigator for RecordingNavigator {
    fn navigate_to_sign_in(&self, route: &str) {
        self.visits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(route.to_string());
    }
}
