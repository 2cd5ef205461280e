use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use super::store::SessionStore;
use crate::api::RefreshError;

/// Storage key holding the serialized session.
pub const SESSION_KEY: &str = "user";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub is_authenticated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refreshed_at: Option<DateTime<Utc>>,
    /// Everything else the backend sent along with the token (`info`, ...).
    #[serde(flatten)]
    pub profile: Map<String, Value>,
}

impl SessionData {
    /// Session for a token issued by the sign-in flow.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            is_authenticated: true,
            refreshed_at: None,
            profile: Map::new(),
        }
    }

    /// Build the session persisted after a refresh: the payload merged with
    /// `is_authenticated: true`. A payload without a usable `token` is a
    /// failed refresh.
    pub fn from_refresh_payload(payload: Value) -> Result<Self, RefreshError> {
        let Value::Object(mut fields) = payload else {
            return Err(RefreshError::Decode("expected a JSON object".to_string()));
        };

        let token = match fields.remove("token") {
            Some(Value::String(token)) if !token.is_empty() => token,
            _ => return Err(RefreshError::MissingToken),
        };
        fields.remove("is_authenticated");
        fields.remove("refreshed_at");

        Ok(Self {
            token,
            is_authenticated: true,
            refreshed_at: Some(Utc::now()),
            profile: fields,
        })
    }

    /// Bearer token, if one is set
    pub fn bearer(&self) -> Option<&str> {
        Some(self.token.as_str()).filter(|t| !t.is_empty())
    }

    /// Minutes since the token was last refreshed (for display)
    pub fn refreshed_minutes_ago(&self) -> Option<i64> {
        self.refreshed_at
            .map(|at| (Utc::now() - at).num_minutes().max(0))
    }
}

/// The persisted session behind the `"user"` storage key.
#[derive(Clone)]
pub struct Session {
    store: Arc<dyn SessionStore>,
}

impl Session {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Load the stored session.
    ///
    /// Unreadable or corrupt entries are logged and reported as no session,
    /// so requests carry on unauthenticated.
    pub fn load(&self) -> Option<SessionData> {
        let raw = match self.store.get(SESSION_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Failed to read stored session");
                return None;
            }
        };

        match serde_json::from_str::<SessionData>(&raw) {
            Ok(data) => Some(data),
            Err(e) => {
                warn!(error = %e, "Stored session is corrupt, ignoring it");
                None
            }
        }
    }

    /// Bearer token of the stored session, if any
    pub fn token(&self) -> Option<String> {
        self.load().and_then(|d| d.bearer().map(str::to_string))
    }

    pub fn save(&self, data: &SessionData) -> Result<()> {
        let contents = serde_json::to_string(data).context("Failed to serialize session")?;
        self.store.set(SESSION_KEY, &contents)
    }

    pub fn clear(&self) -> Result<()> {
        self.store.remove(SESSION_KEY)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::auth::MemorySessionStore;

    fn session() -> (Arc<MemorySessionStore>, Session) {
        let store = Arc::new(MemorySessionStore::new());
        let session = Session::new(store.clone());
        (store, session)
    }

    #[test]
    fn test_refresh_payload_is_merged_with_authenticated_flag() {
        let data = SessionData::from_refresh_payload(json!({
            "token": "T2",
            "is_authenticated": false,
            "info": { "email": "ops@example.com", "role": "admin" }
        }))
        .unwrap();

        assert_eq!(data.token, "T2");
        assert!(data.is_authenticated);
        assert!(data.refreshed_at.is_some());
        assert_eq!(data.refreshed_minutes_ago(), Some(0));
        assert_eq!(data.profile["info"]["role"], "admin");
        assert!(!data.profile.contains_key("token"));
    }

    #[test]
    fn test_refresh_payload_without_token_fails() {
        assert_eq!(
            SessionData::from_refresh_payload(json!({ "info": {} })),
            Err(RefreshError::MissingToken)
        );
        assert_eq!(
            SessionData::from_refresh_payload(json!({ "token": "" })),
            Err(RefreshError::MissingToken)
        );
        assert_eq!(
            SessionData::from_refresh_payload(json!({ "token": 42 })),
            Err(RefreshError::MissingToken)
        );
        assert!(matches!(
            SessionData::from_refresh_payload(json!("T2")),
            Err(RefreshError::Decode(_))
        ));
    }

    #[test]
    fn test_save_then_load_keeps_profile_fields() {
        let (store, session) = session();
        let data = SessionData::from_refresh_payload(json!({
            "token": "abc",
            "info": { "name": "Ops" }
        }))
        .unwrap();

        session.save(&data).unwrap();

        let raw: Value = serde_json::from_str(&store.get(SESSION_KEY).unwrap().unwrap()).unwrap();
        assert_eq!(raw["token"], "abc");
        assert_eq!(raw["is_authenticated"], true);
        assert_eq!(raw["info"]["name"], "Ops");

        assert_eq!(session.load(), Some(data));
        assert_eq!(session.token().as_deref(), Some("abc"));
    }

    #[test]
    fn test_corrupt_session_reads_as_missing() {
        let (store, session) = session();
        store.set(SESSION_KEY, "{not json").unwrap();

        assert_eq!(session.load(), None);
        assert_eq!(session.token(), None);
    }

    #[test]
    fn test_session_without_token_has_no_bearer() {
        let (store, session) = session();
        store.set(SESSION_KEY, r#"{"is_authenticated":false}"#).unwrap();

        assert!(session.load().is_some());
        assert_eq!(session.token(), None);
    }

    #[test]
    fn test_imported_session_was_never_refreshed() {
        let data = SessionData::new("abc");
        assert!(data.is_authenticated);
        assert_eq!(data.bearer(), Some("abc"));
        assert_eq!(data.refreshed_minutes_ago(), None);
    }

    #[test]
    fn test_clear_removes_stored_session() {
        let (store, session) = session();
        session.save(&SessionData::new("abc")).unwrap();
        session.clear().unwrap();
        assert_eq!(store.get(SESSION_KEY).unwrap(), None);
    }
}
