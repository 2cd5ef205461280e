//! Decision table for failed responses.
//!
//! Kept free of side effects: the client asks `decide` what to do with a
//! failure and then performs the logout or refresh itself.

use reqwest::StatusCode;

/// What the client should do with a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Clear the session, navigate to sign-in, reject the call.
    Logout,
    /// Refresh the token (or wait for the refresh in flight) and replay once.
    Refresh,
    /// Hand the failure back to the caller untouched.
    PassThrough,
}

/// Classify a failed request.
///
/// `status` is `None` when the request never got a response (transport
/// error, timeout). First matching rule wins:
///
/// | condition | disposition |
/// |---|---|
/// | 403 | `Logout` |
/// | the failing request is the refresh call itself | `Logout` |
/// | 401 and not yet retried | `Refresh` |
/// | anything else | `PassThrough` |
pub fn decide(status: Option<StatusCode>, is_refresh_call: bool, already_retried: bool) -> Disposition {
    if status == Some(StatusCode::FORBIDDEN) {
        return Disposition::Logout;
    }
    if is_refresh_call {
        return Disposition::Logout;
    }
    if status == Some(StatusCode::UNAUTHORIZED) && !already_retried {
        return Disposition::Refresh;
    }
    Disposition::PassThrough
}
