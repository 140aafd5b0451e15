//! Error taxonomy for the remote session client

use reqwest::StatusCode;
use thiserror::Error;

/// Errors produced by [`QbClient`](super::QbClient) operations.
///
/// `SessionExpired` is internal control flow: the session wrapper converts a
/// 403 into one re-login plus one replay, and only lets it escape if the
/// replay fails the same way.
#[derive(Debug, Error)]
pub enum QbError {
    /// Credentials rejected or no session cookie returned by login.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The remote denied an authenticated call.
    #[error("session expired")]
    SessionExpired,

    /// The remote answered with a non-auth error status.
    #[error("remote returned {status}: {body}")]
    Remote { status: StatusCode, body: String },

    /// Network or transport failure talking to the remote.
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}
