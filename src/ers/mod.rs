//! e-Referral Service (ERS) registry integration.
//!
//! The registry is reached through a single authenticated session
//! ([`RegistrySession`]). Everything above the session (retry, work-list
//! deduplication, attachment selection) is transport-agnostic so the
//! reconciliation runner can be exercised against [`MockRegistrySession`].

pub mod types;
pub mod attachments;
pub mod retry;
pub mod session;
pub mod client;
pub mod mock;
pub mod worklist;

pub use types::*;
pub use attachments::{AttachmentSelection, AttachmentSelector, SelectorError};
pub use retry::RetryPolicy;
pub use session::RegistrySession;
pub use client::HttpRegistrySession;
pub use mock::MockRegistrySession;
pub use worklist::WorkListFetcher;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Registry is not reachable at {0}")]
    Connection(String),

    #[error("Registry request timed out after {0}s")]
    Timeout(u64),

    #[error("Registry returned error (status {status}): {body}")]
    Http { status: u16, body: String },

    #[error("Registry session is not authorised: {0}")]
    Unauthorized(String),

    #[error("Registry resource not found: {0}")]
    NotFound(String),

    #[error("No active registry session")]
    NoSession,

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Response parsing error: {0}")]
    ResponseParsing(String),
}

impl RegistryError {
    /// Worth another attempt: 5xx, 429 and transport failures.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout(_) => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// The session itself is unusable; continuing the batch is pointless.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized(_) | Self::NoSession)
    }

    /// Map a non-success HTTP status to the matching error.
    pub fn from_status(status: u16, body: String, resource: &str) -> Self {
        match status {
            401 | 403 => Self::Unauthorized(format!("status {status} for {resource}")),
            404 => Self::NotFound(resource.to_string()),
            _ => Self::Http { status, body },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_throttling_are_transient() {
        for status in [500, 502, 503, 504, 429] {
            let err = RegistryError::Http { status, body: String::new() };
            assert!(err.is_transient(), "status {status} should be transient");
        }
        assert!(RegistryError::Connection("http://ers".into()).is_transient());
        assert!(RegistryError::Timeout(30).is_transient());
    }

    #[test]
    fn client_errors_are_not_transient() {
        for status in [400, 404, 409, 422] {
            let err = RegistryError::Http { status, body: String::new() };
            assert!(!err.is_transient(), "status {status} should not be retried");
        }
        assert!(!RegistryError::ResponseParsing("bad json".into()).is_transient());
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            RegistryError::from_status(401, String::new(), "worklist"),
            RegistryError::Unauthorized(_)
        ));
        assert!(matches!(
            RegistryError::from_status(403, String::new(), "worklist"),
            RegistryError::Unauthorized(_)
        ));
        assert_eq!(
            RegistryError::from_status(404, String::new(), "referral 1"),
            RegistryError::NotFound("referral 1".into())
        );
        assert_eq!(
            RegistryError::from_status(503, "busy".into(), "worklist"),
            RegistryError::Http { status: 503, body: "busy".into() }
        );
    }

    #[test]
    fn only_session_errors_are_fatal() {
        assert!(RegistryError::Unauthorized("expired".into()).is_fatal());
        assert!(RegistryError::NoSession.is_fatal());
        assert!(!RegistryError::Http { status: 500, body: String::new() }.is_fatal());
        assert!(!RegistryError::NotFound("x".into()).is_fatal());
    }
}
