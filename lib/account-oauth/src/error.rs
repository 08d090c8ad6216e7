//! Login error types

use discovery_core::DiscoveryError;
use thiserror::Error;

/// Why a login attempt failed
#[derive(Error, Debug)]
pub enum LoginError {
    #[error("authorization code is empty")]
    EmptyCode,

    /// No usable connection to the OAuth service could be obtained
    #[error("service unavailable: {0}")]
    ServiceUnavailable(#[source] DiscoveryError),

    #[error("failed to load TLS settings: {0}")]
    Tls(#[source] DiscoveryError),

    #[error("{step} failed: {status}")]
    Rpc {
        step: &'static str,
        status: tonic::Status,
    },

    #[error("{step} timed out")]
    Timeout { step: &'static str },

    /// The OAuth service answered with a non-empty `error` field
    #[error("{step} rejected: {message}")]
    Rejected { step: &'static str, message: String },

    #[error("user info response carried no user")]
    MissingUserInfo,
}

impl LoginError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, LoginError::ServiceUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, LoginError>;
