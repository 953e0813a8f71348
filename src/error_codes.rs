//! Error codes carried by the server's `error` event.
//!
//! Codes serialize using `SCREAMING_SNAKE_CASE` to match the server's JSON
//! format. Codes this client does not know deserialize as
//! [`ErrorCode::Unknown`] instead of failing the whole message.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured error codes returned by the monitoring server.
///
/// Use [`description()`](ErrorCode::description) for a human-readable explanation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Authentication errors
    Unauthorized,
    Forbidden,
    InvalidToken,
    TokenExpired,

    // Request errors
    InvalidInput,
    SessionNotFound,
    CandidateNotFound,
    RateLimitExceeded,

    // Server errors
    InternalError,
    ServiceUnavailable,

    /// Any code this client version does not recognize.
    #[serde(other)]
    Unknown,
}

impl ErrorCode {
    /// Returns `true` for codes that mean the server refuses this client
    /// outright. Receiving one ends the connection without reconnecting.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized | Self::Forbidden | Self::InvalidToken | Self::TokenExpired
        )
    }

    /// Returns a human-readable description of this error code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Unauthorized => "Authentication credentials are missing or invalid.",
            Self::Forbidden => "The authenticated user may not monitor this resource.",
            Self::InvalidToken => "The bearer token is malformed or was not issued by this server.",
            Self::TokenExpired => "The bearer token has expired. Obtain a new one and reconnect.",
            Self::InvalidInput => "The request payload is invalid or malformed.",
            Self::SessionNotFound => "The requested exam session does not exist.",
            Self::CandidateNotFound => "The requested candidate does not exist in this session.",
            Self::RateLimitExceeded => "Too many requests in a short time. Slow down and retry.",
            Self::InternalError => "An internal server error occurred.",
            Self::ServiceUnavailable => "The service is temporarily unavailable.",
            Self::Unknown => "The server reported an error code this client does not recognize.",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn codes_use_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::SessionNotFound).unwrap();
        assert_eq!(json, "\"SESSION_NOT_FOUND\"");
        let code: ErrorCode = serde_json::from_str("\"TOKEN_EXPIRED\"").unwrap();
        assert_eq!(code, ErrorCode::TokenExpired);
    }

    #[test]
    fn unrecognized_code_falls_back_to_unknown() {
        let code: ErrorCode = serde_json::from_str("\"SOMETHING_NEW\"").unwrap();
        assert_eq!(code, ErrorCode::Unknown);
        assert!(!code.is_rejection());
    }

    #[test]
    fn authentication_codes_are_rejections() {
        assert!(ErrorCode::Unauthorized.is_rejection());
        assert!(ErrorCode::InvalidToken.is_rejection());
        assert!(!ErrorCode::RateLimitExceeded.is_rejection());
        assert!(!ErrorCode::InternalError.is_rejection());
    }
}
