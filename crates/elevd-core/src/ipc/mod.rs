//! IPC (Inter-Process Communication) module.
//!
//! Transport-agnostic request/response types for talking to the daemon over
//! its Unix socket, plus the length-prefixed framing both sides use.
//!
//! A refused grant request is reported only as [`ErrorCode::NotAuthorized`]
//! with a generic message; which list refused the requester stays in the
//! daemon log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::controller::RevokeReason;
use crate::grant::Grant;
use crate::principal::{Principal, SessionId};

/// Largest frame either side will accept.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// IPC request from client to daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ElevationRequest {
    /// Ping the daemon.
    Ping,

    /// Request elevation for a principal.
    Grant {
        /// Principal to elevate.
        principal: Principal,
        /// Remote host the request originated from, absent for local
        /// requests.
        origin: Option<String>,
        /// Caller-supplied expiration overriding the computed one.
        expires_at: Option<DateTime<Utc>>,
    },

    /// Revoke a principal's elevation.
    Revoke {
        /// Principal to revoke.
        principal: Principal,
        /// Why the revocation was requested.
        reason: RevokeReason,
    },

    /// Ask whether a principal holds a grant.
    IsGranted {
        /// Principal to query.
        principal: Principal,
    },

    /// Ask whether a session's owning principal holds a grant.
    IsSessionGranted {
        /// Session to query.
        session_id: SessionId,
    },

    /// List all outstanding grants.
    ListGrants,

    /// Shutdown the daemon (drains all grants first).
    Shutdown,
}

/// IPC response from daemon to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ElevationResponse {
    /// Pong response.
    Pong {
        /// Daemon version.
        version: String,
        /// Daemon uptime in seconds.
        uptime_secs: u64,
    },

    /// Elevation granted.
    Granted {
        /// Stored expiration after merge, absent for a non-expiring grant.
        expires_at: Option<DateTime<Utc>>,
    },

    /// Elevation revoked (or was already absent).
    Revoked,

    /// Answer to a grant query.
    GrantStatus {
        /// Whether the principal (or session owner) holds a grant.
        granted: bool,
    },

    /// All outstanding grants.
    Grants {
        /// Grant records, in no particular order.
        entries: Vec<Grant>,
    },

    /// Operation success.
    Ok,

    /// Operation error.
    Error {
        /// Error code.
        code: ErrorCode,
        /// Error message.
        message: String,
    },
}

/// Error codes for IPC responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The requester failed authorization.
    NotAuthorized,
    /// The platform group operation failed.
    GroupOperationFailed,
    /// The request could not be parsed.
    InvalidRequest,
    /// Internal error.
    InternalError,
}

/// Frame a message for IPC transport.
///
/// Format: 4-byte big-endian length prefix + JSON payload.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // frames are capped well below 4GB
pub fn frame_message(message: &[u8]) -> Vec<u8> {
    let len = message.len() as u32;
    let mut framed = Vec::with_capacity(4 + message.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(message);
    framed
}

/// Parse a framed message length.
///
/// Returns the payload length if a complete length prefix is present.
#[must_use]
pub fn parse_frame_length(buffer: &[u8]) -> Option<usize> {
    if buffer.len() < 4 {
        return None;
    }
    let len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
    Some(len as usize)
}

/// IPC errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum IpcError {
    /// Connection failed.
    #[error("failed to connect to daemon: {0}")]
    ConnectionFailed(String),

    /// Daemon not running.
    #[error("daemon is not running")]
    DaemonNotRunning,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let payload = br#"{"type":"ping"}"#;
        let framed = frame_message(payload);

        assert_eq!(framed.len(), 4 + payload.len());
        assert_eq!(parse_frame_length(&framed), Some(payload.len()));
        assert_eq!(&framed[4..], payload);
    }

    #[test]
    fn incomplete_prefix_yields_no_length() {
        assert_eq!(parse_frame_length(&[]), None);
        assert_eq!(parse_frame_length(&[0, 0, 1]), None);
    }

    #[test]
    fn requests_serialize_with_type_tag() {
        let req = ElevationRequest::Grant {
            principal: Principal::from("uid-1000"),
            origin: Some("10.0.0.9".to_string()),
            expires_at: None,
        };

        let json: serde_json::Value = serde_json::from_str(&serde_json::to_string(&req).unwrap())
            .unwrap();
        assert_eq!(json["type"], "grant");
        assert_eq!(json["principal"], "uid-1000");
        assert_eq!(json["origin"], "10.0.0.9");
    }

    #[test]
    fn revoke_reason_uses_kebab_case_on_the_wire() {
        let req = ElevationRequest::Revoke {
            principal: Principal::from("uid-1000"),
            reason: RevokeReason::UserRequest,
        };

        let json: serde_json::Value = serde_json::from_str(&serde_json::to_string(&req).unwrap())
            .unwrap();
        assert_eq!(json["reason"], "user-request");
    }

    #[test]
    fn error_response_round_trips() {
        let resp = ElevationResponse::Error {
            code: ErrorCode::NotAuthorized,
            message: "not authorized".to_string(),
        };

        let json = serde_json::to_string(&resp).unwrap();
        let back: ElevationResponse = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            back,
            ElevationResponse::Error {
                code: ErrorCode::NotAuthorized,
                ..
            }
        ));
    }
}
