//! Error types and result definitions for the miot crate.
//! Includes MIoT error codes and conversion from standard IO/JSON errors.

use thiserror::Error;

/// Represents all possible errors surfaced by the transports and the orchestrator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MiotError {
    /// Standard IO error (socket setup, bind, send)
    #[error("IO error: {0}")]
    Io(String),

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// No reply arrived before the request deadline
    #[error("Timeout waiting for reply")]
    Timeout,

    /// The frame violated the wire format (magic, length, envelope fields)
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// MD5 tag of a LAN frame did not match the device token
    #[error("Integrity check failed")]
    IntegrityCheckFailed,

    /// No transport currently reaches the device
    #[error("Transport unreachable: {0}")]
    TransportUnreachable(String),

    /// The device or broker processed the call and rejected it
    #[error("Application error {code}: {message}")]
    Application { code: i64, message: String },

    /// A topic subscription was rejected repeatedly and abandoned
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    /// Caller supplied arguments that can never succeed
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// The reply was well framed but not of the expected shape
    #[error("Invalid result: {0}")]
    InvalidResult(String),

    /// Device id not present in the catalog
    #[error("Device '{0}' not found")]
    DeviceNotFound(String),

    /// The worker owning the resource has been shut down
    #[error("Transport closed")]
    Closed,
}

/// A specialized Result type for MIoT operations.
pub type Result<T> = std::result::Result<T, MiotError>;

impl From<std::io::Error> for MiotError {
    fn from(err: std::io::Error) -> Self {
        MiotError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for MiotError {
    fn from(err: serde_json::Error) -> Self {
        MiotError::Json(err.to_string())
    }
}

impl MiotError {
    pub fn code(&self) -> i32 {
        match self {
            MiotError::Io(_) => ERR_UNAVAILABLE,
            MiotError::Json(_) => ERR_INVALID_RESULT,
            MiotError::Timeout => ERR_TIMEOUT,
            MiotError::MalformedFrame(_) => ERR_INVALID_FRAME,
            MiotError::IntegrityCheckFailed => ERR_INTEGRITY,
            MiotError::TransportUnreachable(_) => ERR_NO_LINK,
            MiotError::Application { code, .. } => {
                i32::try_from(*code).unwrap_or(ERR_UNKNOWN)
            }
            MiotError::SubscriptionFailed(_) => ERR_SUBSCRIPTION,
            MiotError::InvalidParams(_) => ERR_INVALID_PARAMS,
            MiotError::InvalidResult(_) => ERR_INVALID_RESULT,
            MiotError::DeviceNotFound(_) => ERR_INVALID_PARAMS,
            MiotError::Closed => ERR_INTERNAL,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            ERR_TIMEOUT => MiotError::Timeout,
            ERR_NO_LINK => MiotError::TransportUnreachable("no link".to_string()),
            ERR_LAN_UNAVAILABLE => MiotError::TransportUnreachable("lan".to_string()),
            ERR_INVALID_FRAME => MiotError::MalformedFrame("unknown".to_string()),
            ERR_INTEGRITY => MiotError::IntegrityCheckFailed,
            ERR_INVALID_PARAMS => MiotError::InvalidParams("unknown".to_string()),
            ERR_INVALID_RESULT => MiotError::InvalidResult("unknown".to_string()),
            ERR_SUBSCRIPTION => MiotError::SubscriptionFailed("unknown".to_string()),
            ERR_INTERNAL => MiotError::Closed,
            _ => MiotError::Application {
                code: code as i64,
                message: get_error_message(code).to_string(),
            },
        }
    }

    /// Builds an error from a `{"code": .., "message": ..}` object returned by a
    /// device or broker. Timeout-shaped replies map to [`MiotError::Timeout`].
    pub fn from_reply(value: &serde_json::Value) -> Self {
        let code = value.get("code").and_then(|c| c.as_i64()).unwrap_or(ERR_UNKNOWN as i64);
        if code == ERR_TIMEOUT as i64 {
            return MiotError::Timeout;
        }
        let message = value
            .get("message")
            .or_else(|| value.get("error"))
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();
        MiotError::Application { code, message }
    }

    /// Whether the error means the transport itself could not carry the call.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, MiotError::TransportUnreachable(_) | MiotError::Closed)
    }
}

// MIoT Error Response Codes
define_error_codes! {
    ERR_SUCCESS = 0 => "Success",
    ERR_UNKNOWN = -10000 => "Unknown error",
    ERR_UNAVAILABLE = -10001 => "Service unavailable",
    ERR_INVALID_PARAMS = -10002 => "Invalid params",
    ERR_RESOURCE = -10003 => "Resource error",
    ERR_INTERNAL = -10004 => "Internal error",
    ERR_UNAUTHORIZED = -10005 => "Unauthorized access",
    ERR_TIMEOUT = -10006 => "Timeout",
    ERR_NO_LINK = -10007 => "No link to device",
    ERR_INVALID_FRAME = -10020 => "Malformed frame",
    ERR_INTEGRITY = -10021 => "Integrity check failed",
    ERR_SUBSCRIPTION = -10030 => "Subscription failed",
    ERR_INVALID_RESULT = -10040 => "Invalid result",
    ERR_LAN_UNAVAILABLE = -10120 => "LAN unavailable",
}
