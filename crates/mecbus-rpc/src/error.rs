//! Error types for the RPC layer.

use mecbus_core::BusError;
use thiserror::Error;

use crate::proto::InvokeReplyType;

/// Main error type for RPC operations.
#[derive(Debug, Error)]
pub enum RpcError {
    // Lifecycle errors
    #[error("Service not ready")]
    ServiceNotReady,

    #[error("Directory server not ready")]
    ServerNotReady,

    #[error("RPC call timed out")]
    Timeout,

    // Transport
    #[error("Transport error: {0}")]
    Transport(#[from] BusError),

    // Wire reply codes, one variant each so callers can match on the
    // exact failure the remote host reported.
    #[error("No such service")]
    NoService,

    #[error("No such class: {0}")]
    NoClass(String),

    #[error("No such method")]
    NoMethod,

    #[error("No such instance")]
    NoInstance,

    #[error("Invalid instance id: {0}")]
    InvalidInstanceId(u64),

    #[error("Bad get-instance parameters")]
    GetInstanceParamError,

    #[error("Cannot create instance of {0}")]
    CannotCreateInstance(String),

    #[error("Malformed RPC package")]
    PackageError,

    #[error("Remote handler failed: {0}")]
    OtherReply(String),

    // Registration errors
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),
}

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Transport(err.into())
    }
}

impl RpcError {
    /// Wire code this error travels as in an invoke reply.
    pub fn reply_type(&self) -> InvokeReplyType {
        match self {
            RpcError::NoService | RpcError::ServiceNotReady | RpcError::ServerNotReady => {
                InvokeReplyType::NoService
            }
            RpcError::NoClass(_) => InvokeReplyType::NoClass,
            RpcError::NoMethod => InvokeReplyType::NoMethod,
            RpcError::NoInstance => InvokeReplyType::NoInstance,
            RpcError::InvalidInstanceId(_) => InvokeReplyType::InvalidInstanceId,
            RpcError::GetInstanceParamError => InvokeReplyType::GetInstanceParamError,
            RpcError::CannotCreateInstance(_) => InvokeReplyType::CannotCreateInstance,
            RpcError::PackageError => InvokeReplyType::PackageError,
            _ => InvokeReplyType::OtherError,
        }
    }

    /// Reconstruct the typed error a wire reply code stands for.
    /// `Success` and `Unknown` carry no error.
    pub fn from_reply_type(reply: InvokeReplyType, context: &str) -> Option<Self> {
        match reply {
            InvokeReplyType::Unknown | InvokeReplyType::Success => None,
            InvokeReplyType::CannotCreateInstance => {
                Some(RpcError::CannotCreateInstance(context.to_string()))
            }
            InvokeReplyType::NoInstance => Some(RpcError::NoInstance),
            InvokeReplyType::NoMethod => Some(RpcError::NoMethod),
            InvokeReplyType::NoClass => Some(RpcError::NoClass(context.to_string())),
            InvokeReplyType::NoService => Some(RpcError::NoService),
            InvokeReplyType::GetInstanceParamError => Some(RpcError::GetInstanceParamError),
            InvokeReplyType::InvalidInstanceId => Some(RpcError::InvalidInstanceId(0)),
            InvokeReplyType::PackageError => Some(RpcError::PackageError),
            InvokeReplyType::OtherError => Some(RpcError::OtherReply(context.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_type_roundtrip_for_wire_errors() {
        let cases = [
            RpcError::NoService,
            RpcError::NoClass("Calc".into()),
            RpcError::NoMethod,
            RpcError::NoInstance,
            RpcError::InvalidInstanceId(3),
            RpcError::GetInstanceParamError,
            RpcError::CannotCreateInstance("Calc".into()),
            RpcError::PackageError,
        ];
        for err in cases {
            let code = err.reply_type();
            let back = RpcError::from_reply_type(code, "ctx").expect("error code");
            assert_eq!(back.reply_type(), code);
        }
    }

    #[test]
    fn test_success_maps_to_no_error() {
        assert!(RpcError::from_reply_type(InvokeReplyType::Success, "").is_none());
    }
}
