use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Subsystem unavailable: {0}")]
    SubsystemUnavailable(String),

    #[error("Connect attempt failed: {0}")]
    ConnectAttemptFailed(String),

    #[error("Permission denied: variable '{0}' is writable only by the authority")]
    PermissionDenied(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MessagePack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error("MessagePack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
