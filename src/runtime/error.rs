use crate::runtime::id::ComputationId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// 用户代码抛出的异常 (User-code fault)
/// 原样传递给宿主，保留类型和消息。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Fault {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub detail: Value,
}

impl Fault {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            detail: Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("storage operation timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Codec, storage layout or version mismatch. The flow cannot be replayed.
    Protocol,
    /// Transient I/O failure. Nothing was partially written; safe to retry.
    Storage,
    /// A host callback returned an error.
    Host,
}

/// Engine-level errors. User faults never show up here, they end a flow as `Failed`.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("invalid frame state for `{type_tag}`: {reason}")]
    InvalidFrameState { type_tag: String, reason: String },

    #[error("no surrogator recognizes type `{0}`")]
    UnresolvedSurrogate(String),

    #[error("value of field `{0}` is not portable and no surrogator accepted it")]
    NotPortable(String),

    #[error("unknown flow `{0}`")]
    UnknownFlow(ComputationId),

    #[error("id `{0}` is reserved, already in use or not resumable here")]
    InvalidId(ComputationId),

    #[error("no codec registered for frame type `{0}`")]
    UnknownFrameType(String),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("host callback failed: {0}")]
    Host(#[source] anyhow::Error),
}

impl FlowError {
    pub fn invalid_state(type_tag: impl Into<String>, reason: impl Into<String>) -> Self {
        FlowError::InvalidFrameState {
            type_tag: type_tag.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FlowError::Storage(_) => ErrorKind::Storage,
            FlowError::Host(_) => ErrorKind::Host,
            _ => ErrorKind::Protocol,
        }
    }

    pub fn is_protocol(&self) -> bool {
        self.kind() == ErrorKind::Protocol
    }
}

pub type FlowResult<T> = Result<T, FlowError>;
