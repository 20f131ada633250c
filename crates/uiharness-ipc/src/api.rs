use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome classification for an api reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrCode {
    #[default]
    NoError,
    /// Caller misuse, surfaced verbatim to the caller.
    UsageError,
    /// Infrastructure failure: dead connection, serialization fault, or an
    /// uncategorized failure inside the dispatcher.
    InternalError,
}

/// Exception slot of an api reply.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: ErrCode,
    #[serde(default)]
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// One api invocation as seen by the dispatcher.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiCallInfo {
    #[serde(rename = "api")]
    pub api_id: String,
    #[serde(rename = "this", default, skip_serializing_if = "Option::is_none")]
    pub caller_obj_ref: Option<String>,
    #[serde(rename = "args", default)]
    pub param_list: Vec<Value>,
}

impl ApiCallInfo {
    pub fn new(api_id: impl Into<String>) -> Self {
        Self {
            api_id: api_id.into(),
            ..Self::default()
        }
    }
}

/// Result of one api invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiReplyInfo {
    #[serde(rename = "result", default)]
    pub result_value: Value,
    #[serde(default)]
    pub exception: ApiError,
}

impl ApiReplyInfo {
    pub fn from_error(exception: ApiError) -> Self {
        Self {
            result_value: Value::Null,
            exception,
        }
    }
}
