use serde_json::json;
use uiharness_ipc::{ApiCallInfo, ApiError, ApiReplyInfo, ErrCode};

/// Built-in diagnostic api set served by the bare daemon shell.
///
/// Real api handlers are registered by the host that embeds the server;
/// the shell only answers connectivity probes.
pub fn builtin_dispatcher(call: &ApiCallInfo, reply: &mut ApiReplyInfo) {
    match call.api_id.as_str() {
        "ping" => reply.result_value = json!("pong"),
        _ => {
            reply.exception = ApiError::new(
                ErrCode::UsageError,
                format!("api not registered: {}", call.api_id),
            );
        }
    }
}
