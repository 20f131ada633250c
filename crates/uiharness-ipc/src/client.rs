use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::{ApiCallInfo, ApiError, ApiReplyInfo, ErrCode};
use crate::message::TransactionType;
use crate::sync::lock_or_recover;
use crate::transceiver::{MessageTransceiver, PollError, WAIT_TRANSACTION_MS};
use crate::transport::{Transport, TransportError};

/// How long the client waits for the first sign of life from the daemon.
pub const DISCOVERY_TIMEOUT_MS: u64 = 5000;

/// Part of the caller-visible contract; existing callers key off these
/// substrings, misspelling included.
const DEAD_CONNECTION_MSG: &str = "connection with uitest_daemon is dead";
const CONCURRENT_INVOKE_MSG: &str = "uitest-api dose not allow calling concurrently";

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to attach to the transport: {0}")]
    Transport(#[from] TransportError),

    #[error("peer discovery timed out after {0} ms")]
    DiscoveryTimedOut(u64),
}

struct ClientState {
    current_api: String,
    connection_died: bool,
}

/// Harness-side transaction endpoint: synchronous request/response with a
/// single-flight discipline.
pub struct TransactionClient<T: Transport> {
    transceiver: Arc<MessageTransceiver<T>>,
    // Distinct from the transceiver mutex so poll waits never block state
    // transitions.
    state: Mutex<ClientState>,
}

impl<T: Transport> TransactionClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transceiver: MessageTransceiver::new(transport),
            state: Mutex::new(ClientState {
                current_api: String::new(),
                connection_died: false,
            }),
        }
    }

    pub fn transceiver(&self) -> &Arc<MessageTransceiver<T>> {
        &self.transceiver
    }

    /// Attach, discover the daemon, then arm the watchdog with
    /// auto-handshake so the link stays warm between invocations.
    pub fn initialize(&self) -> Result<(), ConnectError> {
        self.transceiver.initialize()?;
        info!("checking daemon interaction");
        if !self
            .transceiver
            .discover_peer(Duration::from_millis(DISCOVERY_TIMEOUT_MS))
        {
            warn!(timeout_ms = DISCOVERY_TIMEOUT_MS, "daemon discovery timed out");
            return Err(ConnectError::DiscoveryTimedOut(DISCOVERY_TIMEOUT_MS));
        }
        self.transceiver.schedule_check_connection(true);
        info!("daemon interaction established");
        Ok(())
    }

    /// Invoke one api synchronously.
    ///
    /// At most one invocation may be in flight; a concurrent call is
    /// rejected with a usage error without touching the wire.
    pub fn invoke_api(&self, call: &ApiCallInfo, reply: &mut ApiReplyInfo) {
        {
            let mut state = lock_or_recover(&self.state);
            if state.connection_died {
                *reply = dead_connection_reply();
                return;
            }
            if !state.current_api.is_empty() {
                *reply = ApiReplyInfo::from_error(ApiError::new(
                    ErrCode::UsageError,
                    format!("{CONCURRENT_INVOKE_MSG}: {}", state.current_api),
                ));
                return;
            }
            state.current_api = call.api_id.clone();
        }
        self.transact(call, reply);
        lock_or_recover(&self.state).current_api.clear();
    }

    fn transact(&self, call: &ApiCallInfo, reply: &mut ApiReplyInfo) {
        let parcel = match serde_json::to_string(call) {
            Ok(parcel) => parcel,
            Err(error) => {
                *reply = ApiReplyInfo::from_error(ApiError::new(
                    ErrCode::InternalError,
                    format!("failed to serialize api call: {error}"),
                ));
                return;
            }
        };
        let call_id = self.transceiver.emit_call(parcel);
        loop {
            match self
                .transceiver
                .poll_call_reply(Duration::from_millis(WAIT_TRANSACTION_MS))
            {
                Ok(message) => {
                    // Single-flight makes any in-flight reply ours, but a
                    // reply left over from an earlier exchange must not be
                    // mis-attributed.
                    if message.kind != TransactionType::Reply || message.id != call_id {
                        debug!(id = message.id, kind = ?message.kind, "discarding stale message");
                        continue;
                    }
                    match serde_json::from_str::<ApiReplyInfo>(&message.data_parcel) {
                        Ok(parsed) => *reply = parsed,
                        Err(error) => {
                            *reply = ApiReplyInfo::from_error(ApiError::new(
                                ErrCode::InternalError,
                                format!("failed to decode api reply: {error}"),
                            ));
                        }
                    }
                    return;
                }
                Err(PollError::WaitTimeout) => continue,
                Err(PollError::ConnectionDied) => {
                    lock_or_recover(&self.state).connection_died = true;
                    *reply = dead_connection_reply();
                    return;
                }
                Err(PollError::RequestExit) => {
                    *reply = dead_connection_reply();
                    return;
                }
            }
        }
    }

    /// Tear down both ends: the transceiver finalize emits an exit toward
    /// the daemon, and every later invocation reports a dead connection.
    /// Idempotent.
    pub fn finalize(&self) {
        lock_or_recover(&self.state).connection_died = true;
        self.transceiver.finalize();
    }
}

fn dead_connection_reply() -> ApiReplyInfo {
    ApiReplyInfo {
        result_value: Value::Null,
        exception: ApiError::new(ErrCode::InternalError, DEAD_CONNECTION_MSG),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_connection_reply_wording() {
        let reply = dead_connection_reply();
        assert_eq!(reply.exception.code, ErrCode::InternalError);
        assert!(reply
            .exception
            .message
            .contains("connection with uitest_daemon is dead"));
    }
}
