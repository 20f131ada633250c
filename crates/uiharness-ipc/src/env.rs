//! Process-global transaction client, for hosts that load the harness as a
//! library and cannot thread a handle through their call sites.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::error;

use crate::api::{ApiCallInfo, ApiError, ApiReplyInfo, ErrCode};
use crate::client::TransactionClient;
use crate::sync::lock_or_recover;
use crate::transport::{EndpointRole, UnixDatagramTransport};

static SETUP_CALLED: AtomicBool = AtomicBool::new(false);
static CLIENT: Mutex<Option<Arc<TransactionClient<UnixDatagramTransport>>>> = Mutex::new(None);

/// Build and connect the process-wide client for the given pairing token.
///
/// Idempotent: later calls are no-ops reporting `true`. Returns `false` when
/// the transport cannot be attached or the daemon is not discovered; the
/// slot is still marked configured so the host's teardown stays balanced.
pub fn setup_transaction_env(token: &str) -> bool {
    let mut slot = lock_or_recover(&CLIENT);
    if SETUP_CALLED.load(Ordering::SeqCst) {
        return true;
    }
    let connected = match UnixDatagramTransport::new(token, EndpointRole::Client) {
        Ok(transport) => {
            let client = Arc::new(TransactionClient::new(transport));
            let connected = match client.initialize() {
                Ok(()) => true,
                Err(err) => {
                    error!(error = %err, "transaction env setup failed");
                    // Latch the dead state so later invocations fail fast
                    // instead of polling an unarmed channel.
                    client.finalize();
                    false
                }
            };
            *slot = Some(client);
            connected
        }
        Err(err) => {
            error!(error = %err, "transaction transport setup failed");
            false
        }
    };
    SETUP_CALLED.store(true, Ordering::SeqCst);
    connected
}

/// Invoke an api through the process-wide client.
pub fn transaction_client_func(call: &ApiCallInfo, reply: &mut ApiReplyInfo) {
    // Clone the handle out of the slot; holding the slot lock across the
    // invocation would serialize callers and mask the single-flight error.
    let client = lock_or_recover(&CLIENT).clone();
    match client {
        Some(client) => client.invoke_api(call, reply),
        None => {
            *reply = ApiReplyInfo::from_error(ApiError::new(
                ErrCode::InternalError,
                "connection with uitest_daemon is dead (transaction env not set up)",
            ));
        }
    }
}

/// Tear the process-wide client down. No-op when setup has not run.
pub fn dispose_transaction_env() {
    let client = {
        let mut slot = lock_or_recover(&CLIENT);
        if !SETUP_CALLED.load(Ordering::SeqCst) {
            return;
        }
        SETUP_CALLED.store(false, Ordering::SeqCst);
        slot.take()
    };
    if let Some(client) = client {
        client.finalize();
    }
}
