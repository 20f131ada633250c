use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::api::{ApiCallInfo, ApiError, ApiReplyInfo, ErrCode};
use crate::message::{TransactionMessage, TransactionType};
use crate::sync::lock_or_recover;
use crate::transceiver::{MessageTransceiver, PollError, WAIT_TRANSACTION_MS};
use crate::transport::{Transport, TransportError};

pub const EXIT_CODE_SUCCESS: u32 = 0;
pub const EXIT_CODE_FAILURE: u32 = 1;

type ApiCallHandler = Arc<dyn Fn(&ApiCallInfo, &mut ApiReplyInfo) + Send + Sync>;

/// Daemon-side transaction endpoint: reads calls, runs the injected
/// dispatcher and emits replies, serially.
pub struct TransactionServer<T: Transport> {
    transceiver: Arc<MessageTransceiver<T>>,
    call_handler: Mutex<Option<ApiCallHandler>>,
}

impl<T: Transport> TransactionServer<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transceiver: MessageTransceiver::new(transport),
            call_handler: Mutex::new(None),
        }
    }

    pub fn transceiver(&self) -> &Arc<MessageTransceiver<T>> {
        &self.transceiver
    }

    /// Install the dispatcher that serves each api call.
    pub fn set_call_function(
        &self,
        handler: impl Fn(&ApiCallInfo, &mut ApiReplyInfo) + Send + Sync + 'static,
    ) {
        *lock_or_recover(&self.call_handler) = Some(Arc::new(handler));
    }

    /// Attach and arm the watchdog. The server answers handshakes but never
    /// initiates them, and a carrier that loops our own replies back must
    /// not feed them into the queue.
    pub fn initialize(&self) -> Result<(), TransportError> {
        self.transceiver.initialize()?;
        self.transceiver
            .set_message_filter(Some(Box::new(|kind| kind != TransactionType::Reply)));
        self.transceiver.schedule_check_connection(false);
        Ok(())
    }

    /// Drive dispatch until the peer requests exit (code 0) or the
    /// connection dies (code 1).
    pub fn run_loop(&self) -> u32 {
        loop {
            match self
                .transceiver
                .poll_call_reply(Duration::from_millis(WAIT_TRANSACTION_MS))
            {
                Ok(message) => self.dispatch(&message),
                Err(PollError::WaitTimeout) => continue,
                Err(PollError::RequestExit) => {
                    debug!("exit requested, leaving server loop");
                    return EXIT_CODE_SUCCESS;
                }
                Err(PollError::ConnectionDied) => {
                    error!("connection died, leaving server loop");
                    return EXIT_CODE_FAILURE;
                }
            }
        }
    }

    pub fn finalize(&self) {
        self.transceiver.finalize();
    }

    fn dispatch(&self, request: &TransactionMessage) {
        if request.kind != TransactionType::Call {
            debug!(kind = ?request.kind, "ignoring non-call message");
            return;
        }
        let reply = self.serve(&request.data_parcel);
        let parcel = serde_json::to_string(&reply).unwrap_or_else(|err| {
            warn!(error = %err, "failed to encode api reply");
            encode_fallback_reply(&err)
        });
        self.transceiver.emit_reply(request.id, parcel);
    }

    fn serve(&self, call_parcel: &str) -> ApiReplyInfo {
        let call = match serde_json::from_str::<ApiCallInfo>(call_parcel) {
            Ok(call) => call,
            Err(error) => {
                return ApiReplyInfo::from_error(ApiError::new(
                    ErrCode::InternalError,
                    format!("failed to decode api call: {error}"),
                ));
            }
        };
        let handler = lock_or_recover(&self.call_handler).clone();
        let Some(handler) = handler else {
            return ApiReplyInfo::from_error(ApiError::new(
                ErrCode::InternalError,
                "no call function installed",
            ));
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut reply = ApiReplyInfo::default();
            handler(&call, &mut reply);
            reply
        }));
        match outcome {
            Ok(reply) => reply,
            Err(_) => {
                error!(api = %call.api_id, "api handler panicked");
                ApiReplyInfo::from_error(ApiError::new(
                    ErrCode::InternalError,
                    format!("api handler panicked while serving '{}'", call.api_id),
                ))
            }
        }
    }
}

/// A reply that failed to encode is replaced by a bare internal error, which
/// always encodes.
fn encode_fallback_reply(err: &serde_json::Error) -> String {
    let fallback = ApiReplyInfo::from_error(ApiError::new(
        ErrCode::InternalError,
        format!("failed to encode api reply: {err}"),
    ));
    serde_json::to_string(&fallback).unwrap_or_default()
}
