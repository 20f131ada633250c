//! Inter-process transaction core of the uiharness toolkit.
//!
//! Carries opaque api-call requests from a test-harness process to the
//! resident daemon and returns replies, while a periodic-handshake watchdog
//! maintains a mutual liveness contract between the two endpoints.

#![deny(clippy::all)]

mod api;
mod client;
mod env;
mod message;
mod server;
mod socket;
mod sync;
mod transceiver;
pub mod transport;

pub use api::ApiCallInfo;
pub use api::ApiError;
pub use api::ApiReplyInfo;
pub use api::ErrCode;
pub use client::ConnectError;
pub use client::TransactionClient;
pub use client::DISCOVERY_TIMEOUT_MS;
pub use env::dispose_transaction_env;
pub use env::setup_transaction_env;
pub use env::transaction_client_func;
pub use message::TransactionMessage;
pub use message::TransactionType;
pub use server::TransactionServer;
pub use server::EXIT_CODE_FAILURE;
pub use server::EXIT_CODE_SUCCESS;
pub use socket::socket_dir;
pub use transceiver::MessageFilter;
pub use transceiver::MessageTransceiver;
pub use transceiver::PollError;
pub use transceiver::WAIT_TRANSACTION_MS;
pub use transceiver::WATCH_DOG_TIMEOUT_MS;
