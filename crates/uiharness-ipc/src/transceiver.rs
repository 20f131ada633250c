use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::message::{TransactionMessage, TransactionType};
use crate::sync::{lock_or_recover, wait_timeout_or_recover};
use crate::transport::{Transport, TransportError};

/// Silent-peer death threshold.
pub const WATCH_DOG_TIMEOUT_MS: u64 = 2000;

/// Internal poll slice used by the client invoker and the server loop.
pub const WAIT_TRANSACTION_MS: u64 = WATCH_DOG_TIMEOUT_MS / 100;

/// The watchdog re-checks its deadlines at least this often.
const WATCH_DOG_CHECK_SLICE_MS: u64 = WATCH_DOG_TIMEOUT_MS / 10;

/// Ingress predicate; messages whose kind returns `false` are dropped before
/// any other processing, including handshake auto-ack and exit latching.
pub type MessageFilter = Box<dyn Fn(TransactionType) -> bool + Send>;

/// Why a poll ended without a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PollError {
    #[error("no call or reply arrived within the wait window")]
    WaitTimeout,

    #[error("connection with the peer is dead")]
    ConnectionDied,

    #[error("exit was requested")]
    RequestExit,
}

struct TransceiverState {
    queue: VecDeque<TransactionMessage>,
    filter: Option<MessageFilter>,
    connect_died: bool,
    request_exit: bool,
    finalized: bool,
}

/// Bidirectional transaction endpoint: inbound queue, emitter and watchdog
/// over an abstract carrier.
///
/// Shared between the owner, the carrier's ingress thread and the watchdog
/// thread, so it is used through an [`Arc`].
pub struct MessageTransceiver<T: Transport> {
    transport: T,
    state: Mutex<TransceiverState>,
    cond: Condvar,
    auto_handshake: AtomicBool,
    last_incoming_ms: AtomicU64,
    last_outgoing_ms: AtomicU64,
    ingress_seq: AtomicU64,
    next_id: AtomicU32,
    epoch: Instant,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    // Handed to the carrier subscription and the watchdog thread; neither
    // keeps the transceiver alive on its own.
    weak_self: Weak<Self>,
}

impl<T: Transport> MessageTransceiver<T> {
    pub fn new(transport: T) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            transport,
            state: Mutex::new(TransceiverState {
                queue: VecDeque::new(),
                filter: None,
                connect_died: false,
                request_exit: false,
                finalized: false,
            }),
            cond: Condvar::new(),
            auto_handshake: AtomicBool::new(false),
            last_incoming_ms: AtomicU64::new(0),
            last_outgoing_ms: AtomicU64::new(0),
            ingress_seq: AtomicU64::new(0),
            next_id: AtomicU32::new(1),
            epoch: Instant::now(),
            watchdog: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Attach to the carrier so inbound messages start flowing into
    /// [`Self::on_receive_message`].
    pub fn initialize(&self) -> Result<(), TransportError> {
        let weak = self.weak_self.clone();
        self.transport.subscribe(Box::new(move |message| {
            if let Some(transceiver) = weak.upgrade() {
                transceiver.on_receive_message(message);
            }
        }))
    }

    /// Ingress sink. Called by the carrier's delivery thread in production;
    /// tests inject messages here directly.
    pub fn on_receive_message(&self, message: TransactionMessage) {
        self.last_incoming_ms.store(self.now_ms(), Ordering::Relaxed);
        self.ingress_seq.fetch_add(1, Ordering::Relaxed);

        let mut ack_id = None;
        {
            let mut state = lock_or_recover(&self.state);
            let accepted = match &state.filter {
                Some(filter) => filter(message.kind),
                None => true,
            };
            if accepted {
                match message.kind {
                    TransactionType::Exit => {
                        debug!("peer requested exit");
                        state.request_exit = true;
                    }
                    TransactionType::Handshake => ack_id = Some(message.id),
                    TransactionType::Ack => {}
                    TransactionType::Call | TransactionType::Reply => {
                        state.queue.push_back(message);
                    }
                    TransactionType::Invalid => {
                        warn!("dropping message with invalid kind");
                    }
                }
            }
        }
        // Every arrival is announced: pollers watch the queue and flags,
        // discovery watches the ingress counter.
        self.cond.notify_all();
        if let Some(id) = ack_id {
            self.emit_message(TransactionMessage::ack_to(id));
        }
    }

    /// Emit a call with a freshly allocated id; returns that id.
    pub fn emit_call(&self, data_parcel: impl Into<String>) -> u32 {
        let id = self.allocate_id();
        self.emit_message(TransactionMessage::call(id, data_parcel));
        id
    }

    /// Emit a reply echoing the id of the call it answers.
    pub fn emit_reply(&self, request_id: u32, data_parcel: impl Into<String>) {
        self.emit_message(TransactionMessage::reply_to(request_id, data_parcel));
    }

    pub fn emit_handshake(&self) {
        let id = self.allocate_id();
        self.emit_message(TransactionMessage::handshake(id));
    }

    /// Emit an ack echoing the id of the given handshake.
    pub fn emit_ack(&self, handshake: &TransactionMessage) {
        self.emit_message(TransactionMessage::ack_to(handshake.id));
    }

    pub fn emit_exit(&self) {
        let id = self.allocate_id();
        self.emit_message(TransactionMessage::exit(id));
    }

    /// Install or clear the ingress filter.
    pub fn set_message_filter(&self, filter: Option<MessageFilter>) {
        lock_or_recover(&self.state).filter = filter;
    }

    /// Wait up to `timeout` for the next call-or-reply message.
    ///
    /// Exit requests win over queued messages, which win over a dead
    /// connection; a timeout is reported only when none of those fired
    /// before the deadline.
    pub fn poll_call_reply(&self, timeout: Duration) -> Result<TransactionMessage, PollError> {
        let deadline = Instant::now() + timeout;
        let mut state = lock_or_recover(&self.state);
        loop {
            if state.request_exit {
                return Err(PollError::RequestExit);
            }
            if let Some(message) = state.queue.pop_front() {
                return Ok(message);
            }
            if state.connect_died {
                return Err(PollError::ConnectionDied);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(PollError::WaitTimeout);
            }
            let (guard, _) = wait_timeout_or_recover(&self.cond, state, deadline - now);
            state = guard;
        }
    }

    /// Emit one handshake and wait for any sign of life from the peer.
    ///
    /// Any inbound message proves the peer is alive; it need not be the
    /// matching ack.
    pub fn discover_peer(&self, timeout: Duration) -> bool {
        let baseline = self.ingress_seq.load(Ordering::Relaxed);
        self.emit_handshake();
        let deadline = Instant::now() + timeout;
        let mut state = lock_or_recover(&self.state);
        loop {
            if self.ingress_seq.load(Ordering::Relaxed) != baseline {
                return true;
            }
            if state.request_exit {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = wait_timeout_or_recover(&self.cond, state, deadline - now);
            state = guard;
        }
    }

    /// Start the liveness watchdog.
    ///
    /// With `auto_handshake` the watchdog also keeps the link warm by
    /// emitting a handshake whenever half the death window has passed with
    /// no outbound traffic.
    pub fn schedule_check_connection(&self, auto_handshake: bool) {
        self.auto_handshake.store(auto_handshake, Ordering::Relaxed);
        let mut watchdog = lock_or_recover(&self.watchdog);
        if watchdog.is_some() {
            debug!("watchdog already scheduled");
            return;
        }
        // The silence window opens now, not at construction time.
        self.last_incoming_ms.store(self.now_ms(), Ordering::Relaxed);
        let weak = self.weak_self.clone();
        let handle = thread::Builder::new()
            .name("watchdog".to_string())
            .spawn(move || Self::run_watchdog(weak));
        match handle {
            Ok(handle) => *watchdog = Some(handle),
            Err(err) => warn!(error = %err, "failed to spawn watchdog thread"),
        }
    }

    fn run_watchdog(weak: Weak<Self>) {
        loop {
            let Some(transceiver) = weak.upgrade() else {
                return;
            };
            let now = transceiver.now_ms();
            let last_incoming = transceiver.last_incoming_ms.load(Ordering::Relaxed);
            let silent_ms = now.saturating_sub(last_incoming);
            if silent_ms > WATCH_DOG_TIMEOUT_MS {
                warn!(silent_ms, "peer went silent, declaring connection dead");
                {
                    let mut state = lock_or_recover(&transceiver.state);
                    state.connect_died = true;
                }
                transceiver.cond.notify_all();
                return;
            }

            // Sleep toward the nearest deadline, but never longer than the
            // check slice.
            let mut wait_ms = (last_incoming + WATCH_DOG_TIMEOUT_MS + 1).saturating_sub(now);
            if transceiver.auto_handshake.load(Ordering::Relaxed) {
                let half_window = WATCH_DOG_TIMEOUT_MS / 2;
                let quiet_ms =
                    now.saturating_sub(transceiver.last_outgoing_ms.load(Ordering::Relaxed));
                if quiet_ms > half_window {
                    transceiver.emit_handshake();
                }
                let last_outgoing = transceiver.last_outgoing_ms.load(Ordering::Relaxed);
                wait_ms = wait_ms.min((last_outgoing + half_window + 1).saturating_sub(now));
            }
            wait_ms = wait_ms.clamp(1, WATCH_DOG_CHECK_SLICE_MS);

            let state = lock_or_recover(&transceiver.state);
            if state.request_exit || state.connect_died {
                return;
            }
            let (state, _) = wait_timeout_or_recover(
                &transceiver.cond,
                state,
                Duration::from_millis(wait_ms),
            );
            if state.request_exit || state.connect_died {
                return;
            }
        }
    }

    /// Signal termination, best-effort emit an exit toward the peer, stop
    /// the watchdog and detach from the carrier. Idempotent; all current
    /// and future polls return [`PollError::RequestExit`] afterwards.
    pub fn finalize(&self) {
        {
            let mut state = lock_or_recover(&self.state);
            if state.finalized {
                return;
            }
            state.finalized = true;
            state.request_exit = true;
        }
        self.cond.notify_all();
        self.emit_exit();
        let watchdog = lock_or_recover(&self.watchdog).take();
        if let Some(handle) = watchdog {
            if handle.join().is_err() {
                warn!("watchdog thread panicked before finalize");
            }
        }
        self.transport.unsubscribe();
    }

    fn allocate_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn emit_message(&self, message: TransactionMessage) {
        self.last_outgoing_ms.store(self.now_ms(), Ordering::Relaxed);
        if let Err(error) = self.transport.emit(&message) {
            // Routine before the peer attaches; the watchdog is the
            // authority on whether the link is actually dead.
            debug!(%error, kind = ?message.kind, "message emission failed");
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;

    const POLL_TIMEOUT: Duration = Duration::from_millis(20);
    /// Generous scheduling slack so the suite stays green on loaded runners.
    const SHORT_TOLERANCE: Duration = Duration::from_millis(60);
    const WATCH_DOG_TOLERANCE: Duration = Duration::from_millis(400);

    fn sniffing_transceiver() -> (
        Arc<MessageTransceiver<LoopbackTransport>>,
        Arc<Mutex<Vec<TransactionMessage>>>,
    ) {
        let transceiver = MessageTransceiver::new(LoopbackTransport::new());
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let sniffer = Arc::clone(&emitted);
        transceiver
            .transport()
            .set_emitter(move |message| sniffer.lock().unwrap().push(message));
        (transceiver, emitted)
    }

    fn last_emitted(emitted: &Mutex<Vec<TransactionMessage>>) -> TransactionMessage {
        emitted.lock().unwrap().last().cloned().expect("no message emitted")
    }

    #[test]
    fn test_emitted_message_content() {
        let (transceiver, emitted) = sniffing_transceiver();

        transceiver.emit_call("call");
        let call = last_emitted(&emitted);
        assert_eq!(call.kind, TransactionType::Call);
        assert_eq!(call.data_parcel, "call");

        transceiver.emit_reply(1234, "reply");
        let reply = last_emitted(&emitted);
        assert_eq!(reply.kind, TransactionType::Reply);
        assert_eq!(reply.id, 1234);
        assert_eq!(reply.data_parcel, "reply");

        transceiver.emit_handshake();
        assert_eq!(last_emitted(&emitted).kind, TransactionType::Handshake);

        transceiver.emit_ack(&TransactionMessage::handshake(5678));
        let ack = last_emitted(&emitted);
        assert_eq!(ack.kind, TransactionType::Ack);
        assert_eq!(ack.id, 5678);

        transceiver.emit_exit();
        assert_eq!(last_emitted(&emitted).kind, TransactionType::Exit);
    }

    #[test]
    fn test_call_ids_increase_monotonically() {
        let (transceiver, emitted) = sniffing_transceiver();
        let first = transceiver.emit_call("a");
        let second = transceiver.emit_call("b");
        assert!(second > first);
        let emitted = emitted.lock().unwrap();
        assert_eq!(emitted[0].id, first);
        assert_eq!(emitted[1].id, second);
    }

    #[test]
    fn test_poll_times_out_on_empty_queue() {
        let (transceiver, _) = sniffing_transceiver();
        let start = Instant::now();
        let status = transceiver.poll_call_reply(POLL_TIMEOUT);
        let elapsed = start.elapsed();
        assert_eq!(status, Err(PollError::WaitTimeout));
        assert!(elapsed >= POLL_TIMEOUT, "poll returned early: {elapsed:?}");
        assert!(
            elapsed <= POLL_TIMEOUT + SHORT_TOLERANCE,
            "poll overran: {elapsed:?}"
        );
    }

    #[test]
    fn test_poll_returns_queued_message_immediately() {
        let (transceiver, _) = sniffing_transceiver();
        transceiver.on_receive_message(TransactionMessage::call(1234, "payload"));
        let start = Instant::now();
        let message = transceiver.poll_call_reply(POLL_TIMEOUT).unwrap();
        assert!(start.elapsed() < SHORT_TOLERANCE);
        assert_eq!(message.id, 1234);
    }

    #[test]
    fn test_poll_wakes_when_message_arrives_mid_wait() {
        let (transceiver, _) = sniffing_transceiver();
        let injector = Arc::clone(&transceiver);
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            injector.on_receive_message(TransactionMessage::reply_to(9, "late"));
        });
        let start = Instant::now();
        let message = transceiver.poll_call_reply(Duration::from_millis(200)).unwrap();
        let elapsed = start.elapsed();
        worker.join().unwrap();
        assert_eq!(message.data_parcel, "late");
        assert!(elapsed >= Duration::from_millis(10));
        assert!(elapsed < Duration::from_millis(10) + SHORT_TOLERANCE);
    }

    #[test]
    fn test_messages_dequeue_in_arrival_order() {
        let (transceiver, _) = sniffing_transceiver();
        transceiver.on_receive_message(TransactionMessage::call(1, "first"));
        transceiver.on_receive_message(TransactionMessage::call(2, "second"));
        assert_eq!(transceiver.poll_call_reply(POLL_TIMEOUT).unwrap().id, 1);
        assert_eq!(transceiver.poll_call_reply(POLL_TIMEOUT).unwrap().id, 2);
    }

    #[test]
    fn test_filter_drops_rejected_kinds() {
        let (transceiver, _) = sniffing_transceiver();
        // Without a filter the call is accepted.
        transceiver.on_receive_message(TransactionMessage::call(1, ""));
        assert!(transceiver.poll_call_reply(POLL_TIMEOUT).is_ok());

        transceiver.set_message_filter(Some(Box::new(|kind| kind != TransactionType::Call)));
        transceiver.on_receive_message(TransactionMessage::call(2, ""));
        assert_eq!(
            transceiver.poll_call_reply(POLL_TIMEOUT),
            Err(PollError::WaitTimeout)
        );
    }

    #[test]
    fn test_filter_runs_before_handshake_auto_ack() {
        let (transceiver, emitted) = sniffing_transceiver();
        transceiver.set_message_filter(Some(Box::new(|kind| {
            kind != TransactionType::Handshake
        })));
        transceiver.on_receive_message(TransactionMessage::handshake(42));
        assert!(emitted.lock().unwrap().is_empty());
    }

    #[test]
    fn test_handshake_is_acked_with_matching_id() {
        let (transceiver, emitted) = sniffing_transceiver();
        transceiver.on_receive_message(TransactionMessage::handshake(1234));
        let ack = last_emitted(&emitted);
        assert_eq!(ack.kind, TransactionType::Ack);
        assert_eq!(ack.id, 1234);
    }

    #[test]
    fn test_poll_never_yields_control_messages() {
        let (transceiver, _) = sniffing_transceiver();
        transceiver.on_receive_message(TransactionMessage::handshake(1));
        transceiver.on_receive_message(TransactionMessage::ack_to(2));
        transceiver.on_receive_message(TransactionMessage::call(3, "real"));
        let message = transceiver.poll_call_reply(POLL_TIMEOUT).unwrap();
        assert_eq!(message.kind, TransactionType::Call);
        assert_eq!(
            transceiver.poll_call_reply(POLL_TIMEOUT),
            Err(PollError::WaitTimeout)
        );
    }

    #[test]
    fn test_exit_short_circuits_poll() {
        let (transceiver, _) = sniffing_transceiver();
        let injector = Arc::clone(&transceiver);
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            injector.on_receive_message(TransactionMessage::exit(1));
        });
        let start = Instant::now();
        let status = transceiver.poll_call_reply(Duration::from_millis(200));
        let elapsed = start.elapsed();
        worker.join().unwrap();
        assert_eq!(status, Err(PollError::RequestExit));
        assert!(elapsed >= Duration::from_millis(10));
        assert!(elapsed < Duration::from_millis(10) + SHORT_TOLERANCE);
    }

    #[test]
    fn test_exit_wins_over_queued_messages() {
        let (transceiver, _) = sniffing_transceiver();
        transceiver.on_receive_message(TransactionMessage::call(1, "queued"));
        transceiver.on_receive_message(TransactionMessage::exit(2));
        assert_eq!(
            transceiver.poll_call_reply(POLL_TIMEOUT),
            Err(PollError::RequestExit)
        );
    }

    #[test]
    fn test_watchdog_declares_death_after_silence() {
        let (transceiver, _) = sniffing_transceiver();
        transceiver.schedule_check_connection(false);
        let start = Instant::now();
        let status =
            transceiver.poll_call_reply(Duration::from_millis(WATCH_DOG_TIMEOUT_MS * 2));
        let elapsed = start.elapsed();
        assert_eq!(status, Err(PollError::ConnectionDied));
        assert!(elapsed >= Duration::from_millis(WATCH_DOG_TIMEOUT_MS));
        assert!(elapsed <= Duration::from_millis(WATCH_DOG_TIMEOUT_MS) + WATCH_DOG_TOLERANCE);
    }

    #[test]
    fn test_inbound_handshake_postpones_death() {
        let (transceiver, _) = sniffing_transceiver();
        transceiver.schedule_check_connection(false);
        const HANDSHAKE_DELAY: Duration = Duration::from_millis(300);
        let injector = Arc::clone(&transceiver);
        let worker = thread::spawn(move || {
            thread::sleep(HANDSHAKE_DELAY);
            injector.on_receive_message(TransactionMessage::handshake(1));
        });
        let start = Instant::now();
        let status =
            transceiver.poll_call_reply(Duration::from_millis(WATCH_DOG_TIMEOUT_MS * 2));
        let elapsed = start.elapsed();
        worker.join().unwrap();
        assert_eq!(status, Err(PollError::ConnectionDied));
        let expected = HANDSHAKE_DELAY + Duration::from_millis(WATCH_DOG_TIMEOUT_MS);
        assert!(elapsed >= expected - Duration::from_millis(20));
        assert!(elapsed <= expected + WATCH_DOG_TOLERANCE);
    }

    #[test]
    fn test_poll_aborts_immediately_once_connection_died() {
        let (transceiver, _) = sniffing_transceiver();
        transceiver.schedule_check_connection(false);
        assert_eq!(
            transceiver.poll_call_reply(Duration::from_millis(WATCH_DOG_TIMEOUT_MS * 2)),
            Err(PollError::ConnectionDied)
        );
        let start = Instant::now();
        assert_eq!(
            transceiver.poll_call_reply(Duration::from_millis(WATCH_DOG_TIMEOUT_MS)),
            Err(PollError::ConnectionDied)
        );
        assert!(start.elapsed() < SHORT_TOLERANCE);
    }

    #[test]
    fn test_watchdog_keeps_link_warm_with_handshakes() {
        let (transceiver, emitted) = sniffing_transceiver();
        transceiver.schedule_check_connection(true);
        thread::sleep(Duration::from_millis(WATCH_DOG_TIMEOUT_MS / 2 + 400));
        let handshakes = emitted
            .lock()
            .unwrap()
            .iter()
            .filter(|message| message.kind == TransactionType::Handshake)
            .count();
        assert!(handshakes >= 1, "watchdog never emitted a handshake");
        transceiver.finalize();
    }

    #[test]
    fn test_discover_peer_times_out_without_traffic() {
        let (transceiver, emitted) = sniffing_transceiver();
        let timeout = Duration::from_millis(100);
        let start = Instant::now();
        assert!(!transceiver.discover_peer(timeout));
        assert!(start.elapsed() >= timeout);
        // Discovery opens with exactly one handshake.
        assert_eq!(last_emitted(&emitted).kind, TransactionType::Handshake);
    }

    #[test]
    fn test_discover_peer_accepts_any_inbound_traffic() {
        let (transceiver, _) = sniffing_transceiver();
        let injector = Arc::clone(&transceiver);
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(60));
            injector.on_receive_message(TransactionMessage::ack_to(1));
        });
        let start = Instant::now();
        assert!(transceiver.discover_peer(Duration::from_millis(500)));
        let elapsed = start.elapsed();
        worker.join().unwrap();
        assert!(elapsed >= Duration::from_millis(60));
        assert!(elapsed < Duration::from_millis(60) + SHORT_TOLERANCE);
    }

    #[test]
    fn test_finalize_emits_exit_and_aborts_polls() {
        let (transceiver, emitted) = sniffing_transceiver();
        transceiver.finalize();
        assert_eq!(last_emitted(&emitted).kind, TransactionType::Exit);
        assert_eq!(
            transceiver.poll_call_reply(POLL_TIMEOUT),
            Err(PollError::RequestExit)
        );
        // Idempotent: a second finalize neither blocks nor re-emits.
        let before = emitted.lock().unwrap().len();
        transceiver.finalize();
        assert_eq!(emitted.lock().unwrap().len(), before);
    }

    #[test]
    fn test_finalize_stops_scheduled_watchdog() {
        let (transceiver, _) = sniffing_transceiver();
        transceiver.schedule_check_connection(true);
        transceiver.finalize();
        assert!(lock_or_recover(&transceiver.watchdog).is_none());
    }
}
