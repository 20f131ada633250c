use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::message::TransactionMessage;
use crate::socket::{call_socket_path, reply_socket_path, socket_dir};
use crate::sync::lock_or_recover;

use super::{MessageSink, Transport, TransportError};

const MAX_DATAGRAM_BYTES: usize = 64 * 1024;

/// How often the ingress thread re-checks the stop flag while idle.
const INGRESS_POLL: Duration = Duration::from_millis(100);

/// Which side of a client/server pairing this endpoint plays.
///
/// The client emits on the call socket and listens on the reply socket; the
/// server does the reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    Client,
    Server,
}

/// Transaction carrier backed by a pair of unix datagram sockets named after
/// the pairing token.
pub struct UnixDatagramTransport {
    listen_path: PathBuf,
    emit_path: PathBuf,
    sender: UnixDatagram,
    stop: Arc<AtomicBool>,
    ingress: Mutex<Option<JoinHandle<()>>>,
}

impl UnixDatagramTransport {
    /// Build a transport under the configured socket directory
    /// (`UIHARNESS_SOCKET_DIR` or the system temp dir).
    pub fn new(token: &str, role: EndpointRole) -> std::io::Result<Self> {
        Self::with_socket_dir(token, role, &socket_dir())
    }

    pub fn with_socket_dir(
        token: &str,
        role: EndpointRole,
        dir: &Path,
    ) -> std::io::Result<Self> {
        let call = call_socket_path(dir, token);
        let reply = reply_socket_path(dir, token);
        let (listen_path, emit_path) = match role {
            EndpointRole::Client => (reply, call),
            EndpointRole::Server => (call, reply),
        };
        Ok(Self {
            listen_path,
            emit_path,
            sender: UnixDatagram::unbound()?,
            stop: Arc::new(AtomicBool::new(false)),
            ingress: Mutex::new(None),
        })
    }
}

impl Transport for UnixDatagramTransport {
    fn subscribe(&self, sink: MessageSink) -> Result<(), TransportError> {
        let mut ingress = lock_or_recover(&self.ingress);
        if ingress.is_some() {
            return Err(TransportError::AlreadySubscribed);
        }

        // A previous endpoint of the same pairing may have died without
        // cleaning up; rebind over its socket.
        if self.listen_path.exists() {
            std::fs::remove_file(&self.listen_path)?;
        }
        let socket = UnixDatagram::bind(&self.listen_path)?;
        socket.set_read_timeout(Some(INGRESS_POLL))?;

        self.stop.store(false, Ordering::SeqCst);
        let stop = Arc::clone(&self.stop);
        let listen_path = self.listen_path.clone();
        let handle = thread::Builder::new()
            .name("transport-ingress".to_string())
            .spawn(move || {
                let mut buf = vec![0_u8; MAX_DATAGRAM_BYTES];
                while !stop.load(Ordering::SeqCst) {
                    let len = match socket.recv(&mut buf) {
                        Ok(len) => len,
                        Err(err)
                            if err.kind() == std::io::ErrorKind::WouldBlock
                                || err.kind() == std::io::ErrorKind::TimedOut =>
                        {
                            continue;
                        }
                        Err(err) => {
                            if !stop.load(Ordering::SeqCst) {
                                warn!(error = %err, socket = %listen_path.display(), "ingress receive failed");
                            }
                            continue;
                        }
                    };
                    match serde_json::from_slice::<TransactionMessage>(&buf[..len]) {
                        Ok(message) => sink(message),
                        Err(err) => {
                            warn!(error = %err, "dropping undecodable datagram");
                        }
                    }
                }
            })
            .map_err(TransportError::Io)?;

        *ingress = Some(handle);
        Ok(())
    }

    fn emit(&self, message: &TransactionMessage) -> Result<(), TransportError> {
        let payload =
            serde_json::to_vec(message).map_err(|err| TransportError::Parse(err.to_string()))?;
        if payload.len() > MAX_DATAGRAM_BYTES {
            return Err(TransportError::SizeLimit {
                max_bytes: MAX_DATAGRAM_BYTES,
            });
        }
        self.sender.send_to(&payload, &self.emit_path)?;
        Ok(())
    }

    fn unsubscribe(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let handle = lock_or_recover(&self.ingress).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("ingress thread panicked before detach");
            }
            if let Err(err) = std::fs::remove_file(&self.listen_path) {
                debug!(error = %err, socket = %self.listen_path.display(), "stale listen socket not removed");
            }
        }
    }
}

impl Drop for UnixDatagramTransport {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn pair(dir: &Path) -> (UnixDatagramTransport, UnixDatagramTransport) {
        let client =
            UnixDatagramTransport::with_socket_dir("t1", EndpointRole::Client, dir).unwrap();
        let server =
            UnixDatagramTransport::with_socket_dir("t1", EndpointRole::Server, dir).unwrap();
        (client, server)
    }

    #[test]
    fn test_call_crosses_to_server_and_reply_returns() {
        let dir = tempfile::tempdir().unwrap();
        let (client, server) = pair(dir.path());

        let (server_tx, server_rx) = mpsc::channel();
        server
            .subscribe(Box::new(move |message| {
                let _ = server_tx.send(message);
            }))
            .unwrap();
        let (client_tx, client_rx) = mpsc::channel();
        client
            .subscribe(Box::new(move |message| {
                let _ = client_tx.send(message);
            }))
            .unwrap();

        client
            .emit(&TransactionMessage::call(1, "call-parcel"))
            .unwrap();
        let received = server_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received, TransactionMessage::call(1, "call-parcel"));

        server
            .emit(&TransactionMessage::reply_to(received.id, "reply-parcel"))
            .unwrap();
        let reply = client_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(reply, TransactionMessage::reply_to(1, "reply-parcel"));
    }

    #[test]
    fn test_second_subscribe_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let transport =
            UnixDatagramTransport::with_socket_dir("t2", EndpointRole::Server, dir.path()).unwrap();
        transport.subscribe(Box::new(|_| {})).unwrap();
        assert!(matches!(
            transport.subscribe(Box::new(|_| {})),
            Err(TransportError::AlreadySubscribed)
        ));
    }

    #[test]
    fn test_emit_without_bound_peer_fails() {
        let dir = tempfile::tempdir().unwrap();
        let transport =
            UnixDatagramTransport::with_socket_dir("t3", EndpointRole::Client, dir.path()).unwrap();
        let result = transport.emit(&TransactionMessage::handshake(1));
        assert!(matches!(result, Err(TransportError::Io(_))));
    }

    #[test]
    fn test_oversized_message_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let transport =
            UnixDatagramTransport::with_socket_dir("t4", EndpointRole::Client, dir.path()).unwrap();
        let message = TransactionMessage::call(1, "x".repeat(MAX_DATAGRAM_BYTES + 1));
        assert!(matches!(
            transport.emit(&message),
            Err(TransportError::SizeLimit { .. })
        ));
    }

    #[test]
    fn test_unsubscribe_removes_listen_socket_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let transport =
            UnixDatagramTransport::with_socket_dir("t5", EndpointRole::Server, dir.path()).unwrap();
        transport.subscribe(Box::new(|_| {})).unwrap();
        let listen = call_socket_path(dir.path(), "t5");
        assert!(listen.exists());
        transport.unsubscribe();
        assert!(!listen.exists());
        transport.unsubscribe();
    }
}
