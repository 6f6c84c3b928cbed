//! Cross-process "please release your lock" signaling.
//!
//! Every process that holds a contended lock listens on one loopback UDP port. A process that
//! wants the lock reads the owner's port from the lock's owner file and sends it a ping naming
//! the lock. The owner's registered callback decides when to let go.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::Result;

pub const PROTOCOL_VERSION: u8 = 1;
const MESSAGE_LEN: usize = 9;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub type ContendedAction = Arc<dyn Fn() + Send + Sync>;

/// Encodes a release request for `lock_id`.
pub fn encode_ping(lock_id: i64) -> [u8; MESSAGE_LEN] {
    let mut out = [0u8; MESSAGE_LEN];
    out[0] = PROTOCOL_VERSION;
    out[1..].copy_from_slice(&lock_id.to_be_bytes());
    out
}

/// Decodes a datagram; anything other than a well-formed current-version request is `None`.
pub fn decode_ping(bytes: &[u8]) -> Option<i64> {
    if bytes.len() != MESSAGE_LEN || bytes[0] != PROTOCOL_VERSION {
        return None;
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&bytes[1..]);
    Some(i64::from_be_bytes(id))
}

type Actions = Arc<Mutex<HashMap<i64, ContendedAction>>>;

struct Listener {
    port: u16,
    client: UdpSocket,
}

/// Receives release requests for the locks this process holds.
///
/// The listening socket and its thread are created on first use and live until the handler is
/// dropped.
pub struct ContentionHandler {
    actions: Actions,
    listener: Mutex<Option<Listener>>,
    stopped: Arc<AtomicBool>,
}

impl ContentionHandler {
    pub fn new() -> Self {
        Self {
            actions: Arc::new(Mutex::new(HashMap::new())),
            listener: Mutex::new(None),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The handler shared by every lock manager in this process.
    pub fn shared() -> Arc<ContentionHandler> {
        static SHARED: OnceLock<Arc<ContentionHandler>> = OnceLock::new();
        SHARED
            .get_or_init(|| Arc::new(ContentionHandler::new()))
            .clone()
    }

    /// Port on which this process listens, binding it if needed.
    pub fn reserve_port(&self) -> Result<u16> {
        let mut listener = self.listener.lock();
        if let Some(listener) = listener.as_ref() {
            return Ok(listener.port);
        }
        let started = self.spawn_listener()?;
        let port = started.port;
        *listener = Some(started);
        Ok(port)
    }

    /// Invokes `action` whenever another process asks for `lock_id`.
    pub fn start(&self, lock_id: i64, action: ContendedAction) -> Result<()> {
        self.reserve_port()?;
        self.actions.lock().insert(lock_id, action);
        Ok(())
    }

    pub fn stop(&self, lock_id: i64) {
        self.actions.lock().remove(&lock_id);
    }

    pub fn is_registered(&self, lock_id: i64) -> bool {
        self.actions.lock().contains_key(&lock_id)
    }

    /// Asks the process listening on `port` to release `lock_id`.
    ///
    /// Returns whether the request was sent. An owner that has exited is not an error: the
    /// caller keeps contending normally.
    pub fn ping_owner(&self, port: u16, lock_id: i64, display_name: &str) -> bool {
        let sent = self.client().and_then(|client| {
            client.send_to(
                &encode_ping(lock_id),
                SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            )
        });
        match sent {
            Ok(_) => {
                tracing::debug!(
                    target = "brisk.cache.lock",
                    lock = display_name,
                    port,
                    lock_id,
                    "asked lock owner to release"
                );
                true
            }
            Err(err) => {
                tracing::debug!(
                    target = "brisk.cache.lock",
                    lock = display_name,
                    port,
                    lock_id,
                    error = %err,
                    "failed to ping lock owner"
                );
                false
            }
        }
    }

    fn client(&self) -> io::Result<UdpSocket> {
        match self.listener.lock().as_ref() {
            Some(listener) => listener.client.try_clone(),
            None => UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)),
        }
    }

    fn spawn_listener(&self) -> Result<Listener> {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let port = socket.local_addr()?.port();
        let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;

        let actions = self.actions.clone();
        let stopped = self.stopped.clone();
        thread::Builder::new()
            .name("brisk-lock-contention".to_string())
            .spawn(move || listen(socket, actions, stopped))?;

        tracing::debug!(
            target = "brisk.cache.lock",
            port,
            "listening for lock release requests"
        );
        Ok(Listener { port, client })
    }
}

impl Default for ContentionHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ContentionHandler {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for ContentionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentionHandler")
            .field("port", &self.listener.lock().as_ref().map(|l| l.port))
            .field("registered", &self.actions.lock().len())
            .finish()
    }
}

fn listen(socket: UdpSocket, actions: Actions, stopped: Arc<AtomicBool>) {
    let mut buf = [0u8; 64];
    while !stopped.load(Ordering::SeqCst) {
        let len = match socket.recv_from(&mut buf) {
            Ok((len, _)) => len,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                continue
            }
            Err(err) => {
                tracing::debug!(
                    target = "brisk.cache.lock",
                    error = %err,
                    "lock contention listener failed"
                );
                return;
            }
        };
        let Some(lock_id) = decode_ping(&buf[..len]) else {
            tracing::debug!(
                target = "brisk.cache.lock",
                len,
                "ignoring malformed lock release request"
            );
            continue;
        };
        // Invoke outside the map lock: the action may stop its own registration.
        let action = actions.lock().get(&lock_id).cloned();
        match action {
            Some(action) => action(),
            None => tracing::trace!(
                target = "brisk.cache.lock",
                lock_id,
                "release requested for a lock that is not held"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn messages_carry_only_the_lock_id() {
        let bytes = encode_ping(-42);
        assert_eq!(bytes.len(), 9);
        assert_eq!(decode_ping(&bytes), Some(-42));
        assert_eq!(decode_ping(&bytes[..8]), None);
        let mut wrong_version = bytes;
        wrong_version[0] = 2;
        assert_eq!(decode_ping(&wrong_version), None);
    }

    #[test]
    fn pings_invoke_the_registered_action() {
        let handler = ContentionHandler::new();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        handler
            .start(
                7,
                Arc::new(move || {
                    let _ = tx.lock().send(());
                }),
            )
            .unwrap();
        let port = handler.reserve_port().unwrap();

        let requester = ContentionHandler::new();
        assert!(requester.ping_owner(port, 7, "test cache"));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        handler.stop(7);
        assert!(!handler.is_registered(7));
    }

    #[test]
    fn pinging_a_dead_owner_is_not_an_error() {
        let port = {
            let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
            socket.local_addr().unwrap().port()
        };
        let requester = ContentionHandler::new();
        // Sending succeeds or fails quietly; either way nothing panics or blocks.
        let _ = requester.ping_owner(port, 1, "gone");
    }
}
