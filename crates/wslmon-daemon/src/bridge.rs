//! Dual-role IPC bridge.
//!
//! Each side runs two workers over different transports:
//!
//! - the **inbound listener** (server role) accepts one peer at a time,
//!   performs the server handshake, reads frames in a loop, tags each
//!   decoded record with `peer_origin`, and hands it to the supervisor
//!   callback;
//! - the **outbound sender** (client role) connects upward to the peer's
//!   listener, performs the client handshake, and pumps the outbound
//!   queue.
//!
//! The queue is an unbounded FIFO guarded by a mutex and paired condition
//! variable. When a send fails mid-connection the in-flight record goes
//! back to the head of the queue, so delivery is at-least-once within a
//! session with order preserved. Any handshake, transport, or secret
//! failure sleeps a fixed back-off (2 s by default) before retrying; a
//! missing secret is not fatal.
//!
//! Shutdown clears the running signal, notifies the queue, and shuts down
//! the active connections so both workers unblock promptly. The queue is
//! abandoned on shutdown; durability is the journal's job.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretVec};
use tracing::{debug, info, warn};
use wslmon_core::channel::{self, ChannelError, SessionKey};
use wslmon_core::event::{Category, EventRecord, Severity};

use crate::stop::StopSignal;
use crate::transport::{Acceptor, Connector, StreamShutdown};

/// How long the listener waits in one accept slice before re-checking the
/// stop signal.
const ACCEPT_WAIT: Duration = Duration::from_millis(500);

/// Default reconnect back-off.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(2);

/// Callback invoked with every inbound peer record.
pub type InboundCallback = Arc<dyn Fn(EventRecord) + Send + Sync>;

/// Bridge construction parameters.
pub struct BridgeConfig {
    /// Local side tag stamped into `peer_origin` on inbound records.
    pub origin: String,
    /// Path of the raw-byte pre-shared secret file.
    pub secret_path: PathBuf,
    /// Server-role endpoint.
    pub acceptor: Box<dyn Acceptor>,
    /// Client-role endpoint.
    pub connector: Box<dyn Connector>,
    /// Sleep between reconnect attempts.
    pub backoff: Duration,
}

struct BridgeShared {
    stop: StopSignal,
    origin: String,
    secret_path: PathBuf,
    backoff: Duration,
    queue: Mutex<VecDeque<EventRecord>>,
    queue_signal: Condvar,
    /// Session key of the live outbound connection; reads race with
    /// handshake updates, hence the dedicated lock.
    session: Mutex<Option<SessionKey>>,
    /// Cached secret material; loaded lazily, never under a lock during
    /// file I/O.
    secret: Mutex<Option<Arc<SecretVec<u8>>>>,
    /// Shutdown handles for the live connections, one per role.
    inbound_conn: Mutex<Option<Box<dyn StreamShutdown>>>,
    outbound_conn: Mutex<Option<Box<dyn StreamShutdown>>>,
    acceptor: Box<dyn Acceptor>,
    connector: Box<dyn Connector>,
    callback: InboundCallback,
}

/// The dual-role bridge endpoint.
pub struct Bridge {
    shared: Arc<BridgeShared>,
    listener: Option<JoinHandle<()>>,
    sender: Option<JoinHandle<()>>,
}

impl Bridge {
    /// Starts both bridge workers.
    pub fn start(config: BridgeConfig, callback: InboundCallback) -> Self {
        let shared = Arc::new(BridgeShared {
            stop: StopSignal::new(),
            origin: config.origin,
            secret_path: config.secret_path,
            backoff: config.backoff,
            queue: Mutex::new(VecDeque::new()),
            queue_signal: Condvar::new(),
            session: Mutex::new(None),
            secret: Mutex::new(None),
            inbound_conn: Mutex::new(None),
            outbound_conn: Mutex::new(None),
            acceptor: config.acceptor,
            connector: config.connector,
            callback,
        });

        let listener = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("bridge-listener".to_string())
                .spawn(move || listener_worker(&shared))
                .ok()
        };
        let sender = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("bridge-sender".to_string())
                .spawn(move || sender_worker(&shared))
                .ok()
        };

        Self {
            shared,
            listener,
            sender,
        }
    }

    /// Appends a record to the outbound FIFO and wakes the sender.
    ///
    /// Records enqueued after shutdown are dropped; the journal already
    /// holds them locally.
    pub fn enqueue_outbound(&self, record: EventRecord) {
        if self.shared.stop.is_triggered() {
            return;
        }
        let mut queue = self
            .shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        queue.push_back(record);
        self.shared.queue_signal.notify_one();
    }

    /// Number of records waiting to be sent.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stops both workers: triggers the stop signal, wakes the queue wait,
    /// shuts down live connections, and joins. Idempotent.
    pub fn stop(&mut self) {
        self.shared.stop.trigger();
        self.shared.queue_signal.notify_all();
        for slot in [&self.shared.inbound_conn, &self.shared.outbound_conn] {
            if let Some(handle) = slot
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
            {
                handle.shutdown();
            }
        }
        if let Some(handle) = self.listener.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.sender.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.stop();
    }
}

impl BridgeShared {
    /// Loads (and caches) the pre-shared secret. File I/O happens outside
    /// the lock; a concurrent load simply wins the second lock.
    fn load_secret(&self) -> Option<Arc<SecretVec<u8>>> {
        if let Some(secret) = &*self.secret.lock().unwrap_or_else(PoisonError::into_inner) {
            return Some(Arc::clone(secret));
        }
        let bytes = std::fs::read(&self.secret_path).ok()?;
        if bytes.is_empty() {
            return None;
        }
        let secret = Arc::new(SecretVec::new(bytes));
        *self.secret.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&secret));
        Some(secret)
    }

    fn backoff_wait(&self) {
        let _ = self.stop.wait_timeout(self.backoff);
    }

    fn set_session(&self, key: Option<SessionKey>) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = key;
    }

    fn session(&self) -> Option<SessionKey> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Blocks until a record is available or shutdown is requested.
    fn wait_outbound(&self) -> Option<EventRecord> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if self.stop.is_triggered() {
                return None;
            }
            if let Some(record) = queue.pop_front() {
                return Some(record);
            }
            queue = self
                .queue_signal
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn requeue_front(&self, record: EventRecord) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_front(record);
    }

    /// Journals one bridge warning through the inbound callback. The
    /// record has no `peer_origin`, so it follows the normal emit path.
    fn emit_warning(&self, message: &str, err: &ChannelError) {
        let mut record = EventRecord::new(Category::Ipc, Severity::Warning, message);
        record.source = "bridge".to_string();
        record.set_attribute("error", err.to_string());
        (self.callback)(record);
    }
}

fn listener_worker(shared: &Arc<BridgeShared>) {
    let mut handshake_warned = false;
    while !shared.stop.is_triggered() {
        let mut stream = match shared.acceptor.accept(ACCEPT_WAIT) {
            Ok(Some(stream)) => stream,
            Ok(None) => continue,
            Err(err) => {
                warn!(%err, "bridge accept failed");
                shared.backoff_wait();
                continue;
            },
        };

        let Some(secret) = shared.load_secret() else {
            debug!("bridge secret unavailable, dropping inbound peer");
            shared.backoff_wait();
            continue;
        };

        *shared
            .inbound_conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = stream.shutdown_handle();

        let session = match channel::server_handshake(&mut stream, secret.expose_secret()) {
            Ok(session) => session,
            Err(err) => {
                warn!(%err, "inbound handshake failed");
                if !handshake_warned {
                    shared.emit_warning("Inbound bridge handshake failed", &err);
                    handshake_warned = true;
                }
                shared.backoff_wait();
                continue;
            },
        };
        handshake_warned = false;
        info!("inbound bridge session established");

        while !shared.stop.is_triggered() {
            match channel::recv_event(&mut stream, &session) {
                Ok(mut record) => {
                    record.set_attribute("peer_origin", shared.origin.clone());
                    (shared.callback)(record);
                },
                // A plain I/O error is the peer hanging up; anything else
                // means a bad or tampered frame and is worth a record.
                Err(ChannelError::Io(err)) => {
                    debug!(%err, "inbound bridge session ended");
                    break;
                },
                Err(err) => {
                    warn!(%err, "inbound frame rejected, dropping connection");
                    shared.emit_warning("Inbound bridge frame rejected", &err);
                    break;
                },
            }
        }

        *shared
            .inbound_conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

fn sender_worker(shared: &Arc<BridgeShared>) {
    let mut handshake_warned = false;
    while !shared.stop.is_triggered() {
        let Some(secret) = shared.load_secret() else {
            shared.backoff_wait();
            continue;
        };

        let mut stream = match shared.connector.connect() {
            Ok(stream) => stream,
            Err(err) => {
                debug!(%err, "bridge connect failed");
                shared.backoff_wait();
                continue;
            },
        };

        *shared
            .outbound_conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = stream.shutdown_handle();

        match channel::client_handshake(&mut stream, secret.expose_secret()) {
            Ok(session) => shared.set_session(Some(session)),
            Err(err) => {
                warn!(%err, "outbound handshake failed");
                if !handshake_warned {
                    shared.emit_warning("Outbound bridge handshake failed", &err);
                    handshake_warned = true;
                }
                shared.backoff_wait();
                continue;
            },
        }
        handshake_warned = false;
        info!("outbound bridge session established");

        while let Some(record) = shared.wait_outbound() {
            let Some(session) = shared.session() else {
                shared.requeue_front(record);
                break;
            };
            if let Err(err) = channel::send_event(&mut stream, &session, &record) {
                warn!(%err, "bridge send failed, requeueing in-flight record");
                shared.requeue_front(record);
                break;
            }
        }

        shared.set_session(None);
        *shared
            .outbound_conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        shared.backoff_wait();
    }
}
