//! End-to-end bridge behaviour over real Unix sockets.

use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use wslmon_core::channel;
use wslmon_core::event::{Category, EventRecord, Severity};
use wslmon_core::journal::{Journal, JournalOptions};
use wslmon_daemon::bridge::{Bridge, BridgeConfig, InboundCallback};
use wslmon_daemon::supervisor::{HostIdentity, Supervisor};
use wslmon_daemon::transport::{UnixAcceptor, UnixConnector};

const SECRET: &[u8] = b"bridge-test-secret";
const TEST_BACKOFF: Duration = Duration::from_millis(100);

fn write_secret(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("ipc.key");
    std::fs::write(&path, SECRET).unwrap();
    path
}

fn test_record(message: &str) -> EventRecord {
    let mut record = EventRecord::new(Category::Ipc, Severity::Info, message);
    record.timestamp = wslmon_core::event::parse_timestamp("2024-07-01T08:00:00.000000Z").unwrap();
    record.source = "bridge.test".to_string();
    record
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn bridge_between(
    dir: &Path,
    origin: &str,
    listen: &Path,
    connect: &Path,
    callback: InboundCallback,
) -> Bridge {
    Bridge::start(
        BridgeConfig {
            origin: origin.to_string(),
            secret_path: write_secret(dir),
            acceptor: Box::new(UnixAcceptor::bind(listen).unwrap()),
            connector: Box::new(UnixConnector::new(connect)),
            backoff: TEST_BACKOFF,
        },
        callback,
    )
}

#[test]
fn test_bridge_pair_delivers_and_tags_peer_origin() {
    let dir = tempfile::tempdir().unwrap();
    let guest_sock = dir.path().join("guest.sock");
    let host_sock = dir.path().join("host.sock");

    let host_received: Arc<Mutex<Vec<EventRecord>>> = Arc::new(Mutex::new(Vec::new()));
    let host_sink = Arc::clone(&host_received);
    let host_callback: InboundCallback =
        Arc::new(move |record| host_sink.lock().unwrap().push(record));

    let guest_callback: InboundCallback = Arc::new(|_record| {});

    // The guest listens on its socket and connects to the host's; the
    // host mirrors that.
    let mut guest = bridge_between(
        dir.path(),
        "guest",
        &guest_sock,
        &host_sock,
        guest_callback,
    );
    let mut host = bridge_between(dir.path(), "host", &host_sock, &guest_sock, host_callback);

    guest.enqueue_outbound(test_record("from guest"));

    assert!(wait_until(Duration::from_secs(10), || {
        !host_received.lock().unwrap().is_empty()
    }));
    let received = host_received.lock().unwrap();
    assert_eq!(received[0].message, "from guest");
    // The receiving side stamps its own tag.
    assert_eq!(received[0].attribute("peer_origin"), Some("host"));

    drop(received);
    guest.stop();
    host.stop();
}

/// On abrupt peer close mid-session the in-flight record returns to the
/// head of the queue, and after the reconnect it is the first to arrive.
#[test]
fn test_in_flight_record_requeues_at_head() {
    let dir = tempfile::tempdir().unwrap();
    let server_sock = dir.path().join("server.sock");
    let unused_sock = dir.path().join("unused.sock");

    let (received_tx, received_rx) = mpsc::channel::<(usize, String)>();

    // A fake peer listener: the first connection reads one frame and
    // drops with the session still live; the second stays up and drains
    // everything. The "__closed__" marker makes the abrupt close
    // observable to the test before it enqueues more records.
    let listener = std::os::unix::net::UnixListener::bind(&server_sock).unwrap();
    let server = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let session = channel::server_handshake(&mut stream, SECRET).unwrap();
        let record = channel::recv_event(&mut stream, &session).unwrap();
        received_tx.send((0, record.message)).unwrap();
        drop(stream);
        received_tx.send((0, "__closed__".to_string())).unwrap();

        let (mut stream, _) = listener.accept().unwrap();
        let session = channel::server_handshake(&mut stream, SECRET).unwrap();
        while let Ok(record) = channel::recv_event(&mut stream, &session) {
            received_tx.send((1, record.message)).unwrap();
        }
    });

    let mut bridge = bridge_between(
        dir.path(),
        "guest",
        &unused_sock,
        &server_sock,
        Arc::new(|_record| {}),
    );

    bridge.enqueue_outbound(test_record("first"));
    let (connection, message) = received_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!((connection, message.as_str()), (0, "first"));
    let (_, marker) = received_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(marker, "__closed__");

    // The first connection is now closed; these queue up, fail on the
    // dead stream, and must survive the reconnect in order.
    for message in ["second", "third", "fourth"] {
        bridge.enqueue_outbound(test_record(message));
    }

    let mut replayed = Vec::new();
    while replayed.len() < 3 {
        let (connection, message) = received_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(connection, 1, "replay must happen on the new session");
        replayed.push(message);
    }
    assert_eq!(replayed, vec!["second", "third", "fourth"]);

    bridge.stop();
    server.join().unwrap();
}

/// Supervisor wiring: locally-emitted records are forwarded once; records
/// that arrived from the peer are journalled but never forwarded back.
#[test]
fn test_supervisor_does_not_reforward_peer_records() {
    let dir = tempfile::tempdir().unwrap();
    let local_sock = dir.path().join("local.sock");
    let peer_sock = dir.path().join("peer.sock");

    let (received_tx, received_rx) = mpsc::channel::<String>();
    let listener = std::os::unix::net::UnixListener::bind(&peer_sock).unwrap();
    let peer = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let session = channel::server_handshake(&mut stream, SECRET).unwrap();
        while let Ok(record) = channel::recv_event(&mut stream, &session) {
            received_tx.send(record.message.clone()).unwrap();
        }
    });

    let journal = Journal::open(
        JournalOptions::new(dir.path().join("events.log"))
            .default_source("test")
            .hmac_key(None),
    )
    .unwrap();
    let supervisor = Supervisor::new(journal, 16, HostIdentity::default());
    supervisor.attach_bridge(BridgeConfig {
        origin: "guest".to_string(),
        secret_path: write_secret(dir.path()),
        acceptor: Box::new(UnixAcceptor::bind(&local_sock).unwrap()),
        connector: Box::new(UnixConnector::new(&peer_sock)),
        backoff: TEST_BACKOFF,
    });
    supervisor.start();

    // A peer-tagged record must stay local.
    let mut inbound = test_record("inbound from peer");
    inbound.set_attribute("peer_origin", "guest");
    supervisor.emit(inbound);

    // A local record must reach the peer.
    supervisor.emit(test_record("local observation"));

    let first = received_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(first, "local observation");
    assert!(received_rx
        .recv_timeout(Duration::from_millis(300))
        .is_err());

    // Both records made it to the journal regardless.
    assert_eq!(supervisor.ring_snapshot().len(), 2);

    supervisor.stop();
    peer.join().unwrap();
}
