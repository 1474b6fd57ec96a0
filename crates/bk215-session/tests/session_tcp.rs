//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Network connectivity and device session management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use bk215_protocol::{FieldMap, MessageCode};
use bk215_session::{DeviceSession, SessionError, SessionEvent, SessionEvents, WatchdogSettings};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const BUDGET: Duration = Duration::from_millis(500);

async fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    (listener, port)
}

async fn next_event(events: &mut SessionEvents) -> SessionEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event within deadline")
        .expect("stream open")
}

async fn read_exact_len(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("read within deadline")
        .expect("read");
    buf
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_sends_crlf_handshake_and_delivers_messages_in_order() {
    let (listener, port) = listener().await;
    let (session, mut events) = DeviceSession::new(None);
    session.connect("127.0.0.1", port, BUDGET);

    let (mut device, _) = listener.accept().await.expect("accept");
    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));
    assert!(session.is_connected());

    let expected = b"{\"code\":24658,\"data\":{}}\r\n";
    assert_eq!(read_exact_len(&mut device, expected.len()).await, expected);

    device
        .write_all(b"{\"code\":0,\"data\":{}}{\"code\":24658,\"da")
        .await
        .expect("write");
    device
        .write_all(b"ta\":{\"t211\":87}}")
        .await
        .expect("write");

    let SessionEvent::Message(first) = next_event(&mut events).await else {
        panic!("expected message");
    };
    assert!(first.is_handshake_ack());
    let SessionEvent::Message(second) = next_event(&mut events).await else {
        panic!("expected message");
    };
    assert_eq!(second.code, MessageCode::DATA_REPORT);
    assert_eq!(second.data.get("t211"), Some(&json!(87)));
    assert!(session.last_data_at().is_some());

    session.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commands_are_written_without_terminator() {
    let (listener, port) = listener().await;
    let (session, mut events) = DeviceSession::new(None);
    session.connect("127.0.0.1", port, BUDGET);
    let (mut device, _) = listener.accept().await.expect("accept");
    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));
    let _handshake = read_exact_len(&mut device, 26).await;

    let mut fields = FieldMap::new();
    fields.insert("t363".into(), json!(95));
    assert!(session.send_command(fields));

    let expected = b"{\"code\":24662,\"data\":{\"t363\":95}}";
    assert_eq!(read_exact_len(&mut device, expected.len()).await, expected);

    // Nothing else follows the command.
    let mut extra = [0u8; 1];
    assert!(
        timeout(Duration::from_millis(100), device.read(&mut extra))
            .await
            .is_err()
    );
    session.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_close_emits_closed() {
    let (listener, port) = listener().await;
    let (session, mut events) = DeviceSession::new(None);
    session.connect("127.0.0.1", port, BUDGET);
    let (device, _) = listener.accept().await.expect("accept");
    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));

    drop(device);
    assert!(matches!(next_event(&mut events).await, SessionEvent::Closed));
    assert!(!session.is_connected());
    assert!(!session.send_command(FieldMap::new()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_connect_reports_error_then_closed() {
    let (listener, port) = listener().await;
    drop(listener);

    let (session, mut events) = DeviceSession::new(None);
    session.connect("127.0.0.1", port, BUDGET);

    match next_event(&mut events).await {
        SessionEvent::Error(SessionError::Connect { addr, .. }) => {
            assert_eq!(addr, format!("127.0.0.1:{port}"));
        }
        SessionEvent::Error(SessionError::ConnectTimeout { .. }) => {}
        other => panic!("unexpected event {other:?}"),
    }
    assert!(matches!(next_event(&mut events).await, SessionEvent::Closed));
    assert!(!session.is_connected());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn destroy_suppresses_later_events() {
    let (listener, port) = listener().await;
    let (session, mut events) = DeviceSession::new(None);
    session.connect("127.0.0.1", port, BUDGET);
    let (mut device, _) = listener.accept().await.expect("accept");
    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));

    session.destroy();
    let _ = device.write_all(b"{\"code\":24658,\"data\":{\"t211\":50}}").await;

    assert!(timeout(Duration::from_millis(200), events.recv())
        .await
        .is_err());
    assert!(!session.is_connected());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnect_timer_dials_again() {
    let (listener, port) = listener().await;
    let (session, mut events) = DeviceSession::new(None);
    session.connect("127.0.0.1", port, BUDGET);
    let (first, _) = listener.accept().await.expect("accept");
    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));
    drop(first);
    assert!(matches!(next_event(&mut events).await, SessionEvent::Closed));

    session.schedule_reconnect("127.0.0.1", port, BUDGET, Duration::from_millis(50));
    assert!(session.reconnect_pending());
    let (_second, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("second dial")
        .expect("accept");
    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));
    assert!(!session.reconnect_pending());
    session.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_device_trips_the_watchdog() {
    let (listener, port) = listener().await;
    let watchdog = WatchdogSettings {
        check_interval: Duration::from_millis(20),
        floor: Duration::from_millis(60),
        margin: Duration::from_millis(20),
    };
    let (session, mut events) = DeviceSession::new(Some(watchdog));
    session.connect("127.0.0.1", port, BUDGET);
    let (_device, _) = listener.accept().await.expect("accept");
    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));

    match next_event(&mut events).await {
        SessionEvent::Error(SessionError::IdleTimeout { idle }) => {
            assert!(idle > watchdog.idle_bound(BUDGET));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(matches!(next_event(&mut events).await, SessionEvent::Closed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn destroy_wins_over_an_expiring_reconnect_timer() {
    let (listener, port) = listener().await;
    for _ in 0..200 {
        let (session, mut events) = DeviceSession::new(None);
        session.schedule_reconnect("127.0.0.1", port, BUDGET, Duration::ZERO);
        tokio::task::yield_now().await;
        session.destroy();

        assert!(!session.reconnect_pending());
        let late = timeout(Duration::from_millis(5), events.recv()).await;
        assert!(late.is_err(), "event after destroy: {late:?}");
        assert!(!session.is_connected());
    }
    drop(listener);
}
