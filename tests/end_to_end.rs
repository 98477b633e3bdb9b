//! Real loopback UDP exercises of the end-to-end scenarios from the testable properties:
//! passwordless handshake, password retry, timeout, graceful close, broadcast blacklist,
//! and packets-per-second accounting. No mock transport: every test binds a real socket.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use udp_link::codec::Frame;
use udp_link::ip::FixedIpResolver;
use udp_link::server::ClientId;
use udp_link::{Client, Server};

const LOOPBACK_ID: u32 = 0x7f00_0001;

fn logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

fn fresh_server() -> Server {
    Server::with_resolver(logger(), &FixedIpResolver(LOOPBACK_ID))
}

fn fresh_client() -> Client {
    Client::with_resolver(logger(), &FixedIpResolver(LOOPBACK_ID))
}

/// Polls `drain()` (simulating a host pump) until `cond` is true or the timeout elapses.
fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let start = Instant::now();
    loop {
        udp_link::drain();
        if cond() {
            return true;
        }
        if start.elapsed() > timeout {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn s1_passwordless_handshake() {
    let server = fresh_server();
    assert!(server.try_open_connection(0));
    let port = server.port();

    let client_connected = Arc::new(Mutex::new(None));
    let cc2 = client_connected.clone();
    server
        .client_connected()
        .subscribe(move |id| *cc2.lock().unwrap() = Some(id));

    let client = fresh_client();
    let opened = Arc::new(Mutex::new(false));
    let opened2 = opened.clone();
    client.connection_open_signal().subscribe(move |()| *opened2.lock().unwrap() = true);

    client.set_server_data(Some(Ipv4Addr::LOCALHOST), Some(port));
    assert!(client.try_open_connection());

    assert!(wait_until(|| *opened.lock().unwrap(), Duration::from_secs(2)));
    assert!(wait_until(
        || client_connected.lock().unwrap().is_some(),
        Duration::from_secs(2)
    ));
    assert_eq!(*client_connected.lock().unwrap(), Some(ClientId(LOOPBACK_ID)));

    client.close_connection("done");
    server.close_connection();
}

#[test]
fn s2_password_retry() {
    let server = fresh_server();
    server.set_password_required(true, Some("hunter2".to_string()));
    assert!(server.try_open_connection(0));
    let port = server.port();

    let client = fresh_client();
    let password_requests = Arc::new(Mutex::new(0u32));
    let pr2 = password_requests.clone();
    client.password_request().subscribe(move |()| {
        *pr2.lock().unwrap() += 1;
    });

    client.set_server_data(Some(Ipv4Addr::LOCALHOST), Some(port));
    assert!(client.try_open_connection());

    assert!(wait_until(|| *password_requests.lock().unwrap() >= 1, Duration::from_secs(2)));
    assert!(!client.was_incorrect_password());

    client.set_and_send_password("wrong".to_string());
    assert!(wait_until(|| *password_requests.lock().unwrap() >= 2, Duration::from_secs(2)));
    assert!(client.was_incorrect_password());

    let opened = Arc::new(Mutex::new(false));
    let opened2 = opened.clone();
    client.connection_open_signal().subscribe(move |()| *opened2.lock().unwrap() = true);
    client.set_and_send_password("hunter2".to_string());

    assert!(wait_until(|| *opened.lock().unwrap(), Duration::from_secs(2)));
    assert!(!client.was_incorrect_password());

    client.close_connection("done");
    server.close_connection();
}

#[test]
fn s3_timeout_disconnects_client() {
    let server = fresh_server();
    server.set_timeout(1.0);
    assert!(server.try_open_connection(0));
    let port = server.port();

    let disconnected = Arc::new(Mutex::new(None));
    let d2 = disconnected.clone();
    server
        .client_disconnected()
        .subscribe(move |(id, reason)| *d2.lock().unwrap() = Some((id, reason)));

    let client = fresh_client();
    client.set_server_data(Some(Ipv4Addr::LOCALHOST), Some(port));
    assert!(client.try_open_connection());

    assert!(wait_until(|| server.clients_size() == 1, Duration::from_secs(2)));

    // Stop the client's workers without a graceful close so the server simply stops
    // hearing from it (no keep-alive datagram is produced here).
    drop(client);

    assert!(wait_until(|| server.clients_size() == 0, Duration::from_secs(4)));
    let (_, reason) = disconnected.lock().unwrap().clone().expect("disconnected event");
    assert_eq!(reason, "Timedout");

    server.close_connection();
}

#[test]
fn s4_graceful_close_notifies_server() {
    let server = fresh_server();
    assert!(server.try_open_connection(0));
    let port = server.port();

    let disconnected = Arc::new(Mutex::new(None));
    let d2 = disconnected.clone();
    server
        .client_disconnected()
        .subscribe(move |(id, reason)| *d2.lock().unwrap() = Some((id, reason)));

    let client = fresh_client();
    client.set_server_data(Some(Ipv4Addr::LOCALHOST), Some(port));
    assert!(client.try_open_connection());
    assert!(wait_until(|| server.clients_size() == 1, Duration::from_secs(2)));

    client.close_connection("bye");

    assert!(wait_until(|| server.clients_size() == 0, Duration::from_secs(2)));
    let (_, reason) = disconnected.lock().unwrap().clone().expect("disconnected event");
    assert_eq!(reason, "bye");

    server.close_connection();
}

#[test]
fn s5_broadcast_respects_blacklist() {
    let server = fresh_server();
    assert!(server.try_open_connection(0));
    let port = server.port();

    // Three peers from the same loopback address collapse to one ClientId (§9's known
    // limitation); exercise the blacklist semantics against that single connected id.
    let client = fresh_client();
    client.set_server_data(Some(Ipv4Addr::LOCALHOST), Some(port));
    assert!(client.try_open_connection());
    assert!(wait_until(|| server.clients_size() == 1, Duration::from_secs(2)));

    let received = Arc::new(Mutex::new(Vec::new()));
    let r2 = received.clone();
    client
        .data_received()
        .subscribe(move |(payload, _sender)| r2.lock().unwrap().push(payload));

    server.send_to_all(&Frame::Data(bytes::Bytes::from_static(b"hi-all")), &[]);
    assert!(wait_until(|| !received.lock().unwrap().is_empty(), Duration::from_secs(2)));
    assert_eq!(received.lock().unwrap()[0].as_ref(), b"hi-all");

    received.lock().unwrap().clear();
    let blacklisted = ClientId(LOOPBACK_ID);
    server.send_to_all(&Frame::Data(bytes::Bytes::from_static(b"skip-me")), &[blacklisted]);
    thread::sleep(Duration::from_millis(200));
    udp_link::drain();
    assert!(received.lock().unwrap().is_empty());

    client.close_connection("done");
    server.close_connection();
}

#[test]
fn s6_packets_per_second_rolls_over() {
    let server = fresh_server();
    server.set_update_interval(64);
    assert!(server.try_open_connection(0));
    let port = server.port();

    let client = fresh_client();
    client.set_server_data(Some(Ipv4Addr::LOCALHOST), Some(port));
    assert!(client.try_open_connection());
    assert!(wait_until(|| server.clients_size() == 1, Duration::from_secs(2)));

    let id = server.clients()[0].id;
    for _ in 0..10 {
        let _ = client.send_to_server(&Frame::Data(bytes::Bytes::new()));
        thread::sleep(Duration::from_millis(20));
    }

    assert!(wait_until(
        || server.client_data(id).map(|v| v.packets_per_second).unwrap_or(0) >= 10,
        Duration::from_secs(2)
    ));

    assert!(wait_until(
        || server.client_data(id).map(|v| v.packets_per_second).unwrap_or(1) == 0,
        Duration::from_secs(2)
    ));

    client.close_connection("done");
    server.close_connection();
}
