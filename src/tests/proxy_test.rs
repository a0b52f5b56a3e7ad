use std::io::{Read, Write};
use std::net::Shutdown;
use std::thread;
use std::time::Duration;

use rand::RngCore;
use test_env_log::test;

use crate::tests::common;

#[test]
fn test_proxy_small_roundtrip() {
    let front = common::next_addr();
    let feed = common::next_addr();
    let backend = common::next_addr();

    common::spawn_echo_backend(backend);
    common::spawn_feed_publisher(feed, vec![backend.to_string(); 4]);
    common::start_proxy(common::settings(), front, vec![feed]);
    common::settle();

    let mut c = common::connect_retry(front);
    c.write_all(b"Q").unwrap();
    c.shutdown(Shutdown::Write).unwrap();
    let got = common::read_until_eof(&mut c, Duration::from_secs(5));
    assert_eq!(got, b"Q");
}

#[test]
#[serial_test::serial]
fn test_proxy_megabyte_roundtrip() {
    let front = common::next_addr();
    let feed = common::next_addr();
    let backend = common::next_addr();

    common::spawn_echo_backend(backend);
    common::spawn_feed_publisher(feed, vec![backend.to_string(); 4]);
    common::start_proxy(common::settings(), front, vec![feed]);
    common::settle();

    let mut payload = vec![0u8; 1024 * 1024];
    rand::thread_rng().fill_bytes(&mut payload);
    let expected = payload.clone();

    let mut c = common::connect_retry(front);
    let mut writer = c.try_clone().unwrap();
    let handle = thread::spawn(move || {
        writer.write_all(&payload).unwrap();
        writer.shutdown(Shutdown::Write).unwrap();
    });
    let got = common::read_until_eof(&mut c, Duration::from_secs(20));
    handle.join().unwrap();
    assert_eq!(got.len(), expected.len());
    assert_eq!(got, expected);
}

#[test]
fn test_proxy_both_directions() {
    // the backend speaks first here: bytes must flow back before the
    // client has sent anything
    let front = common::next_addr();
    let feed = common::next_addr();
    let backend = common::next_addr();

    let listener = std::net::TcpListener::bind(backend).unwrap();
    thread::spawn(move || {
        if let Ok((mut conn, _)) = listener.accept() {
            conn.write_all(b"BANNER\n").unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"LOGIN");
            conn.write_all(b"OK\n").unwrap();
        }
    });
    common::spawn_feed_publisher(feed, vec![backend.to_string(); 2]);
    common::start_proxy(common::settings(), front, vec![feed]);
    common::settle();

    let mut c = common::connect_retry(front);
    let mut buf = [0u8; 7];
    c.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"BANNER\n");
    c.write_all(b"LOGIN").unwrap();
    let mut buf = [0u8; 3];
    c.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"OK\n");
}

#[test]
fn test_backend_refusal_disconnects_client() {
    let front = common::next_addr();
    let feed = common::next_addr();

    // port 1 is closed: the connect fails synchronously on loopback or
    // reports an error event right after
    common::spawn_feed_publisher(feed, vec!["127.0.0.1:1".to_string(); 2]);
    common::start_proxy(common::settings(), front, vec![feed]);
    common::settle();

    let mut c = common::connect_retry(front);
    let got = common::read_until_eof(&mut c, Duration::from_secs(5));
    assert!(got.is_empty());
}

#[test]
fn test_feed_starvation_disconnects_client() {
    let front = common::next_addr();
    let feed = common::next_addr();

    // the feed endpoint accepts but never publishes a backend
    common::spawn_feed_publisher(feed, vec![]);
    common::start_proxy(common::settings(), front, vec![feed]);
    common::settle();

    let mut c = common::connect_retry(front);
    let got = common::read_until_eof(&mut c, Duration::from_secs(5));
    assert!(got.is_empty());
}

#[test]
fn test_oversize_url_aborts_only_that_client() {
    let front = common::next_addr();
    let feed = common::next_addr();
    let backend = common::next_addr();

    common::spawn_echo_backend(backend);
    // first message is 200 bytes of garbage, the rest are usable
    let oversize = "x".repeat(200);
    common::spawn_feed_publisher(feed, vec![oversize, backend.to_string(), backend.to_string()]);
    common::start_proxy(common::settings(), front, vec![feed]);
    common::settle();

    let mut first = common::connect_retry(front);
    let got = common::read_until_eof(&mut first, Duration::from_secs(5));
    assert!(got.is_empty());

    // the listener keeps accepting and the next URL is served normally
    let mut second = common::connect_retry(front);
    second.write_all(b"STILL UP").unwrap();
    second.shutdown(Shutdown::Write).unwrap();
    let got = common::read_until_eof(&mut second, Duration::from_secs(5));
    assert_eq!(got, b"STILL UP");
}

#[test]
fn test_url_length_boundary() {
    // one byte over the 128-byte cap is rejected before parsing
    let front = common::next_addr();
    let feed = common::next_addr();
    let backend = common::next_addr();

    let just_over = "y".repeat(129);

    common::spawn_echo_backend(backend);
    common::spawn_feed_publisher(feed, vec![just_over, backend.to_string()]);
    common::start_proxy(common::settings(), front, vec![feed]);
    common::settle();

    let mut rejected = common::connect_retry(front);
    let got = common::read_until_eof(&mut rejected, Duration::from_secs(5));
    assert!(got.is_empty());

    let mut accepted = common::connect_retry(front);
    accepted.write_all(b"ping").unwrap();
    accepted.shutdown(Shutdown::Write).unwrap();
    let got = common::read_until_eof(&mut accepted, Duration::from_secs(5));
    assert_eq!(got, b"ping");
}

#[test]
fn test_half_close_propagates() {
    let front = common::next_addr();
    let feed = common::next_addr();
    let backend = common::next_addr();

    common::spawn_echo_backend(backend);
    common::spawn_feed_publisher(feed, vec![backend.to_string(); 2]);
    common::start_proxy(common::settings(), front, vec![feed]);
    common::settle();

    let mut c = common::connect_retry(front);
    c.write_all(b"Q").unwrap();
    c.shutdown(Shutdown::Write).unwrap();
    // the echo backend answers then half-closes; both must reach us
    let got = common::read_until_eof(&mut c, Duration::from_secs(5));
    assert_eq!(got, b"Q");
}
