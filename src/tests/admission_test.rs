use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

use test_env_log::test;

use crate::tests::common;

fn roundtrip(c: &mut std::net::TcpStream, msg: &[u8]) {
    c.write_all(msg).unwrap();
    let mut buf = vec![0u8; msg.len()];
    c.read_exact(&mut buf).unwrap();
    assert_eq!(buf, msg);
}

/// With a tunnel budget of two, a third client sits in the kernel accept
/// queue until one of the first two tunnels is torn down.
#[test]
#[serial_test::serial]
fn test_listener_pauses_at_tunnel_limit() {
    let front = common::next_addr();
    let feed = common::next_addr();
    let backend = common::next_addr();

    common::spawn_echo_backend(backend);
    common::spawn_feed_publisher(feed, vec![backend.to_string(); 8]);
    let conf = common::settings_with(|s| s.max_tunnels = 2);
    common::start_proxy(conf, front, vec![feed]);
    common::settle();

    let mut first = common::connect_retry(front);
    roundtrip(&mut first, b"one");
    let mut second = common::connect_retry(front);
    roundtrip(&mut second, b"two");

    // the listener is paused now; the third connect completes in the
    // backlog but no tunnel is built for it
    let mut third = common::connect_retry(front);
    third.write_all(b"three").unwrap();
    third
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();
    let mut buf = [0u8; 5];
    assert!(third.read_exact(&mut buf).is_err(), "third client served early");

    // free one slot; the unref path resumes the listener
    drop(first);
    thread::sleep(Duration::from_millis(500));

    third.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    third.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"three");

    roundtrip(&mut second, b"still-two");
}
