use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::AtomicU16;
use std::sync::atomic::Ordering::Relaxed;
use std::thread;
use std::time::{Duration, Instant};

use crate::sluice::config::Settings;
use crate::sluice::proxy::Proxy;
use crate::sluice::server::bind_front;

pub static LISTEN_PORT: AtomicU16 = AtomicU16::new(28500);

pub fn next_addr() -> SocketAddr {
    SocketAddr::new(
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        LISTEN_PORT.fetch_add(1, Relaxed),
    )
}

pub fn settings() -> &'static Settings {
    settings_with(|_| {})
}

pub fn settings_with<F: FnOnce(&mut Settings)>(f: F) -> &'static Settings {
    let mut s = Settings::default();
    // keep tests independent of the environment's file-descriptor limits
    s.max_tunnels = 512;
    f(&mut s);
    Box::leak(Box::new(s))
}

/// Bind the front, build the engine and run it on a background thread.
pub fn start_proxy(conf: &'static Settings, front: SocketAddr, feeds: Vec<SocketAddr>) {
    let sock = bind_front(front).expect("bind front");
    let mut proxy = Proxy::new(conf, sock, front, feeds).expect("proxy setup");
    thread::spawn(move || {
        let _ = proxy.run();
    });
}

/// Echoing backend: writes back whatever it reads and half-closes once
/// the peer does.
pub fn spawn_echo_backend(addr: SocketAddr) {
    let listener = TcpListener::bind(addr).expect("bind backend");
    thread::spawn(move || {
        for conn in listener.incoming() {
            let Ok(mut conn) = conn else { break };
            thread::spawn(move || {
                let mut buf = [0u8; 16384];
                loop {
                    match conn.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if conn.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = conn.shutdown(Shutdown::Write);
            });
        }
    });
}

/// Stand-in for the dispatcher: serves every feed connection the same
/// backend URLs, one per line, then holds the connection open.
pub fn spawn_feed_publisher(addr: SocketAddr, lines: Vec<String>) {
    let listener = TcpListener::bind(addr).expect("bind feed");
    thread::spawn(move || {
        let mut held = Vec::new();
        for conn in listener.incoming() {
            let Ok(mut conn) = conn else { break };
            let mut payload = String::new();
            for l in &lines {
                payload.push_str(l);
                payload.push('\n');
            }
            let _ = conn.write_all(payload.as_bytes());
            held.push(conn);
        }
    });
}

pub fn connect_retry(addr: SocketAddr) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(addr) {
            Ok(s) => return s,
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(50)),
            Err(e) => panic!("connect {}: {}", addr, e),
        }
    }
}

/// Give background threads time to wire up (feed connection, queued URLs).
pub fn settle() {
    thread::sleep(Duration::from_millis(400));
}

/// Read until EOF or the deadline; returns the bytes received.
pub fn read_until_eof(conn: &mut TcpStream, deadline: Duration) -> Vec<u8> {
    conn.set_read_timeout(Some(deadline)).unwrap();
    let mut out = Vec::new();
    let mut buf = [0u8; 16384];
    loop {
        match conn.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(_) => break,
        }
    }
    out
}
