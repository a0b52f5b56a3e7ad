use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::sluice::common::parse_addr;

#[test]
fn test_parse_ipv4() {
    let addr = parse_addr("127.0.0.1:9000").unwrap();
    assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    assert_eq!(addr.port(), 9000);
}

#[test]
fn test_parse_ipv6_brackets() {
    let addr = parse_addr("[::1]:9000").unwrap();
    assert_eq!(addr.ip(), IpAddr::V6(Ipv6Addr::LOCALHOST));
    assert_eq!(addr.port(), 9000);
}

#[test]
fn test_parse_rejects_bare_ipv6() {
    // without brackets the last colon is ambiguous
    assert!(parse_addr("::1:9000").is_err());
}

#[test]
fn test_parse_rejects_garbage() {
    assert!(parse_addr("").is_err());
    assert!(parse_addr("localhost:9000").is_err());
    assert!(parse_addr("127.0.0.1").is_err());
    assert!(parse_addr("127.0.0.1:").is_err());
    assert!(parse_addr("127.0.0.1:notaport").is_err());
}
