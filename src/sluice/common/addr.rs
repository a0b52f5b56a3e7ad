use std::net::SocketAddr;

use crate::sluice::common::{Error, Result};

/// Parse a front/backend URL of the form `A.B.C.D:PORT` or `[v6addr]:PORT`.
/// The square brackets are mandatory for IPv6 so the last `:` unambiguously
/// separates the port.
pub fn parse_addr(url: &str) -> Result<SocketAddr> {
    url.parse::<SocketAddr>()
        .map_err(|_| Error::new(format!("invalid address: {}", url)))
}
