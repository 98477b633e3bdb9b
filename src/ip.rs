//! Resolution of the local IPv4 address a socket would be seen at by its peers.
//!
//! `examples/original_source/src/Networking/Socket.cpp` resolves this once, synchronously,
//! in its constructor (`sf::IpAddress::getPublicAddress(sf::seconds(1))`), which stalls
//! construction for up to a second on a slow or absent network. This module keeps the
//! "resolve once, up front" shape but hides it behind a trait so a budget-sensitive caller
//! (tests, anything constructing many endpoints in one process) can inject a resolver that
//! never touches the network at all.

use std::net::{IpAddr, UdpSocket};
use std::time::Duration;

/// Something that can answer "what IPv4 address would a peer see me connect from".
pub trait PublicIpResolver: Send + Sync {
    /// Returns `None` if resolution fails or exceeds `timeout`; never panics or blocks past it.
    fn resolve(&self, timeout: Duration) -> Option<u32>;
}

/// Default resolver. Opens a UDP socket, "connects" it to a well-known public address (no
/// packet is actually sent over a connectionless socket for this call) and reads back the
/// local address the kernel picked for that route. This answers "which of my interfaces
/// faces the internet" without any real network traffic or third-party dependency.
pub struct RouteProbeResolver {
    probe_addr: &'static str,
}

impl Default for RouteProbeResolver {
    fn default() -> Self {
        RouteProbeResolver {
            probe_addr: "8.8.8.8:80",
        }
    }
}

impl PublicIpResolver for RouteProbeResolver {
    fn resolve(&self, _timeout: Duration) -> Option<u32> {
        let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect(self.probe_addr).ok()?;
        match socket.local_addr().ok()?.ip() {
            IpAddr::V4(v4) => Some(u32::from(v4)),
            IpAddr::V6(_) => None,
        }
    }
}

/// Always returns a fixed, caller-supplied address. For tests and for callers who already
/// know their externally visible address (e.g. from prior configuration).
pub struct FixedIpResolver(pub u32);

impl PublicIpResolver for FixedIpResolver {
    fn resolve(&self, _timeout: Duration) -> Option<u32> {
        Some(self.0)
    }
}
