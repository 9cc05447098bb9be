//! Local port selection.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::TcpListener;

/// Ask the OS for a free loopback port.
///
/// The listener is dropped before returning, so another process may still
/// grab the port before the engine binds it. Good enough for a fresh port
/// per incarnation.
pub async fn probe_free_port() -> io::Result<u16> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Base URL of an engine listening on `port`.
pub fn base_url(port: u16) -> String {
    format!("http://127.0.0.1:{port}")
}
