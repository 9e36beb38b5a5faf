//! SOCKS5 proxy engine
//!
//! - CONNECT to IPv4, IPv6 and domain targets
//! - No authentication
//! - BIND and UDP ASSOCIATE are refused with "command not supported"
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)

pub mod address;
pub mod commands;
pub mod handshake;
pub mod protocol;

use super::{ProxyEngine, ServeFuture, serve_connections};
use crate::{listener::Listener, service::ServiceKind};
use anyhow::Result;
use tokio::{io::copy_bidirectional, net::TcpStream};
use tracing::debug;

/// Socks5Engine serves SOCKS5 clients on a listener
#[derive(Debug, Default, Clone)]
pub struct Socks5Engine;

/// Socks5Engine implementation block
impl Socks5Engine {
    pub fn new() -> Self {
        Self
    }
}

impl ProxyEngine for Socks5Engine {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Socks5
    }

    fn serve(&self, listener: Listener) -> Result<ServeFuture> {
        Ok(Box::pin(serve_connections(
            listener,
            ServiceKind::Socks5,
            |stream, _peer| handle_connection(stream),
        )))
    }
}

/// handle_connection runs the full client/server SOCKS5 flow for one client
async fn handle_connection(mut inbound: TcpStream) -> Result<()> {
    handshake::negotiate_method(&mut inbound).await?;

    let mut outbound = commands::handle_request(&mut inbound).await?;

    let (from_client, from_server) = copy_bidirectional(&mut inbound, &mut outbound).await?;

    debug!(
        "SOCKS5 connection closed: {} bytes from client, {} bytes from server",
        from_client, from_server
    );

    Ok(())
}
