//! Proxy engines.
//!
//! An engine takes ownership of a bound [`Listener`] and serves connections on
//! it until the listener is closed (the serve future resolves `Ok`) or an
//! accept error that cannot be retried occurs (`Err`).

pub mod http;
pub mod socks5;

pub use http::HttpEngine;
pub use socks5::Socks5Engine;

use crate::{listener::Listener, service::ServiceKind};
use anyhow::Result;
use std::{future::Future, io, net::SocketAddr, pin::Pin, sync::Arc, time::Duration};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

/// ServeFuture is the long-running half of an engine's serve call
pub type ServeFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

/// ProxyEngine is the seam between the orchestrator and a proxy protocol
pub trait ProxyEngine: Send + Sync {
    fn kind(&self) -> ServiceKind;

    /// serve prepares the engine for `listener` and returns the future that
    /// runs the accept loop. An Err here means the engine never started
    /// serving
    fn serve(&self, listener: Listener) -> Result<ServeFuture>;
}

/// engine_for returns the built-in engine for a service kind
pub fn engine_for(kind: ServiceKind) -> Arc<dyn ProxyEngine> {
    match kind {
        ServiceKind::Http => Arc::new(HttpEngine::new()),
        ServiceKind::Socks5 => Arc::new(Socks5Engine::new()),
    }
}

/// serve_connections runs the accept loop shared by the built-in engines.
/// Each connection is handed to `handler` in its own task; connections still
/// in flight when the listener closes are left to finish on their own
pub async fn serve_connections<H, F>(
    mut listener: Listener,
    kind: ServiceKind,
    handler: H,
) -> Result<()>
where
    H: Fn(TcpStream, SocketAddr) -> F + Send + Sync + 'static,
    F: Future<Output = Result<()>> + Send + 'static,
{
    let local_addr = listener.local_addr();
    info!("{} proxy accepting on {}", kind, local_addr);

    loop {
        let (inbound, peer_addr) = match listener.accept().await {
            Ok(Some(accepted)) => accepted,
            Ok(None) => {
                debug!("{} proxy on {} stopped accepting", kind, local_addr);
                return Ok(());
            }
            Err(e) if is_transient(&e) => {
                warn!("{} proxy accept error, retrying: {}", kind, e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        debug!("{} proxy: new client {}", kind, peer_addr);

        let conn = handler(inbound, peer_addr);
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                error!("{} proxy connection error ({}): {:#}", kind, peer_addr, e);
            }
        });
    }
}

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// is_transient picks out accept errors that only affect a single
/// connection attempt or a momentary resource shortage
fn is_transient(e: &io::Error) -> bool {
    use io::ErrorKind::*;

    matches!(
        e.kind(),
        ConnectionAborted | ConnectionReset | Interrupted | WouldBlock | TimedOut
    ) || is_fd_exhaustion(e)
}

// Per-process and system-wide file descriptor limits
#[cfg(unix)]
const EMFILE: i32 = 24;
#[cfg(unix)]
const ENFILE: i32 = 23;

#[cfg(unix)]
fn is_fd_exhaustion(e: &io::Error) -> bool {
    e.raw_os_error()
        .is_some_and(|code| code == EMFILE || code == ENFILE)
}

#[cfg(not(unix))]
fn is_fd_exhaustion(_e: &io::Error) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn serve_connections_returns_ok_on_close() {
        let (listener, handle) = listener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr();

        let serve = tokio::spawn(serve_connections(
            listener,
            ServiceKind::Http,
            |mut stream: TcpStream, _| async move {
                stream.write_all(b"hi").await?;
                Ok::<(), anyhow::Error>(())
            },
        ));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        handle.close();
        serve.await.unwrap().unwrap();

        // port is free again
        tokio::net::TcpListener::bind(addr).await.unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn fd_exhaustion_is_transient() {
        assert!(is_transient(&io::Error::from_raw_os_error(EMFILE)));
        assert!(is_transient(&io::Error::from_raw_os_error(ENFILE)));
    }

    #[test]
    fn permission_errors_are_fatal() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }
}
