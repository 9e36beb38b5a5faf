//! Closable TCP listener.
//!
//! A tokio `TcpListener` cannot be closed from outside the task that is
//! accepting on it, so every bound socket is paired with a [`CloseHandle`].
//! The engine owns the [`Listener`] and accepts on it; the orchestrator keeps
//! the handle. Closing the handle wakes any pending `accept` which then
//! returns `None`, and the engine drops the socket, releasing the port.

use std::{io, net::SocketAddr};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
};
use tracing::debug;

/// bind opens a listening socket on `addr` and returns both halves
pub async fn bind(addr: SocketAddr) -> io::Result<(Listener, CloseHandle)> {
    let inner = TcpListener::bind(addr).await?;
    let local_addr = inner.local_addr()?;
    let (tx, rx) = watch::channel(false);

    debug!("listener bound on {}", local_addr);

    Ok((
        Listener {
            inner,
            local_addr,
            closed: rx,
        },
        CloseHandle { tx, local_addr },
    ))
}

/// Listener is the exclusively-owned accepting half of a bound endpoint
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
    closed: watch::Receiver<bool>,
}

/// Listener implementation block
impl Listener {
    /// accept waits for the next inbound connection. Returns Ok(None) once
    /// the listener has been closed (or its handle dropped)
    pub async fn accept(&mut self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        if self.is_closed() {
            return Ok(None);
        }

        tokio::select! {
            biased;
            _ = wait_closed(&mut self.closed) => Ok(None),
            accepted = self.inner.accept() => accepted.map(Some),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.closed.has_changed().is_err()
    }
}

/// wait_closed resolves when the close flag is raised or the sender is gone
async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// CloseHandle is the orchestrator's side of a Listener
#[derive(Debug)]
pub struct CloseHandle {
    tx: watch::Sender<bool>,
    local_addr: SocketAddr,
}

/// CloseHandle implementation block
impl CloseHandle {
    /// close signals the listener to stop accepting. Returns true only for
    /// the call that actually closed it; later calls are no-ops
    pub fn close(&self) -> bool {
        let was_closed = self.tx.send_replace(true);
        if !was_closed {
            debug!("listener on {} closed", self.local_addr);
        }
        !was_closed
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn loopback() -> (Listener, CloseHandle) {
        bind("127.0.0.1:0".parse().unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn accepts_connections_until_closed() {
        let (mut listener, handle) = loopback().await;
        let addr = listener.local_addr();

        let client = tokio::spawn(async move { TcpStream::connect(addr).await });
        let accepted = listener.accept().await.unwrap();
        assert!(accepted.is_some());
        client.await.unwrap().unwrap();

        assert!(handle.close());
        assert!(listener.accept().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_wakes_pending_accept() {
        let (mut listener, handle) = loopback().await;

        let pending = tokio::spawn(async move { listener.accept().await.map(|c| c.is_none()) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.close();

        let woke = timeout(Duration::from_secs(2), pending).await.unwrap();
        assert!(woke.unwrap().unwrap());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (_listener, handle) = loopback().await;

        assert!(handle.close());
        assert!(!handle.close());
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn dropping_handle_closes_listener() {
        let (mut listener, handle) = loopback().await;
        drop(handle);

        assert!(listener.is_closed());
        assert!(listener.accept().await.unwrap().is_none());
    }
}
