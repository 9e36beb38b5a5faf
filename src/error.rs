use crate::service::ServiceKind;
use std::{io, net::SocketAddr, time::Duration};
use thiserror::Error;

/// ProxyError covers the failures the orchestrator reports to its caller.
/// Per-connection engine errors never reach this type
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Binding a listener failed. Fatal for the whole process
    #[error("failed to bind {kind} proxy on {addr}: {source}")]
    Bind {
        kind: ServiceKind,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("invalid {kind} port {value}: must be between 0 and 65535, or negative to disable")]
    InvalidPort { kind: ServiceKind, value: i64 },

    #[error("shutdown timed out after {waited:?} with {remaining} service(s) still running")]
    ShutdownTimeout { waited: Duration, remaining: usize },

    #[error("every proxy service stopped on its own")]
    AllServicesStopped,
}
