//! Launches HTTP and SOCKS5 forward proxies and reports where to reach them
//!
//! - One listener and one task per enabled proxy
//! - Each proxy moves through `Launching -> Running -> Stopped`, published as
//!   status events to a single control loop
//! - On `Running`, every global IPv6 address of the host is logged as a
//!   ready-to-use proxy URL (`http://[addr]:port`, `socks5h://[addr]:port`)
//! - Ctrl-C / SIGTERM closes every listener and waits for the proxies to stop
//!
//! # Example
//! ```no_run
//! use std::time::Duration;
//! use v6proxy::{Args, Orchestrator, ShutdownCoordinator, shutdown};
//! use clap::Parser;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = Args::parse_from(["v6proxy", "--socks5-port", "1080"]);
//!     let config = args.resolve()?.expect("one service enabled");
//!
//!     let mut orchestrator = Orchestrator::start(&config).await?;
//!     let coordinator = ShutdownCoordinator::new(Some(Duration::from_secs(10)));
//!     orchestrator.run(shutdown::interrupt(), &coordinator).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod listener;
pub mod orchestrator;
pub mod reporter;
pub mod service;
pub mod shutdown;

// Re-export main types at crate root for convenience
pub use config::{Args, ProxyConfig};
pub use engine::{ProxyEngine, ServeFuture};
pub use error::ProxyError;
pub use listener::{CloseHandle, Listener};
pub use orchestrator::{Orchestrator, ServiceHandle};
pub use service::{ServiceId, ServiceKind, ServiceSpec, ServiceStatus, StatusEvent, StopReason};
pub use shutdown::ShutdownCoordinator;
