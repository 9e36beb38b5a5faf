//! Listener lifecycle orchestration.
//!
//! The orchestrator binds one listener per enabled service, runs each engine
//! in its own task and keeps a [`ServiceHandle`] per service. Service tasks
//! never touch their handle: they only publish [`StatusEvent`]s, and the
//! single control loop ([`Orchestrator::next_event`]) applies them. Closing a
//! listener happens only from that loop, either through [`request_stop`] or
//! when a service reports that it stopped on its own.
//!
//! [`request_stop`]: Orchestrator::request_stop

use crate::{
    ProxyError,
    config::ProxyConfig,
    engine::{ProxyEngine, engine_for},
    listener::{self, CloseHandle, Listener},
    reporter::{AddressSource, discover_reachable_addresses, render_connection_url},
    service::{ServiceId, ServiceKind, ServiceSpec, ServiceStatus, StatusEvent, StopReason},
    shutdown::ShutdownCoordinator,
};
use std::{
    fmt::Display,
    future::Future,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinSet};
use tracing::{debug, error, info, warn};

/// Each service publishes at most three events, so this only has to absorb
/// bursts while the control loop is busy
const EVENT_BUFFER: usize = 64;

/// ServiceHandle is the orchestrator's record of one launched service
#[derive(Debug)]
pub struct ServiceHandle {
    spec: ServiceSpec,
    close: CloseHandle,
    status: ServiceStatus,
    /// Set once the service has left its initial Stopped state
    started: bool,
    stop_requested: bool,
    stop_reason: Option<StopReason>,
    history: Vec<ServiceStatus>,
    connection_urls: Vec<String>,
}

impl ServiceHandle {
    fn new(spec: ServiceSpec, close: CloseHandle) -> Self {
        Self {
            spec,
            close,
            status: ServiceStatus::Stopped,
            started: false,
            stop_requested: false,
            stop_reason: None,
            history: Vec::new(),
            connection_urls: Vec::new(),
        }
    }

    pub fn spec(&self) -> ServiceSpec {
        self.spec
    }

    pub fn kind(&self) -> ServiceKind {
        self.spec.kind
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.close.local_addr()
    }

    pub fn status(&self) -> ServiceStatus {
        self.status
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    pub fn stop_reason(&self) -> Option<&StopReason> {
        self.stop_reason.as_ref()
    }

    /// history lists every transition applied so far, in order
    pub fn history(&self) -> &[ServiceStatus] {
        &self.history
    }

    /// connection_urls are the URLs reported when the service went Running
    pub fn connection_urls(&self) -> &[String] {
        &self.connection_urls
    }

    /// is_finished is true once the service reached its terminal Stopped
    pub fn is_finished(&self) -> bool {
        self.started && self.status == ServiceStatus::Stopped
    }
}

/// Orchestrator owns every service handle and drives their lifecycle
pub struct Orchestrator {
    bind_ip: IpAddr,
    services: Vec<ServiceHandle>,
    events_tx: mpsc::Sender<StatusEvent>,
    events: mpsc::Receiver<StatusEvent>,
    tasks: JoinSet<()>,
    addresses: AddressSource,
    shutdown_started: bool,
}

/// Orchestrator implementation block
impl Orchestrator {
    /// new creates an orchestrator whose listeners bind on `bind_ip`
    pub fn new(bind_ip: IpAddr) -> Self {
        let (events_tx, events) = mpsc::channel(EVENT_BUFFER);

        Self {
            bind_ip,
            services: Vec::new(),
            events_tx,
            events,
            tasks: JoinSet::new(),
            addresses: discover_reachable_addresses,
            shutdown_started: false,
        }
    }

    /// with_address_source replaces interface enumeration for the URLs
    /// reported on Running
    pub fn with_address_source(mut self, addresses: AddressSource) -> Self {
        self.addresses = addresses;
        self
    }

    /// start launches every enabled service of `config` with its built-in
    /// engine. The first bind failure aborts startup; listeners bound so far
    /// are released when the partially built orchestrator is dropped
    pub async fn start(config: &ProxyConfig) -> Result<Self, ProxyError> {
        let mut orchestrator = Self::new(config.bind_ip);

        for spec in &config.services {
            orchestrator.launch(*spec, engine_for(spec.kind)).await?;
        }

        Ok(orchestrator)
    }

    /// launch binds a listener for `spec` and spawns its service task.
    /// Returns Ok(None) for a disabled spec
    pub async fn launch(
        &mut self,
        spec: ServiceSpec,
        engine: Arc<dyn ProxyEngine>,
    ) -> Result<Option<ServiceId>, ProxyError> {
        let Some(port) = spec.port else {
            debug!("{} proxy disabled", spec.kind);
            return Ok(None);
        };

        if engine.kind() != spec.kind {
            warn!(
                "{} proxy launched with a {} engine",
                spec.kind,
                engine.kind()
            );
        }

        let addr = SocketAddr::new(self.bind_ip, port);
        let (listener, close) = listener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind {
                kind: spec.kind,
                addr,
                source,
            })?;

        let id = ServiceId(self.services.len());
        self.services.push(ServiceHandle::new(spec, close));
        self.tasks
            .spawn(run_service(id, listener, engine, self.events_tx.clone()));

        Ok(Some(id))
    }

    pub fn service(&self, id: ServiceId) -> Option<&ServiceHandle> {
        self.services.get(id.0)
    }

    pub fn services(&self) -> impl Iterator<Item = (ServiceId, &ServiceHandle)> {
        self.services
            .iter()
            .enumerate()
            .map(|(i, handle)| (ServiceId(i), handle))
    }

    pub fn local_addr(&self, id: ServiceId) -> Option<SocketAddr> {
        self.service(id).map(ServiceHandle::local_addr)
    }

    pub fn status(&self, id: ServiceId) -> Option<ServiceStatus> {
        self.service(id).map(ServiceHandle::status)
    }

    /// active counts services that have not reached their terminal Stopped
    pub fn active(&self) -> usize {
        self.services.iter().filter(|s| !s.is_finished()).count()
    }

    /// request_stop marks the service and closes its listener. Calling it
    /// again, or after the service stopped on its own, does nothing
    pub fn request_stop(&mut self, id: ServiceId) {
        let Some(handle) = self.services.get_mut(id.0) else {
            warn!("stop requested for unknown service {}", id);
            return;
        };

        if handle.is_finished() {
            return;
        }

        handle.stop_requested = true;
        if handle.close.close() {
            debug!("{} proxy stop requested", handle.kind());
        }
    }

    pub fn request_stop_all(&mut self) {
        for i in 0..self.services.len() {
            self.request_stop(ServiceId(i));
        }
    }

    /// next_event waits for the next status transition, applies it and
    /// returns it. Transitions that would break the state order are logged
    /// and skipped
    pub async fn next_event(&mut self) -> Option<StatusEvent> {
        loop {
            let event = self.events.recv().await?;
            if self.apply(&event) {
                return Some(event);
            }
        }
    }

    /// await_all_stopped drains events until every service is finished.
    /// With a timeout, gives up once it expires
    pub async fn await_all_stopped(&mut self, timeout: Option<Duration>) -> Result<(), ProxyError> {
        let wait = async {
            while self.active() > 0 {
                if self.next_event().await.is_none() {
                    break;
                }
            }
        };

        match timeout {
            None => {
                wait.await;
                Ok(())
            }
            Some(limit) => {
                if tokio::time::timeout(limit, wait).await.is_ok() {
                    return Ok(());
                }

                // engines that ignored the close are cancelled so their
                // listeners are dropped
                let remaining = self.active();
                self.tasks.abort_all();

                Err(ProxyError::ShutdownTimeout {
                    waited: limit,
                    remaining,
                })
            }
        }
    }

    /// run is the control loop: it applies status events until `interrupt`
    /// resolves, then hands over to the shutdown coordinator. Returns an
    /// error if every service stops before any interrupt arrives
    pub async fn run<F>(
        &mut self,
        interrupt: F,
        coordinator: &ShutdownCoordinator,
    ) -> Result<(), ProxyError>
    where
        F: Future,
        F::Output: Display,
    {
        tokio::pin!(interrupt);

        loop {
            tokio::select! {
                reason = &mut interrupt => {
                    return coordinator.shutdown(self, &reason.to_string()).await;
                }
                event = self.next_event() => {
                    if event.is_none() || self.active() == 0 {
                        return Err(ProxyError::AllServicesStopped);
                    }
                }
            }
        }
    }

    /// begin_shutdown flips the one-shot shutdown flag. Only the first call
    /// returns true
    pub(crate) fn begin_shutdown(&mut self) -> bool {
        !std::mem::replace(&mut self.shutdown_started, true)
    }

    fn apply(&mut self, event: &StatusEvent) -> bool {
        let Some(handle) = self.services.get_mut(event.id.0) else {
            warn!("status event for unknown service {}", event.id);
            return false;
        };

        if !handle.status.can_advance_to(event.status, handle.started) {
            warn!(
                "{} proxy: ignoring transition {} -> {}",
                handle.kind(),
                handle.status,
                event.status
            );
            return false;
        }

        handle.status = event.status;
        handle.started = true;
        handle.history.push(event.status);

        let kind = handle.kind();
        match event.status {
            ServiceStatus::Launching => info!("{} proxy server launching...", kind),
            ServiceStatus::Running => {
                handle.connection_urls = report_running(kind, handle.local_addr(), self.addresses);
            }
            ServiceStatus::Stopped => {
                handle.close.close();
                handle.stop_reason = event.reason.clone();

                match &event.reason {
                    Some(StopReason::Failed(e)) => error!("{} proxy server stopped: {}", kind, e),
                    _ if handle.stop_requested => info!("{} proxy server stopped", kind),
                    _ => warn!("{} proxy server stopped without a stop request", kind),
                }

                while self.tasks.try_join_next().is_some() {}
            }
        }

        true
    }
}

/// report_running logs and returns one connection URL per reachable
/// address. An enumeration failure only loses the URLs
fn report_running(
    kind: ServiceKind,
    local_addr: SocketAddr,
    addresses: AddressSource,
) -> Vec<String> {
    info!("{} proxy server started on {}", kind, local_addr);

    let urls: Vec<String> = match addresses() {
        Ok(addrs) => addrs
            .iter()
            .map(|addr| render_connection_url(kind.scheme(), addr, local_addr.port()))
            .collect(),
        Err(e) => {
            warn!("{} proxy: failed to list network interfaces: {}", kind, e);
            return Vec::new();
        }
    };

    if urls.is_empty() {
        info!("{} proxy: no global IPv6 address found", kind);
    }
    for url in &urls {
        info!("{}", url);
    }

    urls
}

/// run_service is the body of one service task. It publishes Launching,
/// Running as soon as the engine owns the listener, and Stopped with the
/// serve outcome. Sends only fail once the orchestrator is gone, at which
/// point nobody is listening
async fn run_service(
    id: ServiceId,
    listener: Listener,
    engine: Arc<dyn ProxyEngine>,
    events: mpsc::Sender<StatusEvent>,
) {
    let _ = events.send(StatusEvent::launching(id)).await;

    let serve = match engine.serve(listener) {
        Ok(serve) => serve,
        Err(e) => {
            let reason = StopReason::Failed(format!("{e:#}"));
            let _ = events.send(StatusEvent::stopped(id, reason)).await;
            return;
        }
    };

    let _ = events.send(StatusEvent::running(id)).await;

    // A nested task turns an engine panic into a Stopped event. It lives in
    // a JoinSet so aborting this task also cancels the engine
    let mut serving = JoinSet::new();
    serving.spawn(serve);

    let reason = match serving.join_next().await {
        Some(Ok(Ok(()))) => StopReason::Closed,
        Some(Ok(Err(e))) => StopReason::Failed(format!("{e:#}")),
        Some(Err(e)) if e.is_panic() => StopReason::Failed("serve task panicked".to_string()),
        Some(Err(e)) => StopReason::Failed(e.to_string()),
        None => StopReason::Failed("serve task missing".to_string()),
    };

    let _ = events.send(StatusEvent::stopped(id, reason)).await;
}
