use std::fmt;

/// ServiceKind identifies which proxy protocol a service speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Http,
    Socks5,
}

/// ServiceKind implementation block
impl ServiceKind {
    /// label is the human-facing name used in log lines
    pub fn label(self) -> &'static str {
        match self {
            ServiceKind::Http => "HTTP",
            ServiceKind::Socks5 => "SOCKS5",
        }
    }

    /// scheme is the URL scheme operators configure their clients with.
    /// socks5h asks clients to resolve hostnames through the proxy
    pub fn scheme(self) -> &'static str {
        match self {
            ServiceKind::Http => "http",
            ServiceKind::Socks5 => "socks5h",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// ServiceSpec is the resolved, immutable description of one service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceSpec {
    pub kind: ServiceKind,
    /// None means the service is disabled, Some(0) asks for an ephemeral port
    pub port: Option<u16>,
}

/// ServiceSpec implementation block
impl ServiceSpec {
    pub fn new(kind: ServiceKind, port: Option<u16>) -> Self {
        Self { kind, port }
    }

    pub fn disabled(kind: ServiceKind) -> Self {
        Self { kind, port: None }
    }

    /// from_flag converts a command line port value: negative disables the
    /// service, anything above u16::MAX is rejected
    pub fn from_flag(kind: ServiceKind, value: i64) -> Result<Self, crate::ProxyError> {
        if value < 0 {
            return Ok(Self::disabled(kind));
        }

        let port =
            u16::try_from(value).map_err(|_| crate::ProxyError::InvalidPort { kind, value })?;

        Ok(Self::new(kind, Some(port)))
    }

    pub fn is_enabled(&self) -> bool {
        self.port.is_some()
    }
}

/// ServiceId names a launched service; ids are handed out in launch order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(pub(crate) usize);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// ServiceStatus is the lifecycle state of a single service.
///
/// A service moves `Stopped -> Launching -> Running -> Stopped`, or
/// `Stopped -> Launching -> Stopped` when the engine fails before it starts
/// serving. Nothing repeats or moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceStatus {
    #[default]
    Stopped,
    Launching,
    Running,
}

/// ServiceStatus implementation block
impl ServiceStatus {
    /// can_advance_to reports whether `next` is a legal transition from `self`.
    /// `started` tells an initial Stopped apart from a terminal one
    pub fn can_advance_to(self, next: ServiceStatus, started: bool) -> bool {
        matches!(
            (self, next, started),
            (ServiceStatus::Stopped, ServiceStatus::Launching, false)
                | (ServiceStatus::Launching, ServiceStatus::Running, _)
                | (ServiceStatus::Launching, ServiceStatus::Stopped, _)
                | (ServiceStatus::Running, ServiceStatus::Stopped, _)
        )
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Launching => "launching",
            ServiceStatus::Running => "running",
        };
        f.write_str(s)
    }
}

/// StopReason is the return condition of an engine's serve call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The listener was closed and the engine returned normally
    Closed,
    /// The engine failed to start or its serve call ended unexpectedly
    Failed(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Closed => f.write_str("listener closed"),
            StopReason::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

/// StatusEvent is one transition published by a service task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub id: ServiceId,
    pub status: ServiceStatus,
    /// Only set on the Stopped transition
    pub reason: Option<StopReason>,
}

/// StatusEvent implementation block
impl StatusEvent {
    pub fn launching(id: ServiceId) -> Self {
        Self {
            id,
            status: ServiceStatus::Launching,
            reason: None,
        }
    }

    pub fn running(id: ServiceId) -> Self {
        Self {
            id,
            status: ServiceStatus::Running,
            reason: None,
        }
    }

    pub fn stopped(id: ServiceId, reason: StopReason) -> Self {
        Self {
            id,
            status: ServiceStatus::Stopped,
            reason: Some(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_flag_disables_service() {
        let spec = ServiceSpec::from_flag(ServiceKind::Http, -1).unwrap();
        assert!(!spec.is_enabled());
    }

    #[test]
    fn zero_flag_requests_ephemeral_port() {
        let spec = ServiceSpec::from_flag(ServiceKind::Socks5, 0).unwrap();
        assert_eq!(spec.port, Some(0));
    }

    #[test]
    fn out_of_range_flag_is_rejected() {
        assert!(ServiceSpec::from_flag(ServiceKind::Http, 70_000).is_err());
    }

    #[test]
    fn legal_transitions() {
        use ServiceStatus::*;

        assert!(Stopped.can_advance_to(Launching, false));
        assert!(Launching.can_advance_to(Running, true));
        assert!(Launching.can_advance_to(Stopped, true));
        assert!(Running.can_advance_to(Stopped, true));
    }

    #[test]
    fn illegal_transitions() {
        use ServiceStatus::*;

        // Launching is never skipped
        assert!(!Stopped.can_advance_to(Running, false));
        // terminal Stopped never restarts
        assert!(!Stopped.can_advance_to(Launching, true));
        assert!(!Running.can_advance_to(Launching, true));
        assert!(!Running.can_advance_to(Running, true));
        assert!(!Launching.can_advance_to(Launching, true));
    }

    #[test]
    fn schemes_match_client_conventions() {
        assert_eq!(ServiceKind::Http.scheme(), "http");
        assert_eq!(ServiceKind::Socks5.scheme(), "socks5h");
    }
}
