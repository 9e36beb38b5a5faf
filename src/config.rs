use crate::{
    ProxyError,
    service::{ServiceKind, ServiceSpec},
};
use clap::{CommandFactory, Parser};
use std::{
    io,
    net::{IpAddr, Ipv6Addr},
    time::Duration,
};

const USAGE_EXAMPLES: &str = "Usage:
  v6proxy --http-port 1087
  v6proxy --socks5-port 1080
  v6proxy --http-port 1087 --socks5-port 1080
";

#[derive(Parser, Debug)]
#[command(author, version, about = "HTTP and SOCKS5 proxies reachable over global IPv6", long_about = None)]
pub struct Args {
    /// HTTP proxy port (0 picks a free port, negative disables)
    #[arg(
        long,
        visible_alias = "httpPort",
        value_name = "PORT",
        default_value_t = -1,
        allow_negative_numbers = true
    )]
    pub http_port: i64,

    /// SOCKS5 proxy port (0 picks a free port, negative disables)
    #[arg(
        long,
        visible_alias = "socks5Port",
        value_name = "PORT",
        default_value_t = -1,
        allow_negative_numbers = true
    )]
    pub socks5_port: i64,

    /// Address every proxy listens on
    #[arg(short, long, default_value_t = IpAddr::V6(Ipv6Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Seconds to wait for the proxies to stop after an interrupt (0 waits forever)
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    pub shutdown_timeout: u64,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// ProxyConfig is the resolved startup configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyConfig {
    pub bind_ip: IpAddr,
    /// Only enabled services are kept
    pub services: Vec<ServiceSpec>,
    pub shutdown_timeout: Option<Duration>,
}

/// Args implementation block
impl Args {
    /// resolve validates the flags. Returns Ok(None) when no service is
    /// enabled, in which case nothing should be bound
    pub fn resolve(&self) -> Result<Option<ProxyConfig>, ProxyError> {
        let services: Vec<ServiceSpec> = [
            ServiceSpec::from_flag(ServiceKind::Http, self.http_port)?,
            ServiceSpec::from_flag(ServiceKind::Socks5, self.socks5_port)?,
        ]
        .into_iter()
        .filter(ServiceSpec::is_enabled)
        .collect();

        if services.is_empty() {
            return Ok(None);
        }

        let shutdown_timeout =
            (self.shutdown_timeout > 0).then(|| Duration::from_secs(self.shutdown_timeout));

        Ok(Some(ProxyConfig {
            bind_ip: self.bind,
            services,
            shutdown_timeout,
        }))
    }
}

/// print_usage writes the examples followed by the full flag help
pub fn print_usage() -> io::Result<()> {
    println!("{USAGE_EXAMPLES}");
    Args::command().print_help()
}
