//! HTTP forward proxy engine.
//!
//! `CONNECT host:port` requests are tunnelled after a `200 Connection
//! Established` answer. Absolute-form requests (`GET http://host/path`) are
//! rewritten to origin form and relayed to the target with `Connection: close`
//! so each client connection carries exactly one upstream exchange.

use super::{ProxyEngine, ServeFuture, serve_connections};
use crate::{listener::Listener, service::ServiceKind};
use anyhow::{Result, anyhow, bail};
use tokio::{
    io::{
        AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader,
        copy_bidirectional,
    },
    net::TcpStream,
};
use tracing::debug;
use url::{Host, Url};

/// Upper bound on the size of a request head
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// How much of a rejected line is quoted back in errors
const QUOTE_CHARS: usize = 80;

/// Headers that only concern the hop between client and proxy
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authorization",
    "proxy-authenticate",
    "te",
    "trailer",
    "upgrade",
];

/// HttpEngine serves HTTP proxy clients on a listener
#[derive(Debug, Default, Clone)]
pub struct HttpEngine;

impl HttpEngine {
    pub fn new() -> Self {
        Self
    }
}

impl ProxyEngine for HttpEngine {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Http
    }

    fn serve(&self, listener: Listener) -> Result<ServeFuture> {
        Ok(Box::pin(serve_connections(
            listener,
            ServiceKind::Http,
            |stream, _peer| handle_client(stream),
        )))
    }
}

/// RequestHead is the request line plus headers of one proxied request
#[derive(Debug, Clone, PartialEq)]
struct RequestHead {
    method: String,
    target: String,
    version: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// handle_client reads one request head and dispatches on the method
async fn handle_client(stream: TcpStream) -> Result<()> {
    let mut client = BufReader::new(stream);

    let head = match read_request_head(&mut client).await {
        Ok(Some(head)) => head,
        Ok(None) => return Ok(()),
        Err(e) => {
            send_error_response(client.get_mut(), 400, "Bad Request").await?;
            return Err(e);
        }
    };

    debug!("HTTP proxy: {} {}", head.method, head.target);

    if head.method.eq_ignore_ascii_case("CONNECT") {
        tunnel(client, &head).await
    } else {
        forward(client, &head).await
    }
}

/// read_request_head reads up to the blank line ending the head, never
/// consuming more than MAX_HEAD_BYTES. Returns Ok(None) if the client closed
/// before sending anything
async fn read_request_head<R>(client: &mut R) -> Result<Option<RequestHead>>
where
    R: AsyncBufRead + Unpin,
{
    let mut limited = client.take(MAX_HEAD_BYTES as u64);

    let mut request_line = String::new();
    if limited.read_line(&mut request_line).await? == 0 {
        return Ok(None);
    }
    ensure_complete_line(&request_line, limited.limit())?;

    let (method, target, version) = parse_request_line(&request_line)?;
    let mut head = RequestHead {
        method,
        target,
        version,
        headers: Vec::new(),
    };

    loop {
        let mut line = String::new();
        limited.read_line(&mut line).await?;
        ensure_complete_line(&line, limited.limit())?;

        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }

        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| anyhow!("malformed header line: {}", quote(line)))?;
        head.headers
            .push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(Some(head))
}

/// ensure_complete_line rejects a line cut short by the size cap or by the
/// client going away
fn ensure_complete_line(line: &str, remaining: u64) -> Result<()> {
    if line.ends_with('\n') {
        Ok(())
    } else if remaining == 0 {
        bail!("request head exceeds {MAX_HEAD_BYTES} bytes")
    } else {
        bail!("connection closed inside request head")
    }
}

/// quote shortens client-supplied text for error messages
fn quote(line: &str) -> &str {
    match line.char_indices().nth(QUOTE_CHARS) {
        Some((end, _)) => &line[..end],
        None => line,
    }
}

/// parse_request_line splits `METHOD SP TARGET SP VERSION`
fn parse_request_line(line: &str) -> Result<(String, String, String)> {
    let mut parts = line.split_whitespace();

    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version), None) if version.starts_with("HTTP/") => {
            Ok((method.to_string(), target.to_string(), version.to_string()))
        }
        _ => Err(anyhow!("invalid request line: {}", quote(line.trim_end()))),
    }
}

/// tunnel handles CONNECT by splicing the client to the target
async fn tunnel(mut client: BufReader<TcpStream>, head: &RequestHead) -> Result<()> {
    let mut upstream = match TcpStream::connect(head.target.as_str()).await {
        Ok(upstream) => upstream,
        Err(e) => {
            send_error_response(client.get_mut(), 502, "Bad Gateway").await?;
            return Err(anyhow!("CONNECT to {} failed: {}", head.target, e));
        }
    };

    client
        .get_mut()
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;

    // bytes the client pipelined after the head are still in the BufReader
    // and are flushed upstream first
    let (from_client, from_server) = copy_bidirectional(&mut client, &mut upstream).await?;

    debug!(
        "CONNECT {} closed: {} bytes from client, {} bytes from server",
        head.target, from_client, from_server
    );

    Ok(())
}

/// forward relays a single absolute-form request to its origin server
async fn forward(mut client: BufReader<TcpStream>, head: &RequestHead) -> Result<()> {
    let url = match Url::parse(&head.target) {
        Ok(url) if url.scheme() == "http" => url,
        _ => {
            send_error_response(client.get_mut(), 400, "Bad Request").await?;
            bail!("not a proxy request: {}", head.target);
        }
    };

    let port = url.port_or_known_default().unwrap_or(80);
    let dialed = match url.host() {
        Some(Host::Domain(domain)) => TcpStream::connect((domain, port)).await,
        Some(Host::Ipv4(ip)) => TcpStream::connect((ip, port)).await,
        Some(Host::Ipv6(ip)) => TcpStream::connect((ip, port)).await,
        None => {
            send_error_response(client.get_mut(), 400, "Bad Request").await?;
            bail!("request target has no host: {}", head.target);
        }
    };

    let mut upstream = match dialed {
        Ok(upstream) => upstream,
        Err(e) => {
            send_error_response(client.get_mut(), 502, "Bad Gateway").await?;
            return Err(anyhow!("connect to {} failed: {}", url, e));
        }
    };

    upstream
        .write_all(origin_request(head, &url).as_bytes())
        .await?;

    let (from_client, from_server) = copy_bidirectional(&mut client, &mut upstream).await?;

    debug!(
        "{} {} done: {} bytes from client, {} bytes from server",
        head.method, url, from_client, from_server
    );

    Ok(())
}

/// origin_request rebuilds the request head in origin form for the target
fn origin_request(head: &RequestHead, url: &Url) -> String {
    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }

    let mut out = format!("{} {} {}\r\n", head.method, path, head.version);

    if head.header("host").is_none() {
        let host = url.host_str().unwrap_or_default();
        match url.port() {
            Some(port) => out.push_str(&format!("Host: {host}:{port}\r\n")),
            None => out.push_str(&format!("Host: {host}\r\n")),
        }
    }

    for (name, value) in &head.headers {
        if HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        out.push_str(&format!("{name}: {value}\r\n"));
    }

    out.push_str("Connection: close\r\n\r\n");
    out
}

/// send_error_response writes a bodiless error status
async fn send_error_response(stream: &mut TcpStream, code: u16, message: &str) -> Result<()> {
    let response =
        format!("HTTP/1.1 {code} {message}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}
