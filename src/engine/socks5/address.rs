use super::protocol::{AddressType, ReplyCode};
use anyhow::Result;
use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
};
use tokio::io::{AsyncRead, AsyncReadExt};

/// TargetAddr is the destination a client asked the proxy to reach
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{addr}"),
            TargetAddr::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

/// read_target_address parses ATYP | DST.ADDR | DST.PORT from a request.
/// A well-framed but unusable address yields the reply code to refuse it
/// with; Err is left for I/O failures
pub async fn read_target_address<R>(stream: &mut R) -> Result<Result<TargetAddr, ReplyCode>>
where
    R: AsyncRead + Unpin,
{
    let atyp = stream.read_u8().await?;

    let target = match AddressType::from_byte(atyp) {
        Some(AddressType::IPv4) => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;

            TargetAddr::Ip(SocketAddr::from((Ipv4Addr::from(octets), port)))
        }
        Some(AddressType::DomainName) => {
            // First octet holds the number of name octets that follow
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            let port = stream.read_u16().await?;

            match String::from_utf8(name) {
                Ok(host) if !host.is_empty() => TargetAddr::Domain(host, port),
                _ => return Ok(Err(ReplyCode::ServerFailure)),
            }
        }
        Some(AddressType::IPv6) => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;

            TargetAddr::Ip(SocketAddr::from((Ipv6Addr::from(octets), port)))
        }
        None => return Ok(Err(ReplyCode::AddrTypeUnsupported)),
    };

    Ok(Ok(target))
}

/// encode_bound_address appends ATYP | BND.ADDR | BND.PORT for a reply
pub fn encode_bound_address(buf: &mut Vec<u8>, addr: SocketAddr) {
    match addr {
        SocketAddr::V4(addr) => {
            buf.push(AddressType::IPv4 as u8);
            buf.extend_from_slice(&addr.ip().octets());
        }
        SocketAddr::V6(addr) => {
            buf.push(AddressType::IPv6 as u8);
            buf.extend_from_slice(&addr.ip().octets());
        }
    }
    buf.extend_from_slice(&addr.port().to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_domain_target() {
        let mut req: &[u8] = &[0x03, 11, b'e', b'x', b'a', b'm', b'p', b'l', b'e', b'.', b'o', b'r', b'g', 0x01, 0xBB];
        let target = read_target_address(&mut req).await.unwrap();
        assert_eq!(target, Ok(TargetAddr::Domain("example.org".into(), 443)));
    }

    #[tokio::test]
    async fn reads_ipv6_target() {
        let mut req = vec![0x04];
        req.extend_from_slice(&"2001:db8::1".parse::<Ipv6Addr>().unwrap().octets());
        req.extend_from_slice(&80u16.to_be_bytes());

        let target = read_target_address(&mut req.as_slice()).await.unwrap();
        assert_eq!(target, Ok(TargetAddr::Ip("[2001:db8::1]:80".parse().unwrap())));
    }

    #[tokio::test]
    async fn unknown_address_type_is_not_an_error() {
        let mut req: &[u8] = &[0x09];
        assert_eq!(
            read_target_address(&mut req).await.unwrap(),
            Err(ReplyCode::AddrTypeUnsupported)
        );
    }

    #[tokio::test]
    async fn empty_domain_is_refused() {
        let mut req: &[u8] = &[0x03, 0, 0x00, 0x50];
        assert_eq!(
            read_target_address(&mut req).await.unwrap(),
            Err(ReplyCode::ServerFailure)
        );
    }

    #[tokio::test]
    async fn non_utf8_domain_is_refused_after_full_read() {
        let mut req: &[u8] = &[0x03, 2, 0xC3, 0x28, 0x00, 0x50, 0xAA];
        assert_eq!(
            read_target_address(&mut req).await.unwrap(),
            Err(ReplyCode::ServerFailure)
        );
        assert_eq!(req, b"\xAA");
    }

    #[tokio::test]
    async fn short_read_is_an_error() {
        let mut req: &[u8] = &[0x01, 127, 0];
        assert!(read_target_address(&mut req).await.is_err());
    }

    #[test]
    fn encodes_ipv4_bound_address() {
        let mut buf = Vec::new();
        encode_bound_address(&mut buf, "10.0.0.1:1080".parse().unwrap());
        assert_eq!(buf, vec![0x01, 10, 0, 0, 1, 0x04, 0x38]);
    }
}
