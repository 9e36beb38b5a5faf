use super::{
    address::{TargetAddr, encode_bound_address, read_target_address},
    protocol::{Command, RSV, ReplyCode, Version},
};
use anyhow::{Result, anyhow, bail};
use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tracing::debug;

const UNSPECIFIED: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

/// handle_request reads the client request, performs CONNECT and returns the
/// outbound stream. Every other command is refused with a reply
pub async fn handle_request<S>(stream: &mut S) -> Result<TcpStream>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // SOCKS5 request format
    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+
    let mut header = [0u8; 3];
    stream.read_exact(&mut header).await?;

    let [version, command, _rsv] = header;
    if version != Version::SOCKS5 as u8 {
        bail!("unsupported SOCKS version {version:#04x}");
    }

    let target = match read_target_address(stream).await? {
        Ok(target) => target,
        Err(code) => {
            send_reply(stream, code, UNSPECIFIED).await?;
            bail!("unusable target address ({code:?})");
        }
    };

    match Command::from_byte(command) {
        Some(Command::Connect) => connect(stream, &target).await,
        Some(cmd @ (Command::Bind | Command::UdpAssociate)) => {
            send_reply(stream, ReplyCode::CommandNotSupported, UNSPECIFIED).await?;
            Err(anyhow!("{cmd:?} not supported"))
        }
        None => {
            send_reply(stream, ReplyCode::CommandNotSupported, UNSPECIFIED).await?;
            Err(anyhow!("unknown command {command:#04x}"))
        }
    }
}

/// connect dials the target and reports the outcome to the client
async fn connect<S>(stream: &mut S, target: &TargetAddr) -> Result<TcpStream>
where
    S: AsyncWrite + Unpin,
{
    debug!("SOCKS5 CONNECT {}", target);

    let dialed = match target {
        TargetAddr::Ip(addr) => TcpStream::connect(addr).await,
        TargetAddr::Domain(host, port) => TcpStream::connect((host.as_str(), *port)).await,
    };

    match dialed {
        Ok(outbound) => {
            send_reply(stream, ReplyCode::Succeeded, outbound.local_addr()?).await?;
            Ok(outbound)
        }
        Err(e) => {
            send_reply(stream, reply_code_for(&e), UNSPECIFIED).await?;
            Err(anyhow!("connect to {target} failed: {e}"))
        }
    }
}

/// reply_code_for maps a dial error to the closest SOCKS5 reply
fn reply_code_for(e: &io::Error) -> ReplyCode {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
        io::ErrorKind::HostUnreachable => ReplyCode::HostUnreachable,
        io::ErrorKind::NetworkUnreachable => ReplyCode::NetworkUnreachable,
        io::ErrorKind::PermissionDenied => ReplyCode::ConnectionNotAllowed,
        io::ErrorKind::TimedOut => ReplyCode::TtlExpired,
        _ => ReplyCode::HostUnreachable,
    }
}

/// send_reply writes VER | REP | RSV | ATYP | BND.ADDR | BND.PORT
async fn send_reply<S>(stream: &mut S, reply_code: ReplyCode, bound_addr: SocketAddr) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut reply = vec![Version::SOCKS5 as u8, reply_code as u8, RSV];
    encode_bound_address(&mut reply, bound_addr);

    stream.write_all(&reply).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{io::duplex, net::TcpListener};

    #[test]
    fn refused_maps_to_connection_refused() {
        let e = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(reply_code_for(&e), ReplyCode::ConnectionRefused);
    }

    #[tokio::test]
    async fn bind_command_is_refused() {
        let (mut client, mut server) = duplex(64);
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();

        assert!(handle_request(&mut server).await.is_err());

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], ReplyCode::CommandNotSupported as u8);
    }

    #[tokio::test]
    async fn non_utf8_domain_gets_failure_reply() {
        let (mut client, mut server) = duplex(64);
        client
            .write_all(&[0x05, 0x01, 0x00, 0x03, 2, 0xFF, 0xFE, 0x00, 0x50])
            .await
            .unwrap();

        assert!(handle_request(&mut server).await.is_err());

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[..2], [0x05, ReplyCode::ServerFailure as u8]);
    }

    #[tokio::test]
    async fn unknown_address_type_gets_reply() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x05, 0x01, 0x00, 0x07]).await.unwrap();

        assert!(handle_request(&mut server).await.is_err());

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], ReplyCode::AddrTypeUnsupported as u8);
    }

    #[tokio::test]
    async fn connect_reaches_loopback_target() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = target.local_addr().unwrap().port().to_be_bytes();

        let (mut client, mut server) = duplex(64);
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, port[0], port[1]])
            .await
            .unwrap();

        let outbound = handle_request(&mut server).await.unwrap();
        assert_eq!(outbound.peer_addr().unwrap(), target.local_addr().unwrap());

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[..4], [0x05, 0x00, 0x00, 0x01]);
    }
}
