use super::protocol::{AuthMethod, Version};
use anyhow::{Result, bail};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// negotiate_method reads the client greeting and answers with the method
/// the server picked. Fails when the client offers nothing acceptable
pub async fn negotiate_method<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ClientHello format
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    // | 1  |    1     | 1 to 255 |
    // +----+----------+----------+
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;

    let [version, n_methods] = buf;
    if version != Version::SOCKS5 as u8 {
        bail!("unsupported SOCKS version {version:#04x}");
    }

    let mut methods = vec![0u8; n_methods as usize];
    stream.read_exact(&mut methods).await?;

    let method = select_method(&methods);

    // ServerChoice
    // +----+--------+
    // |VER | METHOD |
    // +----+--------+
    stream.write_all(&[Version::SOCKS5 as u8, method as u8]).await?;

    if method == AuthMethod::NoAcceptable {
        bail!("client offered no acceptable authentication method");
    }

    Ok(())
}

/// select_method picks NO AUTH when the client offers it
fn select_method(client_methods: &[u8]) -> AuthMethod {
    if client_methods.contains(&(AuthMethod::NoAuth as u8)) {
        AuthMethod::NoAuth
    } else {
        AuthMethod::NoAcceptable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn prefers_no_auth() {
        assert_eq!(select_method(&[0x02, 0x00]), AuthMethod::NoAuth);
        assert_eq!(select_method(&[0x02]), AuthMethod::NoAcceptable);
        assert_eq!(select_method(&[]), AuthMethod::NoAcceptable);
    }

    #[tokio::test]
    async fn answers_no_auth_greeting() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

        negotiate_method(&mut server).await.unwrap();

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn rejects_password_only_clients() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();

        assert!(negotiate_method(&mut server).await.is_err());

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0xFF]);
    }

    #[tokio::test]
    async fn rejects_socks4() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();

        assert!(negotiate_method(&mut server).await.is_err());
    }
}
