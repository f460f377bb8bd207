//! Minimal SOCKS5 CONNECT client (no authentication).

use std::io;
use std::net::{IpAddr, SocketAddr};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const SOCKS_VER: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REP_SUCCESS: u8 = 0x00;

fn protocol_error(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Open a tunnel to `host:port` through the SOCKS5 proxy at `proxy`.
///
/// Returns once the proxy reports the upstream connection established.
pub async fn connect(proxy: SocketAddr, host: &str, port: u16) -> io::Result<TcpStream> {
    let mut stream = TcpStream::connect(proxy).await?;
    stream.set_nodelay(true)?;

    stream.write_all(&[SOCKS_VER, 1, AUTH_NONE]).await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VER || choice[1] != AUTH_NONE {
        return Err(protocol_error(format!(
            "proxy refused no-auth method (reply {:02x} {:02x})",
            choice[0], choice[1]
        )));
    }

    let mut request = vec![SOCKS_VER, CMD_CONNECT, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let name = host.as_bytes();
            if name.is_empty() || name.len() > 255 {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "bad target host length"));
            }
            request.push(ATYP_DOMAIN);
            request.push(name.len() as u8);
            request.extend_from_slice(name);
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VER {
        return Err(protocol_error(format!("bad reply version {:02x}", head[0])));
    }
    if head[1] != REP_SUCCESS {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("proxy connect failed with reply {:02x}", head[1]),
        ));
    }

    // Bound address, which we do not need.
    let skip = match head[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        other => return Err(protocol_error(format!("bad address type {:02x}", other))),
    };
    let mut rest = vec![0u8; skip];
    stream.read_exact(&mut rest).await?;

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accepts one client, checks the CONNECT request, answers with `reply`.
    async fn one_shot_proxy(reply: u8) -> (SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut greet = [0u8; 3];
            s.read_exact(&mut greet).await.unwrap();
            s.write_all(&[5, 0]).await.unwrap();
            let mut head = [0u8; 5];
            s.read_exact(&mut head).await.unwrap();
            let mut rest = vec![0u8; head[4] as usize + 2];
            s.read_exact(&mut rest).await.unwrap();
            s.write_all(&[5, reply, 0, 1, 127, 0, 0, 1, 0, 80]).await.unwrap();
            let mut req = head.to_vec();
            req.extend(rest);
            req
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_connect_sends_domain_request() {
        let (addr, handle) = one_shot_proxy(0).await;
        connect(addr, "example.com", 443).await.unwrap();
        let req = handle.await.unwrap();
        assert_eq!(&req[..4], &[5, 1, 0, ATYP_DOMAIN]);
        assert_eq!(req[4] as usize, "example.com".len());
        assert_eq!(&req[5..16], b"example.com");
        assert_eq!(&req[16..], &443u16.to_be_bytes());
    }

    #[tokio::test]
    async fn test_connect_failure_reply() {
        let (addr, _handle) = one_shot_proxy(0x05).await;
        let err = connect(addr, "example.com", 80).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_connect_to_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(connect(addr, "example.com", 80).await.is_err());
    }
}
