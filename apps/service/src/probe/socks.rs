//! Minimal SOCKS5 client for the proxy's name-resolution extension.
//!
//! This is not a general SOCKS client: it performs the no-auth method
//! negotiation and a single resolve exchange (vendor command `0xF0`), then
//! the connection is done. One resolution per connection, by protocol.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::ProbeError;

pub const SOCKS_VERSION: u8 = 0x05;
pub const AUTH_NONE: u8 = 0x00;
/// Vendor command: resolve a name without opening a connection.
pub const CMD_RESOLVE: u8 = 0xF0;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;

/// The port field of a resolve request is unused by the resolve path but
/// must be non-zero.
const REFERENCE_PORT: u16 = 8444;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Server-reported SOCKS5 reply codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksReply {
    GeneralFailure,
    NotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
    Unknown(u8),
}

impl SocksReply {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => SocksReply::GeneralFailure,
            0x02 => SocksReply::NotAllowed,
            0x03 => SocksReply::NetworkUnreachable,
            0x04 => SocksReply::HostUnreachable,
            0x05 => SocksReply::ConnectionRefused,
            0x06 => SocksReply::TtlExpired,
            0x07 => SocksReply::CommandNotSupported,
            0x08 => SocksReply::AddressTypeNotSupported,
            other => SocksReply::Unknown(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            SocksReply::GeneralFailure => 0x01,
            SocksReply::NotAllowed => 0x02,
            SocksReply::NetworkUnreachable => 0x03,
            SocksReply::HostUnreachable => 0x04,
            SocksReply::ConnectionRefused => 0x05,
            SocksReply::TtlExpired => 0x06,
            SocksReply::CommandNotSupported => 0x07,
            SocksReply::AddressTypeNotSupported => 0x08,
            SocksReply::Unknown(code) => *code,
        }
    }
}

impl std::fmt::Display for SocksReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            SocksReply::GeneralFailure => "general failure",
            SocksReply::NotAllowed => "connection not allowed by ruleset",
            SocksReply::NetworkUnreachable => "network unreachable",
            SocksReply::HostUnreachable => "host unreachable",
            SocksReply::ConnectionRefused => "connection refused",
            SocksReply::TtlExpired => "TTL expired",
            SocksReply::CommandNotSupported => "command not supported",
            SocksReply::AddressTypeNotSupported => "address type not supported",
            SocksReply::Unknown(code) => return write!(f, "unknown reply code {code:#04x}"),
        };
        write!(f, "{text} ({:#04x})", self.code())
    }
}

/// One connection to the local proxy, good for a single resolve exchange.
pub struct ProbeSocket {
    stream: TcpStream,
    timeout: Duration,
}

impl ProbeSocket {
    /// Open the TCP connection only. No SOCKS bytes are written yet so the
    /// caller can publish the local source port first; that port is the only
    /// handle the coordinator has to pair this connection with its stream
    /// event.
    pub async fn connect(proxy: SocketAddr, deadline: Duration) -> Result<Self, ProbeError> {
        let stream = timeout(deadline, TcpStream::connect(proxy))
            .await
            .map_err(|_| ProbeError::Timeout)??;
        Ok(Self { stream, timeout: deadline })
    }

    /// The ephemeral port the kernel picked for this connection.
    pub fn local_port(&self) -> Result<u16, ProbeError> {
        Ok(self.stream.local_addr()?.port())
    }

    /// Version/method negotiation: offer no-auth only, require the server
    /// to pick it.
    pub async fn negotiate(&mut self) -> Result<(), ProbeError> {
        self.stream.write_all(&[SOCKS_VERSION, 0x01, AUTH_NONE]).await?;

        let mut reply = [0u8; 2];
        self.read_exact_deadline(&mut reply).await?;

        if reply[0] != SOCKS_VERSION {
            return Err(ProbeError::Protocol(format!(
                "server speaks version {}, not SOCKS5",
                reply[0]
            )));
        }
        if reply[1] != AUTH_NONE {
            return Err(ProbeError::Protocol(format!(
                "server chose unsupported method {:#04x}",
                reply[1]
            )));
        }
        Ok(())
    }

    /// Ask the proxy to resolve `domain` over the attached circuit and
    /// return the textual address. Consumes the socket: the protocol allows
    /// exactly one exchange.
    pub async fn resolve(mut self, domain: &str) -> Result<String, ProbeError> {
        if domain.len() > u8::MAX as usize {
            return Err(ProbeError::Protocol(format!("domain name too long: {domain}")));
        }

        let mut request = vec![SOCKS_VERSION, CMD_RESOLVE, 0x00, ATYP_DOMAIN, domain.len() as u8];
        request.extend_from_slice(domain.as_bytes());
        request.extend_from_slice(&REFERENCE_PORT.to_be_bytes());
        self.stream.write_all(&request).await?;

        let mut header = [0u8; 4];
        self.read_exact_deadline(&mut header).await?;

        if header[0] != SOCKS_VERSION {
            return Err(ProbeError::Protocol(format!(
                "reply version {} is not SOCKS5",
                header[0]
            )));
        }
        if header[1] != 0x00 {
            return Err(ProbeError::Socks(SocksReply::from_code(header[1])));
        }

        let address = match header[3] {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                self.read_exact_deadline(&mut octets).await?;
                Ipv4Addr::from(octets).to_string()
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                self.read_exact_deadline(&mut len).await?;
                let mut name = vec![0u8; len[0] as usize];
                self.read_exact_deadline(&mut name).await?;
                String::from_utf8(name)
                    .map_err(|_| ProbeError::Protocol("non-UTF-8 address in reply".into()))?
            }
            other => {
                return Err(ProbeError::Protocol(format!(
                    "unsupported address type {other:#04x} in reply"
                )));
            }
        };

        // The bound port closes out the reply; its value is meaningless here.
        let mut port = [0u8; 2];
        self.read_exact_deadline(&mut port).await?;

        Ok(address)
    }

    async fn read_exact_deadline(&mut self, buf: &mut [u8]) -> Result<(), ProbeError> {
        timeout(self.timeout, self.stream.read_exact(buf))
            .await
            .map_err(|_| ProbeError::Timeout)??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One-shot mock proxy: performs the no-auth greeting, checks the
    /// resolve request for `expected_domain`, then sends `reply`.
    async fn mock_proxy(expected_domain: &'static str, reply: Vec<u8>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [SOCKS_VERSION, 0x01, AUTH_NONE]);
            stream.write_all(&[SOCKS_VERSION, AUTH_NONE]).await.unwrap();

            let mut head = [0u8; 5];
            stream.read_exact(&mut head).await.unwrap();
            assert_eq!(head[0], SOCKS_VERSION);
            assert_eq!(head[1], CMD_RESOLVE);
            assert_eq!(head[2], 0x00);
            assert_eq!(head[3], ATYP_DOMAIN);
            let len = head[4] as usize;
            assert_eq!(len, expected_domain.len());

            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await.unwrap();
            assert_eq!(name, expected_domain.as_bytes());

            let mut port = [0u8; 2];
            stream.read_exact(&mut port).await.unwrap();
            assert_ne!(u16::from_be_bytes(port), 0);

            stream.write_all(&reply).await.unwrap();
        });
        addr
    }

    async fn connected(addr: SocketAddr) -> ProbeSocket {
        let mut sock = ProbeSocket::connect(addr, Duration::from_secs(2)).await.unwrap();
        assert_ne!(sock.local_port().unwrap(), 0);
        sock.negotiate().await.unwrap();
        sock
    }

    #[tokio::test]
    async fn resolve_decodes_ipv4_reply() {
        let mut reply = vec![SOCKS_VERSION, 0x00, 0x00, ATYP_IPV4, 93, 184, 216, 34];
        reply.extend_from_slice(&0u16.to_be_bytes());
        let addr = mock_proxy("example.com", reply).await;

        let sock = connected(addr).await;
        let resolved = sock.resolve("example.com").await.unwrap();
        assert_eq!(resolved, "93.184.216.34");
    }

    #[tokio::test]
    async fn resolve_decodes_domain_reply() {
        let mut reply = vec![SOCKS_VERSION, 0x00, 0x00, ATYP_DOMAIN, 9];
        reply.extend_from_slice(b"10.0.0.42");
        reply.extend_from_slice(&0u16.to_be_bytes());
        let addr = mock_proxy("example.com", reply).await;

        let sock = connected(addr).await;
        let resolved = sock.resolve("example.com").await.unwrap();
        assert_eq!(resolved, "10.0.0.42");
    }

    #[tokio::test]
    async fn connection_refused_reply_maps_to_socks_error() {
        let reply = vec![SOCKS_VERSION, 0x05, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
        let addr = mock_proxy("example.com", reply).await;

        let sock = connected(addr).await;
        let err = sock.resolve("example.com").await.unwrap_err();
        match err {
            ProbeError::Socks(code) => {
                assert_eq!(code, SocksReply::ConnectionRefused);
                assert_eq!(code.code(), 0x05);
            }
            other => panic!("expected SocksError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_version_in_reply_is_protocol_error() {
        let reply = vec![0x04, 0x00, 0x00, ATYP_IPV4, 1, 2, 3, 4, 0, 0];
        let addr = mock_proxy("example.com", reply).await;

        let sock = connected(addr).await;
        let err = sock.resolve("example.com").await.unwrap_err();
        assert!(matches!(err, ProbeError::Protocol(_)));
    }

    #[tokio::test]
    async fn bad_method_choice_fails_negotiation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            // username/password method: we never offered it
            stream.write_all(&[SOCKS_VERSION, 0x02]).await.unwrap();
        });

        let mut sock = ProbeSocket::connect(addr, Duration::from_secs(2)).await.unwrap();
        let err = sock.negotiate().await.unwrap_err();
        assert!(matches!(err, ProbeError::Protocol(_)));
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            // Hold the connection open without ever replying.
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let mut sock = ProbeSocket::connect(addr, Duration::from_millis(200)).await.unwrap();
        let err = sock.negotiate().await.unwrap_err();
        assert!(matches!(err, ProbeError::Timeout));
    }

    #[tokio::test]
    async fn oversized_domain_is_rejected_before_sending() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let sock = ProbeSocket::connect(addr, Duration::from_secs(1)).await.unwrap();
        let long = "a".repeat(300);
        let err = sock.resolve(&long).await.unwrap_err();
        assert!(matches!(err, ProbeError::Protocol(_)));
    }
}
