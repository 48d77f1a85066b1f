//! Outbound proxy hop (`proxyAddress`) for reaching the target.
//!
//! `http://` proxies get an HTTP `CONNECT` tunnel; `socks5://` and
//! `socks5h://` proxies get a SOCKS5 `CONNECT`, the latter letting the proxy
//! resolve names. TLS to the target runs inside the tunnel.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use percent_encoding::percent_decode_str;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, Result};

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_AUTH_NONE: u8 = 0x00;
const SOCKS5_AUTH_PASSWORD: u8 = 0x02;
const SOCKS5_AUTH_PASSWORD_VERSION: u8 = 0x01;
const SOCKS5_CMD_CONNECT: u8 = 0x01;
const SOCKS5_ATYP_IPV4: u8 = 0x01;
const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
const SOCKS5_ATYP_IPV6: u8 = 0x04;
const SOCKS5_REPLY_SUCCEEDED: u8 = 0x00;

const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyKind {
    Http,
    /// `remote_dns` is set for `socks5h`.
    Socks5 { remote_dns: bool },
}

/// A parsed `proxyAddress`.
#[derive(Clone, PartialEq, Eq)]
pub struct UpstreamProxy {
    kind: ProxyKind,
    host: String,
    port: u16,
    credentials: Option<(String, String)>,
}

impl fmt::Debug for UpstreamProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamProxy")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("credentials", &self.credentials.is_some())
            .finish()
    }
}

impl fmt::Display for UpstreamProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.kind {
            ProxyKind::Http => "http",
            ProxyKind::Socks5 { remote_dns: false } => "socks5",
            ProxyKind::Socks5 { remote_dns: true } => "socks5h",
        };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

impl UpstreamProxy {
    /// Parse `http://[user:pass@]host[:port]`, `socks5://...` or
    /// `socks5h://...`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let url = url::Url::parse(raw).map_err(|e| Error::config(format!("invalid proxyAddress `{raw}`: {e}")))?;
        let (kind, default_port) = match url.scheme() {
            "http" => (ProxyKind::Http, 80),
            "socks5" => (ProxyKind::Socks5 { remote_dns: false }, 1080),
            "socks5h" => (ProxyKind::Socks5 { remote_dns: true }, 1080),
            other => {
                return Err(Error::config(format!(
                    "unsupported proxyAddress scheme `{other}` (use http, socks5 or socks5h)"
                )));
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::config(format!("proxyAddress `{raw}` has no host")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let credentials = if url.username().is_empty() {
            None
        } else {
            let decode = |s: &str| percent_decode_str(s).decode_utf8_lossy().into_owned();
            Some((decode(url.username()), decode(url.password().unwrap_or_default())))
        };
        Ok(Self {
            kind,
            host,
            port: url.port().unwrap_or(default_port),
            credentials,
        })
    }

    pub fn kind(&self) -> ProxyKind {
        self.kind
    }

    /// `true` when the proxy must be handed an address rather than a name.
    pub fn needs_resolved_address(&self) -> bool {
        self.kind == ProxyKind::Socks5 { remote_dns: false }
    }

    /// Open a tunnel to `host:port`. When `addr` is given (an address already
    /// vetted for `host`), the proxy is asked to reach that address instead.
    pub async fn connect(&self, host: &str, port: u16, addr: Option<SocketAddr>) -> io::Result<TcpStream> {
        let mut stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream.set_nodelay(true).ok();
        match self.kind {
            ProxyKind::Http => self.http_connect(&mut stream, host, port, addr).await?,
            ProxyKind::Socks5 { remote_dns } => {
                self.socks5_connect(&mut stream, host, port, addr, remote_dns)
                    .await?
            }
        }
        tracing::trace!(proxy = %self, %host, "tunnel established");
        Ok(stream)
    }

    async fn http_connect<S>(&self, stream: &mut S, host: &str, port: u16, addr: Option<SocketAddr>) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let authority = match addr {
            Some(addr) => addr.to_string(),
            None => format!("{host}:{port}"),
        };
        let mut head = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
        if let Some((user, pass)) = &self.credentials {
            let token = STANDARD.encode(format!("{user}:{pass}"));
            head.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
        }
        head.push_str("\r\n");
        stream.write_all(head.as_bytes()).await?;
        stream.flush().await?;

        let response = read_response_head(stream).await?;
        let status = response
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed CONNECT response"))?;
        if !(200..300).contains(&status) {
            return Err(io::Error::other(format!("proxy refused CONNECT with status {status}")));
        }
        Ok(())
    }

    async fn socks5_connect<S>(
        &self,
        stream: &mut S,
        host: &str,
        port: u16,
        addr: Option<SocketAddr>,
        remote_dns: bool,
    ) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let methods: &[u8] = if self.credentials.is_some() {
            &[SOCKS5_AUTH_NONE, SOCKS5_AUTH_PASSWORD]
        } else {
            &[SOCKS5_AUTH_NONE]
        };
        let mut greeting = vec![SOCKS5_VERSION, methods.len() as u8];
        greeting.extend_from_slice(methods);
        stream.write_all(&greeting).await?;

        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await?;
        if choice[0] != SOCKS5_VERSION {
            return Err(invalid("unexpected SOCKS version"));
        }
        match choice[1] {
            SOCKS5_AUTH_NONE => {}
            SOCKS5_AUTH_PASSWORD => self.socks5_authenticate(stream).await?,
            _ => return Err(io::Error::other("no acceptable SOCKS5 authentication method")),
        }

        let mut request = vec![SOCKS5_VERSION, SOCKS5_CMD_CONNECT, 0x00];
        let port = match addr {
            Some(addr) => {
                push_ip(&mut request, addr.ip());
                addr.port()
            }
            None if remote_dns => {
                let name = u8::try_from(host.len()).map_err(|_| invalid("host name too long for SOCKS5"))?;
                request.push(SOCKS5_ATYP_DOMAIN);
                request.push(name);
                request.extend_from_slice(host.as_bytes());
                port
            }
            None => return Err(io::Error::other("SOCKS5 proxy needs a resolved address")),
        };
        request.extend_from_slice(&port.to_be_bytes());
        stream.write_all(&request).await?;

        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await?;
        if reply[1] != SOCKS5_REPLY_SUCCEEDED {
            return Err(io::Error::other(format!("SOCKS5 connect failed with reply {:#04x}", reply[1])));
        }
        // Skip the bound address and port
        let bound = match reply[3] {
            SOCKS5_ATYP_IPV4 => 4,
            SOCKS5_ATYP_IPV6 => 16,
            SOCKS5_ATYP_DOMAIN => usize::from(stream.read_u8().await?),
            _ => return Err(invalid("unknown SOCKS5 address type")),
        };
        let mut skip = vec![0u8; bound + 2];
        stream.read_exact(&mut skip).await?;
        Ok(())
    }

    async fn socks5_authenticate<S>(&self, stream: &mut S) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some((user, pass)) = &self.credentials else {
            return Err(io::Error::other("SOCKS5 proxy demands credentials"));
        };
        let user_len = u8::try_from(user.len()).map_err(|_| invalid("SOCKS5 username too long"))?;
        let pass_len = u8::try_from(pass.len()).map_err(|_| invalid("SOCKS5 password too long"))?;
        let mut packet = vec![SOCKS5_AUTH_PASSWORD_VERSION, user_len];
        packet.extend_from_slice(user.as_bytes());
        packet.push(pass_len);
        packet.extend_from_slice(pass.as_bytes());
        stream.write_all(&packet).await?;

        let mut status = [0u8; 2];
        stream.read_exact(&mut status).await?;
        if status[1] != 0 {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "SOCKS5 authentication failed",
            ));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

fn push_ip(buf: &mut Vec<u8>, ip: IpAddr) {
    match ip {
        IpAddr::V4(v4) => {
            buf.push(SOCKS5_ATYP_IPV4);
            buf.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.push(SOCKS5_ATYP_IPV6);
            buf.extend_from_slice(&v6.octets());
        }
    }
}

/// Read up to the blank line ending a response head, byte by byte so no
/// tunneled bytes are consumed.
async fn read_response_head<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<String> {
    let mut head = Vec::with_capacity(128);
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_CONNECT_RESPONSE {
            return Err(invalid("CONNECT response head too large"));
        }
        head.push(stream.read_u8().await?);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}
