// Byte-stream transport for LDAP: URL parsing, TCP and TLS streams

use std::fmt;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{LdapError, Result};

pub const LDAP_PORT: u16 = 389;
pub const LDAPS_PORT: u16 = 636;

/// `ldap://host[:port][/][?options[key]=value&...]`, or `ldaps://` for TLS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapUrl {
    pub secure: bool,
    pub host: String,
    pub port: u16,
    /// Connection options given in the query string, in order.
    pub options: Vec<(String, String)>,
}

impl LdapUrl {
    /// `host:port` for connecting, with IPv6 literals bracketed.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for LdapUrl {
    type Err = LdapError;

    fn from_str(uri: &str) -> Result<Self> {
        let (secure, rest) = if let Some(rest) = uri.strip_prefix("ldaps://") {
            (true, rest)
        } else if let Some(rest) = uri.strip_prefix("ldap://") {
            (false, rest)
        } else {
            return Err(LdapError::validation(format!("Invalid LDAP URI scheme: {}", uri)));
        };

        let (authority, query) = match rest.find(|c: char| c == '/' || c == '?') {
            Some(pos) => {
                let tail = &rest[pos..];
                (&rest[..pos], tail.split_once('?').map(|(_, q)| q).unwrap_or(""))
            }
            None => (rest, ""),
        };

        let (host, port) = split_host_port(authority)
            .ok_or_else(|| LdapError::validation(format!("Invalid host or port in URI: {}", uri)))?;
        let port = port.unwrap_or(if secure { LDAPS_PORT } else { LDAP_PORT });

        let mut options = Vec::new();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = key
                .strip_prefix("options[")
                .and_then(|k| k.strip_suffix(']'))
                .unwrap_or(key);
            options.push((key.to_string(), value.to_string()));
        }

        Ok(Self {
            secure,
            host: host.to_string(),
            port,
            options,
        })
    }
}

fn split_host_port(authority: &str) -> Option<(&str, Option<u16>)> {
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        match after {
            "" => (host, None),
            _ => (host, Some(after.strip_prefix(':')?)),
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };
    if host.is_empty() {
        return None;
    }
    let port = match port {
        Some(p) => Some(p.parse::<u16>().ok()?),
        None => None,
    };
    Some((host, port))
}

impl fmt::Display for LdapUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "ldaps" } else { "ldap" };
        write!(f, "{}://{}", scheme, self.address())
    }
}

/// Stream to the directory server: plain TCP (ldap://) or TLS (ldaps://).
pub enum LdapStream {
    Tcp(TcpStream),
    Tls(Box<ClientTlsStream<TcpStream>>),
}

impl AsyncRead for LdapStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            LdapStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            LdapStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for LdapStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            LdapStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            LdapStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            LdapStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            LdapStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            LdapStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            LdapStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

pub(crate) fn timed_out(limit: Duration) -> LdapError {
    LdapError::Transport(io::Error::new(
        io::ErrorKind::TimedOut,
        format!("timed out after {:?}", limit),
    ))
}

/// Open the transport for `url`. `tls` is required for `ldaps://`.
pub async fn connect(
    url: &LdapUrl,
    tls: Option<&TlsConnector>,
    timeout: Option<Duration>,
) -> Result<LdapStream> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, open(url, tls))
            .await
            .map_err(|_| timed_out(limit))?,
        None => open(url, tls).await,
    }
}

async fn open(url: &LdapUrl, tls: Option<&TlsConnector>) -> Result<LdapStream> {
    let addr = url.address();
    let tcp = TcpStream::connect(&addr).await?;
    tcp.set_nodelay(true)?;
    if !url.secure {
        debug!(%addr, "TCP connected");
        return Ok(LdapStream::Tcp(tcp));
    }

    let connector = tls.ok_or_else(|| LdapError::validation("ldaps:// requires a TLS client configuration"))?;
    let server_name = ServerName::try_from(url.host.clone())
        .map_err(|_| LdapError::validation(format!("Invalid hostname for TLS SNI: {}", url.host)))?;
    let stream = connector.connect(server_name, tcp).await?;
    debug!(%addr, "TLS handshake complete");
    Ok(LdapStream::Tls(Box::new(stream)))
}
