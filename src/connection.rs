// Directory connection: connect and bind, search, close

use std::future::Future;
use std::time::Duration;

use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::config::{Config, ConnectionOptions};
use crate::entry::Entry;
use crate::error::{DirectoryErrorKind, LdapError, Result};
use crate::protocol::{LdapProtocol, SearchRequest, SearchScope};
use crate::secret::Secret;
use crate::tls;
use crate::transport::{self, timed_out, LdapStream, LdapUrl};

fn not_connected() -> LdapError {
    LdapError::Transport(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "not connected",
    ))
}

/// Run `op`, giving up after `limit`. `Err(limit)` means it did not finish.
async fn within<T>(
    limit: Option<Duration>,
    op: impl Future<Output = Result<T>>,
) -> std::result::Result<Result<T>, Duration> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, op).await.map_err(|_| limit),
        None => Ok(op.await),
    }
}

/// A connection to one directory server.
///
/// Created unconnected; [`connect`](Self::connect) opens the transport and
/// binds. After a fatal error (transport, protocol, or a server-announced
/// disconnection) the connection reports `is_connected() == false` and can
/// be connected again.
pub struct LdapConnection {
    url: LdapUrl,
    options: ConnectionOptions,
    bind_dn: String,
    password: Secret,
    tls: Option<TlsConnector>,
    protocol: Option<LdapProtocol<LdapStream>>,
}

impl LdapConnection {
    pub fn new(url: LdapUrl, options: ConnectionOptions) -> Self {
        Self {
            url,
            options,
            bind_dn: String::new(),
            password: Secret::default(),
            tls: None,
            protocol: None,
        }
    }

    /// Credentials used by [`connect`](Self::connect).
    pub fn with_credentials(mut self, bind_dn: impl Into<String>, password: Secret) -> Self {
        self.bind_dn = bind_dn.into();
        self.password = password;
        self
    }

    pub fn with_tls(mut self, connector: TlsConnector) -> Self {
        self.tls = Some(connector);
        self
    }

    /// Build from a configuration file section.
    ///
    /// Options from the URL query string are applied first and the
    /// `options` map second, so the map wins. An `ldaps://` URL gets a
    /// TLS connector from the `tls` section, or system roots without one.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let url: LdapUrl = config.url.parse()?;

        let mut options = ConnectionOptions::from_pairs(
            url.options.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        )?;
        for (key, value) in config.option_pairs()? {
            options.set(&key, &value)?;
        }

        let mut connection = Self::new(url, options).with_credentials(
            config.bind_dn.clone().unwrap_or_default(),
            config.password.clone().unwrap_or_default(),
        );
        if connection.url.secure {
            connection.tls = Some(tls::connector(config.tls.as_ref())?);
        }
        Ok(connection)
    }

    pub fn url(&self) -> &LdapUrl {
        &self.url
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn is_connected(&self) -> bool {
        self.protocol.as_ref().is_some_and(|p| p.is_connected())
    }

    /// Connect and bind with the configured credentials.
    pub async fn connect(&mut self) -> Result<()> {
        let dn = self.bind_dn.clone();
        let password = self.password.clone();
        self.connect_as(&dn, &password).await
    }

    /// Connect and bind as `dn`. Does nothing when already connected.
    ///
    /// A failed bind closes the transport again before the error is returned.
    pub async fn connect_as(&mut self, dn: &str, password: &Secret) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.protocol = None;

        let limit = self.options.network_timeout;
        let stream = transport::connect(&self.url, self.tls.as_ref(), limit).await?;
        info!(url = %self.url, "connected");

        let mut protocol = LdapProtocol::with_version(stream, self.options.protocol_version);
        let bound = match within(limit, protocol.bind(dn, password.reveal())).await {
            Ok(result) => result,
            Err(elapsed) => Err(timed_out(elapsed)),
        };

        match bound {
            Ok(()) => {
                info!(dn, "bound");
                self.protocol = Some(protocol);
                Ok(())
            }
            Err(e) => {
                debug!(error = %e, "bind failed, closing");
                protocol.unbind().await?;
                Err(e)
            }
        }
    }

    /// Subtree search using the connection's deref and limit options.
    pub async fn search(&mut self, base: &str, filter: &str, attributes: &[&str]) -> Result<Vec<Entry>> {
        let mut request = SearchRequest::new(base, filter)?;
        request.deref = self.options.deref;
        request.size_limit = self.options.size_limit;
        request.time_limit = self.options.time_limit;
        request.attributes = attributes.iter().map(|a| a.to_string()).collect();
        self.search_by(&request).await
    }

    pub async fn search_by(&mut self, request: &SearchRequest) -> Result<Vec<Entry>> {
        let limit = self.options.network_timeout;
        let protocol = self.protocol.as_mut().ok_or_else(not_connected)?;

        let outcome = match within(limit, protocol.search(request)).await {
            Ok(result) => result,
            Err(elapsed) => {
                protocol.unbind().await?;
                Err(timed_out(elapsed))
            }
        };

        if !protocol.is_connected() {
            self.protocol = None;
        }
        outcome
    }

    fn base_lookup(&self, dn: &str, attributes: &[&str]) -> Result<SearchRequest> {
        let mut request = SearchRequest::new(dn, "(objectClass=*)")?;
        request.scope = SearchScope::BaseObject;
        request.deref = self.options.deref;
        request.time_limit = self.options.time_limit;
        request.attributes = attributes.iter().map(|a| a.to_string()).collect();
        Ok(request)
    }

    /// Fetch the entry named `dn` with all user attributes.
    ///
    /// A missing entry is reported as a `NoSuchObject` directory error.
    /// `None` means the server answered successfully without an entry.
    pub async fn read(&mut self, dn: &str) -> Result<Option<Entry>> {
        let request = self.base_lookup(dn, &[])?;
        Ok(self.search_by(&request).await?.into_iter().next())
    }

    /// Whether an entry named `dn` exists. Only `NoSuchObject` counts as
    /// absent; every other failure is returned as an error.
    pub async fn exists(&mut self, dn: &str) -> Result<bool> {
        // "1.1" asks for no attributes (RFC 4511 4.5.1.8)
        let request = self.base_lookup(dn, &["1.1"])?;
        match self.search_by(&request).await {
            Ok(_) => Ok(true),
            Err(e) if e.as_directory().map(|d| d.kind()) == Some(DirectoryErrorKind::NoSuchObject) => {
                debug!(dn, "entry does not exist");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Unbind and close. Safe to call any number of times.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut protocol) = self.protocol.take() {
            protocol.unbind().await?;
            info!(url = %self.url, "closed");
        }
        Ok(())
    }
}
