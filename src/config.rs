use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use anyhow::{Context, Result};

use crate::error::LdapError;
use crate::protocol::{DerefAliases, LDAP_VERSION};
use crate::secret::Secret;

/// Per-connection settings, validated before anything touches the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Default alias dereferencing for searches.
    pub deref: DerefAliases,
    /// Default size limit for searches (0 = none).
    pub size_limit: i32,
    /// Default time limit in seconds for searches (0 = none).
    pub time_limit: i32,
    /// Bound on connect and on every operation. `None` waits forever.
    pub network_timeout: Option<Duration>,
    pub protocol_version: i32,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            deref: DerefAliases::Never,
            size_limit: 0,
            time_limit: 0,
            network_timeout: None,
            protocol_version: LDAP_VERSION,
        }
    }
}

impl ConnectionOptions {
    pub fn from_pairs<I, K, V>(pairs: I) -> crate::error::Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut options = Self::default();
        for (key, value) in pairs {
            options.set(key.as_ref(), value.as_ref())?;
        }
        Ok(options)
    }

    pub fn set(&mut self, key: &str, value: &str) -> crate::error::Result<()> {
        let value = value.trim();
        match key {
            "deref" => self.deref = value.parse()?,
            "sizelimit" => self.size_limit = parse_limit(key, value)?,
            "timelimit" => self.time_limit = parse_limit(key, value)?,
            "network_timeout" => {
                let seconds: u64 = value.parse().map_err(|_| invalid(key, value))?;
                self.network_timeout = (seconds > 0).then(|| Duration::from_secs(seconds));
            }
            "protocol_version" => {
                self.protocol_version = match value {
                    "2" => 2,
                    "3" => 3,
                    _ => return Err(invalid(key, value)),
                }
            }
            _ => return Err(LdapError::validation(format!("Unknown option \"{}\"", key))),
        }
        Ok(())
    }
}

fn invalid(key: &str, value: &str) -> LdapError {
    LdapError::validation(format!("Invalid value for option \"{}\": {}", key, value))
}

fn parse_limit(key: &str, value: &str) -> crate::error::Result<i32> {
    match value.parse::<i32>() {
        Ok(n) if n >= 0 => Ok(n),
        _ => Err(invalid(key, value)),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// `ldap://host[:port]` or `ldaps://host[:port]`
    pub url: String,
    pub bind_dn: Option<String>,
    pub password: Option<Secret>,
    /// Raw connection options: `deref`, `sizelimit`, `timelimit`,
    /// `network_timeout` (seconds) and `protocol_version`.
    #[serde(default)]
    pub options: BTreeMap<String, serde_yaml::Value>,
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    /// PEM bundle trusted in addition to the system roots.
    pub ca_file: Option<String>,
    /// Accept any server certificate (test setups only).
    pub skip_verify: Option<bool>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Read config file: {}", path.display()))?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content).context("Parse YAML config")?;
        Ok(config)
    }

    /// The `options` map as strings. Scalars are accepted in any YAML form
    /// (`sizelimit: 100` and `sizelimit: "100"` are the same).
    pub fn option_pairs(&self) -> crate::error::Result<Vec<(String, String)>> {
        let mut pairs = Vec::with_capacity(self.options.len());
        for (key, value) in &self.options {
            let value = match value {
                serde_yaml::Value::String(s) => s.clone(),
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::Bool(b) => b.to_string(),
                _ => return Err(invalid(key, "expected a scalar")),
            };
            pairs.push((key.clone(), value));
        }
        Ok(pairs)
    }

    pub fn connection_options(&self) -> crate::error::Result<ConnectionOptions> {
        ConnectionOptions::from_pairs(self.option_pairs()?)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: "ldap://localhost:389".to_string(),
            bind_dn: None,
            password: None,
            options: BTreeMap::new(),
            tls: None,
        }
    }
}
