use anyhow::{Context, Result};
use clap::Parser;
use ldap_client::{Config, Entry, LdapConnection, SearchRequest, SearchScope, Secret};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "ldap-search")]
#[command(about = "Search an LDAPv3 directory and print matching entries")]
struct Args {
    /// Configuration file path (url, bind_dn, password, options, tls)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Server URL (overrides config; e.g. ldap://localhost:389)
    #[arg(short = 'H', long, value_name = "URL")]
    url: Option<String>,

    /// Bind DN (overrides config)
    #[arg(short = 'D', long, value_name = "DN")]
    bind_dn: Option<String>,

    /// Bind password (overrides config)
    #[arg(short = 'w', long, value_name = "PASSWORD")]
    password: Option<String>,

    /// Search base
    #[arg(short = 'b', long, value_name = "DN")]
    base: String,

    /// Search scope: base, one or sub
    #[arg(short = 's', long, value_name = "SCOPE", default_value = "sub")]
    scope: SearchScope,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// RFC 4515 search filter
    #[arg(default_value = "(objectClass=*)")]
    filter: String,

    /// Attributes to return (all user attributes when empty)
    attributes: Vec<String>,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(url) = &args.url {
        config.url = url.clone();
    }
    if let Some(dn) = &args.bind_dn {
        config.bind_dn = Some(dn.clone());
    }
    if let Some(password) = &args.password {
        config.password = Some(Secret::from(password.as_str()));
    }
    Ok(config)
}

/// LDIF-like rendering. Values that are not UTF-8 are written hex-encoded
/// under `attr;hex`.
fn print_entry(entry: &Entry) {
    println!("dn: {}", entry.dn());
    for (name, values) in entry.attributes() {
        for value in values {
            match std::str::from_utf8(value) {
                Ok(text) => println!("{}: {}", name, text),
                Err(_) => println!("{};hex: {}", name, hex::encode(value)),
            }
        }
    }
    println!();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("ldap_client={},info", log_level))
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&args)?;
    let mut connection = LdapConnection::from_config(&config)
        .with_context(|| format!("Configure connection to {}", config.url))?;

    let mut request = SearchRequest::new(args.base.clone(), &args.filter)?;
    request.scope = args.scope;
    request.deref = connection.options().deref;
    request.size_limit = connection.options().size_limit;
    request.time_limit = connection.options().time_limit;
    request.attributes = args.attributes.clone();

    connection
        .connect()
        .await
        .with_context(|| format!("Connect to {}", connection.url()))?;

    let outcome = connection.search_by(&request).await;
    if let Err(e) = connection.close().await {
        error!("Close failed: {}", e);
    }

    let entries = outcome.with_context(|| format!("Search {} {}", request.base, request.filter))?;
    for entry in &entries {
        print_entry(entry);
    }
    info!("{} entries", entries.len());
    Ok(())
}
