pub mod ber;
pub mod config;
pub mod connection;
pub mod entry;
pub mod error;
pub mod filter;
pub mod protocol;
pub mod secret;
pub mod tls;
pub mod transport;

pub use config::{Config, ConnectionOptions};
pub use connection::LdapConnection;
pub use entry::Entry;
pub use error::{DirectoryError, DirectoryErrorKind, LdapError, Result};
pub use filter::Filter;
pub use protocol::{DerefAliases, LdapProtocol, SearchRequest, SearchScope};
pub use secret::Secret;
pub use transport::LdapUrl;
