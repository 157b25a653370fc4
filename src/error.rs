//! Error types for the LDAP client.

use std::fmt;
use thiserror::Error;

/// LDAP result code `noSuchObject` (RFC 4511 Appendix A).
pub const RESULT_NO_SUCH_OBJECT: i32 = 32;

/// `LDAP_SERVER_DOWN` from the C API result-code mapping. Client libraries
/// report it for a lost connection; a server never sends it in an LDAPResult.
pub const RESULT_SERVER_DOWN: i32 = 81;

/// Connection-lost code from the same C API mapping, also client-side only.
///
/// A server that is going away announces it with a Notice of Disconnection
/// instead, which is reported through [`DirectoryError::disconnected`].
pub const RESULT_CONNECTION_LOST: i32 = -1;

/// Main error type for all client operations.
#[derive(Debug, Error)]
pub enum LdapError {
    /// Socket failure or short read. The connection is unusable.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Unexpected tag, bad length or unbalanced sequences. The connection is unusable.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Nonzero result code returned by the server.
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// Malformed filter string. Never reaches the wire.
    #[error("invalid filter `{input}`: {message}")]
    FilterSyntax { input: String, message: String },

    /// Unsupported argument or connection option. Never reaches the wire.
    #[error("validation error: {0}")]
    Validation(String),
}

impl LdapError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        LdapError::Protocol(message.into())
    }

    pub(crate) fn filter(input: &str, message: impl Into<String>) -> Self {
        LdapError::FilterSyntax {
            input: input.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        LdapError::Validation(message.into())
    }

    /// True when the connection this error came from must be discarded.
    pub fn is_fatal(&self) -> bool {
        match self {
            LdapError::Transport(_) | LdapError::Protocol(_) => true,
            LdapError::Directory(e) => e.kind() == DirectoryErrorKind::Disconnected,
            LdapError::FilterSyntax { .. } | LdapError::Validation(_) => false,
        }
    }

    /// The directory error, if the server rejected the operation.
    pub fn as_directory(&self) -> Option<&DirectoryError> {
        match self {
            LdapError::Directory(e) => Some(e),
            _ => None,
        }
    }
}

/// Sub-kinds of a server-reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryErrorKind {
    NoSuchObject,
    Disconnected,
    Generic,
}

impl DirectoryErrorKind {
    pub fn from_code(code: i32) -> Self {
        match code {
            RESULT_NO_SUCH_OBJECT => DirectoryErrorKind::NoSuchObject,
            RESULT_SERVER_DOWN | RESULT_CONNECTION_LOST => DirectoryErrorKind::Disconnected,
            _ => DirectoryErrorKind::Generic,
        }
    }
}

/// A nonzero LDAPResult. Code and texts are kept verbatim from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryError {
    kind: DirectoryErrorKind,
    code: i32,
    matched_dn: String,
    message: String,
}

impl DirectoryError {
    pub fn new(code: i32, matched_dn: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: DirectoryErrorKind::from_code(code),
            code,
            matched_dn: matched_dn.into(),
            message: message.into(),
        }
    }

    /// Notice of Disconnection and similar: the server is going away regardless of the code.
    pub fn disconnected(code: i32, message: impl Into<String>) -> Self {
        Self {
            kind: DirectoryErrorKind::Disconnected,
            code,
            matched_dn: String::new(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> DirectoryErrorKind {
        self.kind
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn matched_dn(&self) -> &str {
        &self.matched_dn
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.kind {
            DirectoryErrorKind::NoSuchObject => "no such object",
            DirectoryErrorKind::Disconnected => "disconnected",
            DirectoryErrorKind::Generic => "directory error",
        };
        write!(f, "{} (result code {})", label, self.code)?;
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        if !self.matched_dn.is_empty() {
            write!(f, " [matched: {}]", self.matched_dn)?;
        }
        Ok(())
    }
}

impl std::error::Error for DirectoryError {}

/// Result type alias using LdapError.
pub type Result<T> = std::result::Result<T, LdapError>;
