//! Search filter expressions.
//!
//! A [`Filter`] is produced by [`parse`] (or `str::parse`) from the RFC 4515
//! string form and encoded onto the wire by the protocol engine. Assertion
//! values are kept exactly as written, escapes included; [`unescape`] turns
//! them into the raw octets sent to the server.

mod parser;

use std::fmt;

pub use parser::parse;

/// Deepest nesting of `&`, `|` and `!` accepted by the parser and the encoder.
pub const MAX_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Presence {
        attribute: String,
    },
    Equality {
        attribute: String,
        value: String,
    },
    /// `initial` and `final_` are `None` when the pattern starts or ends with `*`.
    Substring {
        attribute: String,
        initial: Option<String>,
        any: Vec<String>,
        final_: Option<String>,
    },
    Approximate {
        attribute: String,
        value: String,
    },
    GreaterOrEqual {
        attribute: String,
        value: String,
    },
    LessOrEqual {
        attribute: String,
        value: String,
    },
    Extensible {
        attribute: Option<String>,
        rule: Option<String>,
        value: String,
        dn_attributes: bool,
    },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn presence(attribute: impl Into<String>) -> Self {
        Filter::Presence {
            attribute: attribute.into(),
        }
    }

    pub fn equality(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Equality {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    pub fn not(inner: Filter) -> Self {
        Filter::Not(Box::new(inner))
    }
}

impl std::str::FromStr for Filter {
    type Err = crate::error::LdapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Presence { attribute } => write!(f, "({}=*)", attribute),
            Filter::Equality { attribute, value } => write!(f, "({}={})", attribute, value),
            Filter::Substring {
                attribute,
                initial,
                any,
                final_,
            } => {
                write!(f, "({}=", attribute)?;
                if let Some(initial) = initial {
                    f.write_str(initial)?;
                }
                f.write_str("*")?;
                for part in any {
                    write!(f, "{}*", part)?;
                }
                if let Some(final_) = final_ {
                    f.write_str(final_)?;
                }
                f.write_str(")")
            }
            Filter::Approximate { attribute, value } => write!(f, "({}~={})", attribute, value),
            Filter::GreaterOrEqual { attribute, value } => write!(f, "({}>={})", attribute, value),
            Filter::LessOrEqual { attribute, value } => write!(f, "({}<={})", attribute, value),
            Filter::Extensible {
                attribute,
                rule,
                value,
                dn_attributes,
            } => {
                f.write_str("(")?;
                if let Some(attribute) = attribute {
                    f.write_str(attribute)?;
                }
                if *dn_attributes {
                    f.write_str(":dn")?;
                }
                if let Some(rule) = rule {
                    write!(f, ":{}", rule)?;
                }
                write!(f, ":={})", value)
            }
            Filter::And(children) => write_set(f, '&', children),
            Filter::Or(children) => write_set(f, '|', children),
            Filter::Not(inner) => write!(f, "(!{})", inner),
        }
    }
}

fn write_set(f: &mut fmt::Formatter<'_>, op: char, children: &[Filter]) -> fmt::Result {
    write!(f, "({}", op)?;
    for child in children {
        write!(f, "{}", child)?;
    }
    f.write_str(")")
}

/// Decode RFC 4515 escapes in an assertion value.
///
/// `\XX` (two hex digits) yields that octet. A backslash followed by
/// anything else yields the following character literally, and a
/// trailing lone backslash is kept as is.
pub fn unescape(value: &str) -> Vec<u8> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' || i + 1 == bytes.len() {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        let pair = &bytes[i + 1..bytes.len().min(i + 3)];
        if pair.len() == 2 && pair.iter().all(u8::is_ascii_hexdigit) {
            if let Ok(decoded) = hex::decode(pair) {
                out.extend_from_slice(&decoded);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i + 1]);
        i += 2;
    }
    out
}
