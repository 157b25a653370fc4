// Search result entries

use std::collections::BTreeMap;

/// One `SearchResultEntry` as returned by the server.
///
/// Attribute names are stored lowercased; lookups are case-insensitive.
/// Values keep the order the server sent them in and are raw octets,
/// since binary attributes (`jpegPhoto`, `objectGUID`) are not UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    dn: String,
    attributes: BTreeMap<String, Vec<Vec<u8>>>,
}

impl Entry {
    pub(crate) fn new(dn: String) -> Self {
        Self {
            dn,
            attributes: BTreeMap::new(),
        }
    }

    /// A repeated attribute description appends to the values already held.
    pub(crate) fn add_values(&mut self, name: &str, values: Vec<Vec<u8>>) {
        self.attributes
            .entry(name.to_ascii_lowercase())
            .or_default()
            .extend(values);
    }

    pub fn dn(&self) -> &str {
        &self.dn
    }

    pub fn attribute(&self, name: &str) -> Option<&[Vec<u8>]> {
        self.attributes
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
    }

    /// First value of `name`, if present and valid UTF-8.
    pub fn first_str(&self, name: &str) -> Option<&str> {
        self.attribute(name)?
            .first()
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    /// All attributes, keyed by lowercased name.
    pub fn attributes(&self) -> &BTreeMap<String, Vec<Vec<u8>>> {
        &self.attributes
    }

    pub fn into_parts(self) -> (String, BTreeMap<String, Vec<Vec<u8>>>) {
        (self.dn, self.attributes)
    }
}
