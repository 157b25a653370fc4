// LDAP message exchange on top of the BER stream
// Message ids, request envelopes, response dispatch, bind/search/unbind

use std::fmt;
use std::io;
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::ber::{BerStream, SEQUENCE, SET};
use crate::entry::Entry;
use crate::error::{DirectoryError, LdapError, Result};
use crate::filter::{unescape, Filter, MAX_DEPTH};

pub const LDAP_TAG_BIND_REQUEST: u8 = 0x60;
pub const LDAP_TAG_BIND_RESPONSE: u8 = 0x61;
pub const LDAP_TAG_UNBIND_REQUEST: u8 = 0x42;
pub const LDAP_TAG_SEARCH_REQUEST: u8 = 0x63;
pub const LDAP_TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const LDAP_TAG_SEARCH_RESULT_DONE: u8 = 0x65;
pub const LDAP_TAG_SEARCH_RESULT_REFERENCE: u8 = 0x73;
pub const LDAP_TAG_EXTENDED_RESPONSE: u8 = 0x78;

/// AuthenticationChoice `simple [0]`
const TAG_SIMPLE_AUTH: u8 = 0x80;
/// LDAPResult `referral [3]`
const TAG_REFERRAL: u8 = 0xA3;
const TAG_RESPONSE_NAME: u8 = 0x8A;
const TAG_RESPONSE_VALUE: u8 = 0x8B;

// Filter CHOICE tags
const FILTER_AND: u8 = 0xA0;
const FILTER_OR: u8 = 0xA1;
const FILTER_NOT: u8 = 0xA2;
const FILTER_EQUALITY: u8 = 0xA3;
const FILTER_SUBSTRINGS: u8 = 0xA4;
const FILTER_GREATER_OR_EQUAL: u8 = 0xA5;
const FILTER_LESS_OR_EQUAL: u8 = 0xA6;
const FILTER_PRESENT: u8 = 0x87;
const FILTER_APPROX: u8 = 0xA8;
const FILTER_EXTENSIBLE: u8 = 0xA9;

const SUBSTRING_INITIAL: u8 = 0x80;
const SUBSTRING_ANY: u8 = 0x81;
const SUBSTRING_FINAL: u8 = 0x82;

const MATCHING_RULE: u8 = 0x81;
const MATCHING_TYPE: u8 = 0x82;
const MATCHING_VALUE: u8 = 0x83;
const MATCHING_DN_ATTRIBUTES: u8 = 0x84;

/// RFC 4511 4.4.1 Notice of Disconnection
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";

pub const LDAP_VERSION: i32 = 3;

/// Message ids wrap back to 1 before reaching this value.
const MESSAGE_ID_LIMIT: i32 = 0x7fff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

impl TryFrom<i32> for SearchScope {
    type Error = LdapError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            _ => Err(LdapError::validation(format!("Invalid search scope: {}", value))),
        }
    }
}

impl FromStr for SearchScope {
    type Err = LdapError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "base" => Ok(SearchScope::BaseObject),
            "one" | "onelevel" => Ok(SearchScope::SingleLevel),
            "sub" | "subtree" => Ok(SearchScope::WholeSubtree),
            _ => Err(LdapError::validation(format!("Invalid search scope: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DerefAliases {
    #[default]
    Never = 0,
    InSearching = 1,
    FindingBaseObject = 2,
    Always = 3,
}

impl FromStr for DerefAliases {
    type Err = LdapError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "never" => Ok(DerefAliases::Never),
            "searching" => Ok(DerefAliases::InSearching),
            "finding" => Ok(DerefAliases::FindingBaseObject),
            "always" => Ok(DerefAliases::Always),
            _ => Err(LdapError::validation(format!("Invalid deref mode: {}", s))),
        }
    }
}

/// Parameters of one search operation.
///
/// The filter is parsed when the request is built, so a malformed filter
/// is reported before anything is sent.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub base: String,
    pub scope: SearchScope,
    pub deref: DerefAliases,
    /// 0 means no client-requested limit.
    pub size_limit: i32,
    /// Seconds; 0 means no client-requested limit.
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

impl SearchRequest {
    pub fn new(base: impl Into<String>, filter: &str) -> Result<Self> {
        Ok(Self {
            base: base.into(),
            scope: SearchScope::WholeSubtree,
            deref: DerefAliases::Never,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter: filter.parse()?,
            attributes: Vec::new(),
        })
    }
}

/// resultCode, matchedDN and diagnosticMessage of an LDAPResult.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
    pub code: i32,
    pub matched_dn: String,
    pub message: String,
}

impl LdapResult {
    pub fn is_success(&self) -> bool {
        self.code == 0
    }

    fn check(&self) -> Result<()> {
        if self.is_success() {
            return Ok(());
        }
        Err(DirectoryError::new(self.code, self.matched_dn.clone(), self.message.clone()).into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    pub name: Option<String>,
    pub value: Option<Vec<u8>>,
}

/// Response operations this client understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Bind,
    SearchEntry,
    SearchReference,
    SearchDone,
    Extended,
}

impl ResponseKind {
    pub fn tag(self) -> u8 {
        match self {
            ResponseKind::Bind => LDAP_TAG_BIND_RESPONSE,
            ResponseKind::SearchEntry => LDAP_TAG_SEARCH_RESULT_ENTRY,
            ResponseKind::SearchReference => LDAP_TAG_SEARCH_RESULT_REFERENCE,
            ResponseKind::SearchDone => LDAP_TAG_SEARCH_RESULT_DONE,
            ResponseKind::Extended => LDAP_TAG_EXTENDED_RESPONSE,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            LDAP_TAG_BIND_RESPONSE => Some(ResponseKind::Bind),
            LDAP_TAG_SEARCH_RESULT_ENTRY => Some(ResponseKind::SearchEntry),
            LDAP_TAG_SEARCH_RESULT_REFERENCE => Some(ResponseKind::SearchReference),
            LDAP_TAG_SEARCH_RESULT_DONE => Some(ResponseKind::SearchDone),
            LDAP_TAG_EXTENDED_RESPONSE => Some(ResponseKind::Extended),
            _ => None,
        }
    }
}

/// A decoded response operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Bind(LdapResult),
    Entry(Entry),
    Reference(Vec<String>),
    Done(LdapResult),
    Extended(ExtendedResponse),
}

fn not_connected() -> LdapError {
    LdapError::Transport(io::Error::new(io::ErrorKind::NotConnected, "connection is closed"))
}

/// Protocol engine bound to one connection.
///
/// Every operation borrows the engine mutably, so exactly one request is
/// outstanding at a time. An operation whose future is dropped before it
/// completes leaves the stream at an unknown offset; the next operation
/// notices and closes the connection instead of reading garbage.
pub struct LdapProtocol<S> {
    ber: Option<BerStream<S>>,
    message_id: i32,
    version: i32,
    in_flight: bool,
}

impl<S> LdapProtocol<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self::with_version(stream, LDAP_VERSION)
    }

    pub fn with_version(stream: S, version: i32) -> Self {
        Self {
            ber: Some(BerStream::new(stream)),
            message_id: 0,
            version,
            in_flight: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.ber.is_some()
    }

    /// Id of the most recently sent request (0 before the first one).
    pub fn last_message_id(&self) -> i32 {
        self.message_id
    }

    fn next_message_id(&mut self) -> i32 {
        self.message_id += 1;
        if self.message_id >= MESSAGE_ID_LIMIT {
            self.message_id = 1;
        }
        self.message_id
    }

    async fn abort(&mut self, reason: &dyn fmt::Display) {
        if let Some(mut ber) = self.ber.take() {
            warn!(%reason, "closing LDAP connection");
            if let Err(e) = ber.shutdown().await {
                debug!(error = %e, "shutdown after fatal error failed");
            }
        }
    }

    /// Send one request and collect its responses.
    ///
    /// `write_body` writes the request operation's content; the envelope and
    /// the operation tag are added here. Responses must carry one of the
    /// `expected` tags. Reading stops after the first response whose kind
    /// is not in `continuation`.
    ///
    /// Transport and protocol failures, and a server-announced
    /// disconnection, close the connection before the error is returned.
    pub async fn send<F>(
        &mut self,
        request_tag: u8,
        write_body: F,
        expected: &[ResponseKind],
        continuation: &[ResponseKind],
    ) -> Result<Vec<Response>>
    where
        F: FnOnce(&mut BerStream<S>) -> Result<()>,
    {
        if self.ber.is_none() {
            return Err(not_connected());
        }
        if self.in_flight {
            let err = LdapError::protocol("Previous operation was interrupted, stream is out of sync");
            self.abort(&err).await;
            return Err(err);
        }

        self.in_flight = true;
        let result = self.exchange(request_tag, write_body, expected, continuation).await;
        self.in_flight = false;

        match result {
            Err(e) if e.is_fatal() => {
                self.abort(&e).await;
                Err(e)
            }
            other => other,
        }
    }

    async fn exchange<F>(
        &mut self,
        request_tag: u8,
        write_body: F,
        expected: &[ResponseKind],
        continuation: &[ResponseKind],
    ) -> Result<Vec<Response>>
    where
        F: FnOnce(&mut BerStream<S>) -> Result<()>,
    {
        let id = self.next_message_id();
        let ber = self.ber.as_mut().ok_or_else(not_connected)?;

        if let Err(e) = write_request(ber, id, request_tag, write_body) {
            ber.discard_writes();
            return Err(e);
        }
        ber.flush().await?;
        debug!(message_id = id, tag = request_tag, "request sent");

        let mut responses = Vec::new();
        loop {
            let (kind, response) = receive(ber, id, expected).await?;
            responses.push(response);
            if !continuation.contains(&kind) {
                break;
            }
        }
        debug!(message_id = id, responses = responses.len(), "operation complete");
        Ok(responses)
    }

    /// Simple bind. An empty password with a non-empty DN is an
    /// unauthenticated bind and most servers reject it (RFC 4513 5.1.2).
    pub async fn bind(&mut self, dn: &str, password: &str) -> Result<()> {
        let version = self.version;
        let responses = self
            .send(
                LDAP_TAG_BIND_REQUEST,
                |ber| {
                    ber.write_int(version);
                    ber.write_string(dn)?;
                    ber.write_string_tagged(password, TAG_SIMPLE_AUTH)
                },
                &[ResponseKind::Bind],
                &[],
            )
            .await?;

        match responses.last() {
            Some(Response::Bind(_)) => {
                debug!(dn, "bind successful");
                Ok(())
            }
            _ => {
                let err = LdapError::protocol("Bind answered without a BindResponse");
                self.abort(&err).await;
                Err(err)
            }
        }
    }

    /// Run a search and return its entries in the order the server sent them.
    /// Continuation references are logged and skipped.
    pub async fn search(&mut self, request: &SearchRequest) -> Result<Vec<Entry>> {
        if request.size_limit < 0 || request.time_limit < 0 {
            return Err(LdapError::validation(format!(
                "Limits must not be negative (size {}, time {})",
                request.size_limit, request.time_limit
            )));
        }

        debug!(base = %request.base, filter = %request.filter, scope = ?request.scope, "search");
        let responses = self
            .send(
                LDAP_TAG_SEARCH_REQUEST,
                |ber| write_search_body(ber, request),
                &[
                    ResponseKind::SearchEntry,
                    ResponseKind::SearchReference,
                    ResponseKind::SearchDone,
                    ResponseKind::Extended,
                ],
                &[
                    ResponseKind::SearchEntry,
                    ResponseKind::SearchReference,
                    ResponseKind::Extended,
                ],
            )
            .await?;

        let mut entries = Vec::with_capacity(responses.len());
        for response in responses {
            match response {
                Response::Entry(entry) => entries.push(entry),
                Response::Reference(urls) => debug!(?urls, "skipping search reference"),
                Response::Extended(ext) => debug!(name = ?ext.name, "ignoring extended response"),
                Response::Done(_) | Response::Bind(_) => {}
            }
        }
        Ok(entries)
    }

    /// Send an UnbindRequest (best effort) and shut the transport down.
    /// Calling this on a closed engine does nothing.
    pub async fn unbind(&mut self) -> Result<()> {
        let Some(mut ber) = self.ber.take() else {
            return Ok(());
        };

        if self.in_flight {
            debug!("skipping unbind on desynchronized connection");
        } else {
            let id = self.next_message_id();
            ber.discard_writes();
            ber.start_sequence(SEQUENCE);
            ber.write_int(id);
            ber.start_sequence(LDAP_TAG_UNBIND_REQUEST);
            ber.end_sequence()?;
            ber.end_sequence()?;
            if let Err(e) = ber.flush().await {
                debug!(error = %e, "unbind not delivered");
            }
        }

        self.in_flight = false;
        if let Err(e) = ber.shutdown().await {
            debug!(error = %e, "shutdown failed");
        }
        Ok(())
    }
}

fn write_request<S, F>(ber: &mut BerStream<S>, id: i32, request_tag: u8, write_body: F) -> Result<()>
where
    F: FnOnce(&mut BerStream<S>) -> Result<()>,
{
    ber.start_sequence(SEQUENCE);
    ber.write_int(id);
    ber.start_sequence(request_tag);
    write_body(ber)?;
    ber.end_sequence()?;
    ber.end_sequence()
}

fn write_search_body<S>(ber: &mut BerStream<S>, request: &SearchRequest) -> Result<()> {
    ber.write_string(&request.base)?;
    ber.write_enumeration(request.scope as i32);
    ber.write_enumeration(request.deref as i32);
    ber.write_int(request.size_limit);
    ber.write_int(request.time_limit);
    ber.write_boolean(request.types_only);
    write_filter(ber, &request.filter)?;
    ber.start_sequence(SEQUENCE);
    for attribute in &request.attributes {
        ber.write_string(attribute)?;
    }
    ber.end_sequence()
}

/// Encode a filter as the SearchRequest `Filter` CHOICE.
///
/// Filters nested deeper than [`MAX_DEPTH`] are rejected before anything is
/// sent.
pub fn write_filter<S>(ber: &mut BerStream<S>, filter: &Filter) -> Result<()> {
    write_filter_at(ber, filter, 1)
}

fn write_filter_at<S>(ber: &mut BerStream<S>, filter: &Filter, depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(LdapError::validation("Filter nested too deeply"));
    }
    match filter {
        Filter::Presence { attribute } => ber.write_string_tagged(attribute, FILTER_PRESENT),
        Filter::Equality { attribute, value } => write_assertion(ber, FILTER_EQUALITY, attribute, value),
        Filter::Approximate { attribute, value } => write_assertion(ber, FILTER_APPROX, attribute, value),
        Filter::GreaterOrEqual { attribute, value } => {
            write_assertion(ber, FILTER_GREATER_OR_EQUAL, attribute, value)
        }
        Filter::LessOrEqual { attribute, value } => {
            write_assertion(ber, FILTER_LESS_OR_EQUAL, attribute, value)
        }
        Filter::Substring {
            attribute,
            initial,
            any,
            final_,
        } => {
            ber.start_sequence(FILTER_SUBSTRINGS);
            ber.write_string(attribute)?;
            ber.start_sequence(SEQUENCE);
            if let Some(initial) = initial {
                ber.write_string_tagged(unescape(initial), SUBSTRING_INITIAL)?;
            }
            for part in any {
                ber.write_string_tagged(unescape(part), SUBSTRING_ANY)?;
            }
            if let Some(final_) = final_ {
                ber.write_string_tagged(unescape(final_), SUBSTRING_FINAL)?;
            }
            ber.end_sequence()?;
            ber.end_sequence()
        }
        Filter::Extensible {
            attribute,
            rule,
            value,
            dn_attributes,
        } => {
            ber.start_sequence(FILTER_EXTENSIBLE);
            if let Some(rule) = rule {
                ber.write_string_tagged(rule, MATCHING_RULE)?;
            }
            if let Some(attribute) = attribute {
                ber.write_string_tagged(attribute, MATCHING_TYPE)?;
            }
            ber.write_string_tagged(unescape(value), MATCHING_VALUE)?;
            // DEFAULT FALSE, so only written when set
            if *dn_attributes {
                ber.write_boolean_tagged(true, MATCHING_DN_ATTRIBUTES);
            }
            ber.end_sequence()
        }
        Filter::And(children) => write_set(ber, FILTER_AND, children, depth),
        Filter::Or(children) => write_set(ber, FILTER_OR, children, depth),
        Filter::Not(inner) => {
            ber.start_sequence(FILTER_NOT);
            write_filter_at(ber, inner, depth + 1)?;
            ber.end_sequence()
        }
    }
}

fn write_assertion<S>(ber: &mut BerStream<S>, tag: u8, attribute: &str, value: &str) -> Result<()> {
    ber.start_sequence(tag);
    ber.write_string(attribute)?;
    ber.write_string(unescape(value))?;
    ber.end_sequence()
}

fn write_set<S>(ber: &mut BerStream<S>, tag: u8, children: &[Filter], depth: usize) -> Result<()> {
    ber.start_sequence(tag);
    for child in children {
        write_filter_at(ber, child, depth + 1)?;
    }
    ber.end_sequence()
}

/// Read one response message. On any failure other than a transport
/// error, the rest of the message is drained so the stream stays framed.
async fn receive<S>(ber: &mut BerStream<S>, id: i32, expected: &[ResponseKind]) -> Result<(ResponseKind, Response)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let outcome = read_message(ber, id, expected).await;
    if let Err(e) = &outcome {
        if !matches!(e, LdapError::Transport(_)) {
            if let Err(drain) = ber.recover().await {
                debug!(error = %drain, "could not drain response");
            }
        }
    }
    outcome
}

async fn read_message<S>(ber: &mut BerStream<S>, id: i32, expected: &[ResponseKind]) -> Result<(ResponseKind, Response)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ber.read_sequence(&[SEQUENCE]).await?;
    let response_id = ber.read_int().await?;

    let mut tags: Vec<u8> = expected.iter().map(|kind| kind.tag()).collect();
    // unsolicited notifications may arrive during any operation
    if response_id == 0 {
        tags.push(LDAP_TAG_EXTENDED_RESPONSE);
    }
    let tag = ber.read_sequence(&tags).await?;
    let kind = ResponseKind::from_tag(tag)
        .ok_or_else(|| LdapError::protocol(format!("Unknown response tag 0x{:02X}", tag)))?;

    let unsolicited = response_id == 0 && kind == ResponseKind::Extended;
    if response_id != id && !unsolicited {
        return Err(LdapError::protocol(format!(
            "Expected message id {}, have {}",
            id, response_id
        )));
    }

    let response = decode(ber, kind, unsolicited).await?;
    ber.finish_sequence()?;
    if ber.remaining() > 0 {
        debug!(bytes = ber.remaining(), "ignoring response controls");
        ber.skip_remaining().await?;
    }
    ber.finish_sequence()?;
    Ok((kind, response))
}

async fn decode<S>(ber: &mut BerStream<S>, kind: ResponseKind, unsolicited: bool) -> Result<Response>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match kind {
        ResponseKind::Bind => {
            let result = read_result(ber).await?;
            // referral, serverSaslCreds
            ber.skip_remaining().await?;
            result.check()?;
            Ok(Response::Bind(result))
        }
        ResponseKind::SearchDone => {
            let result = read_result(ber).await?;
            ber.skip_remaining().await?;
            result.check()?;
            Ok(Response::Done(result))
        }
        ResponseKind::SearchEntry => Ok(Response::Entry(read_entry(ber).await?)),
        ResponseKind::SearchReference => {
            let mut urls = Vec::new();
            while ber.remaining() > 0 {
                urls.push(ber.read_utf8().await?);
            }
            Ok(Response::Reference(urls))
        }
        ResponseKind::Extended => {
            let result = read_result(ber).await?;
            let mut name = None;
            let mut value = None;
            while ber.remaining() > 0 {
                let (tag, bytes) = ber
                    .read_value(&[TAG_REFERRAL, TAG_RESPONSE_NAME, TAG_RESPONSE_VALUE])
                    .await?;
                match tag {
                    TAG_RESPONSE_NAME => name = Some(String::from_utf8_lossy(&bytes).into_owned()),
                    TAG_RESPONSE_VALUE => value = Some(bytes),
                    _ => {}
                }
            }

            if unsolicited || name.as_deref() == Some(NOTICE_OF_DISCONNECTION_OID) {
                return Err(DirectoryError::disconnected(result.code, result.message).into());
            }
            Ok(Response::Extended(ExtendedResponse { result, name, value }))
        }
    }
}

async fn read_result<S>(ber: &mut BerStream<S>) -> Result<LdapResult>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    Ok(LdapResult {
        code: ber.read_enumeration().await?,
        matched_dn: ber.read_utf8().await?,
        message: ber.read_utf8().await?,
    })
}

async fn read_entry<S>(ber: &mut BerStream<S>) -> Result<Entry>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut entry = Entry::new(ber.read_utf8().await?);

    ber.read_sequence(&[SEQUENCE]).await?;
    while ber.remaining() > 0 {
        ber.read_sequence(&[SEQUENCE]).await?;
        let name = ber.read_utf8().await?;
        ber.read_sequence(&[SET]).await?;
        let mut values = Vec::new();
        while ber.remaining() > 0 {
            values.push(ber.read_string().await?);
        }
        ber.finish_sequence()?;
        ber.finish_sequence()?;
        entry.add_values(&name, values);
    }
    ber.finish_sequence()?;

    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ber::{ENUMERATION, INTEGER, OCTET_STRING};
    use crate::error::DirectoryErrorKind;
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};

    type Server = BerStream<DuplexStream>;

    fn connect() -> (LdapProtocol<DuplexStream>, Server) {
        let (client, server) = duplex(64 * 1024);
        (LdapProtocol::new(client), BerStream::new(server))
    }

    fn encoded(filter: &str) -> Vec<u8> {
        let (client, _server) = duplex(1024);
        let mut ber = BerStream::new(client);
        write_filter(&mut ber, &filter.parse().unwrap()).unwrap();
        ber.pending().to_vec()
    }

    /// Read a request envelope, returning its message id and operation tag.
    /// The operation body is left open for the caller.
    async fn read_request(server: &mut Server) -> (i32, u8) {
        server.read_sequence(&[SEQUENCE]).await.unwrap();
        let id = server.read_int().await.unwrap();
        let tag = server
            .read_sequence(&[LDAP_TAG_BIND_REQUEST, LDAP_TAG_SEARCH_REQUEST, LDAP_TAG_UNBIND_REQUEST])
            .await
            .unwrap();
        (id, tag)
    }

    async fn skip_request(server: &mut Server) -> (i32, u8) {
        let (id, tag) = read_request(server).await;
        server.skip_remaining().await.unwrap();
        server.finish_sequence().unwrap();
        server.finish_sequence().unwrap();
        (id, tag)
    }

    fn result(server: &mut Server, id: i32, tag: u8, code: i32, matched: &str, message: &str) {
        server.start_sequence(SEQUENCE);
        server.write_int(id);
        server.start_sequence(tag);
        server.write_enumeration(code);
        server.write_string(matched).unwrap();
        server.write_string(message).unwrap();
        server.end_sequence().unwrap();
        server.end_sequence().unwrap();
    }

    fn entry(server: &mut Server, id: i32, dn: &str, attributes: &[(&str, &[&str])]) {
        server.start_sequence(SEQUENCE);
        server.write_int(id);
        server.start_sequence(LDAP_TAG_SEARCH_RESULT_ENTRY);
        server.write_string(dn).unwrap();
        server.start_sequence(SEQUENCE);
        for (name, values) in attributes {
            server.start_sequence(SEQUENCE);
            server.write_string(name).unwrap();
            server.start_sequence(SET);
            for value in *values {
                server.write_string(value).unwrap();
            }
            server.end_sequence().unwrap();
            server.end_sequence().unwrap();
        }
        server.end_sequence().unwrap();
        server.end_sequence().unwrap();
        server.end_sequence().unwrap();
    }

    #[test]
    fn test_search_scope_try_from() {
        assert_eq!(SearchScope::try_from(0).unwrap(), SearchScope::BaseObject);
        assert_eq!(SearchScope::try_from(2).unwrap(), SearchScope::WholeSubtree);
        assert!(matches!(SearchScope::try_from(3), Err(LdapError::Validation(_))));
        assert_eq!("sub".parse::<SearchScope>().unwrap(), SearchScope::WholeSubtree);
        assert_eq!("one".parse::<SearchScope>().unwrap(), SearchScope::SingleLevel);
    }

    #[test]
    fn test_deref_from_str() {
        assert_eq!("never".parse::<DerefAliases>().unwrap(), DerefAliases::Never);
        assert_eq!("Always".parse::<DerefAliases>().unwrap(), DerefAliases::Always);
        assert_eq!("finding".parse::<DerefAliases>().unwrap() as i32, 2);
        assert!("sometimes".parse::<DerefAliases>().is_err());
    }

    #[test]
    fn test_response_kind_tags() {
        for kind in [
            ResponseKind::Bind,
            ResponseKind::SearchEntry,
            ResponseKind::SearchReference,
            ResponseKind::SearchDone,
            ResponseKind::Extended,
        ] {
            assert_eq!(ResponseKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(ResponseKind::from_tag(LDAP_TAG_SEARCH_REQUEST), None);
    }

    #[test]
    fn test_encode_equality_and_presence() {
        assert_eq!(
            encoded("(cn=Test)"),
            vec![0xA3, 0x0A, 0x04, 0x02, b'c', b'n', 0x04, 0x04, b'T', b'e', b's', b't']
        );
        let mut presence = vec![0x87, 0x0B];
        presence.extend_from_slice(b"objectClass");
        assert_eq!(encoded("objectClass=*"), presence);
    }

    #[test]
    fn test_encode_substring() {
        assert_eq!(
            encoded("(cn=a*b*c)"),
            vec![
                0xA4, 0x0F, 0x04, 0x02, b'c', b'n', 0x30, 0x09, 0x80, 0x01, b'a', 0x81, 0x01, b'b', 0x82, 0x01,
                b'c'
            ]
        );
        assert_eq!(
            encoded("(cn=*x)"),
            vec![0xA4, 0x09, 0x04, 0x02, b'c', b'n', 0x30, 0x03, 0x82, 0x01, b'x']
        );
    }

    #[test]
    fn test_encode_not_and_or() {
        assert_eq!(
            encoded("(!(cn=x))"),
            vec![0xA2, 0x09, 0xA3, 0x07, 0x04, 0x02, b'c', b'n', 0x04, 0x01, b'x']
        );
        assert_eq!(
            encoded("(&(a=1)(b>=2))"),
            vec![
                0xA0, 0x10, 0xA3, 0x06, 0x04, 0x01, b'a', 0x04, 0x01, b'1', 0xA5, 0x06, 0x04, 0x01, b'b', 0x04,
                0x01, b'2'
            ]
        );
        assert_eq!(encoded("(|)"), vec![0xA1, 0x00]);
    }

    #[test]
    fn test_encode_extensible() {
        let mut expected = vec![0xA9, 0x14, 0x81, 0x08];
        expected.extend_from_slice(b"2.5.13.5");
        expected.extend_from_slice(&[0x82, 0x02, b'c', b'n', 0x83, 0x01, b'x', 0x84, 0x01, 0xFF]);
        assert_eq!(encoded("(cn:dn:2.5.13.5:=x)"), expected);

        assert_eq!(
            encoded("(cn:=x)"),
            vec![0xA9, 0x07, 0x82, 0x02, b'c', b'n', 0x83, 0x01, b'x']
        );
    }

    #[test]
    fn test_encode_unescapes_values() {
        assert_eq!(
            encoded("(cn=a\\2ab)"),
            vec![0xA3, 0x09, 0x04, 0x02, b'c', b'n', 0x04, 0x03, b'a', b'*', b'b']
        );
        assert_eq!(
            encoded("(cn=\\28x*)"),
            vec![0xA4, 0x0A, 0x04, 0x02, b'c', b'n', 0x30, 0x04, 0x80, 0x02, b'(', b'x']
        );
    }

    #[test]
    fn test_encode_substring_keeps_empty_any() {
        assert_eq!(
            encoded("(cn=a**b)"),
            vec![
                0xA4, 0x0E, 0x04, 0x02, b'c', b'n', 0x30, 0x08, 0x80, 0x01, b'a', 0x81, 0x00, 0x82, 0x01, b'b'
            ]
        );
        assert_eq!(
            encoded("(cn=**)"),
            vec![0xA4, 0x08, 0x04, 0x02, b'c', b'n', 0x30, 0x02, 0x81, 0x00]
        );
    }

    #[test]
    fn test_encode_rejects_deep_nesting() {
        let mut filter = Filter::presence("cn");
        for _ in 0..MAX_DEPTH {
            filter = Filter::not(filter);
        }
        let (client, _server) = duplex(1024);
        let mut ber = BerStream::new(client);
        let err = write_filter(&mut ber, &filter).unwrap_err();
        assert!(matches!(err, LdapError::Validation(ref m) if m == "Filter nested too deeply"));

        let Filter::Not(inner) = filter else { unreachable!() };
        let mut ber = BerStream::new(duplex(1024).0);
        write_filter(&mut ber, &inner).unwrap();
    }

    #[test]
    fn test_message_id_sequence_and_wrap() {
        let (client, _server) = duplex(1024);
        let mut protocol = LdapProtocol::new(client);
        assert_eq!(protocol.next_message_id(), 1);
        assert_eq!(protocol.next_message_id(), 2);
        protocol.message_id = 0x7fff_fffd;
        assert_eq!(protocol.next_message_id(), 0x7fff_fffe);
        assert_eq!(protocol.next_message_id(), 1);
    }

    #[tokio::test]
    async fn test_bind_request_encoding_and_success() {
        let (mut protocol, mut server) = connect();
        let handle = tokio::spawn(async move {
            let (id, tag) = read_request(&mut server).await;
            assert_eq!(tag, LDAP_TAG_BIND_REQUEST);
            assert_eq!(server.read_int().await.unwrap(), 3);
            let dn = server.read_utf8().await.unwrap();
            let (auth_tag, password) = server.read_value(&[TAG_SIMPLE_AUTH]).await.unwrap();
            server.finish_sequence().unwrap();
            server.finish_sequence().unwrap();
            assert_eq!(server.read_depth(), 0);

            result(&mut server, id, LDAP_TAG_BIND_RESPONSE, 0, "", "");
            server.flush().await.unwrap();
            (id, dn, auth_tag, password)
        });

        protocol.bind("cn=admin,dc=example,dc=com", "secret").await.unwrap();
        let (id, dn, auth_tag, password) = handle.await.unwrap();
        assert_eq!(id, 1);
        assert_eq!(dn, "cn=admin,dc=example,dc=com");
        assert_eq!(auth_tag, 0x80);
        assert_eq!(password, b"secret".to_vec());
        assert!(protocol.is_connected());
    }

    #[tokio::test]
    async fn test_bind_failure_keeps_code_and_text() {
        let (mut protocol, mut server) = connect();
        tokio::spawn(async move {
            let (id, _) = skip_request(&mut server).await;
            result(&mut server, id, LDAP_TAG_BIND_RESPONSE, 49, "", "80090308: LdapErr: DSID-0C09042F");
            server.flush().await.unwrap();
            server
        });

        let err = protocol.bind("cn=admin", "wrong").await.unwrap_err();
        let directory = err.as_directory().unwrap();
        assert_eq!(directory.code(), 49);
        assert_eq!(directory.message(), "80090308: LdapErr: DSID-0C09042F");
        assert_eq!(directory.kind(), DirectoryErrorKind::Generic);
        assert!(protocol.is_connected());
    }

    #[tokio::test]
    async fn test_bind_server_down_code_disconnects() {
        let (mut protocol, mut server) = connect();
        tokio::spawn(async move {
            let (id, _) = skip_request(&mut server).await;
            result(&mut server, id, LDAP_TAG_BIND_RESPONSE, 81, "", "server down");
            server.flush().await.unwrap();
            server
        });

        let err = protocol.bind("cn=admin", "pw").await.unwrap_err();
        assert_eq!(err.as_directory().unwrap().kind(), DirectoryErrorKind::Disconnected);
        assert!(!protocol.is_connected());
    }

    #[tokio::test]
    async fn test_bind_answered_by_extended_response_is_fatal() {
        let (mut protocol, mut server) = connect();
        tokio::spawn(async move {
            let (id, _) = skip_request(&mut server).await;
            result(&mut server, id, LDAP_TAG_EXTENDED_RESPONSE, 0, "", "");
            result(&mut server, id, LDAP_TAG_BIND_RESPONSE, 0, "", "");
            server.flush().await.unwrap();
            server
        });

        let err = protocol.bind("cn=admin", "pw").await.unwrap_err();
        assert!(matches!(err, LdapError::Protocol(_)));
        assert!(err.is_fatal());
        assert!(!protocol.is_connected());
    }

    #[tokio::test]
    async fn test_notice_of_disconnection_during_bind() {
        let (mut protocol, mut server) = connect();
        tokio::spawn(async move {
            skip_request(&mut server).await;
            server.start_sequence(SEQUENCE);
            server.write_int(0);
            server.start_sequence(LDAP_TAG_EXTENDED_RESPONSE);
            server.write_enumeration(51);
            server.write_string("").unwrap();
            server.write_string("busy").unwrap();
            server.write_string_tagged(NOTICE_OF_DISCONNECTION_OID, TAG_RESPONSE_NAME).unwrap();
            server.end_sequence().unwrap();
            server.end_sequence().unwrap();
            server.flush().await.unwrap();
            server
        });

        let err = protocol.bind("cn=admin", "pw").await.unwrap_err();
        let directory = err.as_directory().unwrap();
        assert_eq!(directory.kind(), DirectoryErrorKind::Disconnected);
        assert_eq!(directory.code(), 51);
        assert!(!protocol.is_connected());
    }

    #[tokio::test]
    async fn test_search_request_body_order() {
        let (mut protocol, mut server) = connect();
        let handle = tokio::spawn(async move {
            let (id, tag) = read_request(&mut server).await;
            assert_eq!(tag, LDAP_TAG_SEARCH_REQUEST);
            let base = server.read_utf8().await.unwrap();
            let scope = server.read_int_tagged(&[ENUMERATION]).await.unwrap();
            let deref = server.read_enumeration().await.unwrap();
            let size = server.read_int_tagged(&[INTEGER]).await.unwrap();
            let time = server.read_int().await.unwrap();
            let types_only = server.read_boolean().await.unwrap();
            let (filter_tag, _) = server.read_value(&[FILTER_EQUALITY]).await.unwrap();
            server.read_sequence(&[SEQUENCE]).await.unwrap();
            let mut attributes = Vec::new();
            while server.remaining() > 0 {
                attributes.push(server.read_utf8().await.unwrap());
            }
            server.finish_sequence().unwrap();
            server.finish_sequence().unwrap();
            server.finish_sequence().unwrap();

            result(&mut server, id, LDAP_TAG_SEARCH_RESULT_DONE, 0, "", "");
            server.flush().await.unwrap();
            (base, scope, deref, size, time, types_only, filter_tag, attributes)
        });

        let mut request = SearchRequest::new("dc=example,dc=com", "(uid=jdoe)").unwrap();
        request.scope = SearchScope::SingleLevel;
        request.deref = DerefAliases::Always;
        request.size_limit = 500;
        request.time_limit = 30;
        request.types_only = true;
        request.attributes = vec!["cn".into(), "mail".into()];
        let entries = protocol.search(&request).await.unwrap();
        assert!(entries.is_empty());

        let (base, scope, deref, size, time, types_only, filter_tag, attributes) = handle.await.unwrap();
        assert_eq!(base, "dc=example,dc=com");
        assert_eq!(scope, 1);
        assert_eq!(deref, 3);
        assert_eq!(size, 500);
        assert_eq!(time, 30);
        assert!(types_only);
        assert_eq!(filter_tag, FILTER_EQUALITY);
        assert_eq!(attributes, vec!["cn", "mail"]);
    }

    #[tokio::test]
    async fn test_search_returns_entries_in_order() {
        let (mut protocol, mut server) = connect();
        tokio::spawn(async move {
            let (id, _) = skip_request(&mut server).await;
            entry(&mut server, id, "uid=a,dc=example", &[("cn", &["Alice"][..]), ("objectClass", &["top", "person"][..])]);
            // continuation reference between entries
            server.start_sequence(SEQUENCE);
            server.write_int(id);
            server.start_sequence(LDAP_TAG_SEARCH_RESULT_REFERENCE);
            server.write_string("ldap://other.example/dc=example").unwrap();
            server.end_sequence().unwrap();
            server.end_sequence().unwrap();
            entry(&mut server, id, "uid=b,dc=example", &[("CN", &["Bob"][..])]);
            result(&mut server, id, LDAP_TAG_SEARCH_RESULT_DONE, 0, "", "");
            server.flush().await.unwrap();
            server
        });

        let request = SearchRequest::new("dc=example", "(objectClass=person)").unwrap();
        let entries = protocol.search(&request).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].dn(), "uid=a,dc=example");
        assert_eq!(entries[0].first_str("cn"), Some("Alice"));
        assert_eq!(entries[0].attribute("objectclass").unwrap().len(), 2);
        assert_eq!(entries[1].dn(), "uid=b,dc=example");
        assert_eq!(entries[1].first_str("cn"), Some("Bob"));
    }

    #[tokio::test]
    async fn test_search_no_such_object() {
        let (mut protocol, mut server) = connect();
        tokio::spawn(async move {
            let (id, _) = skip_request(&mut server).await;
            result(&mut server, id, LDAP_TAG_SEARCH_RESULT_DONE, 32, "dc=example", "no such entry");
            server.flush().await.unwrap();
            // next operation must still find the stream framed
            let (id, _) = skip_request(&mut server).await;
            result(&mut server, id, LDAP_TAG_BIND_RESPONSE, 0, "", "");
            server.flush().await.unwrap();
            server
        });

        let request = SearchRequest::new("ou=missing,dc=example", "(objectClass=*)").unwrap();
        let err = protocol.search(&request).await.unwrap_err();
        let directory = err.as_directory().unwrap();
        assert_eq!(directory.kind(), DirectoryErrorKind::NoSuchObject);
        assert_eq!(directory.matched_dn(), "dc=example");
        assert!(protocol.is_connected());

        protocol.bind("", "").await.unwrap();
        assert_eq!(protocol.last_message_id(), 2);
    }

    #[tokio::test]
    async fn test_response_controls_are_skipped() {
        let (mut protocol, mut server) = connect();
        tokio::spawn(async move {
            let (id, _) = skip_request(&mut server).await;
            server.start_sequence(SEQUENCE);
            server.write_int(id);
            server.start_sequence(LDAP_TAG_BIND_RESPONSE);
            server.write_enumeration(0);
            server.write_string("").unwrap();
            server.write_string("").unwrap();
            server.end_sequence().unwrap();
            server.start_sequence(0xA0);
            server.start_sequence(SEQUENCE);
            server.write_string("1.2.840.113556.1.4.319").unwrap();
            server.end_sequence().unwrap();
            server.end_sequence().unwrap();
            server.end_sequence().unwrap();
            server.flush().await.unwrap();
            server
        });

        protocol.bind("cn=admin", "pw").await.unwrap();
        assert!(protocol.is_connected());
    }

    #[tokio::test]
    async fn test_message_id_mismatch_is_fatal() {
        let (mut protocol, mut server) = connect();
        tokio::spawn(async move {
            let (id, _) = skip_request(&mut server).await;
            result(&mut server, id + 5, LDAP_TAG_BIND_RESPONSE, 0, "", "");
            server.flush().await.unwrap();
            server
        });

        let err = protocol.bind("cn=admin", "pw").await.unwrap_err();
        assert!(matches!(err, LdapError::Protocol(ref m) if m.contains("message id")));
        assert!(!protocol.is_connected());
    }

    #[tokio::test]
    async fn test_unexpected_tag_is_fatal() {
        let (mut protocol, mut server) = connect();
        tokio::spawn(async move {
            let (id, _) = skip_request(&mut server).await;
            result(&mut server, id, LDAP_TAG_SEARCH_RESULT_DONE, 0, "", "");
            server.flush().await.unwrap();
            server
        });

        let err = protocol.bind("cn=admin", "pw").await.unwrap_err();
        assert!(matches!(err, LdapError::Protocol(_)));
        assert!(!protocol.is_connected());

        let err = protocol.bind("cn=admin", "pw").await.unwrap_err();
        assert!(matches!(err, LdapError::Transport(ref e) if e.kind() == io::ErrorKind::NotConnected));
    }

    #[tokio::test]
    async fn test_notice_of_disconnection() {
        let (mut protocol, mut server) = connect();
        tokio::spawn(async move {
            skip_request(&mut server).await;
            server.start_sequence(SEQUENCE);
            server.write_int(0);
            server.start_sequence(LDAP_TAG_EXTENDED_RESPONSE);
            server.write_enumeration(52);
            server.write_string("").unwrap();
            server.write_string("server shutting down").unwrap();
            server.write_string_tagged(NOTICE_OF_DISCONNECTION_OID, TAG_RESPONSE_NAME).unwrap();
            server.end_sequence().unwrap();
            server.end_sequence().unwrap();
            server.flush().await.unwrap();
            server
        });

        let request = SearchRequest::new("dc=example", "(cn=*)").unwrap();
        let err = protocol.search(&request).await.unwrap_err();
        let directory = err.as_directory().unwrap();
        assert_eq!(directory.kind(), DirectoryErrorKind::Disconnected);
        assert_eq!(directory.code(), 52);
        assert_eq!(directory.message(), "server shutting down");
        assert!(!protocol.is_connected());
    }

    #[tokio::test]
    async fn test_truncated_response_is_transport_error() {
        let (mut protocol, mut server) = connect();
        tokio::spawn(async move {
            let (id, _) = skip_request(&mut server).await;
            server.write(&[0x30, 0x0C, 0x02, 0x01, id as u8, 0x61, 0x07, 0x0A, 0x01]);
            server.flush().await.unwrap();
            server.shutdown().await.unwrap();
        });

        let err = protocol.bind("cn=admin", "pw").await.unwrap_err();
        assert!(matches!(err, LdapError::Transport(_)));
        assert!(!protocol.is_connected());
    }

    #[tokio::test]
    async fn test_interrupted_operation_poisons_connection() {
        let (mut protocol, server) = connect();
        let request = SearchRequest::new("dc=example", "(cn=*)").unwrap();
        let timed_out = tokio::time::timeout(Duration::from_millis(50), protocol.search(&request)).await;
        assert!(timed_out.is_err());
        assert!(protocol.is_connected());

        let err = protocol.bind("cn=admin", "pw").await.unwrap_err();
        assert!(matches!(err, LdapError::Protocol(_)));
        assert!(!protocol.is_connected());
        drop(server);
    }

    #[tokio::test]
    async fn test_negative_limits_rejected_locally() {
        let (mut protocol, _server) = connect();
        let mut request = SearchRequest::new("dc=example", "(cn=*)").unwrap();
        request.size_limit = -1;
        let err = protocol.search(&request).await.unwrap_err();
        assert!(matches!(err, LdapError::Validation(_)));
        assert!(protocol.is_connected());
        assert_eq!(protocol.last_message_id(), 0);
    }

    #[tokio::test]
    async fn test_unbind_is_sent_once() {
        let (mut protocol, mut server) = connect();
        protocol.unbind().await.unwrap();
        assert!(!protocol.is_connected());
        protocol.unbind().await.unwrap();

        let (id, tag) = read_request(&mut server).await;
        assert_eq!((id, tag), (1, LDAP_TAG_UNBIND_REQUEST));
        assert_eq!(server.remaining(), 0);
        server.finish_sequence().unwrap();
        server.finish_sequence().unwrap();
    }

    #[tokio::test]
    async fn test_server_side_helpers_produce_valid_ber() {
        let (_client, server_io) = duplex(1024);
        let mut server = BerStream::new(server_io);
        result(&mut server, 7, LDAP_TAG_BIND_RESPONSE, 0, "", "");
        assert_eq!(
            server.pending(),
            &[0x30, 0x0C, 0x02, 0x01, 0x07, 0x61, 0x07, 0x0A, 0x01, 0x00, OCTET_STRING, 0x00, OCTET_STRING, 0x00][..]
        );
    }
}
