//! The request environment and the marshalling into it.
//!
//! One [`Env`] describes one request in the gateway vocabulary that
//! synchronous applications are written against: CGI-style upper-case keys
//! for the request line and headers, and `rack.*` keys for the serving
//! environment.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::net::SocketAddr;

use http::{HeaderMap, Method, Version};
use tracing::error;

use crate::body::Input;

pub const REQUEST_METHOD: &str = "REQUEST_METHOD";
pub const SCRIPT_NAME: &str = "SCRIPT_NAME";
pub const PATH_INFO: &str = "PATH_INFO";
pub const QUERY_STRING: &str = "QUERY_STRING";
pub const SERVER_NAME: &str = "SERVER_NAME";
pub const SERVER_PORT: &str = "SERVER_PORT";
pub const SERVER_PROTOCOL: &str = "SERVER_PROTOCOL";
pub const HTTP_VERSION: &str = "HTTP_VERSION";
pub const REMOTE_ADDR: &str = "REMOTE_ADDR";
pub const CONTENT_LENGTH: &str = "CONTENT_LENGTH";
pub const CONTENT_TYPE: &str = "CONTENT_TYPE";

pub const RACK_VERSION: &str = "rack.version";
pub const RACK_INPUT: &str = "rack.input";
pub const RACK_ERRORS: &str = "rack.errors";
pub const RACK_URL_SCHEME: &str = "rack.url_scheme";
pub const RACK_MULTITHREAD: &str = "rack.multithread";
pub const RACK_MULTIPROCESS: &str = "rack.multiprocess";
pub const RACK_RUN_ONCE: &str = "rack.run_once";
pub const RACK_SESSION: &str = "rack.session";

const HEADER_PREFIX: &str = "HTTP_";
const DEFAULT_PORT: u16 = 80;

/// Header names that describe the body and therefore keep their bare name.
const UNPREFIXED: [&str; 2] = [CONTENT_LENGTH, CONTENT_TYPE];

// Application calls run on the blocking pool, several at a time.
const MULTITHREAD: bool = true;

// ── Values ────────────────────────────────────────────────────────────────────

/// One environment value.
#[derive(Clone, Debug)]
pub enum Value {
    Str(String),
    Int(i64),
    Bool(bool),
    Version(u32, u32),
    Input(Input),
    Errors(Errors),
    Nil,
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self { Self::Str(s.to_owned()) }
}

impl From<String> for Value {
    fn from(s: String) -> Self { Self::Str(s) }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self { Self::Int(n) }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self { Self::Bool(b) }
}

// ── Error sink ────────────────────────────────────────────────────────────────

/// The `rack.errors` stream. Each written line becomes a `tracing` error
/// event under the `bridle::errors` target.
#[derive(Clone, Debug, Default)]
pub struct Errors {
    pending: Vec<u8>,
}

impl Errors {
    fn emit(line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end_matches('\r');
        if !line.is_empty() {
            error!(target: "bridle::errors", "{line}");
        }
    }
}

impl Write for Errors {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        while let Some(at) = self.pending.iter().position(|&b| b == b'\n') {
            let rest = self.pending.split_off(at + 1);
            Self::emit(&self.pending[..at]);
            self.pending = rest;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let pending = std::mem::take(&mut self.pending);
        Self::emit(&pending);
        Ok(())
    }
}

impl Drop for Errors {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

// ── Env ───────────────────────────────────────────────────────────────────────

/// The environment handed to the application, one per request.
///
/// There are no mutators: once built, the environment is read-only.
#[derive(Clone, Debug, Default)]
pub struct Env {
    vars: BTreeMap<String, Value>,
}

impl Env {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_int)
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn method(&self) -> &str {
        self.str(REQUEST_METHOD).unwrap_or_default()
    }

    pub fn path(&self) -> &str {
        self.str(PATH_INFO).unwrap_or_default()
    }

    pub fn query(&self) -> &str {
        self.str(QUERY_STRING).unwrap_or_default()
    }

    /// A fresh reader over the request body, positioned at the start.
    pub fn input(&self) -> Input {
        match self.get(RACK_INPUT) {
            Some(Value::Input(input)) => {
                let mut input = input.clone();
                input.rewind();
                input
            }
            _ => Input::empty(),
        }
    }

    /// A writer into the server's error log.
    pub fn errors(&self) -> Errors {
        Errors::default()
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Env {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self { vars: iter.into_iter().map(|(k, v)| (k.into(), v)).collect() }
    }
}

// ── Request head ──────────────────────────────────────────────────────────────

/// The request line and headers as delivered by the native server.
#[derive(Clone, Debug)]
pub struct RequestHead {
    pub method: Method,
    /// The request target as sent: path plus optional `?query`.
    pub target: String,
    pub version: Version,
    pub headers: HeaderMap,
    /// Authority from an absolute-form URI or HTTP/2 `:authority`.
    pub authority: Option<String>,
    pub peer: Option<SocketAddr>,
}

impl RequestHead {
    pub fn new(
        method: Method,
        target: impl Into<String>,
        version: Version,
        headers: HeaderMap,
    ) -> Self {
        Self { method, target: target.into(), version, headers, authority: None, peer: None }
    }

    pub fn from_parts(parts: &http::request::Parts, peer: Option<SocketAddr>) -> Self {
        let target = parts.uri.path_and_query().map_or("/", |pq| pq.as_str());
        Self {
            method: parts.method.clone(),
            target: target.to_owned(),
            version: parts.version,
            headers: parts.headers.clone(),
            authority: parts.uri.authority().map(|a| a.as_str().to_owned()),
            peer,
        }
    }

    /// The declared body length, if the head carries a usable one.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(http::header::CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    fn host(&self) -> Option<String> {
        match self.headers.get(http::header::HOST) {
            Some(host) => Some(String::from_utf8_lossy(host.as_bytes()).into_owned()),
            None => self.authority.clone(),
        }
    }
}

// ── Marshalling ───────────────────────────────────────────────────────────────

/// Builds the environment for one request.
///
/// `input` must be the finalized body of this same request.
pub fn to_environment(head: &RequestHead, input: Input) -> Env {
    let mut vars = BTreeMap::new();

    let (path, query) = split_target(&head.target);
    let (server_name, server_port) = match head.host() {
        Some(host) => split_host(&host),
        None => (String::new(), DEFAULT_PORT),
    };

    vars.insert(REQUEST_METHOD.to_owned(), Value::from(head.method.as_str()));
    vars.insert(SCRIPT_NAME.to_owned(), Value::from(""));
    vars.insert(PATH_INFO.to_owned(), Value::Str(path));
    vars.insert(QUERY_STRING.to_owned(), Value::from(query));
    vars.insert(SERVER_NAME.to_owned(), Value::Str(server_name));
    vars.insert(SERVER_PORT.to_owned(), Value::Int(i64::from(server_port)));
    vars.insert(SERVER_PROTOCOL.to_owned(), Value::from(protocol(head.version)));
    // A client `Version` header lands on the same key below and wins.
    vars.insert(HTTP_VERSION.to_owned(), Value::from(protocol(head.version)));
    if let Some(peer) = head.peer {
        vars.insert(REMOTE_ADDR.to_owned(), Value::Str(peer.ip().to_string()));
    }

    for name in head.headers.keys() {
        let value = head
            .headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect::<Vec<_>>()
            .join(", ");
        vars.insert(env_key(name.as_str()), Value::Str(value));
    }

    vars.insert(RACK_VERSION.to_owned(), Value::Version(1, 0));
    vars.insert(RACK_INPUT.to_owned(), Value::Input(input));
    vars.insert(RACK_ERRORS.to_owned(), Value::Errors(Errors::default()));
    vars.insert(RACK_URL_SCHEME.to_owned(), Value::from("http"));
    vars.insert(RACK_MULTITHREAD.to_owned(), Value::Bool(MULTITHREAD));
    vars.insert(RACK_MULTIPROCESS.to_owned(), Value::Bool(false));
    vars.insert(RACK_RUN_ONCE.to_owned(), Value::Bool(false));
    vars.insert(RACK_SESSION.to_owned(), Value::Nil);

    Env { vars }
}

/// Maps a header name to its environment key: `X-Forwarded-For` becomes
/// `HTTP_X_FORWARDED_FOR`, `Content-Type` stays `CONTENT_TYPE`.
pub fn env_key(header: &str) -> String {
    let key = header.to_ascii_uppercase().replace('-', "_");
    if UNPREFIXED.contains(&key.as_str()) {
        key
    } else {
        format!("{HEADER_PREFIX}{key}")
    }
}

/// Splits `name[:port]`. A missing or unreadable port means 80.
pub fn split_host(host: &str) -> (String, u16) {
    let split_at = if host.starts_with('[') {
        host.find(']').and_then(|end| host[end..].find(':').map(|i| end + i))
    } else {
        host.find(':')
    };
    match split_at {
        Some(at) => {
            let port = host[at + 1..].trim().parse().unwrap_or(DEFAULT_PORT);
            (host[..at].to_owned(), port)
        }
        None => (host.to_owned(), DEFAULT_PORT),
    }
}

/// Splits a request target into `PATH_INFO` and `QUERY_STRING` at the first
/// `?`. The query is empty, never absent.
pub fn split_target(target: &str) -> (String, &str) {
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    let path = if path.is_empty() || path.starts_with('/') {
        path.to_owned()
    } else {
        format!("/{path}")
    };
    (path, query)
}

fn protocol(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2",
        Version::HTTP_3 => "HTTP/3",
        _ => "HTTP/1.1",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::HeaderValue;
    use proptest::prelude::*;
    use std::io::Read;

    fn head(target: &str, headers: &[(&'static str, &str)]) -> RequestHead {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(*name, HeaderValue::from_str(value).unwrap());
        }
        RequestHead::new(Method::GET, target, Version::HTTP_11, map)
    }

    #[test]
    fn request_line_entries() {
        let head = head("/hello?name=ada&x=1", &[("host", "example.com:3000")]);
        let env = to_environment(&head, Input::empty());

        assert_eq!(env.method(), "GET");
        assert_eq!(env.path(), "/hello");
        assert_eq!(env.query(), "name=ada&x=1");
        assert_eq!(env.str(SCRIPT_NAME), Some(""));
        assert_eq!(env.str(SERVER_NAME), Some("example.com"));
        assert_eq!(env.int(SERVER_PORT), Some(3000));
        assert_eq!(env.str(SERVER_PROTOCOL), Some("HTTP/1.1"));
        assert_eq!(env.str(HTTP_VERSION), Some("HTTP/1.1"));
        assert!(!env.contains(REMOTE_ADDR));
    }

    #[test]
    fn version_header_claims_http_version() {
        let env = to_environment(&head("/", &[("version", "2")]), Input::empty());
        assert_eq!(env.str(HTTP_VERSION), Some("2"));
        assert_eq!(env.str(SERVER_PROTOCOL), Some("HTTP/1.1"));
    }

    #[test]
    fn fixed_metadata_entries() {
        let env = to_environment(&head("/", &[]), Input::empty());

        assert!(matches!(env.get(RACK_VERSION), Some(Value::Version(1, 0))));
        assert!(matches!(env.get(RACK_INPUT), Some(Value::Input(_))));
        assert!(matches!(env.get(RACK_ERRORS), Some(Value::Errors(_))));
        assert_eq!(env.str(RACK_URL_SCHEME), Some("http"));
        assert_eq!(env.bool(RACK_MULTITHREAD), Some(true));
        assert_eq!(env.bool(RACK_MULTIPROCESS), Some(false));
        assert_eq!(env.bool(RACK_RUN_ONCE), Some(false));
        assert!(env.get(RACK_SESSION).is_some_and(Value::is_nil));
    }

    #[test]
    fn headers_are_prefixed_except_content_metadata() {
        let env = to_environment(
            &head("/", &[
                ("host", "h"),
                ("content-type", "text/plain"),
                ("content-length", "8"),
                ("x-request-id", "abc"),
                ("accept-encoding", "gzip"),
            ]),
            Input::empty(),
        );

        assert_eq!(env.str("CONTENT_TYPE"), Some("text/plain"));
        assert_eq!(env.str("CONTENT_LENGTH"), Some("8"));
        assert!(!env.contains("HTTP_CONTENT_TYPE"));
        assert!(!env.contains("HTTP_CONTENT_LENGTH"));
        assert_eq!(env.str("HTTP_X_REQUEST_ID"), Some("abc"));
        assert_eq!(env.str("HTTP_ACCEPT_ENCODING"), Some("gzip"));
        assert_eq!(env.str("HTTP_HOST"), Some("h"));
    }

    #[test]
    fn repeated_headers_join() {
        let head = head("/", &[("accept", "text/html"), ("accept", "*/*")]);
        let env = to_environment(&head, Input::empty());
        assert_eq!(env.str("HTTP_ACCEPT"), Some("text/html, */*"));
    }

    #[test]
    fn host_without_port_defaults_to_80() {
        assert_eq!(split_host("example.com"), ("example.com".to_owned(), 80));
        assert_eq!(split_host("example.com:"), ("example.com".to_owned(), 80));
        assert_eq!(split_host("example.com:http"), ("example.com".to_owned(), 80));
        assert_eq!(split_host("a:1:2"), ("a".to_owned(), 80));
    }

    #[test]
    fn bracketed_ipv6_hosts() {
        assert_eq!(split_host("[::1]:8080"), ("[::1]".to_owned(), 8080));
        assert_eq!(split_host("[::1]"), ("[::1]".to_owned(), 80));
    }

    #[test]
    fn missing_host_falls_back_to_authority_then_defaults() {
        let env = to_environment(&head("/", &[]), Input::empty());
        assert_eq!(env.str(SERVER_NAME), Some(""));
        assert_eq!(env.int(SERVER_PORT), Some(80));

        let mut h2 = head("/", &[]);
        h2.authority = Some("api.local:9443".to_owned());
        let env = to_environment(&h2, Input::empty());
        assert_eq!(env.str(SERVER_NAME), Some("api.local"));
        assert_eq!(env.int(SERVER_PORT), Some(9443));
    }

    #[test]
    fn targets_split_on_first_question_mark() {
        assert_eq!(split_target("/a/b"), ("/a/b".to_owned(), ""));
        assert_eq!(split_target("/a?"), ("/a".to_owned(), ""));
        assert_eq!(split_target("/a?x=1?y=2"), ("/a".to_owned(), "x=1?y=2"));
        assert_eq!(split_target("*"), ("/*".to_owned(), ""));
        assert_eq!(split_target(""), (String::new(), ""));
    }

    #[test]
    fn input_reads_from_the_start_every_time() {
        let env = to_environment(&head("/", &[]), Input::new(Bytes::from_static(b"name=Ada")));
        for _ in 0..2 {
            let mut body = String::new();
            env.input().read_to_string(&mut body).unwrap();
            assert_eq!(body, "name=Ada");
        }
    }

    #[test]
    fn remote_addr_and_protocol() {
        let mut h = head("/", &[]);
        h.version = Version::HTTP_10;
        h.peer = Some("10.1.2.3:55000".parse().unwrap());
        let env = to_environment(&h, Input::empty());
        assert_eq!(env.str(REMOTE_ADDR), Some("10.1.2.3"));
        assert_eq!(env.str(SERVER_PROTOCOL), Some("HTTP/1.0"));
    }

    #[test]
    fn content_length_parsing() {
        assert_eq!(head("/", &[("content-length", "8")]).content_length(), Some(8));
        assert_eq!(head("/", &[("content-length", "eight")]).content_length(), None);
        assert_eq!(head("/", &[]).content_length(), None);
    }

    #[test]
    fn error_sink_accepts_partial_lines() {
        let mut errors = Errors::default();
        write!(errors, "first line\nsecond ").unwrap();
        write!(errors, "half\n").unwrap();
        assert!(errors.pending.is_empty());
        write!(errors, "dangling").unwrap();
        errors.flush().unwrap();
        assert!(errors.pending.is_empty());
    }

    proptest! {
        #[test]
        fn env_keys_follow_the_naming_rule(name in "[A-Za-z][A-Za-z0-9-]{0,20}") {
            let key = env_key(&name);
            let normal = name.to_ascii_uppercase().replace('-', "_");
            if normal == "CONTENT_LENGTH" || normal == "CONTENT_TYPE" {
                prop_assert_eq!(key, normal);
            } else {
                prop_assert_eq!(key, format!("HTTP_{normal}"));
            }
        }

        #[test]
        fn ports_round_trip(name in "[a-z][a-z0-9.-]{0,20}", port in any::<u16>()) {
            prop_assert_eq!(split_host(&format!("{name}:{port}")), (name.clone(), port));
            prop_assert_eq!(split_host(&name), (name, 80));
        }

        #[test]
        fn query_is_everything_after_first_question_mark(
            path in "/[a-z/]{0,12}",
            query in proptest::option::of("[a-z=&?]{0,12}"),
        ) {
            let target = match &query {
                Some(q) => format!("{path}?{q}"),
                None => path.clone(),
            };
            let (p, q) = split_target(&target);
            prop_assert_eq!(p, path);
            prop_assert_eq!(q, query.as_deref().unwrap_or(""));
        }
    }
}
