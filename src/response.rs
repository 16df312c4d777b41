//! The application's answer: status, headers and a lazy body.
//!
//! Applications rarely build a [`Response`] by hand. Returning the classic
//! triple is enough:
//!
//! ```rust
//! use bridle::{Env, Headers};
//!
//! fn app(_env: Env) -> (u16, Headers, Vec<&'static str>) {
//!     (200, Headers::from([("Content-Type", "text/plain")]), vec!["Hello world!"])
//! }
//! ```

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use indexmap::IndexMap;

use crate::error::{BoxError, Error};

const FILE_CHUNK: usize = 8192;

// ── Headers ───────────────────────────────────────────────────────────────────

/// One or more values for a single header name.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Values(Vec<String>);

impl Values {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl From<&str> for Values {
    fn from(v: &str) -> Self { Self(vec![v.to_owned()]) }
}

impl From<String> for Values {
    fn from(v: String) -> Self { Self(vec![v]) }
}

impl From<Vec<String>> for Values {
    fn from(v: Vec<String>) -> Self { Self(v) }
}

impl From<Vec<&str>> for Values {
    fn from(v: Vec<&str>) -> Self { Self(v.into_iter().map(str::to_owned).collect()) }
}

impl<const N: usize> From<[&str; N]> for Values {
    fn from(v: [&str; N]) -> Self { Self(v.iter().map(|s| (*s).to_owned()).collect()) }
}

/// Response headers: unique names, each with one or more values, kept in
/// insertion order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Headers(IndexMap<String, Values>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `name`, replacing any earlier values.
    pub fn insert(&mut self, name: impl Into<String>, values: impl Into<Values>) {
        self.0.insert(name.into(), values.into());
    }

    pub fn with(mut self, name: impl Into<String>, values: impl Into<Values>) -> Self {
        self.insert(name, values);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Values> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Values)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K: Into<String>, V: Into<Values>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (name, values) in iter {
            headers.insert(name, values);
        }
        headers
    }
}

impl<K: Into<String>, V: Into<Values>, const N: usize> From<[(K, V); N]> for Headers {
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}

/// Converts application headers into the native header set.
///
/// Every value becomes its own header line. A value containing `\n` is
/// several values folded into one string and is split the same way.
pub fn to_native_headers(headers: &Headers) -> Result<HeaderMap, Error> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, values) in headers.iter() {
        let header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| Error::InvalidHeader(name.to_owned()))?;
        for value in values.iter().flat_map(|v| v.split('\n')) {
            let value = HeaderValue::from_str(value)
                .map_err(|_| Error::InvalidHeader(format!("{name}: {value:?}")))?;
            map.append(header.clone(), value);
        }
    }
    Ok(map)
}

// ── Body ──────────────────────────────────────────────────────────────────────

/// A lazy, single-pass sequence of response chunks.
///
/// The pump calls [`close`](Body::close) exactly once after the last chunk or
/// after a failure, whichever comes first.
pub trait Body {
    fn next_chunk(&mut self) -> Option<Result<Bytes, BoxError>>;

    /// Releases whatever the body holds open.
    fn close(&mut self) {}
}

/// An in-memory body.
#[derive(Debug, Default)]
pub struct Chunks(std::vec::IntoIter<Bytes>);

impl Chunks {
    pub fn new(chunks: Vec<Bytes>) -> Self {
        Self(chunks.into_iter())
    }
}

impl Body for Chunks {
    fn next_chunk(&mut self) -> Option<Result<Bytes, BoxError>> {
        self.0.next().map(Ok)
    }
}

/// A body backed by any fallible iterator. The iterator is dropped on close.
pub struct IterBody<I>(Option<I>);

impl<I> IterBody<I> {
    pub fn new(iter: I) -> Self {
        Self(Some(iter))
    }
}

impl<I, T, E> Body for IterBody<I>
where
    I: Iterator<Item = Result<T, E>>,
    T: Into<Bytes>,
    E: Into<BoxError>,
{
    fn next_chunk(&mut self) -> Option<Result<Bytes, BoxError>> {
        let item = self.0.as_mut()?.next()?;
        Some(item.map(Into::into).map_err(Into::into))
    }

    fn close(&mut self) {
        self.0 = None;
    }
}

/// Streams a file in fixed-size chunks. The file handle is released on close.
#[derive(Debug)]
pub struct FileBody {
    file: Option<File>,
}

impl FileBody {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::new(File::open(path)?))
    }

    pub fn new(file: File) -> Self {
        Self { file: Some(file) }
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }
}

impl Body for FileBody {
    fn next_chunk(&mut self) -> Option<Result<Bytes, BoxError>> {
        let file = self.file.as_mut()?;
        let mut buf = vec![0; FILE_CHUNK];
        match file.read(&mut buf) {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some(Ok(Bytes::from(buf)))
            }
            Err(e) => Some(Err(e.into())),
        }
    }

    fn close(&mut self) {
        self.file = None;
    }
}

/// Conversion into a boxed [`Body`].
pub trait IntoBody {
    fn into_body(self) -> Box<dyn Body>;
}

impl IntoBody for Box<dyn Body> {
    fn into_body(self) -> Box<dyn Body> { self }
}

impl<T: Into<Bytes>> IntoBody for Vec<T> {
    fn into_body(self) -> Box<dyn Body> {
        Box::new(Chunks::new(self.into_iter().map(Into::into).collect()))
    }
}

impl IntoBody for &'static str {
    fn into_body(self) -> Box<dyn Body> { vec![self].into_body() }
}

impl IntoBody for String {
    fn into_body(self) -> Box<dyn Body> { vec![self].into_body() }
}

impl IntoBody for Bytes {
    fn into_body(self) -> Box<dyn Body> { vec![self].into_body() }
}

impl IntoBody for () {
    fn into_body(self) -> Box<dyn Body> { Box::new(Chunks::default()) }
}

impl IntoBody for Chunks {
    fn into_body(self) -> Box<dyn Body> { Box::new(self) }
}

impl IntoBody for FileBody {
    fn into_body(self) -> Box<dyn Body> { Box::new(self) }
}

impl<I> IntoBody for IterBody<I>
where
    IterBody<I>: Body + 'static,
{
    fn into_body(self) -> Box<dyn Body> { Box::new(self) }
}

// ── Status ────────────────────────────────────────────────────────────────────

/// Anything an application may hand back as a status: an integer, a numeric
/// string, or a [`StatusCode`].
pub trait IntoStatus {
    fn into_status(self) -> Result<StatusCode, Error>;
}

impl IntoStatus for StatusCode {
    fn into_status(self) -> Result<StatusCode, Error> { Ok(self) }
}

// Bare literals default to i32, so every common integer type is accepted.
macro_rules! int_status {
    ($($t:ty),*) => {$(
        impl IntoStatus for $t {
            fn into_status(self) -> Result<StatusCode, Error> {
                u16::try_from(self)
                    .ok()
                    .and_then(|code| StatusCode::from_u16(code).ok())
                    .ok_or_else(|| Error::InvalidStatus(self.to_string()))
            }
        }
    )*};
}

int_status!(u16, u32, u64, usize, i32, i64);

impl IntoStatus for &str {
    fn into_status(self) -> Result<StatusCode, Error> {
        let code: u16 = self.trim().parse().map_err(|_| Error::InvalidStatus(self.to_owned()))?;
        code.into_status()
    }
}

impl IntoStatus for String {
    fn into_status(self) -> Result<StatusCode, Error> { self.as_str().into_status() }
}

// ── Response ──────────────────────────────────────────────────────────────────

/// What the application returns for one request.
pub struct Response {
    pub(crate) status: StatusCode,
    pub(crate) headers: Headers,
    pub(crate) body: Box<dyn Body>,
}

impl Response {
    pub fn new(status: StatusCode, headers: Headers, body: impl IntoBody) -> Self {
        Self { status, headers, body: body.into_body() }
    }

    /// A plain-text response whose body is the status reason phrase.
    pub fn error(status: StatusCode) -> Self {
        let reason = status.canonical_reason().unwrap_or("Error");
        let headers = Headers::new()
            .with("content-type", "text/plain; charset=utf-8")
            .with("content-length", reason.len().to_string());
        Self::new(status, headers, reason)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn into_parts(self) -> (StatusCode, Headers, Box<dyn Body>) {
        (self.status, self.headers, self.body)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

// ── IntoResponse ──────────────────────────────────────────────────────────────

/// Conversion of an application's return value into a [`Response`].
///
/// Failing conversions (a bad status, an `Err` from the application) are
/// application failures and end up as a 500.
pub trait IntoResponse {
    fn into_response(self) -> Result<Response, Error>;
}

impl IntoResponse for Response {
    fn into_response(self) -> Result<Response, Error> { Ok(self) }
}

impl<S, H, B> IntoResponse for (S, H, B)
where
    S: IntoStatus,
    H: Into<Headers>,
    B: IntoBody,
{
    fn into_response(self) -> Result<Response, Error> {
        let (status, headers, body) = self;
        Ok(Response::new(status.into_status()?, headers.into(), body))
    }
}

impl<T, E> IntoResponse for Result<T, E>
where
    T: IntoResponse,
    E: Into<BoxError>,
{
    fn into_response(self) -> Result<Response, Error> {
        self.map_err(|e| Error::Application(e.into()))?.into_response()
    }
}
