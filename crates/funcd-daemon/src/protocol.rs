// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Raw HTTP/1.1 exchange with the container daemon over a Unix domain socket.
//!
//! There is no HTTP library underneath. Each call:
//! - opens a fresh connection to the socket (no pooling, no shared state)
//! - writes one request carrying `Connection: close`
//! - reads until the daemon closes the stream
//! - splits the header block at the first `CR LF CR LF`
//! - decodes a `Transfer-Encoding: chunked` body, or takes the remainder as the body
//!
//! Non-2xx statuses are returned as normal [`Response`] values. Only transport and
//! framing failures are reported as [`ProtocolError`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, trace};

/// Maximum accepted response size (64 MB), applied to the raw stream and to decoded bodies.
pub const MAX_RESPONSE_SIZE: usize = 64 * 1024 * 1024;

/// Separator between the header block and the body.
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

const CRLF: &[u8] = b"\r\n";

/// Default timeout for a single request/response exchange.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport and framing failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to connect to daemon socket {path}: {source}")]
    Connect {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("response has no header terminator")]
    MissingHeaderTerminator,

    #[error("malformed status line: {0:?}")]
    MalformedStatusLine(String),

    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),

    #[error("invalid chunk size line: {0:?}")]
    InvalidChunkSize(String),

    #[error("chunk data is not followed by CRLF")]
    MissingChunkTerminator,

    #[error("chunked body ended before the terminating chunk")]
    TruncatedChunk,

    #[error("body shorter than Content-Length: expected {expected}, got {actual}")]
    TruncatedBody { expected: usize, actual: usize },

    #[error("response too large: {0} bytes (max: {MAX_RESPONSE_SIZE})")]
    ResponseTooLarge(usize),
}

/// HTTP request methods used against the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
        }
    }

    fn sends_length(&self) -> bool {
        matches!(self, Method::Post | Method::Put)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered header list with case-insensitive lookup.
///
/// Names keep the case they were inserted with so requests go out as written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header. Existing entries with the same name are kept.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when the last transfer coding is `chunked`.
    pub fn is_chunked(&self) -> bool {
        self.get("transfer-encoding")
            .and_then(|v| v.split(',').next_back())
            .map(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
    }

    pub fn content_length(&self) -> Option<usize> {
        self.get("content-length")
            .and_then(|v| v.trim().parse::<usize>().ok())
    }
}

/// A request to send to the daemon.
///
/// `path` is relative to the API version prefix, e.g. `containers/json?all=true`.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Attach a raw body with its content type.
    pub fn body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.headers.insert("Content-Type", content_type);
        self.body = Some(body.into());
        self
    }

    /// Attach a JSON body.
    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> Result<Self, serde_json::Error> {
        let encoded = serde_json::to_vec(value)?;
        Ok(self.body("application/json", encoded))
    }
}

/// A parsed daemon response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    /// 2xx and 304 count as success in the daemon's status contract.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status) || self.status == 304
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// One-connection-per-call client for a daemon listening on a Unix socket.
#[derive(Debug, Clone)]
pub struct SocketClient {
    socket_path: PathBuf,
    api_version: String,
    timeout: Duration,
}

impl SocketClient {
    /// Create a client. `api_version` is the path prefix, e.g. `v4.0.0`; empty means none.
    pub fn new(socket_path: impl Into<PathBuf>, api_version: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
            api_version: api_version.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Bound every exchange by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn api_version(&self) -> &str {
        &self.api_version
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Perform one request/response exchange.
    pub async fn send(&self, request: Request) -> Result<Response, ProtocolError> {
        match tokio::time::timeout(self.timeout, self.exchange(&request)).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout(self.timeout)),
        }
    }

    async fn exchange(&self, request: &Request) -> Result<Response, ProtocolError> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| ProtocolError::Connect {
                path: self.socket_path.display().to_string(),
                source,
            })?;

        let encoded = self.encode_request(request);
        trace!(
            method = %request.method,
            path = %request.path,
            bytes = encoded.len(),
            "Writing daemon request"
        );
        stream.write_all(&encoded).await?;
        stream.flush().await?;

        let raw = read_to_close(&mut stream).await?;
        let response = parse_response(&raw)?;

        debug!(
            method = %request.method,
            path = %request.path,
            status = response.status,
            body_bytes = response.body.len(),
            "Daemon request completed"
        );

        Ok(response)
    }

    /// Versioned request target for a relative path.
    pub fn target(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        let version = self.api_version.trim_matches('/');
        if version.is_empty() {
            format!("/{}", path)
        } else {
            format!("/{}/{}", version, path)
        }
    }

    /// Serialize a request to wire bytes.
    pub fn encode_request(&self, request: &Request) -> Bytes {
        let body_len = request.body.as_ref().map(|b| b.len()).unwrap_or(0);
        let mut buf = BytesMut::with_capacity(256 + body_len);

        buf.put_slice(
            format!(
                "{} {} HTTP/1.1\r\n",
                request.method,
                self.target(&request.path)
            )
            .as_bytes(),
        );
        if !request.headers.contains("host") {
            buf.put_slice(b"Host: d\r\n");
        }
        if !request.headers.contains("user-agent") {
            buf.put_slice(
                format!("User-Agent: funcd/{}\r\n", env!("CARGO_PKG_VERSION")).as_bytes(),
            );
        }
        if !request.headers.contains("accept") {
            buf.put_slice(b"Accept: application/json\r\n");
        }
        for (name, value) in request.headers.iter() {
            if name.eq_ignore_ascii_case("connection") || name.eq_ignore_ascii_case("content-length")
            {
                continue;
            }
            buf.put_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        buf.put_slice(b"Connection: close\r\n");
        if request.body.is_some() || request.method.sends_length() {
            buf.put_slice(format!("Content-Length: {}\r\n", body_len).as_bytes());
        }
        buf.put_slice(CRLF);

        if let Some(body) = &request.body {
            buf.put_slice(body);
        }

        buf.freeze()
    }
}

/// Read until the peer closes the stream.
pub async fn read_to_close<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        buf.reserve(8 * 1024);
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            break;
        }
        if buf.len() > MAX_RESPONSE_SIZE {
            return Err(ProtocolError::ResponseTooLarge(buf.len()));
        }
    }
    Ok(buf.freeze())
}

/// Parse a complete raw response.
pub fn parse_response(raw: &[u8]) -> Result<Response, ProtocolError> {
    let header_end =
        find_subsequence(raw, HEADER_TERMINATOR).ok_or(ProtocolError::MissingHeaderTerminator)?;

    let head = String::from_utf8_lossy(&raw[..header_end]);
    let mut lines = head.split("\r\n");

    let (status, reason) = parse_status_line(lines.next().unwrap_or_default())?;

    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProtocolError::MalformedHeader(line.to_string()))?;
        if name.trim().is_empty() {
            return Err(ProtocolError::MalformedHeader(line.to_string()));
        }
        headers.insert(name.trim(), value.trim());
    }

    let rest = &raw[header_end + HEADER_TERMINATOR.len()..];
    let body = if headers.is_chunked() {
        decode_chunked(rest)?
    } else if let Some(expected) = headers.content_length() {
        if rest.len() < expected {
            return Err(ProtocolError::TruncatedBody {
                expected,
                actual: rest.len(),
            });
        }
        Bytes::copy_from_slice(&rest[..expected])
    } else {
        Bytes::copy_from_slice(rest)
    };

    Ok(Response {
        status,
        reason,
        headers,
        body,
    })
}

/// Parse `HTTP/1.1 200 OK` into `(200, "OK")`.
fn parse_status_line(line: &str) -> Result<(u16, String), ProtocolError> {
    let malformed = || ProtocolError::MalformedStatusLine(line.to_string());

    let mut parts = line.splitn(3, ' ');
    let version = parts.next().ok_or_else(malformed)?;
    if !version.starts_with("HTTP/") {
        return Err(malformed());
    }

    let code = parts.next().ok_or_else(malformed)?;
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    let status = code.parse::<u16>().map_err(|_| malformed())?;
    let reason = parts.next().unwrap_or_default().trim().to_string();

    Ok((status, reason))
}

/// Decode a chunked body.
///
/// Chunk extensions (`;name=value`) are ignored and trailers after the zero-length
/// chunk are discarded. Malformed size lines are errors, not skipped.
pub fn decode_chunked(mut input: &[u8]) -> Result<Bytes, ProtocolError> {
    let mut body = BytesMut::new();

    loop {
        let line_end = find_subsequence(input, CRLF).ok_or(ProtocolError::TruncatedChunk)?;
        let line = String::from_utf8_lossy(&input[..line_end]);
        let size_field = line.split(';').next().unwrap_or_default().trim();

        if size_field.is_empty() || !size_field.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ProtocolError::InvalidChunkSize(line.into_owned()));
        }
        let size = usize::from_str_radix(size_field, 16)
            .map_err(|_| ProtocolError::InvalidChunkSize(line.to_string()))?;

        input = &input[line_end + CRLF.len()..];
        if size == 0 {
            break;
        }

        if input.len() < size {
            return Err(ProtocolError::TruncatedChunk);
        }
        if body.len() + size > MAX_RESPONSE_SIZE {
            return Err(ProtocolError::ResponseTooLarge(body.len() + size));
        }
        body.put_slice(&input[..size]);
        input = &input[size..];

        if !input.starts_with(CRLF) {
            return Err(if input.len() < CRLF.len() {
                ProtocolError::TruncatedChunk
            } else {
                ProtocolError::MissingChunkTerminator
            });
        }
        input = &input[CRLF.len()..];
    }

    Ok(body.freeze())
}

/// Encode chunks with the given boundaries, followed by the terminating chunk.
///
/// Empty chunks are skipped since a zero size ends the body.
pub fn encode_chunked<C: AsRef<[u8]>>(chunks: &[C]) -> Bytes {
    let mut buf = BytesMut::new();
    for chunk in chunks {
        let chunk = chunk.as_ref();
        if chunk.is_empty() {
            continue;
        }
        buf.put_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        buf.put_slice(chunk);
        buf.put_slice(CRLF);
    }
    buf.put_slice(b"0\r\n\r\n");
    buf.freeze()
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
