//! HTTP/1.1 framing for intercepted streams
//!
//! The MITM loops speak HTTP/1.1 directly over raw (or TLS-wrapped) streams,
//! so requests and responses are parsed with `httparse` and re-serialized by
//! hand. Bodies are fully read before filters run: chunked transfer coding is
//! decoded, Content-Length bodies read exactly, and unframed response bodies
//! read until the origin closes.

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a request or response head.
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Maximum number of headers parsed from one message.
const MAX_HEADERS: usize = 100;

/// Chunk size used when re-framing response bodies.
const CHUNK_BYTES: usize = 16 * 1024;

/// HTTP framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed HTTP message: {0}")]
    Parse(String),

    #[error("HTTP message head too large")]
    HeadTooLarge,

    #[error("truncated HTTP message")]
    UnexpectedEof,

    #[error("invalid chunk framing: {0}")]
    InvalidChunk(String),
}

impl From<httparse::Error> for FrameError {
    fn from(e: httparse::Error) -> Self {
        FrameError::Parse(e.to_string())
    }
}

/// A fully-read HTTP/1.x request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Request method (GET, POST, ...).
    pub method: String,

    /// Request target: origin-form as read off the wire, absolute once the
    /// MITM loop has anchored it to the CONNECT authority.
    pub target: String,

    /// HTTP/1.x minor version (0 or 1).
    pub version: u8,

    /// Headers in wire order, names case-preserved.
    pub headers: Vec<(String, String)>,

    /// Decoded body (empty when the request has none).
    pub body: Vec<u8>,
}

/// A fully-read HTTP/1.x response.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// HTTP/1.x minor version (0 or 1).
    pub version: u8,

    /// Status code.
    pub status: u16,

    /// Reason phrase as received (may be empty).
    pub reason: String,

    /// Headers in wire order, names case-preserved.
    pub headers: Vec<(String, String)>,

    /// Decoded body.
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// First value of `name`, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    /// True when `name`'s comma-separated values contain `value`.
    pub fn header_contains(&self, name: &str, value: &str) -> bool {
        header_contains(&self.headers, name, value)
    }

    /// The Host header, if present.
    pub fn host(&self) -> Option<&str> {
        self.header("host")
    }
}

impl HttpResponse {
    /// Build a synthetic response (filters, rejection payloads, tests).
    pub fn new(status: u16, reason: &str, body: Vec<u8>) -> Self {
        Self {
            version: 1,
            status,
            reason: reason.to_string(),
            headers: Vec::new(),
            body,
        }
    }

    /// First value of `name`, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    /// True when `name`'s comma-separated values contain `value`.
    pub fn header_contains(&self, name: &str, value: &str) -> bool {
        header_contains(&self.headers, name, value)
    }

    /// Replace or append a header.
    pub fn set_header(&mut self, name: &str, value: &str) {
        for (existing, v) in self.headers.iter_mut() {
            if existing.eq_ignore_ascii_case(name) {
                *v = value.to_string();
                return;
            }
        }
        self.headers.push((name.to_string(), value.to_string()));
    }
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Case-insensitive membership test over comma-separated header values,
/// across repeated headers of the same name.
pub fn header_contains(headers: &[(String, String)], name: &str, value: &str) -> bool {
    headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case(name))
        .flat_map(|(_, v)| v.split(','))
        .any(|part| part.trim().eq_ignore_ascii_case(value))
}

fn is_chunked(headers: &[(String, String)]) -> bool {
    header_value(headers, "transfer-encoding")
        .map(|te| te.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
}

fn content_length(headers: &[(String, String)]) -> Option<usize> {
    header_value(headers, "content-length").and_then(|v| v.trim().parse().ok())
}

/// Read one request off the stream. `Ok(None)` on clean EOF before the first
/// byte of a message.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<HttpRequest>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let head = match read_head(reader).await? {
        Some(head) => head,
        None => return Ok(None),
    };

    let mut header_buf = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut header_buf);
    match parsed.parse(&head)? {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => return Err(FrameError::UnexpectedEof),
    }

    let method = parsed
        .method
        .ok_or_else(|| FrameError::Parse("missing method".into()))?
        .to_string();
    let target = parsed
        .path
        .ok_or_else(|| FrameError::Parse("missing request target".into()))?
        .to_string();
    let version = parsed.version.unwrap_or(1);
    let headers = collect_headers(parsed.headers);

    let body = if is_chunked(&headers) {
        read_chunked_body(reader).await?
    } else if let Some(len) = content_length(&headers) {
        read_exact_body(reader, len).await?
    } else {
        Vec::new()
    };

    Ok(Some(HttpRequest {
        method,
        target,
        version,
        headers,
        body,
    }))
}

/// Read one response off the stream. EOF before the status line is an error:
/// a round-trip without a response is a failed round-trip.
pub async fn read_response<R>(reader: &mut R) -> Result<HttpResponse, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let head = read_head(reader).await?.ok_or(FrameError::UnexpectedEof)?;

    let mut header_buf = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut header_buf);
    match parsed.parse(&head)? {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => return Err(FrameError::UnexpectedEof),
    }

    let status = parsed
        .code
        .ok_or_else(|| FrameError::Parse("missing status code".into()))?;
    let reason = parsed.reason.unwrap_or("").to_string();
    let version = parsed.version.unwrap_or(1);
    let headers = collect_headers(parsed.headers);

    let body = if !response_has_body(status) {
        Vec::new()
    } else if is_chunked(&headers) {
        read_chunked_body(reader).await?
    } else if let Some(len) = content_length(&headers) {
        read_exact_body(reader, len).await?
    } else {
        // Delimited by connection close.
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await?;
        body
    };

    Ok(HttpResponse {
        version,
        status,
        reason,
        headers,
        body,
    })
}

/// Serialize a request in origin-form with identity body framing.
pub async fn write_request<W>(writer: &mut W, req: &HttpRequest) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(
        format!(
            "{} {} HTTP/1.{}\r\n",
            req.method,
            origin_form(&req.target),
            req.version
        )
        .as_bytes(),
    );

    let had_length = content_length(&req.headers).is_some();
    for (name, value) in &req.headers {
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        head.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    if !req.body.is_empty() || had_length {
        head.extend_from_slice(format!("Content-Length: {}\r\n", req.body.len()).as_bytes());
    }
    head.extend_from_slice(b"\r\n");

    writer.write_all(&head).await?;
    writer.write_all(&req.body).await?;
    writer.flush().await?;
    Ok(())
}

/// Serialize a response with identity body framing (Content-Length).
pub async fn write_response<W>(writer: &mut W, resp: &HttpResponse) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(
        format!("HTTP/1.{} {} {}\r\n", resp.version, resp.status, resp.reason).as_bytes(),
    );
    for (name, value) in &resp.headers {
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        head.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    if response_has_body(resp.status) {
        head.extend_from_slice(format!("Content-Length: {}\r\n", resp.body.len()).as_bytes());
    }
    head.extend_from_slice(b"\r\n");

    writer.write_all(&head).await?;
    writer.write_all(&resp.body).await?;
    writer.flush().await?;
    Ok(())
}

/// Serialize a response re-framed as chunked, status line pinned to
/// HTTP/1.1. The origin's length headers are dropped since the body length
/// is unknown to the client until the terminating chunk.
pub async fn write_response_chunked<W>(writer: &mut W, resp: &HttpResponse) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", resp.status, resp.reason).as_bytes());
    for (name, value) in &resp.headers {
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        head.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    head.extend_from_slice(b"Transfer-Encoding: chunked\r\n\r\n");
    writer.write_all(&head).await?;

    for chunk in resp.body.chunks(CHUNK_BYTES) {
        writer
            .write_all(format!("{:x}\r\n", chunk.len()).as_bytes())
            .await?;
        writer.write_all(chunk).await?;
        writer.write_all(b"\r\n").await?;
    }
    writer.write_all(b"0\r\n\r\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Reduce an absolute-form target back to origin-form for the wire.
pub fn origin_form(target: &str) -> &str {
    for scheme in ["https://", "http://"] {
        if let Some(rest) = target.strip_prefix(scheme) {
            return match rest.find('/') {
                Some(idx) => &rest[idx..],
                None => "/",
            };
        }
    }
    if target.is_empty() {
        "/"
    } else {
        target
    }
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect()
}

fn response_has_body(status: u16) -> bool {
    !(status < 200 || status == 204 || status == 304)
}

/// Accumulate a message head up to and including the blank line. `None` on
/// EOF before the first byte.
async fn read_head<R>(reader: &mut R) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(512);
    loop {
        let start = head.len();
        let n = reader.read_until(b'\n', &mut head).await?;
        if n == 0 {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(FrameError::UnexpectedEof);
        }
        if head.len() > MAX_HEAD_BYTES {
            return Err(FrameError::HeadTooLarge);
        }
        let line = &head[start..];
        if line == b"\r\n" || line == b"\n" {
            // Blank line only terminates the head once a start line exists.
            if start > 0 {
                return Ok(Some(head));
            }
            head.clear();
        }
    }
}

async fn read_exact_body<R>(reader: &mut R, len: usize) -> Result<Vec<u8>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

async fn read_chunked_body<R>(reader: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = BytesMut::new();
    loop {
        let mut size_line = Vec::new();
        if reader.read_until(b'\n', &mut size_line).await? == 0 {
            return Err(FrameError::UnexpectedEof);
        }
        let size_text = std::str::from_utf8(&size_line)
            .map_err(|_| FrameError::InvalidChunk("non-ASCII chunk size".into()))?;
        let size_text = size_text
            .trim()
            .split(';')
            .next()
            .unwrap_or_default();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| FrameError::InvalidChunk(format!("bad chunk size {:?}", size_text)))?;

        if size == 0 {
            // Trailer section: lines until the terminating blank line.
            loop {
                let mut trailer = Vec::new();
                let n = reader.read_until(b'\n', &mut trailer).await?;
                if n == 0 || trailer == b"\r\n" || trailer == b"\n" {
                    break;
                }
            }
            break;
        }

        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..]).await?;

        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
        if &crlf != b"\r\n" {
            return Err(FrameError::InvalidChunk("missing chunk terminator".into()));
        }
    }
    Ok(body.to_vec())
}
