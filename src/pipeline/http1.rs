//! Minimal HTTP/1.1 framing for the client-facing side of the listener.
//!
//! The original runs inside `mitmproxy`, which supplies HTTP/1 framing for
//! free; this crate has no such framework dependency, so
//! request-line/header parsing and chunked/content-length body reading are
//! implemented directly here with `httparse`, grounded in the sibling
//! example `MMADUs-Glaive`'s `core::session` module (which frames HTTP/1
//! the same way without a heavyweight server crate) but simplified to a
//! single growing-buffer reader rather than that module's byte-offset
//! state machine — this proxy terminates one connection per tunnel rather
//! than multiplexing a pool, so the extra complexity buys nothing here.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::{ProxyError, ProxyResult};

const MAX_HEAD_BYTES: usize = 64 * 1024;
const HEAD_READ_CHUNK: usize = 4096;

/// A parsed request line + headers, plus whatever body bytes were already
/// read into the head buffer by the time headers completed.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version_minor: u8,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Reads and parses one request head (request line + headers) from `stream`,
/// returning the parsed head and any bytes already buffered past the header
/// terminator (the start of the body, or the start of the next pipelined
/// request). Returns `Ok(None)` on a clean EOF before any bytes arrived
/// (the normal way a persistent connection ends).
pub async fn read_request_head<S>(stream: &mut S) -> ProxyResult<Option<(RequestHead, Vec<u8>)>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(HEAD_READ_CHUNK);
    loop {
        if buf.len() > MAX_HEAD_BYTES {
            return Err(ProxyError::Network(std::io::Error::other("request head too large")));
        }

        let mut chunk = [0u8; HEAD_READ_CHUNK];
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(ProxyError::Network)?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::Network(std::io::Error::other("connection closed mid-headers")));
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers_storage = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers_storage);
        match req.parse(&buf) {
            Ok(httparse::Status::Complete(consumed)) => {
                let method = req.method.unwrap_or("").to_string();
                let target = req.path.unwrap_or("").to_string();
                let version_minor = req.version.unwrap_or(1);
                let headers = req
                    .headers
                    .iter()
                    .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).to_string()))
                    .collect();
                let remainder = buf[consumed..].to_vec();
                return Ok(Some((
                    RequestHead { method, target, version_minor, headers },
                    remainder,
                )));
            }
            Ok(httparse::Status::Partial) => continue,
            Err(e) => return Err(ProxyError::Network(std::io::Error::other(format!("malformed request: {e}")))),
        }
    }
}

/// Reads the request/response body given already-buffered `prefix` bytes
/// and the declared framing (`Content-Length` or chunked `Transfer-Encoding`).
/// Absent both, the body is empty — this matches a GET/HEAD-heavy browsing
/// traffic model, and this proxy does not persist request bodies.
pub async fn read_body<S>(stream: &mut S, prefix: Vec<u8>, content_length: Option<u64>, chunked: bool) -> ProxyResult<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    if chunked {
        return read_chunked_body(stream, prefix).await;
    }

    let Some(len) = content_length else {
        return Ok(prefix);
    };
    let len = len as usize;

    if prefix.len() >= len {
        return Ok(prefix[..len].to_vec());
    }

    let mut body = prefix;
    body.reserve(len - body.len());
    let mut remaining = len - body.len();
    let mut chunk = [0u8; 16 * 1024];
    while remaining > 0 {
        let to_read = remaining.min(chunk.len());
        let n = stream.read(&mut chunk[..to_read]).await.map_err(ProxyError::Network)?;
        if n == 0 {
            return Err(ProxyError::Network(std::io::Error::other("connection closed mid-body")));
        }
        body.extend_from_slice(&chunk[..n]);
        remaining -= n;
    }
    Ok(body)
}

async fn read_chunked_body<S>(stream: &mut S, prefix: Vec<u8>) -> ProxyResult<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = prefix;
    let mut body = Vec::new();
    let mut cursor = 0usize;

    loop {
        // Ensure we have a full chunk-size line buffered.
        let line_end = loop {
            if let Some(pos) = find_crlf(&buf[cursor..]) {
                break cursor + pos;
            }
            if !fill_more(stream, &mut buf).await? {
                return Err(ProxyError::Network(std::io::Error::other("connection closed mid-chunk-size")));
            }
        };

        let size_line = String::from_utf8_lossy(&buf[cursor..line_end]);
        let size_str = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|e| ProxyError::Network(std::io::Error::other(format!("invalid chunk size '{size_str}': {e}"))))?;
        cursor = line_end + 2;

        if size == 0 {
            // Trailing headers (rare) followed by a final CRLF; skip to the
            // terminating blank line.
            loop {
                if let Some(pos) = find_crlf(&buf[cursor..]) {
                    if pos == 0 {
                        cursor += 2;
                        break;
                    }
                    cursor += pos + 2;
                    continue;
                }
                if !fill_more(stream, &mut buf).await? {
                    break;
                }
            }
            return Ok(body);
        }

        while buf.len() < cursor + size + 2 {
            if !fill_more(stream, &mut buf).await? {
                return Err(ProxyError::Network(std::io::Error::other("connection closed mid-chunk-data")));
            }
        }

        body.extend_from_slice(&buf[cursor..cursor + size]);
        cursor += size + 2; // skip data + trailing CRLF
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

async fn fill_more<S: AsyncRead + Unpin>(stream: &mut S, buf: &mut Vec<u8>) -> ProxyResult<bool> {
    let mut chunk = [0u8; 4096];
    let n = stream.read(&mut chunk).await.map_err(ProxyError::Network)?;
    if n == 0 {
        return Ok(false);
    }
    buf.extend_from_slice(&chunk[..n]);
    Ok(true)
}

/// Writes a complete HTTP/1.1 response (status line + headers + body) to
/// the client. The proxy always sends `Content-Length` and never chunks the
/// downstream response, since the body is fully collected before P3 builds
/// headers.
pub async fn write_response<S>(stream: &mut S, status: u16, headers: &[(String, String)], body: &[u8]) -> ProxyResult<()>
where
    S: AsyncWrite + Unpin,
{
    let reason = status_reason(status);
    let mut head = format!("HTTP/1.1 {status} {reason}\r\n");
    for (name, value) in headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    stream.write_all(head.as_bytes()).await.map_err(ProxyError::Network)?;
    stream.write_all(body).await.map_err(ProxyError::Network)?;
    stream.flush().await.map_err(ProxyError::Network)?;
    Ok(())
}

fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        504 => "Gateway Timeout",
        _ => "OK",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor as StdCursor;

    #[tokio::test]
    async fn parses_simple_request_head() {
        let raw = b"GET /a.js HTTP/1.1\r\nHost: example.com\r\nUser-Agent: test\r\n\r\n";
        let mut stream = StdCursor::new(raw.to_vec());
        let (head, remainder) = read_request_head(&mut stream).await.unwrap().unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/a.js");
        assert_eq!(head.header("host"), Some("example.com"));
        assert!(remainder.is_empty());
    }

    #[tokio::test]
    async fn reads_content_length_body() {
        let raw = b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let mut stream = StdCursor::new(raw.to_vec());
        let (_, remainder) = read_request_head(&mut stream).await.unwrap().unwrap();
        let body = read_body(&mut stream, remainder, Some(5), false).await.unwrap();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn reads_chunked_body() {
        let raw = b"POST /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
        let mut stream = StdCursor::new(raw.to_vec());
        let (_, remainder) = read_request_head(&mut stream).await.unwrap().unwrap();
        let body = read_body(&mut stream, remainder, None, true).await.unwrap();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn eof_before_any_bytes_is_clean_close() {
        let mut stream = StdCursor::new(Vec::<u8>::new());
        let result = read_request_head(&mut stream).await.unwrap();
        assert!(result.is_none());
    }
}
