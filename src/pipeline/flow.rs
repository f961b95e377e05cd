//! Per-flow state machine, phases P1-P5.

use std::io::Write;
use std::time::Duration;

use log::{debug, warn};
use tokio::time::timeout;

use crate::cache::{CacheKey, CacheWrite};
use crate::core::events::Event;
use crate::core::ProxyError;
use crate::eligibility::{is_admissible, EligibilityInput};
use crate::fingerprint;
use crate::normalize;

use super::{is_forwardable, is_safe_header, InstanceContext};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const READ_TIMEOUT: Duration = Duration::from_secs(40);
const HEADERS_WRAPPER_TIMEOUT: Duration = Duration::from_secs(20);
const BODY_WRAPPER_TIMEOUT: Duration = Duration::from_secs(30);
const RECOMPRESS_TIMEOUT: Duration = Duration::from_secs(60);
const UPSTREAM_MAX_ATTEMPTS: u32 = 3;
const UPSTREAM_RETRY_DELAY: Duration = Duration::from_secs(5);
const CACHE_TTL_SECONDS: u64 = 86_400;

/// One client request, already framed by the listener.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub method: String,
    /// Absolute URL (scheme + host already resolved by the listener/CONNECT
    /// handler, since the origin is only known from the CONNECT target or
    /// an absolute-form request line).
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RequestRecord {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn is_websocket_upgrade(&self) -> bool {
        self.header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }

    /// Best-effort per-request opt-out of the upstream proxy. There is no
    /// caller-supplied flow-metadata channel in this crate's request path,
    /// so a client instead opts a single request out of the configured
    /// upstream proxy with this header.
    fn wants_direct(&self) -> bool {
        self.header("x-veilproxy-direct").is_some()
    }
}

/// One upstream/cached response.
#[derive(Debug, Clone, Default)]
pub struct ResponseRecord {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub is_cached: bool,
}

/// Runs a flow end to end: P1 cache lookup, P2 upstream dispatch, P3/P4
/// response assembly, and schedules P5 as a detached background task.
/// Returns `None` for a WebSocket upgrade — the caller is expected to pass
/// the connection through untouched instead.
pub async fn run(ctx: &InstanceContext, request: RequestRecord) -> Result<Option<ResponseRecord>, ProxyError> {
    let normalized = normalize::normalize_url(&request.url);
    let cache_key = normalize::cache_key(&normalized.canonical);

    debug!("flow start: {} {}", request.method, normalized.canonical);

    // P1 — cache lookup.
    if request.method.eq_ignore_ascii_case("GET") {
        if let Some(hit) = ctx.cache.get(&cache_key).await {
            ctx.counters.credit_download_saved(hit.origin_content_length);
            ctx.counters.credit_upload_saved(request.body.len() as u64);
            let headers = hit
                .headers
                .into_iter()
                .map(|(k, v)| (String::from_utf8_lossy(&k).to_string(), String::from_utf8_lossy(&v).to_string()))
                .collect();
            debug!("cache hit for {}", normalized.canonical);
            return Ok(Some(ResponseRecord {
                status: hit.status_code,
                headers,
                body: hit.body,
                is_cached: true,
            }));
        }
    }

    ctx.counters.credit_upload(request.body.len() as u64);

    if request.is_websocket_upgrade() {
        debug!("websocket upgrade for {}, passing through uncached", normalized.canonical);
        return Ok(None);
    }

    // P2 — upstream dispatch.
    let direct = request.wants_direct();
    let profile_tag = fingerprint::resolve(request.header("user-agent"));
    let session = ctx.sessions.checkout(profile_tag).await?;

    let method = parse_method(&request.method)?;
    let forward_headers = forwardable_headers(&request.headers);

    let mut attempt = 0u32;
    let upstream_response = loop {
        attempt += 1;
        let mut builder = session
            .client(direct)
            .request(method.clone(), &request.url)
            .timeout(READ_TIMEOUT)
            .body(request.body.clone());
        for (name, value) in &forward_headers {
            builder = builder.header(name, value);
        }

        let attempt_result = timeout(CONNECT_TIMEOUT.max(HEADERS_WRAPPER_TIMEOUT), builder.send()).await;

        match attempt_result {
            Ok(Ok(resp)) => break resp,
            Ok(Err(e)) if attempt < UPSTREAM_MAX_ATTEMPTS => {
                warn!("upstream attempt {attempt} failed for {}: {e}", normalized.canonical);
                tokio::time::sleep(UPSTREAM_RETRY_DELAY).await;
                continue;
            }
            Ok(Err(e)) => return Err(ProxyError::UpstreamExhausted(format!("{e}"))),
            Err(_) if attempt < UPSTREAM_MAX_ATTEMPTS => {
                warn!("upstream attempt {attempt} timed out for {}", normalized.canonical);
                tokio::time::sleep(UPSTREAM_RETRY_DELAY).await;
                continue;
            }
            Err(_) => return Err(ProxyError::UpstreamExhausted("headers wrapper timeout exhausted".to_string())),
        }
    };

    // P3 — response headers, minus content-encoding/content-length/transfer-encoding.
    let status = upstream_response.status().as_u16();
    let content_encoding = upstream_response
        .headers()
        .get("content-encoding")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let upstream_content_length = upstream_response
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let response_content_type = upstream_response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let has_set_cookie = upstream_response.headers().get("set-cookie").is_some();
    let response_vary = upstream_response
        .headers()
        .get("vary")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let response_cache_control = upstream_response
        .headers()
        .get("cache-control")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut response_headers: Vec<(String, String)> = upstream_response
        .headers()
        .iter()
        .filter(|(name, _)| {
            let lower = name.as_str().to_ascii_lowercase();
            lower != "content-encoding" && lower != "content-length" && lower != "transfer-encoding"
        })
        .map(|(name, value)| (name.as_str().to_string(), value.to_str().unwrap_or_default().to_string()))
        .collect();

    // P4 — body collection, bounded to 30s.
    let body = match timeout(BODY_WRAPPER_TIMEOUT, upstream_response.bytes()).await {
        Ok(Ok(bytes)) => bytes.to_vec(),
        Ok(Err(e)) => return Err(ProxyError::Network(std::io::Error::other(format!("body read failed: {e}")))),
        Err(_) => return Err(ProxyError::UpstreamExhausted("body wrapper timeout exhausted".to_string())),
    };

    response_headers.push(("content-length".to_string(), body.len().to_string()));

    let request_cache_control = request.header("cache-control").map(str::to_string);
    let request_pragma = request.header("pragma").map(str::to_string);
    let request_method = request.method.clone();
    let canonical_path = normalized.path.clone();
    let normalized_url = normalized.canonical.clone();

    // P5 — fires as a detached background task; must not block the client.
    let ctx = ctx.clone();
    let body_for_bg = body.clone();
    let response_headers_for_bg = response_headers.clone();
    tokio::spawn(async move {
        post_response(
            ctx,
            cache_key,
            normalized_url,
            canonical_path,
            request_method,
            body_for_bg,
            response_headers_for_bg,
            status,
            content_encoding,
            upstream_content_length,
            response_content_type,
            has_set_cookie,
            response_vary,
            response_cache_control,
            request_cache_control,
            request_pragma,
        )
        .await;
    });

    Ok(Some(ResponseRecord { status, headers: response_headers, body, is_cached: false }))
}

/// Headers kept when building the request sent upstream: strips hop-by-hop
/// headers and this crate's own internal `direct`-flow control header.
fn forwardable_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers.iter().filter(|(k, _)| is_forwardable(k)).cloned().collect()
}

fn parse_method(method: &str) -> Result<wreq::Method, ProxyError> {
    method
        .parse::<wreq::Method>()
        .map_err(|_| ProxyError::Network(std::io::Error::other(format!("invalid method '{method}'"))))
}

#[allow(clippy::too_many_arguments)]
async fn post_response(
    ctx: InstanceContext,
    cache_key: CacheKey,
    normalized_url: String,
    canonical_path: String,
    request_method: String,
    body: Vec<u8>,
    response_headers: Vec<(String, String)>,
    status: u16,
    content_encoding: Option<String>,
    upstream_content_length: Option<u64>,
    response_content_type: Option<String>,
    has_set_cookie: bool,
    response_vary: Option<String>,
    response_cache_control: Option<String>,
    request_cache_control: Option<String>,
    request_pragma: Option<String>,
) {
    let extract_rules = ctx.config.load().extract_rules.clone();
    if !extract_rules.is_empty() {
        for result in crate::extract::run(&extract_rules, &normalized_url, &body, response_content_type.as_deref()) {
            ctx.emit(Event::Notification {
                instance: ctx.instance_id.clone(),
                title: result.title,
                body: result.body,
            });
        }
    }

    let origin_content_length = compute_origin_content_length(upstream_content_length, content_encoding.as_deref(), &body).await;
    ctx.counters.credit_download(origin_content_length);

    let ignore_rules = ctx.config.load().ignore_rules.clone();
    let input = EligibilityInput {
        request_method: &request_method,
        response_status: status,
        response_has_set_cookie: has_set_cookie,
        response_vary: response_vary.as_deref(),
        request_cache_control: request_cache_control.as_deref(),
        request_pragma: request_pragma.as_deref(),
        response_cache_control: response_cache_control.as_deref(),
        canonical_path: &canonical_path,
        response_content_type: response_content_type.as_deref(),
        normalized_url: &normalized_url,
        ignore_rules: &ignore_rules,
    };

    if !is_admissible(&input) {
        return;
    }

    {
        let mut in_progress = ctx.in_progress.lock().await;
        if in_progress.contains(&cache_key) {
            return;
        }
        in_progress.insert(cache_key);
    }

    let safe_headers: Vec<(Vec<u8>, Vec<u8>)> = response_headers
        .iter()
        .filter(|(name, _)| is_safe_header(name))
        .map(|(name, value)| (name.as_bytes().to_vec(), value.as_bytes().to_vec()))
        .collect();

    let write = CacheWrite {
        status_code: status,
        headers: &safe_headers,
        body: &body,
        origin_content_length,
    };

    if let Err(e) = ctx.cache.set(&cache_key, write, CACHE_TTL_SECONDS).await {
        warn!("cache admission failed for {normalized_url}: {e}");
    }

    ctx.in_progress.lock().await.remove(&cache_key);
}

/// Computes `origin_content_length`: prefer the upstream `Content-Length`;
/// else recompress the decoded body with the claimed `Content-Encoding` and
/// use that size; else the decoded length.
async fn compute_origin_content_length(upstream_content_length: Option<u64>, content_encoding: Option<&str>, body: &[u8]) -> u64 {
    if let Some(len) = upstream_content_length {
        return len;
    }

    let Some(codec) = content_encoding else {
        return body.len() as u64;
    };

    let codec = codec.to_ascii_lowercase();
    if !matches!(codec.as_str(), "gzip" | "br" | "deflate" | "zstd") {
        return body.len() as u64;
    }

    let body_owned = body.to_vec();
    let result = timeout(RECOMPRESS_TIMEOUT, tokio::task::spawn_blocking(move || recompress(&codec, &body_owned))).await;

    match result {
        Ok(Ok(Some(len))) => len,
        _ => body.len() as u64,
    }
}

fn recompress(codec: &str, data: &[u8]) -> Option<u64> {
    match codec {
        "gzip" => {
            let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data).ok()?;
            encoder.finish().ok().map(|v| v.len() as u64)
        }
        "deflate" => {
            let mut encoder = flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data).ok()?;
            encoder.finish().ok().map(|v| v.len() as u64)
        }
        "br" => {
            let mut output = Vec::new();
            let mut writer = brotli::CompressorWriter::new(&mut output, 4096, 5, 22);
            writer.write_all(data).ok()?;
            drop(writer);
            Some(output.len() as u64)
        }
        "zstd" => zstd::stream::encode_all(data, 3).ok().map(|v| v.len() as u64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_upgrade_is_detected_case_insensitively() {
        let req = RequestRecord {
            method: "GET".to_string(),
            url: "http://example.com/ws".to_string(),
            headers: vec![("Upgrade".to_string(), "WebSocket".to_string())],
            body: vec![],
        };
        assert!(req.is_websocket_upgrade());
    }

    #[test]
    fn non_upgrade_request_is_not_websocket() {
        let req = RequestRecord {
            method: "GET".to_string(),
            url: "http://example.com/a".to_string(),
            headers: vec![],
            body: vec![],
        };
        assert!(!req.is_websocket_upgrade());
    }

    #[test]
    fn internal_direct_header_is_not_forwarded_upstream() {
        let headers = vec![
            ("X-Veilproxy-Direct".to_string(), "1".to_string()),
            ("User-Agent".to_string(), "test".to_string()),
        ];
        let forwarded = forwardable_headers(&headers);
        assert!(!forwarded.iter().any(|(k, _)| k.eq_ignore_ascii_case("x-veilproxy-direct")));
        assert!(forwarded.iter().any(|(k, _)| k.eq_ignore_ascii_case("user-agent")));
    }

    #[tokio::test]
    async fn origin_content_length_prefers_upstream_header() {
        let len = compute_origin_content_length(Some(42), Some("gzip"), b"hello").await;
        assert_eq!(len, 42);
    }

    #[tokio::test]
    async fn origin_content_length_falls_back_to_decoded_length_without_encoding() {
        let len = compute_origin_content_length(None, None, b"hello").await;
        assert_eq!(len, 5);
    }

    #[tokio::test]
    async fn origin_content_length_recompresses_gzip() {
        let body = vec![b'a'; 10_000];
        let len = compute_origin_content_length(None, Some("gzip"), &body).await;
        assert!(len > 0);
        assert!(len < body.len() as u64);
    }

    #[test]
    fn recompress_gzip_produces_smaller_output_for_repetitive_data() {
        let data = vec![b'x'; 10_000];
        let len = recompress("gzip", &data).unwrap();
        assert!(len < data.len() as u64);
    }

    #[test]
    fn recompress_unknown_codec_returns_none() {
        assert!(recompress("identity", b"hello").is_none());
    }
}
