//! Accepts plain-HTTP and `CONNECT` requests on an instance's listener
//! socket. Each accepted connection becomes one Tokio task;
//! `CONNECT` tunnels hand off to [`super::connect`], forward-proxy plain
//! requests are looped directly against [`super::flow`].

use log::{debug, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::core::ProxyResult;

use super::connect;
use super::flow::{self, RequestRecord};
use super::http1;
use super::InstanceContext;

/// Binds `(host, port)` and runs the accept loop until `shutdown` receives
/// `true` or the bind fails. Each connection is dispatched to its own task
/// sharing `ctx`: while running, the listener accepts; on stop, a shutdown
/// signal is posted to the listener.
pub async fn run(ctx: InstanceContext, host: &str, port: u16, mut shutdown: watch::Receiver<bool>) -> ProxyResult<()> {
    let listener = TcpListener::bind((host, port)).await.map_err(crate::core::ProxyError::Network)?;
    debug!("instance {} listening on {host}:{port}", ctx.instance_id);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("instance {} listener shutting down", ctx.instance_id);
                    return Ok(());
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed on {host}:{port}: {e}");
                        continue;
                    }
                };
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    debug!("accepted connection from {peer}");
                    if let Err(e) = handle_connection(&ctx, stream).await {
                        warn!("connection from {peer} ended with error: {e}");
                    }
                });
            }
        }
    }
}

async fn handle_connection(ctx: &InstanceContext, mut stream: TcpStream) -> ProxyResult<()> {
    loop {
        let head = match http1::read_request_head(&mut stream).await? {
            Some(h) => h,
            None => return Ok(()),
        };
        let (head, remainder) = head;

        if head.method.eq_ignore_ascii_case("CONNECT") {
            let (host, port) = connect::parse_connect_target(&head.target)?;
            return connect::handle_tunnel(ctx, stream, host, port).await;
        }

        let content_length = head.header("content-length").and_then(|v| v.parse::<u64>().ok());
        let chunked = head
            .header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);
        let body = http1::read_body(&mut stream, remainder, content_length, chunked).await?;

        let url = absolute_url(&head);
        let request = RequestRecord { method: head.method.clone(), url, headers: head.headers.clone(), body };

        let keep_alive = !head
            .header("connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false);

        match flow::run(ctx, request).await {
            Ok(Some(response)) => {
                http1::write_response(&mut stream, response.status, &response.headers, &response.body).await?;
            }
            Ok(None) => {
                // A plain (non-CONNECT) WebSocket upgrade has no TLS layer
                // to splice around; forward the raw bytes directly.
                return forward_plain_upgrade(stream, &head, &body).await;
            }
            Err(e) => {
                warn!("flow error for {}: {e}", head.target);
                return Ok(());
            }
        }

        if !keep_alive {
            return Ok(());
        }
    }
}

async fn forward_plain_upgrade(client_stream: TcpStream, head: &http1::RequestHead, body: &[u8]) -> ProxyResult<()> {
    let host = head.header("host").unwrap_or_default();
    let (host, port) = match host.rsplit_once(':') {
        Some((h, p)) => (h.to_string(), p.parse().unwrap_or(80)),
        None => (host.to_string(), 80),
    };
    let mut origin = TcpStream::connect((host.as_str(), port)).await.map_err(crate::core::ProxyError::Network)?;

    let mut request_bytes = format!("{} {} HTTP/1.1\r\n", head.method, head.target);
    for (name, value) in &head.headers {
        request_bytes.push_str(name);
        request_bytes.push_str(": ");
        request_bytes.push_str(value);
        request_bytes.push_str("\r\n");
    }
    request_bytes.push_str("\r\n");

    use tokio::io::AsyncWriteExt;
    origin.write_all(request_bytes.as_bytes()).await.map_err(crate::core::ProxyError::Network)?;
    origin.write_all(body).await.map_err(crate::core::ProxyError::Network)?;

    let mut client_stream = client_stream;
    tokio::io::copy_bidirectional(&mut client_stream, &mut origin)
        .await
        .map_err(crate::core::ProxyError::Network)?;
    Ok(())
}

/// Builds the absolute URL for a forward-proxy (non-CONNECT) request:
/// either the request line is already absolute-form, or it is relative and
/// the `Host` header supplies the authority (assumed plain `http://`,
/// since a TLS origin always arrives via `CONNECT`).
fn absolute_url(head: &http1::RequestHead) -> String {
    if head.target.starts_with("http://") || head.target.starts_with("https://") {
        return head.target.clone();
    }
    let host = head.header("host").unwrap_or_default();
    format!("http://{host}{}", head.target)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(target: &str, host: Option<&str>) -> http1::RequestHead {
        let mut headers = Vec::new();
        if let Some(h) = host {
            headers.push(("Host".to_string(), h.to_string()));
        }
        http1::RequestHead { method: "GET".to_string(), target: target.to_string(), version_minor: 1, headers }
    }

    #[test]
    fn absolute_form_request_line_is_used_as_is() {
        let h = head("http://example.com/a", None);
        assert_eq!(absolute_url(&h), "http://example.com/a");
    }

    #[test]
    fn relative_request_line_combines_with_host_header() {
        let h = head("/a?b=1", Some("example.com"));
        assert_eq!(absolute_url(&h), "http://example.com/a?b=1");
    }
}
