//! `CONNECT` handling and TLS termination.
//!
//! On `CONNECT host:port`, the listener answers `200 Connection
//! Established`, then terminates TLS against the client using a leaf
//! certificate minted on the fly by the [`crate::tls::CertificateAuthority`]
//! for `host`. Everything read off the decrypted stream afterwards is
//! framed as plain HTTP/1.1 requests against `https://host{path}`.
//!
//! WebSocket upgrades (detected by [`flow::run`] returning `None`) are
//! spliced directly to the real origin instead of going through the cache
//! pipeline — WebSocket payload rewriting is out of scope.

use std::sync::Arc;

use log::{debug, warn};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::core::{ProxyError, ProxyResult};

use super::flow::{self, RequestRecord};
use super::http1;
use super::InstanceContext;

/// Parses a `CONNECT` target of the form `host:port` (or bare `host`,
/// defaulting to 443).
pub fn parse_connect_target(target: &str) -> ProxyResult<(String, u16)> {
    if let Some((host, port)) = target.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            return Ok((host.to_string(), port));
        }
    }
    Ok((target.to_string(), 443))
}

/// Handles one established `CONNECT` tunnel: TLS-terminates it against the
/// client, then loops reading and dispatching HTTP/1.1 requests over the
/// decrypted stream until the client disconnects.
pub async fn handle_tunnel<S>(ctx: &InstanceContext, mut client_stream: S, host: String, port: u16) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    client_stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await
        .map_err(ProxyError::Network)?;

    let server_config = ctx.ca.server_config_for_host(&host)?;
    let acceptor = TlsAcceptor::from(server_config);
    let mut tls_stream = acceptor
        .accept(client_stream)
        .await
        .map_err(|e| ProxyError::Tls(format!("tls handshake with client failed for {host}: {e}")))?;

    loop {
        let head = match http1::read_request_head(&mut tls_stream).await {
            Ok(Some(h)) => h,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!("malformed request inside tunnel to {host}: {e}");
                return Ok(());
            }
        };
        let (head, remainder) = head;

        let content_length = head
            .header("content-length")
            .and_then(|v| v.parse::<u64>().ok());
        let chunked = head
            .header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);
        let body = http1::read_body(&mut tls_stream, remainder, content_length, chunked).await?;

        let url = format!("https://{host}{}", head.target);
        let request = RequestRecord { method: head.method.clone(), url, headers: head.headers.clone(), body };

        match flow::run(ctx, request).await {
            Ok(Some(response)) => {
                http1::write_response(&mut tls_stream, response.status, &response.headers, &response.body).await?;
            }
            Ok(None) => {
                debug!("passing websocket upgrade through to {host}:{port}");
                splice_to_origin(tls_stream, &host, port, &head, &[]).await?;
                return Ok(());
            }
            Err(e) => {
                warn!("flow error for https://{host}{}: {e}", head.target);
                return Ok(());
            }
        }
    }
}

/// Connects directly to the real origin and splices the two streams
/// together raw, after forwarding the upgrade request line/headers that
/// were already consumed off the client stream.
async fn splice_to_origin<C>(mut client_stream: C, host: &str, port: u16, head: &http1::RequestHead, body: &[u8]) -> ProxyResult<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let origin_tcp = TcpStream::connect((host, port)).await.map_err(ProxyError::Network)?;

    let mut request_bytes = format!("{} {} HTTP/1.1\r\n", head.method, head.target);
    for (name, value) in &head.headers {
        request_bytes.push_str(name);
        request_bytes.push_str(": ");
        request_bytes.push_str(value);
        request_bytes.push_str("\r\n");
    }
    request_bytes.push_str("\r\n");

    if port == 443 {
        let connector = TlsConnector::from(Arc::new(insecure_client_config()));
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| ProxyError::Tls(format!("invalid server name '{host}': {e}")))?;
        let mut origin_tls = connector
            .connect(server_name, origin_tcp)
            .await
            .map_err(|e| ProxyError::Tls(format!("tls handshake with origin {host} failed: {e}")))?;
        origin_tls.write_all(request_bytes.as_bytes()).await.map_err(ProxyError::Network)?;
        origin_tls.write_all(body).await.map_err(ProxyError::Network)?;
        tokio::io::copy_bidirectional(&mut client_stream, &mut origin_tls)
            .await
            .map_err(ProxyError::Network)?;
    } else {
        let mut origin_tcp = origin_tcp;
        origin_tcp.write_all(request_bytes.as_bytes()).await.map_err(ProxyError::Network)?;
        origin_tcp.write_all(body).await.map_err(ProxyError::Network)?;
        tokio::io::copy_bidirectional(&mut client_stream, &mut origin_tcp)
            .await
            .map_err(ProxyError::Network)?;
    }

    Ok(())
}

fn insecure_client_config() -> ClientConfig {
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerify))
        .with_no_client_auth()
}

/// Certificate verification is deliberately disabled: this proxy is itself
/// a MITM, and the origin hop here is made on behalf of a client whose own
/// certificate checks were already bypassed by this same proxy.
#[derive(Debug)]
struct NoVerify;

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let (host, port) = parse_connect_target("example.com:443").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);
    }

    #[test]
    fn bare_host_defaults_to_443() {
        let (host, port) = parse_connect_target("example.com").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);
    }
}
