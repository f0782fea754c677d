//! Forwarding to a resolved backend on `127.0.0.1`.
//!
//! Every proxied request opens its own upstream connection; nothing is
//! retried. Upgrades are spliced byte-for-byte once both sides switched
//! protocols, and closing either side closes the other.

use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper::header::{self, HeaderValue};
use hyper::http::uri::PathAndQuery;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::ProxyError;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

pub fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ProxyBody> {
    let mut resp = Response::new(full(body));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

/// `Connection: upgrade` plus an `Upgrade` header.
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let wants_upgrade = req
        .headers()
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    wants_upgrade && req.headers().contains_key(header::UPGRADE)
}

/// Rewrite the request for the backend: origin-form URI plus forwarding
/// headers. Everything else passes through untouched.
fn prepare<B>(req: &mut Request<B>, peer: Option<SocketAddr>) {
    let path = req
        .uri()
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    *req.uri_mut() = Uri::from(path);

    let headers = req.headers_mut();
    if let Some(host) = headers.get(header::HOST).cloned() {
        headers.entry(X_FORWARDED_HOST).or_insert(host);
    }
    if let Some(peer) = peer
        && let Ok(ip) = HeaderValue::from_str(&peer.ip().to_string())
    {
        headers.append(X_FORWARDED_FOR, ip);
    }
    headers
        .entry(X_FORWARDED_PROTO)
        .or_insert(HeaderValue::from_static("http"));
}

async fn connect(port: u16) -> Result<SendRequest<Incoming>, ProxyError> {
    let stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .map_err(|source| ProxyError::Connect { port, source })?;
    let _ = stream.set_nodelay(true);

    let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            tracing::debug!(port, error = %e, "upstream connection error");
        }
    });
    Ok(sender)
}

async fn send(req: Request<Incoming>, port: u16) -> Result<Response<Incoming>, ProxyError> {
    let mut sender = connect(port).await?;
    Ok(sender.send_request(req).await?)
}

fn bad_gateway(port: u16, err: &ProxyError) -> Response<ProxyBody> {
    tracing::warn!(port, error = %err, "proxy error");
    text_response(StatusCode::BAD_GATEWAY, format!("Bad gateway: {err}"))
}

/// Forward a plain HTTP request; a backend failure becomes a 502 carrying
/// the error text.
pub async fn forward_http(
    mut req: Request<Incoming>,
    port: u16,
    peer: Option<SocketAddr>,
) -> Response<ProxyBody> {
    prepare(&mut req, peer);
    match send(req, port).await {
        Ok(resp) => resp.map(|body| body.boxed()),
        Err(e) => bad_gateway(port, &e),
    }
}

/// Forward an upgrade request. When the backend switches protocols the two
/// upgraded connections are spliced in a background task; any other
/// backend answer is passed back as-is. An unreachable backend gets a 502
/// and the client connection is closed.
pub async fn forward_upgrade(
    mut req: Request<Incoming>,
    port: u16,
    peer: Option<SocketAddr>,
) -> Response<ProxyBody> {
    let client_upgrade = hyper::upgrade::on(&mut req);
    prepare(&mut req, peer);

    let mut upstream = match send(req, port).await {
        Ok(resp) => resp,
        Err(e) => {
            // The client socket is closed once the error is written.
            let mut resp = bad_gateway(port, &e);
            resp.headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
            return resp;
        }
    };
    if upstream.status() != StatusCode::SWITCHING_PROTOCOLS {
        tracing::debug!(port, status = %upstream.status(), "backend declined upgrade");
        return upstream.map(|body| body.boxed());
    }

    let upstream_upgrade = hyper::upgrade::on(&mut upstream);
    tokio::spawn(async move {
        match tokio::try_join!(client_upgrade, upstream_upgrade) {
            Ok((client, backend)) => splice(TokioIo::new(client), TokioIo::new(backend)).await,
            Err(e) => tracing::debug!(port, error = %e, "upgrade did not complete"),
        }
    });

    let (parts, _body) = upstream.into_parts();
    Response::from_parts(parts, empty())
}

/// Copy bytes both ways until either side finishes, then shut both down.
pub async fn splice<A, B>(a: A, b: B)
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let result = tokio::select! {
        r = tokio::io::copy(&mut a_read, &mut b_write) => r,
        r = tokio::io::copy(&mut b_read, &mut a_write) => r,
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "splice ended with error");
    }

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn request(headers: &[(&str, &str)]) -> Request<()> {
        let mut builder = Request::builder().uri("http://localhost:8081/ws?app=demo");
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn upgrade_detection_needs_both_headers() {
        assert!(is_upgrade_request(&request(&[
            ("connection", "keep-alive, Upgrade"),
            ("upgrade", "websocket"),
        ])));
        assert!(!is_upgrade_request(&request(&[("upgrade", "websocket")])));
        assert!(!is_upgrade_request(&request(&[("connection", "upgrade")])));
        assert!(!is_upgrade_request(&request(&[])));
    }

    #[test]
    fn prepare_uses_origin_form_and_adds_forwarding_headers() {
        let mut req = request(&[("host", "192.168.1.20:8081")]);
        prepare(&mut req, Some("192.168.1.50:40000".parse().unwrap()));

        assert_eq!(req.uri().to_string(), "/ws?app=demo");
        assert_eq!(req.headers()["host"], "192.168.1.20:8081");
        assert_eq!(req.headers()[X_FORWARDED_HOST], "192.168.1.20:8081");
        assert_eq!(req.headers()[X_FORWARDED_FOR], "192.168.1.50");
        assert_eq!(req.headers()[X_FORWARDED_PROTO], "http");
    }

    #[test]
    fn prepare_keeps_existing_forwarding_chain() {
        let mut req = request(&[("x-forwarded-for", "10.0.0.1"), ("x-forwarded-proto", "https")]);
        prepare(&mut req, Some("127.0.0.1:5000".parse().unwrap()));
        let chain: Vec<_> = req
            .headers()
            .get_all(X_FORWARDED_FOR)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(chain, vec!["10.0.0.1", "127.0.0.1"]);
        assert_eq!(req.headers()[X_FORWARDED_PROTO], "https");
    }

    #[tokio::test]
    async fn splice_copies_both_ways_and_closes_both_sides() {
        let (mut client, proxy_client_side) = tokio::io::duplex(1024);
        let (proxy_backend_side, mut backend) = tokio::io::duplex(1024);
        let task = tokio::spawn(splice(proxy_client_side, proxy_backend_side));

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        backend.write_all(b"world").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        drop(client);
        let mut rest = Vec::new();
        backend.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        task.await.unwrap();
    }

    #[test]
    fn text_responses_are_plain_text() {
        let resp = text_response(StatusCode::NOT_FOUND, "Not found");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
    }
}
