//! Front-end registry HTTP server.
//!
//! A raw `hyper` server, `http1::Builder` + `service_fn` over an accept
//! loop, rather than a web framework. The route table here is small
//! enough that a framework buys nothing.

use std::convert::Infallible;
use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::registry::FrontendRegistry;

/// Runs the front-end registry API until the process exits. Each
/// connection is served on its own task; a single bad connection never
/// takes down the listener.
pub async fn run(addr: SocketAddr, registry: FrontendRegistry) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "front-end registry listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%err, "front-end registry accept error");
                continue;
            }
        };

        let io = TokioIo::new(stream);
        let registry = registry.clone();

        tokio::spawn(async move {
            let result = http1::Builder::new()
                .serve_connection(io, service_fn(move |req| handle(req, registry.clone())))
                .await;
            if let Err(err) = result {
                warn!(%peer, %err, "front-end registry connection error");
            }
        });
    }
}

async fn handle(
    req: Request<hyper::body::Incoming>,
    registry: FrontendRegistry,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();

    let result = match (&method, segments.as_slice()) {
        (&Method::GET, []) => Ok(json_response(StatusCode::OK, &server_info())),
        (&Method::GET, ["v1", "ping"]) => Ok(text_response(StatusCode::OK, "pong")),
        (&Method::GET, ["v1", "frontend"]) => list(&registry).await,
        (&Method::GET, ["v1", "frontend", id]) => get(&registry, id).await,
        (&Method::POST, ["v1", "frontend", id]) => create(&registry, id, req).await,
        (&Method::DELETE, ["v1", "frontend", id]) => delete(&registry, id).await,
        _ => Ok(text_response(StatusCode::NOT_FOUND, "not found")),
    };

    Ok(result.unwrap_or_else(|err| {
        error!(%err, "front-end registry request failed");
        text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    }))
}

async fn list(registry: &FrontendRegistry) -> Result<Response<Full<Bytes>>, crate::error::Error> {
    let records: std::collections::BTreeMap<String, robin_core::model::FrontendRecord> =
        registry.list().await?.into_iter().collect();
    Ok(json_response(StatusCode::OK, &records))
}

async fn get(registry: &FrontendRegistry, id: &str) -> Result<Response<Full<Bytes>>, crate::error::Error> {
    match registry.get(id).await? {
        Some(record) => Ok(json_response(StatusCode::OK, &record)),
        None => Ok(text_response(StatusCode::NOT_FOUND, "no such frontend")),
    }
}

async fn create(
    registry: &FrontendRegistry,
    id: &str,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, crate::error::Error> {
    let body = req
        .collect()
        .await
        .map_err(|e| crate::error::Error::Io(std::io::Error::other(e.to_string())))?
        .to_bytes();

    let record: robin_core::model::FrontendRecord = match serde_json::from_slice(&body) {
        Ok(record) => record,
        Err(err) => return Ok(text_response(StatusCode::BAD_REQUEST, &err.to_string())),
    };

    match registry.create(id, &record).await {
        Ok(true) => Ok(text_response(StatusCode::OK, "created")),
        Ok(false) => Ok(text_response(StatusCode::CONFLICT, "frontend id already exists")),
        Err(crate::error::Error::Model(robin_core::Error::Validation(msg))) => {
            Ok(text_response(StatusCode::BAD_REQUEST, &msg))
        }
        Err(err) => Err(err),
    }
}

async fn delete(registry: &FrontendRegistry, id: &str) -> Result<Response<Full<Bytes>>, crate::error::Error> {
    match registry.delete(id).await? {
        true => Ok(text_response(StatusCode::OK, "deleted")),
        false => Ok(text_response(StatusCode::NOT_FOUND, "no such frontend")),
    }
}

fn server_info() -> serde_json::Value {
    serde_json::json!({ "name": "robin", "version": robin_core::VERSION })
}

fn json_response(status: StatusCode, body: &impl serde::Serialize) -> Response<Full<Bytes>> {
    let json = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(json)))
        .expect("response builder invariants upheld")
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("response builder invariants upheld")
}
