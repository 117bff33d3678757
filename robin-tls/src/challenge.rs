//! HTTP-01 challenge provider.
//!
//! `present`/`cleanup` write through the shared [`KvStore`] at
//! `lb/acme/<token>` so *any* replica can answer
//! `GET /.well-known/acme-challenge/<token>`, not just the one that
//! requested the order. The listener itself is a minimal `hyper` server,
//! the same raw `http1::Builder` + `service_fn` shape the teacher's admin
//! API uses.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, warn};

use crate::error::Result;
use crate::kv::KvStore;

const CHALLENGE_PREFIX: &str = "lb/acme";

/// Cluster-shared HTTP-01 deploy/cleanup/serve surface.
pub struct ChallengeProvider {
    kv: Arc<dyn KvStore>,
}

impl ChallengeProvider {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn key(token: &str) -> String {
        format!("{CHALLENGE_PREFIX}/{token}")
    }

    /// Stores `keyAuth` under the token's well-known KV path.
    pub async fn present(&self, token: &str, key_auth: &str) {
        if let Err(err) = self.kv.put(&Self::key(token), key_auth.as_bytes()).await {
            error!(token, %err, "failed to publish acme challenge token");
        }
    }

    /// Deletes the token's KV entry.
    pub async fn cleanup(&self, token: &str) {
        if let Err(err) = self.kv.delete(&Self::key(token)).await {
            warn!(token, %err, "failed to clean up acme challenge token");
        }
    }

    async fn lookup(&self, token: &str) -> Option<String> {
        match self.kv.get(&Self::key(token)).await {
            Ok(Some(bytes)) => String::from_utf8(bytes).ok(),
            Ok(None) => None,
            Err(err) => {
                error!(token, %err, "failed to look up acme challenge token");
                None
            }
        }
    }

    /// Binds a listener on `addr` and serves
    /// `GET /.well-known/acme-challenge/<token>` until the process exits.
    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "acme http-01 challenge listener started");

        loop {
            let (stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(%err, "acme challenge listener accept error");
                    continue;
                }
            };
            let io = TokioIo::new(stream);
            let provider = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let provider = provider.clone();
                    async move { handle(req, provider).await }
                });
                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(%err, "acme challenge connection error");
                }
            });
        }
    }
}

async fn handle(
    req: Request<hyper::body::Incoming>,
    provider: Arc<ChallengeProvider>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    const PREFIX: &str = "/.well-known/acme-challenge/";

    if req.method() != Method::GET || !req.uri().path().starts_with(PREFIX) {
        return Ok(not_found());
    }

    let token = &req.uri().path()[PREFIX.len()..];
    match provider.lookup(token).await {
        Some(key_auth) => Ok(Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain")
            .body(Full::new(Bytes::from(key_auth)))
            .unwrap()),
        None => Ok(not_found()),
    }
}

fn not_found() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;

    #[tokio::test]
    async fn present_then_lookup_roundtrips() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let provider = ChallengeProvider::new(kv);
        provider.present("tok1", "auth1").await;
        assert_eq!(provider.lookup("tok1").await, Some("auth1".to_string()));
    }

    #[tokio::test]
    async fn cleanup_removes_the_token() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let provider = ChallengeProvider::new(kv);
        provider.present("tok1", "auth1").await;
        provider.cleanup("tok1").await;
        assert_eq!(provider.lookup("tok1").await, None);
    }
}
