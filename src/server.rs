use anyhow::{Context, Result};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::client::{TunnelClient, TunnelSettings};
use crate::config::Config;
use crate::dispatch::{full_body, text_response, BoxBody, Dispatcher};
use crate::registry::ClientRegistry;
use crate::tls;

/// Bound listeners plus the shared state they serve
pub struct Relay {
    control: TcpListener,
    public: TcpListener,
    admin: Option<TcpListener>,
    tls: Option<TlsAcceptor>,
    registry: ClientRegistry,
    settings: Arc<TunnelSettings>,
    dispatcher: Dispatcher,
}

impl Relay {
    /// Bind every listener named in `config`. Bind failures are fatal.
    pub async fn bind(config: &Config) -> Result<Self> {
        let http = &config.http;

        let tls = if http.tls.enabled {
            Some(tls::acceptor(&http.tls.cert, &http.tls.key).context("Failed to set up TLS")?)
        } else {
            None
        };

        let (addr, port) = http.client_bind();
        let control = TcpListener::bind((addr, port))
            .await
            .with_context(|| format!("Failed to bind client listener on {}:{}", addr, port))?;

        let (addr, port) = http.server_bind();
        let public = TcpListener::bind((addr, port))
            .await
            .with_context(|| format!("Failed to bind HTTP listener on {}:{}", addr, port))?;

        let admin = match http.admin_addr {
            Some(addr) => Some(
                TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("Failed to bind admin API on {}", addr))?,
            ),
            None => None,
        };

        let registry = ClientRegistry::new();
        let settings = Arc::new(http.tunnel_settings(public.local_addr()?.port()));
        let dispatcher = Dispatcher::new(registry.clone(), &http.host, http.response_timeout());

        Ok(Self {
            control,
            public,
            admin,
            tls,
            registry,
            settings,
            dispatcher,
        })
    }

    pub fn control_addr(&self) -> std::io::Result<SocketAddr> {
        self.control.local_addr()
    }

    pub fn public_addr(&self) -> std::io::Result<SocketAddr> {
        self.public.local_addr()
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn registry(&self) -> ClientRegistry {
        self.registry.clone()
    }

    /// Serve until `shutdown` resolves
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future,
    {
        info!("Client listener on {}", self.control.local_addr()?);
        info!(
            "HTTP listener on {} (https: {}, host: {})",
            self.public.local_addr()?,
            self.tls.is_some(),
            self.settings.host
        );

        let mut tasks = JoinSet::new();
        tasks.spawn(accept_clients(
            self.control,
            self.registry.clone(),
            self.settings.clone(),
        ));
        tasks.spawn(accept_public(self.public, self.tls, self.dispatcher));
        if let Some(admin) = self.admin {
            info!("Admin API listening on http://{}", admin.local_addr()?);
            tasks.spawn(accept_admin(admin, self.registry.clone()));
        }

        shutdown.await;
        info!("Shutting down server...");
        tasks.shutdown().await;
        Ok(())
    }
}

pub async fn run_server(config: Config) -> Result<()> {
    let relay = Relay::bind(&config).await?;
    relay
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
}

async fn accept_clients(
    listener: TcpListener,
    registry: ClientRegistry,
    settings: Arc<TunnelSettings>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
                }
                let client = TunnelClient::new(stream, registry.clone(), settings.clone());
                info!("Client connected from {} as {}", peer_addr, client.id());
                tokio::spawn(client.run());
            }
            Err(e) => error!("Failed to accept client connection: {}", e),
        }
    }
}

async fn accept_public(listener: TcpListener, tls: Option<TlsAcceptor>, dispatcher: Dispatcher) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Failed to accept HTTP connection: {}", e);
                continue;
            }
        };

        let dispatcher = dispatcher.clone();
        match tls.clone() {
            Some(acceptor) => {
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => serve_http(tls_stream, peer_addr, dispatcher).await,
                        Err(e) => warn!("TLS handshake failed from {}: {}", peer_addr, e),
                    }
                });
            }
            None => {
                tokio::spawn(serve_http(stream, peer_addr, dispatcher));
            }
        }
    }
}

async fn serve_http<IO>(io: IO, peer_addr: SocketAddr, dispatcher: Dispatcher)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let dispatcher = dispatcher.clone();
        async move { dispatcher.handle(req).await }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .await
    {
        debug!("HTTP connection error from {}: {}", peer_addr, e);
    }
}

async fn accept_admin(listener: TcpListener, registry: ClientRegistry) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let registry = registry.clone();
                tokio::spawn(async move {
                    let service =
                        service_fn(move |req| handle_admin_request(registry.clone(), req));
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        error!("Admin API error: {}", e);
                    }
                });
            }
            Err(e) => error!("Failed to accept admin connection: {}", e),
        }
    }
}

#[derive(Debug, Serialize)]
struct TunnelSummary {
    id: String,
    registered_at: u64,
}

async fn handle_admin_request<B>(
    registry: ClientRegistry,
    req: Request<B>,
) -> Result<Response<BoxBody>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => text_response(StatusCode::OK, "OK"),

        (&Method::GET, "/tunnels") => {
            let mut tunnels: Vec<TunnelSummary> = registry
                .snapshot()
                .await
                .iter()
                .map(|handle| TunnelSummary {
                    id: handle.id().to_string(),
                    registered_at: handle
                        .registered_at()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_secs())
                        .unwrap_or_default(),
                })
                .collect();
            tunnels.sort_by(|a, b| a.id.cmp(&b.id));

            match serde_json::to_vec(&tunnels) {
                Ok(json) => {
                    let mut resp = Response::new(full_body(json));
                    resp.headers_mut().insert(
                        http::header::CONTENT_TYPE,
                        http::HeaderValue::from_static("application/json"),
                    );
                    resp
                }
                Err(e) => {
                    error!("Failed to serialize tunnel list: {}", e);
                    text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
                }
            }
        }

        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::TunnelHandle;
    use http_body_util::{BodyExt, Empty};

    fn get(path: &str) -> Request<Empty<bytes::Bytes>> {
        Request::builder().uri(path).body(Empty::new()).unwrap()
    }

    #[tokio::test]
    async fn test_admin_health_and_listing() {
        let registry = ClientRegistry::new();
        let resp = handle_admin_request(registry.clone(), get("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = handle_admin_request(registry, get("/tunnels")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"[]");
    }

    #[tokio::test]
    async fn test_admin_listing_is_sorted_with_registration_time() {
        let registry = ClientRegistry::new();
        for id in ["beta", "alpha"] {
            registry
                .insert(id.to_string(), Arc::new(TunnelHandle::detached(id)))
                .await;
        }

        let resp = handle_admin_request(registry, get("/tunnels")).await.unwrap();
        let content_type = &resp.headers()[http::header::CONTENT_TYPE];
        assert_eq!(content_type, "application/json");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let tunnels: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(tunnels[0]["id"], "alpha");
        assert_eq!(tunnels[1]["id"], "beta");
        assert!(tunnels[0]["registered_at"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_admin_unknown_path() {
        let resp = handle_admin_request(ClientRegistry::new(), get("/nope")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
