//! The three listener kinds this service exposes: a remote TLS data-plane listener, a local
//! unix-socket data-plane listener for co-resident callers that don't need TLS, and the control
//! listener (ticket CRUD), which never carries TLS since it is only ever reachable locally.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use camino::Utf8PathBuf;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use imageio_task::{ShutdownSignal, Task};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tower_service::Service as _;

use crate::config::ControlListenerConf;
use crate::state::AppState;

pub struct RemoteListenerTask {
    pub addr: SocketAddr,
    pub tls_config: Arc<rustls::ServerConfig>,
    pub state: AppState,
}

#[async_trait]
impl Task for RemoteListenerTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "remote listener";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        let listener = TcpListener::bind(self.addr).await.with_context(|| format!("couldn't bind {}", self.addr))?;
        info!(addr = %self.addr, "remote listener bound");

        let acceptor = tokio_rustls::TlsAcceptor::from(self.tls_config);
        let app = crate::api::images_router().with_state(self.state);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(error) => { warn!(%error, "accept failed"); continue; }
                    };
                    spawn_peer(peer_addr.to_string(), shutdown_signal.clone(), {
                        let acceptor = acceptor.clone();
                        let app = app.clone();
                        async move {
                            let tls_stream = acceptor.accept(stream).await.context("TLS handshake failed")?;
                            serve_http(tls_stream, app).await
                        }
                    });
                }
                () = shutdown_signal.wait() => return Ok(()),
            }
        }
    }
}

pub struct LocalUnixListenerTask {
    pub path: Utf8PathBuf,
    pub state: AppState,
}

#[async_trait]
impl Task for LocalUnixListenerTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "local unix listener";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        let listener = bind_unix(&self.path)?;
        info!(path = %self.path, "local listener bound");

        let app = crate::api::images_router().with_state(self.state);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(pair) => pair,
                        Err(error) => { warn!(%error, "accept failed"); continue; }
                    };
                    let app = app.clone();
                    spawn_peer(self.path.to_string(), shutdown_signal.clone(), async move { serve_http(stream, app).await });
                }
                () = shutdown_signal.wait() => return Ok(()),
            }
        }
    }
}

pub struct ControlListenerTask {
    pub conf: ControlListenerConf,
    pub state: AppState,
}

#[async_trait]
impl Task for ControlListenerTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "control listener";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        let app = crate::api::tickets_router().with_state(self.state);

        match self.conf {
            ControlListenerConf::Unix { path } => {
                let listener = bind_unix(&path)?;
                info!(%path, "control listener bound");
                loop {
                    tokio::select! {
                        accepted = listener.accept() => {
                            let (stream, _) = match accepted {
                                Ok(pair) => pair,
                                Err(error) => { warn!(%error, "accept failed"); continue; }
                            };
                            let app = app.clone();
                            spawn_peer(path.to_string(), shutdown_signal.clone(), async move { serve_http(stream, app).await });
                        }
                        () = shutdown_signal.wait() => return Ok(()),
                    }
                }
            }
            ControlListenerConf::Tcp { addr } => {
                let listener = TcpListener::bind(addr).await.with_context(|| format!("couldn't bind {addr}"))?;
                info!(%addr, "control listener bound");
                loop {
                    tokio::select! {
                        accepted = listener.accept() => {
                            let (stream, peer_addr) = match accepted {
                                Ok(pair) => pair,
                                Err(error) => { warn!(%error, "accept failed"); continue; }
                            };
                            let app = app.clone();
                            spawn_peer(peer_addr.to_string(), shutdown_signal.clone(), async move { serve_http(stream, app).await });
                        }
                        () = shutdown_signal.wait() => return Ok(()),
                    }
                }
            }
        }
    }
}

fn bind_unix(path: &camino::Utf8Path) -> anyhow::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("couldn't create {parent}"))?;
    }
    // A socket left behind by a previous, uncleanly terminated run would otherwise make every
    // subsequent bind fail with "address in use".
    let _ = std::fs::remove_file(path);
    UnixListener::bind(path).with_context(|| format!("couldn't bind {path}"))
}

fn spawn_peer(peer: String, mut shutdown_signal: ShutdownSignal, fut: impl std::future::Future<Output = anyhow::Result<()>> + Send + 'static) {
    tokio::spawn(async move {
        tokio::select! {
            result = fut => {
                if let Err(error) = result {
                    debug!(%peer, %error, "connection terminated with an error");
                }
            }
            () = shutdown_signal.wait() => {}
        }
    });
}

async fn serve_http<S>(stream: S, app: Router) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = hyper::service::service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
        let mut app = app.clone();
        async move { app.call(request.map(Body::new)).await }
    });

    ConnBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|error| anyhow::anyhow!("connection error: {error}"))
}
