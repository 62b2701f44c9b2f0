//! The control-plane client: ticket CRUD against the control listener, which may be a Unix
//! domain socket (the common case — `imageioctl` runs alongside the server) or a loopback TCP
//! port. Unlike the data-plane client this doesn't go through `reqwest`, since `reqwest` has no
//! Unix-socket transport; both transports are instead served by a single hand-rolled HTTP/1.1
//! client built directly on `hyper`, the same layer the server's listener uses to serve requests.

use std::net::SocketAddr;

use bytes::Bytes;
use camino::Utf8PathBuf;
use http_body_util::{BodyExt as _, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpStream, UnixStream};

#[derive(Debug, Clone)]
pub enum ControlTarget {
    Unix(Utf8PathBuf),
    Tcp(SocketAddr),
}

impl ControlTarget {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        if let Some(path) = raw.strip_prefix("unix:") {
            return Ok(Self::Unix(Utf8PathBuf::from(path)));
        }
        if let Ok(addr) = raw.parse::<SocketAddr>() {
            return Ok(Self::Tcp(addr));
        }
        Ok(Self::Unix(Utf8PathBuf::from(raw)))
    }
}

pub struct ControlClient {
    target: ControlTarget,
}

impl ControlClient {
    pub fn new(target: ControlTarget) -> Self {
        Self { target }
    }

    async fn send(&self, method: Method, path: &str, body: Option<serde_json::Value>) -> anyhow::Result<(StatusCode, Bytes)> {
        let body_bytes: Bytes = match &body {
            Some(value) => serde_json::to_vec(value)?.into(),
            None => Bytes::new(),
        };

        let mut request = Request::builder().method(method).uri(path).header("host", "localhost");
        if body.is_some() {
            request = request.header("content-type", "application/json");
        }
        let request = request.body(Full::new(body_bytes))?;

        let (mut sender, connection) = match &self.target {
            ControlTarget::Unix(path) => {
                let stream = UnixStream::connect(path).await.map_err(|e| anyhow::anyhow!("couldn't connect to {path}: {e}"))?;
                hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?
            }
            ControlTarget::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await.map_err(|e| anyhow::anyhow!("couldn't connect to {addr}: {e}"))?;
                hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?
            }
        };

        tokio::spawn(async move {
            if let Err(error) = connection.await {
                debug!(%error, "control connection closed with an error");
            }
        });

        let response = sender.send_request(request).await?;
        let status = response.status();
        let body: Incoming = response.into_body();
        let collected = body.collect().await?.to_bytes();
        Ok((status, collected))
    }

    pub async fn add_ticket(&self, ticket_id: &str, spec: serde_json::Value) -> anyhow::Result<()> {
        let (status, body) = self.send(Method::PUT, &format!("/tickets/{ticket_id}"), Some(spec)).await?;
        ensure_success(status, &body)
    }

    pub async fn show_ticket(&self, ticket_id: &str) -> anyhow::Result<serde_json::Value> {
        let (status, body) = self.send(Method::GET, &format!("/tickets/{ticket_id}"), None).await?;
        ensure_success(status, &body)?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub async fn list_tickets(&self) -> anyhow::Result<serde_json::Value> {
        let (status, body) = self.send(Method::GET, "/tickets/", None).await?;
        ensure_success(status, &body)?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub async fn mod_ticket(&self, ticket_id: &str, timeout: u64) -> anyhow::Result<()> {
        let (status, body) = self
            .send(Method::PATCH, &format!("/tickets/{ticket_id}"), Some(serde_json::json!({ "timeout": timeout })))
            .await?;
        ensure_success(status, &body)
    }

    pub async fn del_ticket(&self, ticket_id: &str, timeout: Option<u64>) -> anyhow::Result<()> {
        let path = match timeout {
            Some(t) => format!("/tickets/{ticket_id}?timeout={t}"),
            None => format!("/tickets/{ticket_id}"),
        };
        let (status, body) = self.send(Method::DELETE, &path, None).await?;
        ensure_success(status, &body)
    }
}

fn ensure_success(status: StatusCode, body: &Bytes) -> anyhow::Result<()> {
    if status.is_success() {
        Ok(())
    } else {
        anyhow::bail!("server returned {status}: {}", String::from_utf8_lossy(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_unix_prefix() {
        let target = ControlTarget::parse("unix:/run/imageio/control.sock").unwrap();
        assert!(matches!(target, ControlTarget::Unix(path) if path == "/run/imageio/control.sock"));
    }

    #[test]
    fn parse_bare_path_defaults_to_unix() {
        let target = ControlTarget::parse("/run/imageio/control.sock").unwrap();
        assert!(matches!(target, ControlTarget::Unix(path) if path == "/run/imageio/control.sock"));
    }

    #[test]
    fn parse_tcp_socket_addr() {
        let target = ControlTarget::parse("127.0.0.1:54323").unwrap();
        assert!(matches!(target, ControlTarget::Tcp(addr) if addr.port() == 54323));
    }

    #[test]
    fn ensure_success_rejects_error_status() {
        let err = ensure_success(StatusCode::NOT_FOUND, &Bytes::from_static(b"no such ticket")).unwrap_err();
        assert!(err.to_string().contains("404"));
    }
}
