use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::client::{MetaContextRequest, NbdClient};
use crate::error::Result;

/// Where to dial the NBD server: a Unix socket or a TCP host:port.
#[derive(Debug, Clone)]
pub enum NbdTarget {
    Unix(PathBuf),
    Tcp(String),
}

/// A bounded pool of independent NBD connections to the same export.
///
/// Each connection in the pool is fully independent (its own handshake, its own in-flight
/// request), so operations on distinct connections proceed concurrently; the semaphore caps
/// how many connections exist at once, matching the server's advertised concurrency ceiling.
pub struct NbdPool {
    target: NbdTarget,
    export: String,
    meta: MetaContextRequest,
    connections: Vec<Arc<NbdClient>>,
    permits: Semaphore,
    next: std::sync::atomic::AtomicUsize,
}

impl NbdPool {
    pub async fn connect(target: NbdTarget, export: &str, meta: MetaContextRequest, size: usize) -> Result<Self> {
        let mut connections = Vec::with_capacity(size);
        for _ in 0..size {
            let client = match &target {
                NbdTarget::Unix(path) => NbdClient::connect_unix(path, export, meta.clone()).await?,
                NbdTarget::Tcp(addr) => NbdClient::connect_tcp(addr, export, meta.clone()).await?,
            };
            connections.push(Arc::new(client));
        }
        Ok(Self {
            target,
            export: export.to_owned(),
            meta,
            connections,
            permits: Semaphore::new(size),
            next: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    pub fn size(&self) -> usize {
        self.connections.len()
    }

    pub fn export_size(&self) -> u64 {
        self.connections[0].export_size()
    }

    /// Acquires a permit and hands back one of the pool's connections, round-robin.
    ///
    /// The permit is dropped (returned to the pool) when the guard goes out of scope; the
    /// underlying connection itself is shared and may still be serving another caller's request
    /// concurrently (NBD connections are safe for concurrent non-overlapping requests).
    pub async fn acquire(&self) -> NbdLease<'_> {
        let permit = self.permits.acquire().await.expect("semaphore is never closed");
        let index = self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % self.connections.len();
        NbdLease {
            client: Arc::clone(&self.connections[index]),
            _permit: permit,
        }
    }

    pub fn target(&self) -> &NbdTarget {
        &self.target
    }

    pub fn export(&self) -> &str {
        &self.export
    }

    pub fn meta(&self) -> &MetaContextRequest {
        &self.meta
    }
}

pub struct NbdLease<'a> {
    client: Arc<NbdClient>,
    _permit: tokio::sync::SemaphorePermit<'a>,
}

impl std::ops::Deref for NbdLease<'_> {
    type Target = NbdClient;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}
