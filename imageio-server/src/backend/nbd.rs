//! The NBD backend: a thin adapter from the [`Backend`] capability interface onto
//! [`imageio_nbd::NbdPool`].

use async_trait::async_trait;
use imageio_nbd::{Extent, MetaContextRequest, NbdPool, NbdTarget};

use super::{Backend, BackendError, BackendFeatures, ExtentContext, Result};

/// Upper bound on how many parallel NBD connections a single ticket's backend will open,
/// regardless of what the server advertises.
const MAX_NBD_CONCURRENCY: usize = 8;

pub struct NbdBackend {
    pool: NbdPool,
    requests_dirty_bitmap: Option<String>,
}

impl NbdBackend {
    pub async fn connect(url: &str, concurrency: usize) -> Result<Self> {
        let (target, export) = parse_nbd_url(url)?;
        let meta = MetaContextRequest {
            allocation_depth: true,
            dirty_bitmap: None,
        };
        let size = concurrency.clamp(1, MAX_NBD_CONCURRENCY);
        let pool = NbdPool::connect(target, &export, meta.clone(), size).await?;
        Ok(Self { pool, requests_dirty_bitmap: meta.dirty_bitmap })
    }
}

#[async_trait]
impl Backend for NbdBackend {
    fn size(&self) -> u64 {
        self.pool.export_size()
    }

    async fn read_to(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let lease = self.pool.acquire().await;
        lease.read(offset, buf.len() as u32, buf).await?;
        Ok(())
    }

    async fn write_from(&self, offset: u64, data: &[u8], flush: bool) -> Result<()> {
        let lease = self.pool.acquire().await;
        lease.write(offset, data, flush).await?;
        Ok(())
    }

    async fn zero(&self, offset: u64, length: u64, flush: bool, punch_hole: bool) -> Result<()> {
        let lease = self.pool.acquire().await;
        if lease.supports_write_zeroes() {
            lease.write_zeroes(offset, length, flush, punch_hole).await?;
            return Ok(());
        }
        drop(lease);

        const ZERO_CHUNK: u64 = 1024 * 1024;
        let mut written = 0u64;
        while written < length {
            let chunk = (length - written).min(ZERO_CHUNK);
            self.write_from(offset + written, &vec![0u8; chunk as usize], false).await?;
            written += chunk;
        }
        if flush {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let lease = self.pool.acquire().await;
        if lease.supports_flush() {
            lease.flush().await?;
        }
        Ok(())
    }

    async fn extents(&self, context: ExtentContext) -> Result<Vec<Extent>> {
        let lease = self.pool.acquire().await;
        if !lease.supports_block_status() {
            return Err(BackendError::NotSupported);
        }

        match context {
            ExtentContext::Zero => {
                let extents = lease
                    .block_status(0, self.size(), imageio_nbd::proto::META_CONTEXT_BASE_ALLOCATION)
                    .await?;
                Ok(extents)
            }
            ExtentContext::Dirty(name) => {
                if self.requests_dirty_bitmap.as_deref() != Some(name.as_str()) {
                    return Err(BackendError::NotSupported);
                }
                let context_name = format!("{}{name}", imageio_nbd::proto::DIRTY_BITMAP_PREFIX);
                let raw = lease.block_status(0, self.size(), &context_name).await?;
                // qemu's dirty-bitmap meta-context uses bit 0 of the status word to mean
                // "dirty", which our client surfaces on `Extent::hole`; remap it here.
                Ok(raw
                    .into_iter()
                    .map(|e| Extent { start: e.start, length: e.length, zero: false, hole: false, dirty: Some(e.hole) })
                    .collect())
            }
        }
    }

    fn max_readers(&self) -> usize {
        self.pool.size()
    }

    fn max_writers(&self) -> usize {
        self.pool.size()
    }

    fn features(&self) -> BackendFeatures {
        BackendFeatures {
            extents: true,
            dirty_extents: self.requests_dirty_bitmap.is_some(),
            zero: true,
            flush: true,
        }
    }
}

fn parse_nbd_url(url: &str) -> Result<(NbdTarget, String)> {
    if let Some(rest) = url.strip_prefix("nbd:unix:") {
        let (path, export) = match rest.split_once(":exportname=") {
            Some((p, e)) => (p, e.to_owned()),
            None => (rest, String::new()),
        };
        return Ok((NbdTarget::Unix(path.into()), export));
    }
    if let Some(rest) = url.strip_prefix("nbd://") {
        let (hostport, export) = match rest.split_once('/') {
            Some((hp, e)) => (hp, e.to_owned()),
            None => (rest, String::new()),
        };
        return Ok((NbdTarget::Tcp(hostport.to_owned()), export));
    }
    Err(BackendError::BadUrl(url.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unix_url_with_export_name() {
        let (target, export) = parse_nbd_url("nbd:unix:/var/run/nbd.sock:exportname=disk0").unwrap();
        assert!(matches!(target, NbdTarget::Unix(p) if p == std::path::Path::new("/var/run/nbd.sock")));
        assert_eq!(export, "disk0");
    }

    #[test]
    fn parses_tcp_url_with_export_name() {
        let (target, export) = parse_nbd_url("nbd://127.0.0.1:10809/disk0").unwrap();
        assert!(matches!(target, NbdTarget::Tcp(hp) if hp == "127.0.0.1:10809"));
        assert_eq!(export, "disk0");
    }

    #[test]
    fn rejects_unrelated_scheme() {
        assert!(parse_nbd_url("file:///tmp/x").is_err());
    }
}
