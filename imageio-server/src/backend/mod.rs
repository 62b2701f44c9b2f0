//! The backend capability interface and its three implementations: raw file, NBD, and HTTP
//! pass-through.

pub mod file;
pub mod http;
pub mod nbd;

use async_trait::async_trait;
use camino::Utf8Path;
use imageio_nbd::Extent;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Nbd(#[from] imageio_nbd::NbdError),
    #[error("origin server returned an error: {0}")]
    Origin(String),
    #[error("backend does not support this operation")]
    NotSupported,
    #[error("unsupported or malformed backend url: {0}")]
    BadUrl(String),
    #[error("range [{offset}, {end}) lies outside of image of size {size}")]
    OutOfRange { offset: u64, end: u64, size: u64 },
}

pub type Result<T> = core::result::Result<T, BackendError>;

/// Which extent query the caller wants: current allocation/zero status, or change status
/// relative to a named dirty bitmap.
#[derive(Debug, Clone)]
pub enum ExtentContext {
    Zero,
    Dirty(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BackendFeatures {
    pub extents: bool,
    pub dirty_extents: bool,
    pub zero: bool,
    pub flush: bool,
}

/// Uniform capability object abstracting a virtual disk image, regardless of how it is stored.
#[async_trait]
pub trait Backend: Send + Sync {
    fn size(&self) -> u64;

    async fn read_to(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    async fn write_from(&self, offset: u64, data: &[u8], flush: bool) -> Result<()>;

    async fn zero(&self, offset: u64, length: u64, flush: bool, punch_hole: bool) -> Result<()> {
        let _ = (offset, length, flush, punch_hole);
        Err(BackendError::NotSupported)
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn extents(&self, context: ExtentContext) -> Result<Vec<Extent>> {
        let _ = context;
        Err(BackendError::NotSupported)
    }

    fn max_readers(&self) -> usize {
        1
    }

    fn max_writers(&self) -> usize {
        1
    }

    fn features(&self) -> BackendFeatures;
}

/// Opens the concrete backend implied by a ticket's `url` field. `tls_ca`, when set, is used to
/// validate an `https://` origin's certificate for the HTTP pass-through backend; it has no
/// effect on the other backends.
pub async fn open(url: &str, nbd_concurrency: usize, tls_ca: Option<&Utf8Path>) -> Result<Box<dyn Backend>> {
    if let Some(path) = url.strip_prefix("file://") {
        return Ok(Box::new(file::FileBackend::open(path.as_ref()).await?));
    }
    if url.starts_with("nbd:") || url.starts_with("nbd+unix:") {
        return Ok(Box::new(nbd::NbdBackend::connect(url, nbd_concurrency).await?));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        let parsed = Url::parse(url).map_err(|e| BackendError::BadUrl(e.to_string()))?;
        return Ok(Box::new(http::HttpBackend::connect(parsed, tls_ca).await?));
    }
    Err(BackendError::BadUrl(url.to_owned()))
}
