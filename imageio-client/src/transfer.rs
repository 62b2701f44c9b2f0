//! The upload/download/checksum transfer engine built on top of [`crate::client::ImageioClient`]
//! and a local `qemu-nbd` export of the file being transferred.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use futures::stream::{self, StreamExt as _, TryStreamExt as _};
use imageio_nbd::{MetaContextRequest, NbdClient};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _, AsyncWriteExt as _};
use url::Url;

use crate::client::{ImageioClient, WireExtent};
use crate::qemu::{self, QemuNbd};

const CHUNK_SIZE: u64 = 4 * 1024 * 1024;
const MAX_WORKERS: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub bytes_done: u64,
    pub bytes_total: u64,
}

pub type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;

fn no_progress() -> ProgressFn {
    Arc::new(|_| {})
}

pub struct UploadCfg {
    pub file: Utf8PathBuf,
    pub ticket_url: Url,
    pub ca_cert: Option<Utf8PathBuf>,
    pub workers: usize,
    pub progress: ProgressFn,
}

impl UploadCfg {
    pub fn new(file: Utf8PathBuf, ticket_url: Url) -> Self {
        Self { file, ticket_url, ca_cert: None, workers: MAX_WORKERS, progress: no_progress() }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum WorkItem {
    Data { offset: u64, size: u64 },
    Zero { offset: u64, size: u64 },
}

/// Splits an allocation map into upload work items: zero/hole extents become a single `Zero` item
/// each (the server handles the whole range with one `PATCH`), data extents are chunked to at most
/// `chunk_size` bytes so no single `PUT` body grows unbounded.
fn plan_upload(extents: &[imageio_nbd::Extent], chunk_size: u64) -> Vec<WorkItem> {
    let mut work = Vec::new();
    for extent in extents {
        if extent.zero || extent.hole {
            work.push(WorkItem::Zero { offset: extent.start, size: extent.length });
            continue;
        }
        let mut cursor = extent.start;
        while cursor < extent.end() {
            let size = (extent.end() - cursor).min(chunk_size);
            work.push(WorkItem::Data { offset: cursor, size });
            cursor += size;
        }
    }
    work
}

/// Splits a remote extent listing into download ranges: zero/hole extents are skipped entirely
/// (the destination file is preallocated sparse, so there is nothing to fetch), data extents are
/// chunked the same way `plan_upload` chunks them.
fn plan_download(extents: &[WireExtent], chunk_size: u64) -> Vec<(u64, u64)> {
    let mut work = Vec::new();
    for extent in extents {
        if extent.zero || extent.hole {
            continue;
        }
        let end = extent.start + extent.length;
        let mut cursor = extent.start;
        while cursor < end {
            let size = (end - cursor).min(chunk_size);
            work.push((cursor, size));
            cursor += size;
        }
    }
    work
}

/// 1. Probes the local image with `qemu-img info`.
/// 2. Exports it read-only with a local `qemu-nbd`, and walks its allocation map over NBD —
///    exactly the way the server walks a remote backend's.
/// 3. OPTIONS the ticket to learn the server's writer concurrency cap.
/// 4. Streams data extents as `PUT`s and zero extents as `PATCH`/zero, `max(workers)`-bounded,
///    failing the whole transfer on the first error.
/// 5. Issues a trailing `PATCH`/flush once every chunk has landed, guaranteeing durability across
///    every worker's connection rather than relying on a single "last" writer to flush.
#[instrument(skip_all)]
pub async fn upload(cfg: UploadCfg) -> anyhow::Result<()> {
    let info = qemu::probe_image_info(&cfg.file).await?;
    info!(format = %info.format, size = info.virtual_size, "probed local image");

    let exporter = QemuNbd::spawn_read_only(&cfg.file, &info.format).await?;
    let local = NbdClient::connect_unix(exporter.socket_path.as_std_path(), "", MetaContextRequest::default()).await?;

    let remote = ImageioClient::new(cfg.ticket_url, cfg.ca_cert.as_deref())?;
    let options = remote.options().await?;
    let concurrency = cfg.workers.min(options.max_writers.unwrap_or(1)).min(MAX_WORKERS).max(1);
    debug!(concurrency, ?options, "negotiated upload concurrency");

    let extents = local.block_status(0, local.export_size(), "base:allocation").await?;
    let work = plan_upload(&extents, CHUNK_SIZE);

    let bytes_total = info.virtual_size;
    let bytes_done = Arc::new(AtomicU64::new(0));
    let local = Arc::new(local);
    let remote = Arc::new(remote);
    let progress = cfg.progress;

    stream::iter(work.into_iter().map(anyhow::Ok))
        .try_for_each_concurrent(Some(concurrency), |item| {
            let local = Arc::clone(&local);
            let remote = Arc::clone(&remote);
            let bytes_done = Arc::clone(&bytes_done);
            let progress = Arc::clone(&progress);
            async move {
                let size = match item {
                    WorkItem::Data { offset, size } => {
                        let mut buf = vec![0u8; size as usize];
                        local.read(offset, size as u32, &mut buf).await?;
                        remote.put_range(offset, offset + size, Bytes::from(buf), false).await?;
                        size
                    }
                    WorkItem::Zero { offset, size } => {
                        remote.patch_zero(offset, size, false).await?;
                        size
                    }
                };
                let done = bytes_done.fetch_add(size, Ordering::Relaxed) + size;
                progress(Progress { bytes_done: done, bytes_total });
                anyhow::Ok(())
            }
        })
        .await?;

    remote.patch_flush().await?;
    local.disconnect().await.ok();
    Ok(())
}

pub struct DownloadCfg {
    pub ticket_url: Url,
    pub ca_cert: Option<Utf8PathBuf>,
    pub file: Utf8PathBuf,
    pub workers: usize,
    pub progress: ProgressFn,
}

impl DownloadCfg {
    pub fn new(ticket_url: Url, file: Utf8PathBuf) -> Self {
        Self { ticket_url, ca_cert: None, file, workers: MAX_WORKERS, progress: no_progress() }
    }
}

/// Symmetrical to [`upload`]: `GET /extents` tells us which ranges are real data, the rest is
/// left untouched so the destination file stays sparse (a file preallocated with `set_len` and
/// never written to is a hole on every filesystem this matters on).
#[instrument(skip_all)]
pub async fn download(cfg: DownloadCfg) -> anyhow::Result<()> {
    let remote = ImageioClient::new(cfg.ticket_url, cfg.ca_cert.as_deref())?;
    let options = remote.options().await?;
    let size = remote.probe_size().await?;
    info!(size, "probed remote image");

    let file = OpenOptions::new().create(true).write(true).truncate(true).open(&cfg.file).await?;
    file.set_len(size).await?;
    drop(file);

    let extents = remote.extents(None).await?;
    let concurrency = cfg.workers.min(options.max_readers.unwrap_or(1)).min(MAX_WORKERS).max(1);
    debug!(concurrency, ?options, "negotiated download concurrency");

    let work = plan_download(&extents, CHUNK_SIZE);

    let bytes_total = size;
    let bytes_done = Arc::new(AtomicU64::new(0));
    let remote = Arc::new(remote);
    let file_path = cfg.file.clone();
    let progress = cfg.progress;

    stream::iter(work.into_iter().map(anyhow::Ok))
        .try_for_each_concurrent(Some(concurrency), |(offset, len)| {
            let remote = Arc::clone(&remote);
            let bytes_done = Arc::clone(&bytes_done);
            let progress = Arc::clone(&progress);
            let file_path = file_path.clone();
            async move {
                let chunk = remote.get_range(offset, offset + len).await?;
                let mut file = OpenOptions::new().write(true).open(&file_path).await?;
                file.seek(std::io::SeekFrom::Start(offset)).await?;
                file.write_all(&chunk).await?;

                let done = bytes_done.fetch_add(len, Ordering::Relaxed) + len;
                progress(Progress { bytes_done: done, bytes_total });
                anyhow::Ok(())
            }
        })
        .await?;

    Ok(())
}

/// Hashes a local image's logical content with BLAKE2b, the same digest `ovirt-imageio`-family
/// tools have always used for this. Reading straight through a sparse file is sufficient — a hole
/// reads back as zero bytes without any real I/O, so no extent-awareness is needed here for
/// correctness, only for the upload/download paths where skipping zero ranges saves real work.
pub async fn checksum(path: &Utf8Path) -> anyhow::Result<String> {
    use blake2::Digest as _;

    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = blake2::Blake2b512::new();
    let mut buf = vec![0u8; CHUNK_SIZE as usize];

    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use imageio_nbd::Extent;

    fn data(start: u64, length: u64) -> Extent {
        Extent { start, length, zero: false, hole: false, dirty: None }
    }

    fn zero(start: u64, length: u64) -> Extent {
        Extent { start, length, zero: true, hole: false, dirty: None }
    }

    #[test]
    fn plan_upload_chunks_data_extents() {
        let extents = vec![data(0, 10)];
        let work = plan_upload(&extents, 4);
        assert_eq!(
            work,
            vec![
                WorkItem::Data { offset: 0, size: 4 },
                WorkItem::Data { offset: 4, size: 4 },
                WorkItem::Data { offset: 8, size: 2 },
            ]
        );
    }

    #[test]
    fn plan_upload_keeps_zero_extents_whole() {
        let extents = vec![zero(0, 100), data(100, 3)];
        let work = plan_upload(&extents, 4);
        assert_eq!(
            work,
            vec![WorkItem::Zero { offset: 0, size: 100 }, WorkItem::Data { offset: 100, size: 3 }]
        );
    }

    #[test]
    fn plan_upload_empty_extents_is_empty() {
        assert!(plan_upload(&[], 4).is_empty());
    }

    fn wire_data(start: u64, length: u64) -> WireExtent {
        WireExtent { start, length, zero: false, hole: false, dirty: None }
    }

    fn wire_hole(start: u64, length: u64) -> WireExtent {
        WireExtent { start, length, zero: false, hole: true, dirty: None }
    }

    #[test]
    fn plan_download_skips_holes_and_chunks_data() {
        let extents = vec![wire_hole(0, 100), wire_data(100, 9)];
        let work = plan_download(&extents, 4);
        assert_eq!(work, vec![(100, 4), (104, 4), (108, 1)]);
    }

    #[test]
    fn plan_download_all_holes_yields_no_work() {
        let extents = vec![wire_hole(0, 50)];
        assert!(plan_download(&extents, 4).is_empty());
    }

    #[tokio::test]
    async fn checksum_is_stable_across_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("disk.img")).unwrap();
        tokio::fs::write(&path, b"some disk bytes, not actually sparse").await.unwrap();

        let first = checksum(&path).await.unwrap();
        let second = checksum(&path).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 128); // Blake2b512 hex-encoded
    }

    #[tokio::test]
    async fn checksum_differs_for_different_content() {
        let dir = tempfile::tempdir().unwrap();
        let a = Utf8PathBuf::from_path_buf(dir.path().join("a.img")).unwrap();
        let b = Utf8PathBuf::from_path_buf(dir.path().join("b.img")).unwrap();
        tokio::fs::write(&a, b"alpha").await.unwrap();
        tokio::fs::write(&b, b"bravo").await.unwrap();

        assert_ne!(checksum(&a).await.unwrap(), checksum(&b).await.unwrap());
    }
}
