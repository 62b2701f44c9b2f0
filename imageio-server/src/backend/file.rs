//! The raw file / block device backend.
//!
//! Opens with `O_DIRECT` when the underlying filesystem allows it, falling back to buffered
//! I/O with an explicit `fdatasync` on flush. Requests that are not aligned to the device's
//! logical block size go through a bounce buffer so the syscall itself always sees an aligned
//! offset, length, and buffer address.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use imageio_nbd::Extent;
use tokio::sync::Mutex as AsyncMutex;

use super::{Backend, BackendError, BackendFeatures, ExtentContext, Result};

/// Default alignment assumed for `O_DIRECT` I/O when the device's native block size cannot be
/// queried; 4 KiB covers the overwhelming majority of modern storage.
const DEFAULT_ALIGNMENT: u64 = 4096;

pub struct FileBackend {
    file: Arc<File>,
    size: u64,
    alignment: u64,
    /// Serializes writes, matching the single-descriptor concurrency model of this backend
    /// (`max_writers() == 1`); reads proceed concurrently via independent `pread` calls.
    write_lock: AsyncMutex<()>,
}

impl FileBackend {
    pub async fn open(path: &Path) -> Result<Self> {
        let path = path.to_owned();
        tokio::task::spawn_blocking(move || Self::open_blocking(&path))
            .await
            .expect("blocking file-open task panicked")
    }

    fn open_blocking(path: &Path) -> Result<Self> {
        let (file, alignment) = open_with_direct_io(path)?;
        let size = file_size(&file)?;
        Ok(Self {
            file: Arc::new(file),
            size,
            alignment,
            write_lock: AsyncMutex::new(()),
        })
    }

    fn aligned_span(&self, offset: u64, len: u64) -> (u64, u64) {
        if self.alignment <= 1 {
            return (offset, len);
        }
        let start = offset - (offset % self.alignment);
        let end = offset + len;
        let aligned_end = end.div_ceil(self.alignment) * self.alignment;
        (start, aligned_end - start)
    }
}

#[async_trait]
impl Backend for FileBackend {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_to(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset + buf.len() as u64;
        if end > self.size {
            return Err(BackendError::OutOfRange { offset, end, size: self.size });
        }

        let file = Arc::clone(&self.file);
        let (aligned_offset, aligned_len) = self.aligned_span(offset, buf.len() as u64);
        let want_len = buf.len();
        let skip = (offset - aligned_offset) as usize;

        let bounce = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut bounce = vec![0u8; aligned_len as usize];
            file.read_at(&mut bounce, aligned_offset)?;
            Ok(bounce)
        })
        .await
        .expect("blocking read task panicked")?;

        buf.copy_from_slice(&bounce[skip..skip + want_len]);
        Ok(())
    }

    async fn write_from(&self, offset: u64, data: &[u8], flush: bool) -> Result<()> {
        let end = offset + data.len() as u64;
        if end > self.size {
            return Err(BackendError::OutOfRange { offset, end, size: self.size });
        }

        let _guard = self.write_lock.lock().await;
        self.write_from_locked(offset, data, flush).await
    }

    /// The actual write, assuming `write_lock` is already held by the caller. `zero`'s
    /// punch-hole fallback calls this directly instead of `write_from` to avoid deadlocking on
    /// the non-reentrant lock.
    async fn write_from_locked(&self, offset: u64, data: &[u8], flush: bool) -> Result<()> {
        let file = Arc::clone(&self.file);
        let (aligned_offset, aligned_len) = self.aligned_span(offset, data.len() as u64);
        let data = data.to_vec();
        let skip = (offset - aligned_offset) as usize;
        let unaligned = skip != 0 || aligned_len as usize != data.len();

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            if unaligned {
                let mut bounce = vec![0u8; aligned_len as usize];
                // Best effort: a fully-aligned fast path never reaches here. Read existing
                // content first so we do not clobber neighboring bytes within the same block.
                let _ = file.read_at(&mut bounce, aligned_offset);
                bounce[skip..skip + data.len()].copy_from_slice(&data);
                file.write_at(&bounce, aligned_offset)?;
            } else {
                file.write_at(&data, aligned_offset)?;
            }
            if flush {
                file.sync_data()?;
            }
            Ok(())
        })
        .await
        .expect("blocking write task panicked")?;

        Ok(())
    }

    async fn zero(&self, offset: u64, length: u64, flush: bool, punch_hole: bool) -> Result<()> {
        let end = offset + length;
        if end > self.size {
            return Err(BackendError::OutOfRange { offset, end, size: self.size });
        }

        let _guard = self.write_lock.lock().await;
        let file = Arc::clone(&self.file);

        let punched = if punch_hole {
            tokio::task::spawn_blocking(move || try_punch_hole(&file, offset, length))
                .await
                .expect("blocking punch-hole task panicked")
        } else {
            false
        };

        if !punched {
            const ZERO_CHUNK: usize = 1024 * 1024;
            let mut written = 0u64;
            while written < length {
                let chunk = (length - written).min(ZERO_CHUNK as u64) as usize;
                self.write_from_locked(offset + written, &vec![0u8; chunk], false).await?;
                written += chunk as u64;
            }
        }

        if flush {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || file.sync_data())
            .await
            .expect("blocking flush task panicked")?;
        Ok(())
    }

    async fn extents(&self, context: ExtentContext) -> Result<Vec<Extent>> {
        if !matches!(context, ExtentContext::Zero) {
            return Err(BackendError::NotSupported);
        }
        let file = Arc::clone(&self.file);
        let size = self.size;
        tokio::task::spawn_blocking(move || seek_data_hole_extents(&file, size))
            .await
            .expect("blocking extents task panicked")
    }

    fn max_readers(&self) -> usize {
        8
    }

    fn max_writers(&self) -> usize {
        1
    }

    fn features(&self) -> BackendFeatures {
        BackendFeatures {
            extents: true,
            dirty_extents: false,
            zero: true,
            flush: true,
        }
    }
}

#[cfg(target_os = "linux")]
fn open_with_direct_io(path: &Path) -> Result<(File, u64)> {
    match OpenOptions::new().read(true).write(true).custom_flags(libc::O_DIRECT).open(path) {
        Ok(file) => Ok((file, DEFAULT_ALIGNMENT)),
        Err(_) => {
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            Ok((file, 1))
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn open_with_direct_io(path: &Path) -> Result<(File, u64)> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    Ok((file, 1))
}

fn file_size(file: &File) -> Result<u64> {
    let meta = file.metadata()?;
    if meta.len() > 0 || !is_block_device(&meta) {
        return Ok(meta.len());
    }
    block_device_size(file).map_err(BackendError::Io)
}

#[cfg(unix)]
fn is_block_device(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    meta.file_type().is_block_device()
}

#[cfg(not(unix))]
fn is_block_device(_meta: &std::fs::Metadata) -> bool {
    false
}

#[cfg(target_os = "linux")]
fn block_device_size(file: &File) -> std::io::Result<u64> {
    use std::os::unix::io::AsRawFd;
    const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;
    let mut size: u64 = 0;
    // SAFETY: `fd` is a valid, open file descriptor for the lifetime of this call, and `size`
    // is a correctly sized output buffer for the `BLKGETSIZE64` ioctl.
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(size)
}

#[cfg(not(target_os = "linux"))]
fn block_device_size(_file: &File) -> std::io::Result<u64> {
    Ok(0)
}

#[cfg(target_os = "linux")]
fn try_punch_hole(file: &File, offset: u64, length: u64) -> bool {
    use std::os::unix::io::AsRawFd;
    // SAFETY: `fd` is valid; `fallocate` with these flags only affects the given byte range.
    let ret = unsafe {
        libc::fallocate(
            file.as_raw_fd(),
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            offset as libc::off_t,
            length as libc::off_t,
        )
    };
    ret == 0
}

#[cfg(not(target_os = "linux"))]
fn try_punch_hole(_file: &File, _offset: u64, _length: u64) -> bool {
    false
}

#[cfg(target_os = "linux")]
fn seek_data_hole_extents(file: &File, size: u64) -> Result<Vec<Extent>> {
    use std::os::unix::io::AsRawFd;

    let mut extents = Vec::new();
    let mut cursor: i64 = 0;
    let fd = file.as_raw_fd();

    while (cursor as u64) < size {
        // SAFETY: `fd` stays open and valid for this call; `lseek` does not touch file contents.
        let data_start = unsafe { libc::lseek(fd, cursor, libc::SEEK_DATA) };
        if data_start < 0 {
            // ENXIO: no more data past `cursor` — remainder of the file is a hole.
            extents.push(Extent { start: cursor as u64, length: size - cursor as u64, zero: true, hole: true, dirty: None });
            break;
        }
        if data_start as u64 > cursor as u64 {
            extents.push(Extent {
                start: cursor as u64,
                length: data_start as u64 - cursor as u64,
                zero: true,
                hole: true,
                dirty: None,
            });
        }

        // SAFETY: same as above.
        let mut hole_start = unsafe { libc::lseek(fd, data_start, libc::SEEK_HOLE) };
        if hole_start < 0 {
            hole_start = size as i64;
        }
        extents.push(Extent {
            start: data_start as u64,
            length: (hole_start - data_start) as u64,
            zero: false,
            hole: false,
            dirty: None,
        });

        cursor = hole_start;
    }

    Ok(merge(extents))
}

#[cfg(not(target_os = "linux"))]
fn seek_data_hole_extents(_file: &File, size: u64) -> Result<Vec<Extent>> {
    Ok(vec![Extent { start: 0, length: size, zero: false, hole: false, dirty: None }])
}

fn merge(mut extents: Vec<Extent>) -> Vec<Extent> {
    extents.sort_by_key(|e| e.start);
    let mut merged: Vec<Extent> = Vec::with_capacity(extents.len());
    for extent in extents {
        match merged.last_mut() {
            Some(prev) if prev.end() == extent.start && prev.zero == extent.zero && prev.hole == extent.hole => {
                prev.length += extent.length;
            }
            _ => merged.push(extent),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_extents_joins_adjacent_same_flags() {
        let input = vec![
            Extent { start: 0, length: 10, zero: true, hole: true, dirty: None },
            Extent { start: 10, length: 10, zero: true, hole: true, dirty: None },
            Extent { start: 20, length: 5, zero: false, hole: false, dirty: None },
        ];
        let merged = merge(input);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].length, 20);
    }
}
