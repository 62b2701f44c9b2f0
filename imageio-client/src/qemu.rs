//! Wraps the two external `qemu-img`/`qemu-nbd` binaries the transfer engine needs: probing a
//! local image's format and virtual size, and exporting it read-only over NBD so its allocation
//! map can be walked the same way the server walks a remote one.

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use tokio::process::{Child, Command};
use tokio::time::{Duration, sleep};

#[derive(Debug, Deserialize)]
struct QemuImgInfo {
    format: String,
    #[serde(rename = "virtual-size")]
    virtual_size: u64,
}

#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub format: String,
    pub virtual_size: u64,
}

/// Runs `qemu-img info --output=json` on a local image file.
pub async fn probe_image_info(path: &Utf8Path) -> anyhow::Result<ImageInfo> {
    let output = Command::new("qemu-img")
        .args(["info", "--output=json", path.as_str()])
        .output()
        .await
        .map_err(|error| anyhow::anyhow!("couldn't run qemu-img: {error}"))?;

    if !output.status.success() {
        anyhow::bail!("qemu-img info failed: {}", String::from_utf8_lossy(&output.stderr));
    }

    let info: QemuImgInfo = serde_json::from_slice(&output.stdout)?;
    Ok(ImageInfo { format: info.format, virtual_size: info.virtual_size })
}

/// A local `qemu-nbd` process exporting a single image over a Unix domain socket. Killed when
/// dropped so a CLI invocation never leaves an orphaned exporter behind.
pub struct QemuNbd {
    child: Child,
    pub socket_path: Utf8PathBuf,
}

impl QemuNbd {
    /// Spawns `qemu-nbd` in read-only mode and waits for its socket to become connectable.
    pub async fn spawn_read_only(path: &Utf8Path, format: &str) -> anyhow::Result<Self> {
        let socket_path = Utf8PathBuf::from(format!("/tmp/imageio-client-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&socket_path);

        let child = Command::new("qemu-nbd")
            .args(["--read-only", "--persistent", "--format", format, "--socket"])
            .arg(socket_path.as_str())
            .arg(path.as_str())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| anyhow::anyhow!("couldn't run qemu-nbd: {error}"))?;

        let exporter = Self { child, socket_path };
        exporter.wait_for_socket().await?;
        info!(pid = ?exporter.child.id(), socket = %exporter.socket_path, "qemu-nbd exporting local image");
        Ok(exporter)
    }

    async fn wait_for_socket(&self) -> anyhow::Result<()> {
        for _ in 0..50 {
            if tokio::net::UnixStream::connect(&self.socket_path).await.is_ok() {
                return Ok(());
            }
            sleep(Duration::from_millis(100)).await;
        }
        anyhow::bail!("qemu-nbd did not open its socket at {} in time", self.socket_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_qemu_img_info_json() {
        let raw = r#"{"virtual-size": 10737418240, "filename": "disk.qcow2", "format": "qcow2"}"#;
        let info: QemuImgInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.format, "qcow2");
        assert_eq!(info.virtual_size, 10_737_418_240);
    }
}
