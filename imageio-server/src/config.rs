//! Typed configuration: a small JSON file on disk (`imageio.json`), deserialized into a
//! [`ConfFile`], validated into an immutable [`Conf`] snapshot, and held behind a [`ConfHandle`]
//! so a reload does not require restarting already-spawned tasks.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Marker type carrying the rolling-log parameters `imageio-log` needs at the type level.
pub struct LogSpec;

impl imageio_log::StaticLogConfig for LogSpec {
    const MAX_BYTES_PER_LOG_FILE: u64 = 10 * 1024 * 1024;
    const MAX_LOG_FILES: usize = 10;
    const LOG_FILE_PREFIX: &'static str = "imageio";
}

fn default_remote_listener() -> SocketAddr {
    "0.0.0.0:54322".parse().expect("valid default address")
}

fn default_local_socket() -> Utf8PathBuf {
    Utf8PathBuf::from("/run/imageio/local.sock")
}

fn default_control_listener() -> ControlListenerConf {
    ControlListenerConf::Unix { path: Utf8PathBuf::from("/run/imageio/control.sock") }
}

fn default_tls_certificate() -> Utf8PathBuf {
    Utf8PathBuf::from("server.crt")
}

fn default_tls_private_key() -> Utf8PathBuf {
    Utf8PathBuf::from("server.key")
}

const fn default_nbd_concurrency() -> usize {
    4
}

const fn default_buffer_chunk_size() -> usize {
    crate::buffer_pool::DEFAULT_CHUNK_SIZE
}

fn default_log_filter() -> String {
    "info".to_owned()
}

/// Where the control plane (ticket CRUD) is exposed. Unlike the data-plane listeners this one
/// is not necessarily local-only, but defaults to a unix socket so only co-resident callers
/// (the orchestrator that issues tickets) can reach it without an extra auth layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ControlListenerConf {
    Unix { path: Utf8PathBuf },
    Tcp { addr: SocketAddr },
}

/// On-disk configuration shape. Every field is either required or has a sensible default so a
/// freshly generated file is immediately usable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfFile {
    #[serde(default)]
    pub data_dir: Option<Utf8PathBuf>,
    #[serde(default = "default_remote_listener")]
    pub remote_listener: SocketAddr,
    #[serde(default = "default_local_socket")]
    pub local_socket: Utf8PathBuf,
    #[serde(default = "default_control_listener")]
    pub control_listener: ControlListenerConf,
    #[serde(default = "default_tls_certificate")]
    pub tls_certificate: Utf8PathBuf,
    #[serde(default = "default_tls_private_key")]
    pub tls_private_key: Utf8PathBuf,
    #[serde(default)]
    pub tls_ca: Option<Utf8PathBuf>,
    #[serde(default = "default_nbd_concurrency")]
    pub nbd_concurrency: usize,
    #[serde(default = "default_buffer_chunk_size")]
    pub buffer_chunk_size: usize,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for ConfFile {
    fn default() -> Self {
        Self {
            data_dir: None,
            remote_listener: default_remote_listener(),
            local_socket: default_local_socket(),
            control_listener: default_control_listener(),
            tls_certificate: default_tls_certificate(),
            tls_private_key: default_tls_private_key(),
            tls_ca: None,
            nbd_concurrency: default_nbd_concurrency(),
            buffer_chunk_size: default_buffer_chunk_size(),
            log_filter: default_log_filter(),
        }
    }
}

/// Validated, path-resolved configuration. Relative paths in the source [`ConfFile`] are
/// resolved against the directory the config file itself lives in, so the service can be
/// pointed at a config anywhere without every path needing to be absolute.
#[derive(Debug, Clone)]
pub struct Conf {
    pub data_dir: Utf8PathBuf,
    pub remote_listener: SocketAddr,
    pub local_socket: Utf8PathBuf,
    pub control_listener: ControlListenerConf,
    pub tls_certificate: Utf8PathBuf,
    pub tls_private_key: Utf8PathBuf,
    pub tls_ca: Option<Utf8PathBuf>,
    pub nbd_concurrency: usize,
    pub buffer_chunk_size: usize,
    pub log_filter: String,
}

impl Conf {
    fn from_file(conf_file: ConfFile, config_path: &Utf8Path) -> anyhow::Result<Self> {
        let base = config_path.parent().context("config path has no parent directory")?;
        let data_dir = normalize_path(conf_file.data_dir.as_deref().unwrap_or(base), base);

        Ok(Self {
            control_listener: match conf_file.control_listener {
                ControlListenerConf::Unix { path } => ControlListenerConf::Unix { path: normalize_path(&path, base) },
                tcp @ ControlListenerConf::Tcp { .. } => tcp,
            },
            local_socket: normalize_path(&conf_file.local_socket, base),
            tls_certificate: normalize_path(&conf_file.tls_certificate, &data_dir),
            tls_private_key: normalize_path(&conf_file.tls_private_key, &data_dir),
            tls_ca: conf_file.tls_ca.map(|p| normalize_path(&p, &data_dir)),
            data_dir,
            remote_listener: conf_file.remote_listener,
            nbd_concurrency: conf_file.nbd_concurrency.max(1),
            buffer_chunk_size: conf_file.buffer_chunk_size.max(4096),
            log_filter: conf_file.log_filter,
        })
    }
}

fn normalize_path(path: &Utf8Path, base: &Utf8Path) -> Utf8PathBuf {
    if path.is_absolute() { path.to_owned() } else { base.join(path) }
}

struct ConfHandleInner {
    conf: RwLock<Arc<Conf>>,
    config_path: Utf8PathBuf,
}

/// Cheaply cloneable handle onto the current configuration snapshot. Readers call
/// [`ConfHandle::get_conf`] and hold the returned `Arc` for as long as they need a consistent
/// view; a reload only affects subsequent calls.
#[derive(Clone)]
pub struct ConfHandle(Arc<ConfHandleInner>);

impl ConfHandle {
    pub fn get_conf(&self) -> Arc<Conf> {
        self.0.conf.read().clone()
    }

    pub fn config_path(&self) -> &Utf8Path {
        &self.0.config_path
    }

    /// Re-reads the config file from disk and swaps it in if it parses and validates. Leaves
    /// the previous snapshot in place on error so a typo in a reload never takes the service
    /// down.
    pub fn try_reload(&self) -> anyhow::Result<()> {
        let conf = read_and_validate(&self.0.config_path)?;
        *self.0.conf.write() = Arc::new(conf);
        Ok(())
    }
}

fn read_conf_file(config_path: &Utf8Path) -> anyhow::Result<ConfFile> {
    let content = std::fs::read_to_string(config_path)
        .with_context(|| format!("couldn't read config file at {config_path}"))?;
    serde_json::from_str(&content).with_context(|| format!("couldn't parse config file at {config_path}"))
}

fn read_and_validate(config_path: &Utf8Path) -> anyhow::Result<Conf> {
    let conf_file = read_conf_file(config_path)?;
    Conf::from_file(conf_file, config_path)
}

/// Loads the config at `config_path`, writing out a commented-free default file first if none
/// exists yet. Suitable for a first-run `--config-init-only` invocation as well as normal
/// startup.
pub fn load_conf_file_or_generate_new(config_path: &Utf8Path) -> anyhow::Result<ConfHandle> {
    if !config_path.exists() {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("couldn't create {parent}"))?;
        }
        let default = ConfFile::default();
        let json = serde_json::to_string_pretty(&default).context("couldn't serialize default config")?;
        std::fs::write(config_path, json).with_context(|| format!("couldn't write default config to {config_path}"))?;
    }

    let conf = read_and_validate(config_path)?;
    Ok(ConfHandle(Arc::new(ConfHandleInner {
        conf: RwLock::new(Arc::new(conf)),
        config_path: config_path.to_owned(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_resolve_against_config_directory() {
        let conf_file = ConfFile {
            data_dir: None,
            tls_certificate: Utf8PathBuf::from("server.crt"),
            ..ConfFile::default()
        };
        let conf = Conf::from_file(conf_file, Utf8Path::new("/etc/imageio/imageio.json")).unwrap();
        assert_eq!(conf.data_dir, Utf8PathBuf::from("/etc/imageio"));
        assert_eq!(conf.tls_certificate, Utf8PathBuf::from("/etc/imageio/server.crt"));
    }

    #[test]
    fn absolute_paths_are_kept_as_is() {
        let conf_file = ConfFile {
            tls_certificate: Utf8PathBuf::from("/var/lib/imageio/server.crt"),
            ..ConfFile::default()
        };
        let conf = Conf::from_file(conf_file, Utf8Path::new("/etc/imageio/imageio.json")).unwrap();
        assert_eq!(conf.tls_certificate, Utf8PathBuf::from("/var/lib/imageio/server.crt"));
    }
}
