//! Thin wrapper around `imageio-log`, binding it to this service's [`LogSpec`].

use camino::Utf8Path;
use imageio_log::LoggerGuard;

use crate::config::LogSpec;

pub fn init(path: &Utf8Path, log_filter: &str, debug_directives: Option<&str>) -> anyhow::Result<LoggerGuard> {
    imageio_log::init::<LogSpec>(path, log_filter, debug_directives)
}

pub fn deleter_task(path: camino::Utf8PathBuf) -> imageio_log::LogDeleterTask<LogSpec> {
    imageio_log::LogDeleterTask::<LogSpec>::new(path)
}
