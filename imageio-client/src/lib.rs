#[macro_use]
extern crate tracing;

pub mod client;
pub mod control;
pub mod qemu;
pub mod transfer;

pub use transfer::{DownloadCfg, Progress, ProgressFn, UploadCfg, checksum, download, upload};
