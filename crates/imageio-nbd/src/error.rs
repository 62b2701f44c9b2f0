use thiserror::Error;

#[derive(Debug, Error)]
pub enum NbdError {
    #[error("I/O error talking to NBD server")]
    Io(#[from] std::io::Error),
    #[error("server does not speak fixed newstyle NBD handshake")]
    UnsupportedHandshake,
    #[error("server rejected option {opt} (code {code:#x})")]
    OptionRejected { opt: u32, code: u32 },
    #[error("export {export:?} not found on server")]
    NoSuchExport { export: String },
    #[error("server does not support structured replies")]
    StructuredRepliesUnsupported,
    #[error("meta-context {0:?} not available on the negotiated export")]
    MetaContextUnavailable(String),
    #[error("server returned an error for command, code {0}")]
    CommandError(u32),
    #[error("malformed reply from server: {0}")]
    Protocol(&'static str),
    #[error("requested range lies outside of export of size {size}")]
    OutOfRange { size: u64 },
}

pub type Result<T> = core::result::Result<T, NbdError>;
