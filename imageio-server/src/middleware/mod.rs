mod log;

pub use log::log_middleware;
