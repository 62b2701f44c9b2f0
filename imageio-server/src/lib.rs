#[macro_use]
extern crate tracing;

pub mod api;
pub mod backend;
pub mod buffer_pool;
pub mod config;
pub mod extract;
pub mod http;
pub mod listener;
pub mod log;
pub mod middleware;
pub mod service;
pub mod state;
pub mod ticket;
pub mod ticket_store;
pub mod tls;
