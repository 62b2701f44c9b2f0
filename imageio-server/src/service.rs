//! Wires configuration into running tasks: the three listeners plus the ticket janitor, all
//! sharing one [`ShutdownSignal`] so a single `ShutdownHandle::signal()` call drains everything.

use std::sync::Arc;

use imageio_task::{ChildTask, ShutdownSignal, spawn_task};

use crate::buffer_pool::BufferPool;
use crate::config::ConfHandle;
use crate::listener::{ControlListenerTask, LocalUnixListenerTask, RemoteListenerTask};
use crate::state::AppState;
use crate::ticket_store::{JanitorTask, TicketStore};

pub struct ImageioService {
    conf_handle: ConfHandle,
}

impl ImageioService {
    pub fn new(conf_handle: ConfHandle) -> Self {
        Self { conf_handle }
    }

    pub async fn run(self, shutdown_signal: ShutdownSignal) -> anyhow::Result<()> {
        let conf = self.conf_handle.get_conf();

        crate::tls::install_default_crypto_provider();
        let tls_config = crate::tls::build_server_config(&conf)?;

        let tickets = TicketStore::new();
        let buffer_pool = Arc::new(BufferPool::new(conf.buffer_chunk_size));

        let state = AppState {
            conf_handle: self.conf_handle.clone(),
            tickets: Arc::clone(&tickets),
            buffer_pool,
            shutdown_signal: shutdown_signal.clone(),
        };

        let tasks: Vec<ChildTask<anyhow::Result<()>>> = vec![
            spawn_task(
                RemoteListenerTask { addr: conf.remote_listener, tls_config, state: state.clone() },
                shutdown_signal.clone(),
            ),
            spawn_task(LocalUnixListenerTask { path: conf.local_socket.clone(), state: state.clone() }, shutdown_signal.clone()),
            spawn_task(
                ControlListenerTask { conf: conf.control_listener.clone(), state: state.clone() },
                shutdown_signal.clone(),
            ),
            spawn_task(JanitorTask { store: tickets }, shutdown_signal.clone()),
            spawn_task(crate::log::deleter_task(conf.data_dir.clone()), shutdown_signal.clone()),
        ];

        for task in tasks {
            match task.join().await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => error!(%error, "a task exited with an error"),
                Err(join_error) => error!(%join_error, "a task panicked"),
            }
        }

        Ok(())
    }
}
