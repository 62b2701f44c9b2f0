use std::sync::Arc;

use imageio_task::ShutdownSignal;

use crate::buffer_pool::BufferPool;
use crate::config::ConfHandle;
use crate::ticket_store::TicketStore;

/// Everything a handler needs, threaded through axum's `State` extractor. Cheap to clone: every
/// field is already reference-counted or a handle onto shared state.
#[derive(Clone)]
pub struct AppState {
    pub conf_handle: ConfHandle,
    pub tickets: Arc<TicketStore>,
    pub buffer_pool: Arc<BufferPool>,
    pub shutdown_signal: ShutdownSignal,
}
