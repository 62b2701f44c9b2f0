//! The in-memory ticket table: a single `parking_lot::Mutex`-guarded map plus a background
//! janitor task that expires and force-cancels tickets on a schedule.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use imageio_task::{ShutdownSignal, Task};
use parking_lot::Mutex;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::backend::{self, Backend, BackendError};
use crate::ticket::{self, Operation, TicketSpec, TicketStatus, TransferDirection};

const JANITOR_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum TicketError {
    #[error("ticket not found")]
    NotFound,
    #[error("ticket has been canceled")]
    Canceled,
    #[error("ticket has expired")]
    Expired,
    #[error("operation not permitted by this ticket")]
    VerbNotAllowed,
    #[error("range [{start}, {end}) lies outside of image of size {size}")]
    RangeNotSatisfiable { start: u64, end: u64, size: u64 },
}

struct TicketEntry {
    spec: TicketSpec,
    created_at: OffsetDateTime,
    /// `None` once the ticket is force-gone; present while it can still authorize or is draining.
    expires: Option<Instant>,
    canceling: bool,
    force_deadline: Option<Instant>,
    connections: u32,
    transferred: u64,
    last_activity: Instant,
}

impl TicketEntry {
    fn new(spec: TicketSpec) -> Self {
        let now = Instant::now();
        Self {
            expires: Some(now + Duration::from_secs(spec.timeout)),
            created_at: ticket::now(),
            canceling: false,
            force_deadline: None,
            connections: 0,
            transferred: 0,
            last_activity: now,
            spec,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        if self.canceling {
            return false;
        }
        match self.expires {
            Some(deadline) => now <= deadline || self.connections > 0,
            None => false,
        }
    }

    fn status(&self, now: Instant) -> TicketStatus {
        let expires_in = self
            .expires
            .map(|d| d.saturating_duration_since(now).as_secs() as i64)
            .unwrap_or(0);
        TicketStatus {
            uuid: self.spec.uuid.clone(),
            size: self.spec.size,
            url: self.spec.url.clone(),
            ops: self.spec.ops.clone(),
            sparse: self.spec.sparse,
            dirty: self.spec.dirty,
            transfer_id: self.spec.transfer_id.clone(),
            filename: self.spec.filename.clone(),
            expires_in,
            connections: self.connections,
            active: self.connections > 0,
            canceled: self.canceling,
            transferred: ticket::transfer_direction(&self.spec.ops).map(|_| self.transferred),
            idle_time: now.saturating_duration_since(self.last_activity).as_secs() as i64,
        }
    }
}

pub struct TicketStore {
    tickets: Mutex<HashMap<String, TicketEntry>>,
    backends: Mutex<HashMap<String, Arc<dyn Backend>>>,
    activity: Notify,
}

impl TicketStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tickets: Mutex::new(HashMap::new()),
            backends: Mutex::new(HashMap::new()),
            activity: Notify::new(),
        })
    }

    /// Returns the cached backend for this ticket's image, opening and caching one if this is
    /// the first request to touch it. A ticket's backend outlives any single request and is
    /// reused by every subsequent connection until the ticket itself goes away.
    pub async fn backend_for(
        &self,
        id: &str,
        nbd_concurrency: usize,
        tls_ca: Option<&camino::Utf8Path>,
    ) -> backend::Result<Arc<dyn Backend>> {
        if let Some(existing) = self.backends.lock().get(id) {
            return Ok(Arc::clone(existing));
        }

        let url = self.tickets.lock().get(id).map(|entry| entry.spec.url.clone());
        let url = url.ok_or(BackendError::NotSupported)?;
        let opened: Arc<dyn Backend> = Arc::from(backend::open(&url, nbd_concurrency, tls_ca).await?);

        let mut backends = self.backends.lock();
        let cached = backends.entry(id.to_owned()).or_insert(opened);
        Ok(Arc::clone(cached))
    }

    pub fn add(&self, spec: TicketSpec) {
        let mut tickets = self.tickets.lock();
        tickets.insert(spec.uuid.clone(), TicketEntry::new(spec));
    }

    pub fn get(&self, id: &str) -> Option<TicketStatus> {
        let tickets = self.tickets.lock();
        let now = Instant::now();
        tickets.get(id).map(|entry| entry.status(now))
    }

    pub fn list(&self) -> Vec<String> {
        self.tickets.lock().keys().cloned().collect()
    }

    /// `timeout = 0` forces immediate expiration of the ticket's validity window (it does not
    /// by itself disconnect any in-progress operation; quiescence does that).
    pub fn extend(&self, id: &str, timeout_secs: u64) -> Result<(), TicketError> {
        let mut tickets = self.tickets.lock();
        let entry = tickets.get_mut(id).ok_or(TicketError::NotFound)?;
        let now = Instant::now();
        if timeout_secs == 0 {
            entry.expires = Some(now);
        } else {
            let candidate = now + Duration::from_secs(timeout_secs);
            entry.expires = Some(entry.expires.map_or(candidate, |cur| cur.max(candidate)));
        }
        Ok(())
    }

    /// Marks the ticket as canceling. Returns immediately; callers that need quiescence call
    /// [`TicketStore::wait_for_quiescence`].
    pub fn begin_cancel(&self, id: &str, force_after: Option<Duration>) -> Result<(), TicketError> {
        let mut tickets = self.tickets.lock();
        let entry = tickets.get_mut(id).ok_or(TicketError::NotFound)?;
        entry.canceling = true;
        if let Some(grace) = force_after {
            if grace.is_zero() {
                entry.force_deadline = Some(Instant::now());
            } else {
                let candidate = Instant::now() + grace;
                entry.force_deadline = Some(entry.force_deadline.map_or(candidate, |cur| cur.min(candidate)));
            }
        }
        Ok(())
    }

    /// Cancels a ticket, waiting for its connection count to reach zero (or a forced deadline
    /// to pass), then removes it. Mirrors the control plane's `DELETE /tickets/{id}` contract.
    pub async fn cancel(self: &Arc<Self>, id: &str, timeout: Duration) -> Result<(), TicketError> {
        self.begin_cancel(id, Some(timeout))?;

        loop {
            let quiescent_or_forced = {
                let tickets = self.tickets.lock();
                match tickets.get(id) {
                    None => return Ok(()),
                    Some(entry) => {
                        entry.connections == 0
                            || entry.force_deadline.is_some_and(|deadline| Instant::now() >= deadline)
                    }
                }
            };

            if quiescent_or_forced {
                self.tickets.lock().remove(id);
                self.backends.lock().remove(id);
                return Ok(());
            }

            let wait = self.activity.notified();
            tokio::select! {
                () = wait => {}
                () = tokio::time::sleep(Duration::from_millis(200)) => {}
            }
        }
    }

    pub fn remove(&self, id: &str) {
        self.tickets.lock().remove(id);
        self.backends.lock().remove(id);
    }

    /// Atomic check-and-register: the single entry point every data-plane handler goes through
    /// before touching a backend.
    pub fn authorize(self: &Arc<Self>, id: &str, op: Operation, range: Option<(u64, u64)>) -> Result<Lease, TicketError> {
        let mut tickets = self.tickets.lock();
        let entry = tickets.get_mut(id).ok_or(TicketError::NotFound)?;
        let now = Instant::now();

        if !entry.is_live(now) {
            return Err(if entry.canceling { TicketError::Canceled } else { TicketError::Expired });
        }
        if !entry.spec.ops.contains(&op) {
            return Err(TicketError::VerbNotAllowed);
        }
        if let Some((start, end)) = range {
            if start > end || end > entry.spec.size {
                return Err(TicketError::RangeNotSatisfiable { start, end, size: entry.spec.size });
            }
        }

        entry.connections += 1;
        entry.last_activity = now;

        Ok(Lease {
            store: Arc::clone(self),
            id: id.to_owned(),
            direction: ticket::transfer_direction(&entry.spec.ops),
            bytes: std::sync::atomic::AtomicU64::new(0),
        })
    }

    fn release(&self, id: &str, direction: Option<TransferDirection>, bytes: u64) {
        let mut tickets = self.tickets.lock();
        if let Some(entry) = tickets.get_mut(id) {
            entry.connections = entry.connections.saturating_sub(1);
            entry.last_activity = Instant::now();
            if direction.is_some() {
                entry.transferred += bytes;
            }
        }
        drop(tickets);
        self.activity.notify_waiters();
    }

    fn is_canceled(&self, id: &str) -> bool {
        let tickets = self.tickets.lock();
        match tickets.get(id) {
            Some(entry) => entry.canceling,
            None => true,
        }
    }

    fn inactivity_limit(&self, id: &str) -> Option<Duration> {
        let tickets = self.tickets.lock();
        tickets.get(id)?.spec.inactivity_timeout.map(Duration::from_secs)
    }

    fn sweep(&self) {
        let now = Instant::now();
        let mut tickets = self.tickets.lock();
        let expired_ids: Vec<String> = tickets
            .iter()
            .filter(|(_, entry)| {
                let past_validity = entry.expires.is_some_and(|d| now > d) && entry.connections == 0;
                let past_inactivity = entry.connections == 0
                    && entry
                        .spec
                        .inactivity_timeout
                        .is_some_and(|secs| now.saturating_duration_since(entry.last_activity) >= Duration::from_secs(secs));
                let forced = entry.canceling
                    && (entry.connections == 0 || entry.force_deadline.is_some_and(|d| now >= d));
                past_validity || past_inactivity || forced
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired_ids {
            tickets.remove(id);
        }
        drop(tickets);

        if !expired_ids.is_empty() {
            let mut backends = self.backends.lock();
            for id in &expired_ids {
                backends.remove(id);
            }
        }
    }
}

/// RAII guard pinning a ticket against removal for the lifetime of one in-flight operation.
///
/// Dropping the lease (including via an early `?` return, or a panic unwind) always releases
/// the connection count, so a handler can never leak an authorization slot.
pub struct Lease {
    store: Arc<TicketStore>,
    id: String,
    direction: Option<TransferDirection>,
    bytes: std::sync::atomic::AtomicU64,
}

impl Lease {
    pub fn ticket_id(&self) -> &str {
        &self.id
    }

    /// Accumulates bytes successfully copied so far; called once per chunk rather than once at
    /// the end, so a late failure still credits the bytes that made it to the backend.
    pub fn record_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, std::sync::atomic::Ordering::Relaxed);
    }

    /// Handlers call this between chunks of a streaming copy to notice cancellation promptly.
    pub fn is_canceled(&self) -> bool {
        self.store.is_canceled(&self.id)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let bytes = self.bytes.load(std::sync::atomic::Ordering::Relaxed);
        self.store.release(&self.id, self.direction, bytes);
    }
}

/// Periodic sweep enforcing ticket-validity and inactivity timeouts, and force-completing
/// cancellations whose grace period elapsed without callers noticing via [`TicketStore::cancel`].
pub struct JanitorTask {
    pub store: Arc<TicketStore>,
}

#[async_trait]
impl Task for JanitorTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "ticket janitor";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        let mut interval = tokio::time::interval(JANITOR_TICK);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.store.sweep();
                }
                () = shutdown_signal.wait() => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn spec(id: &str, size: u64, ops: &[Operation]) -> TicketSpec {
        TicketSpec {
            uuid: id.to_owned(),
            size,
            url: "file:///tmp/x".to_owned(),
            timeout: 60,
            ops: ops.iter().copied().collect::<HashSet<_>>(),
            sparse: false,
            dirty: false,
            inactivity_timeout: None,
            transfer_id: None,
            filename: None,
        }
    }

    #[test]
    fn authorize_respects_ops_and_range() {
        let store = TicketStore::new();
        store.add(spec("a", 100, &[Operation::Read]));

        assert!(store.authorize("a", Operation::Read, Some((0, 100))).is_ok());
        assert!(matches!(
            store.authorize("a", Operation::Write, Some((0, 10))),
            Err(TicketError::VerbNotAllowed)
        ));
        assert!(matches!(
            store.authorize("a", Operation::Read, Some((0, 200))),
            Err(TicketError::RangeNotSatisfiable { .. })
        ));
    }

    #[test]
    fn unknown_ticket_is_forbidden() {
        let store = TicketStore::new();
        assert!(matches!(store.authorize("nope", Operation::Read, None), Err(TicketError::NotFound)));
    }

    #[test]
    fn extend_with_zero_timeout_expires_immediately() {
        let store = TicketStore::new();
        store.add(spec("a", 100, &[Operation::Read]));
        store.extend("a", 0).unwrap();
        assert!(matches!(
            store.authorize("a", Operation::Read, Some((0, 1))),
            Err(TicketError::Expired)
        ));
    }

    #[test]
    fn lease_drop_decrements_connections() {
        let store = TicketStore::new();
        store.add(spec("a", 100, &[Operation::Read]));
        {
            let lease = store.authorize("a", Operation::Read, Some((0, 10))).unwrap();
            assert_eq!(store.get("a").unwrap().connections, 1);
            drop(lease);
        }
        assert_eq!(store.get("a").unwrap().connections, 0);
    }

    #[tokio::test]
    async fn cancel_waits_for_quiescence() {
        let store = TicketStore::new();
        store.add(spec("a", 100, &[Operation::Read]));
        let lease = store.authorize("a", Operation::Read, Some((0, 10))).unwrap();

        let store2 = Arc::clone(&store);
        let cancel_fut = tokio::spawn(async move { store2.cancel("a", Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(lease);

        cancel_fut.await.unwrap().unwrap();
        assert!(store.get("a").is_none());
    }
}
