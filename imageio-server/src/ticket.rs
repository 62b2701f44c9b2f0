//! The ticket data model: the JSON shape installed by the control plane and the derived
//! runtime state tracked per ticket while it is live.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// One permitted verb on a ticket's image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Write,
}

/// The document a control-plane `PUT /tickets/{id}` installs.
///
/// Extra fields are rejected (`deny_unknown_fields`) since a ticket is a small, fully-typed
/// authorization capsule, not an open-ended bag of attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TicketSpec {
    pub uuid: String,
    pub size: u64,
    pub url: String,
    pub timeout: u64,
    pub ops: HashSet<Operation>,
    #[serde(default)]
    pub sparse: bool,
    #[serde(default)]
    pub dirty: bool,
    #[serde(default)]
    pub inactivity_timeout: Option<u64>,
    #[serde(default)]
    pub transfer_id: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

/// Snapshot returned by `GET /tickets/{id}`; mirrors [`TicketSpec`] plus the derived fields
/// a caller needs to monitor a transfer.
#[derive(Debug, Clone, Serialize)]
pub struct TicketStatus {
    pub uuid: String,
    pub size: u64,
    pub url: String,
    pub ops: HashSet<Operation>,
    pub sparse: bool,
    pub dirty: bool,
    pub transfer_id: Option<String>,
    pub filename: Option<String>,
    pub expires_in: i64,
    pub connections: u32,
    pub active: bool,
    pub canceled: bool,
    pub transferred: Option<u64>,
    pub idle_time: i64,
}

/// Which single direction `transferred` is tracking for a ticket, per the invariant that
/// byte-accounting is only meaningful when a ticket does not mix read and write traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferDirection {
    Read,
    Write,
}

pub(crate) fn transfer_direction(ops: &HashSet<Operation>) -> Option<TransferDirection> {
    match (ops.contains(&Operation::Read), ops.contains(&Operation::Write)) {
        (true, false) => Some(TransferDirection::Read),
        (false, true) => Some(TransferDirection::Write),
        _ => None,
    }
}

pub(crate) fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}
