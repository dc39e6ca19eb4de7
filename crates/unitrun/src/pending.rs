//! # Pending-Request Table
//!
//! Correlates inbound replies with the callers awaiting them. Every outbound
//! request parks a oneshot sender here under its envelope id; the pump settles
//! it when a reply with a matching `reply_id` arrives.
//!
//! ## Invariants
//! - An entry is removed exactly once: by its reply, its deadline, a failed send,
//!   the closing of the channel it went out on, or its caller giving up.
//! - The deadline is fixed when the request is issued. An entry whose caller
//!   never waits still expires.
//! - An in-flight slot, when the unit is limited, lives as long as its entry.
//! - A reply with no entry (duplicate or late) is dropped without error.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::trace;
use unitwire::Envelope;
use unitwire::EnvelopeId;

use crate::router::Route;

/// Ways a pending request can end without a successful reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The peer answered with a rejection carrying this description.
    Rejected(String),
    /// No reply arrived within the configured window.
    Timeout,
    /// The channel the request went out on closed before a reply arrived.
    ChannelClosed,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected(reason) => write!(f, "Request rejected: {}", reason),
            Self::Timeout => write!(f, "Request timed out"),
            Self::ChannelClosed => write!(f, "Channel closed before reply"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

struct PendingEntry {
    route: Route,
    tx: oneshot::Sender<Result<Envelope>>,
    _slot: Option<OwnedSemaphorePermit>,
}

/// Map from outbound envelope id to its awaiting caller.
#[derive(Default)]
pub struct PendingTable {
    entries: DashMap<EnvelopeId, PendingEntry>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks a caller under `id`. `route` records which channel the request used.
    pub fn register(&self, id: EnvelopeId, route: Route) -> oneshot::Receiver<Result<Envelope>> {
        self.park(id, route, None)
    }

    /// Like [`PendingTable::register`], holding `slot` until the entry is removed.
    pub fn register_limited(
        &self,
        id: EnvelopeId,
        route: Route,
        slot: OwnedSemaphorePermit,
    ) -> oneshot::Receiver<Result<Envelope>> {
        self.park(id, route, Some(slot))
    }

    fn park(
        &self,
        id: EnvelopeId,
        route: Route,
        slot: Option<OwnedSemaphorePermit>,
    ) -> oneshot::Receiver<Result<Envelope>> {
        let (tx, rx) = oneshot::channel();
        self.entries.insert(id, PendingEntry { route, tx, _slot: slot });
        rx
    }

    /// Settles the entry matching `reply`. Returns `false` when nothing was waiting.
    pub fn settle(&self, reply: Envelope) -> bool {
        let Some(reply_id) = reply.reply_id() else {
            return false;
        };

        let Some((_, entry)) = self.entries.remove(reply_id) else {
            trace!(reply_id = %reply_id, "dropping unmatched reply");
            return false;
        };

        let outcome = if reply.is_rejection() {
            Err(Error::Rejected(describe(reply.data())))
        } else {
            Ok(reply)
        };

        // The caller may have given up already
        let _ = entry.tx.send(outcome);
        true
    }

    /// Removes an entry without settling it.
    pub fn remove(&self, id: &EnvelopeId) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Fails the entry with [`Error::Timeout`] if it is still waiting.
    pub fn expire(&self, id: &EnvelopeId) -> bool {
        let Some((_, entry)) = self.entries.remove(id) else {
            return false;
        };
        trace!(id = %id, "request expired");
        let _ = entry.tx.send(Err(Error::Timeout));
        true
    }

    /// Fails every entry that went out over `route`. Returns how many were failed.
    pub fn fail_route(&self, route: &Route, error: Error) -> usize {
        let keys: Vec<EnvelopeId> = self
            .entries
            .iter()
            .filter(|e| &e.value().route == route)
            .map(|e| e.key().clone())
            .collect();
        self.fail_keys(keys, error)
    }

    /// Fails every entry.
    pub fn fail_all(&self, error: Error) -> usize {
        let keys: Vec<EnvelopeId> = self.entries.iter().map(|e| e.key().clone()).collect();
        self.fail_keys(keys, error)
    }

    fn fail_keys(&self, keys: Vec<EnvelopeId>, error: Error) -> usize {
        let mut failed = 0;
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(&key) {
                let _ = entry.tx.send(Err(error.clone()));
                failed += 1;
            }
        }
        failed
    }

    pub fn contains(&self, id: &EnvelopeId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Renders a rejection payload as a human-readable description.
fn describe(data: &serde_json::Value) -> String {
    match data {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Removes its entry when dropped, so an abandoned request never lingers.
struct EntryGuard {
    id: EnvelopeId,
    table: Arc<PendingTable>,
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}

/// The awaiting half of an issued request.
///
/// Dropping it before the reply arrives abandons the request.
pub struct PendingReply {
    rx: oneshot::Receiver<Result<Envelope>>,
    guard: EntryGuard,
    deadline: Instant,
}

impl PendingReply {
    pub(crate) fn new(
        id: EnvelopeId,
        rx: oneshot::Receiver<Result<Envelope>>,
        table: Arc<PendingTable>,
        deadline: Instant,
    ) -> Self {
        Self { rx, guard: EntryGuard { id, table }, deadline }
    }

    /// The id of the request this reply will answer.
    pub fn id(&self) -> &EnvelopeId {
        &self.guard.id
    }

    /// When the request stops waiting for a reply.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Waits for the reply envelope. The entry is gone once this returns.
    pub async fn wait(self) -> Result<Envelope> {
        let PendingReply { rx, guard: _guard, deadline } = self;

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::ChannelClosed),
            Err(_) => Err(Error::Timeout),
        }
    }
}
