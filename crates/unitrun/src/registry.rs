//! # Connection Registry
//!
//! Tracks the inbound connections of a hub unit, in the order they were accepted,
//! and which application each one belongs to once known.
//!
//! Two binding policies are offered:
//! - [`ConnectionRegistry::bind_application`] binds a name to an explicit connection.
//!   The handshake and the `registerApplication` action use this.
//! - [`ConnectionRegistry::register_application`] binds to the first connection that
//!   is still unbound. This relies on registrations arriving in accept order and
//!   binds the wrong connection when they do not.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde_json::json;
use tracing::debug;
use tracing::warn;
use unitwire::actions;
use unitwire::Envelope;
use unitwire::Role;

use crate::transport::Channel;

/// Strong type for connection identifiers.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

impl FromStr for ConnectionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.strip_prefix("conn-")
            .and_then(|n| n.parse().ok())
            .map(ConnectionId)
            .ok_or_else(|| Error::MalformedId(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    ConnectionNotFound(ConnectionId),
    AlreadyBound { connection: ConnectionId, application: String },
    MalformedId(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionNotFound(id) => write!(f, "Connection not found: {}", id),
            Self::AlreadyBound { connection, application } => {
                write!(f, "Connection {} is already bound to '{}'", connection, application)
            }
            Self::MalformedId(s) => write!(f, "Malformed connection id: '{}'", s),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

struct Connection {
    id: ConnectionId,
    application: Option<String>,
    channel: Arc<dyn Channel>,
}

/// Snapshot of one registered connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub application: Option<String>,
}

/// Accept-ordered set of inbound connections.
///
/// The lock is never held across an `.await`.
pub struct ConnectionRegistry {
    connections: Mutex<Vec<Connection>>,
    next_id: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Connection>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a freshly accepted channel with no application bound.
    pub fn accept(&self, channel: Arc<dyn Channel>) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push(Connection { id, application: None, channel });
        id
    }

    /// Binds `name` to the first unbound connection, in accept order.
    pub fn register_application(&self, name: &str) -> Option<ConnectionId> {
        let mut connections = self.lock();
        let conn = connections.iter_mut().find(|c| c.application.is_none())?;
        conn.application = Some(name.to_string());
        Some(conn.id)
    }

    /// Binds `name` to connection `id`. Rebinding the same name is a no-op.
    pub fn bind_application(&self, id: ConnectionId, name: &str) -> Result<()> {
        let mut connections = self.lock();
        let conn = connections
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(Error::ConnectionNotFound(id))?;

        if let Some(existing) = &conn.application {
            if existing != name {
                return Err(Error::AlreadyBound {
                    connection: id,
                    application: existing.clone(),
                });
            }
        }

        conn.application = Some(name.to_string());
        Ok(())
    }

    /// The first connection (in accept order) bound to `name`.
    pub fn lookup(&self, name: &str) -> Option<ConnectionId> {
        self.lock()
            .iter()
            .find(|c| c.application.as_deref() == Some(name))
            .map(|c| c.id)
    }

    pub fn application(&self, id: ConnectionId) -> Option<String> {
        self.lock().iter().find(|c| c.id == id).and_then(|c| c.application.clone())
    }

    pub fn channel(&self, id: ConnectionId) -> Option<Arc<dyn Channel>> {
        self.lock().iter().find(|c| c.id == id).map(|c| c.channel.clone())
    }

    /// The earliest accepted connection still alive.
    pub fn first(&self) -> Option<(ConnectionId, Arc<dyn Channel>)> {
        self.lock().first().map(|c| (c.id, c.channel.clone()))
    }

    pub fn remove(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        let mut connections = self.lock();
        let index = connections.iter().position(|c| c.id == id)?;
        let conn = connections.remove(index);
        Some(ConnectionInfo { id: conn.id, application: conn.application })
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.lock()
            .iter()
            .map(|c| ConnectionInfo { id: c.id, application: c.application.clone() })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Tells every connection bound to an application other than `name` that
    /// `name` has joined. Unbound connections are skipped.
    ///
    /// Returns the number of connections notified. A failed send is logged and
    /// does not stop the broadcast.
    pub async fn broadcast_to_peers(&self, name: &str, source: Role, destination: Role) -> usize {
        let targets: Vec<(ConnectionId, Arc<dyn Channel>)> = self
            .lock()
            .iter()
            .filter(|c| c.application.as_deref().is_some_and(|app| app != name))
            .map(|c| (c.id, c.channel.clone()))
            .collect();

        let mut notified = 0;
        for (id, channel) in targets {
            let envelope = Envelope::call(
                source,
                destination,
                actions::PEER_CONNECTED,
                json!({ "application": name }),
            );
            let mut envelope = match envelope {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(connection = %id, error = %e, "cannot build peer notification");
                    continue;
                }
            };
            let packet = match unitwire::seal(&mut envelope) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!(connection = %id, error = %e, "cannot encode peer notification");
                    continue;
                }
            };
            match channel.send(packet).await {
                Ok(()) => {
                    debug!(connection = %id, application = name, "peer notified");
                    notified += 1;
                }
                Err(e) => warn!(connection = %id, error = %e, "peer notification failed"),
            }
        }
        notified
    }
}
