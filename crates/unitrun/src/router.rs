//! # Router
//!
//! Picks the physical channel for a logical destination.
//!
//! A plain unit has one outbound link, its parent, and every message goes there.
//! A hub resolves in this order:
//! 1. an explicit connection id,
//! 2. an explicit application name,
//! 3. the parent link, when the destination is the parent role and a parent exists,
//! 4. the earliest accepted connection still alive.
//!
//! Step 4 silently picks a peer. Callers that need a specific peer must use 1 or 2.

use std::fmt;
use std::sync::Arc;

use unitwire::Role;

use crate::registry::ConnectionId;
use crate::registry::ConnectionRegistry;
use crate::transport::Channel;

/// The logical link a message travels on.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum Route {
    Parent,
    Connection(ConnectionId),
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Parent => write!(f, "parent"),
            Route::Connection(id) => write!(f, "{}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A plain unit was built without a parent link.
    NoParentLink,
    /// A hub has no live connection to fall back to.
    NoConnections,
    UnknownConnection(ConnectionId),
    UnknownApplication(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoParentLink => write!(f, "no parent link to route to"),
            Self::NoConnections => write!(f, "no connection to route to"),
            Self::UnknownConnection(id) => write!(f, "unknown connection {}", id),
            Self::UnknownApplication(name) => write!(f, "no connection bound to application '{}'", name),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Explicit addressing a caller may attach to an outbound call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Addressing {
    pub connection: Option<ConnectionId>,
    pub application: Option<String>,
}

impl Addressing {
    pub fn is_empty(&self) -> bool {
        self.connection.is_none() && self.application.is_none()
    }
}

pub struct Router {
    hub: bool,
    parent_role: Role,
    parent: Option<Arc<dyn Channel>>,
    registry: Arc<ConnectionRegistry>,
}

impl Router {
    pub fn new(
        hub: bool,
        parent_role: Role,
        parent: Option<Arc<dyn Channel>>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self { hub, parent_role, parent, registry }
    }

    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    /// Resolves a destination to a route and the channel behind it.
    pub fn resolve(&self, destination: Role, addressing: &Addressing) -> Result<(Route, Arc<dyn Channel>)> {
        if !self.hub {
            return self.parent().map(|ch| (Route::Parent, ch));
        }

        if let Some(id) = addressing.connection {
            let channel = self.registry.channel(id).ok_or(Error::UnknownConnection(id))?;
            return Ok((Route::Connection(id), channel));
        }

        if let Some(name) = &addressing.application {
            let id = self
                .registry
                .lookup(name)
                .ok_or_else(|| Error::UnknownApplication(name.clone()))?;
            let channel = self.registry.channel(id).ok_or(Error::UnknownConnection(id))?;
            return Ok((Route::Connection(id), channel));
        }

        if destination == self.parent_role {
            if let Some(parent) = &self.parent {
                return Ok((Route::Parent, parent.clone()));
            }
        }

        self.registry
            .first()
            .map(|(id, ch)| (Route::Connection(id), ch))
            .ok_or(Error::NoConnections)
    }

    /// The channel behind an already-known route, used to answer inbound calls.
    pub fn channel_for(&self, route: &Route) -> Result<Arc<dyn Channel>> {
        match route {
            Route::Parent => self.parent(),
            Route::Connection(id) => self.registry.channel(*id).ok_or(Error::UnknownConnection(*id)),
        }
    }

    fn parent(&self) -> Result<Arc<dyn Channel>> {
        self.parent.clone().ok_or(Error::NoParentLink)
    }
}
