//! # Unit Builder
//!
//! Provides a fluent API for wiring a unit: its links, its handlers and its
//! settings. Nothing runs until [`UnitBuilder::start`].

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::sync::broadcast;
use tracing::info;
use unitwire::Role;

use crate::builtins;
use crate::config::ConfigStore;
use crate::config::UnitConfig;
use crate::dispatch::Dispatcher;
use crate::dispatch::Handler;
use crate::dispatch::HandlerTable;
use crate::dispatch::Incoming;
use crate::dispatch::handler_fn;
use crate::pending::PendingTable;
use crate::registry::ConnectionRegistry;
use crate::router::Route;
use crate::router::Router;
use crate::transport::Acceptor;
use crate::transport::Channel;
use crate::unit;
use crate::unit::Shared;
use crate::unit::Unit;
use crate::unit::UnitId;
use crate::unit::UnitState;

#[derive(Debug)]
pub enum Error {
    /// Hub mode was requested without a source of inbound links.
    MissingAcceptor,
    /// A non-hub unit has nowhere to send anything.
    MissingParent,
    /// The parent role equals the unit's own role.
    ParentIsSelf(Role),
    /// The role a hub addresses its connections as equals its own role.
    PeerIsSelf(Role),
    /// The unit started but could not announce itself.
    Unit(unit::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingAcceptor => write!(f, "Hub unit requires an acceptor"),
            Self::MissingParent => write!(f, "Non-hub unit requires a parent link"),
            Self::ParentIsSelf(role) => write!(f, "Parent role cannot be the unit's own role ({})", role),
            Self::PeerIsSelf(role) => write!(f, "Peer role cannot be the hub's own role ({})", role),
            Self::Unit(e) => write!(f, "Unit error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Unit(e) => Some(e),
            _ => None,
        }
    }
}

impl From<unit::Error> for Error {
    fn from(e: unit::Error) -> Self {
        Self::Unit(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Fluent builder for a unit.
pub struct UnitBuilder {
    config: UnitConfig,
    parent: Option<Arc<dyn Channel>>,
    acceptor: Option<Box<dyn Acceptor>>,
    handlers: HandlerTable,
}

impl UnitBuilder {
    pub fn new(role: Role) -> Self {
        Self::from_config(UnitConfig { role, ..UnitConfig::default() })
    }

    pub fn from_config(config: UnitConfig) -> Self {
        Self {
            config,
            parent: None,
            acceptor: None,
            handlers: HandlerTable::new(),
        }
    }

    /// Links this unit to its supervising unit.
    pub fn parent(mut self, channel: impl Channel) -> Self {
        self.parent = Some(Arc::new(channel));
        self
    }

    /// Accepts inbound links from `acceptor`. Implies hub mode.
    pub fn acceptor(mut self, acceptor: impl Acceptor) -> Self {
        self.acceptor = Some(Box::new(acceptor));
        self.config.hub = true;
        self
    }

    pub fn hub(mut self, hub: bool) -> Self {
        self.config.hub = hub;
        self
    }

    pub fn parent_role(mut self, role: Role) -> Self {
        self.config.parent_role = role;
        self
    }

    pub fn peer_role(mut self, role: Role) -> Self {
        self.config.peer_role = role;
        self
    }

    pub fn application(mut self, name: impl Into<String>) -> Self {
        self.config.application = Some(name.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn max_in_flight(mut self, limit: usize) -> Self {
        self.config.max_in_flight = Some(limit);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Binds `action` to `handler`. Binding a built-in action replaces it.
    pub fn handler(mut self, action: impl Into<String>, handler: impl Handler) -> Self {
        self.handlers.insert(action, Arc::new(handler));
        self
    }

    /// Binds `action` to an async closure.
    pub fn handler_fn<F, Fut>(self, action: impl Into<String>, f: F) -> Self
    where
        F: Fn(Incoming) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.handler(action, handler_fn(f))
    }

    fn validate(&self) -> Result<()> {
        if self.config.hub {
            if self.acceptor.is_none() {
                return Err(Error::MissingAcceptor);
            }
            if self.config.peer_role == self.config.role {
                return Err(Error::PeerIsSelf(self.config.role));
            }
        } else if self.parent.is_none() {
            return Err(Error::MissingParent);
        }

        if self.parent.is_some() && self.config.parent_role == self.config.role {
            return Err(Error::ParentIsSelf(self.config.role));
        }
        Ok(())
    }

    /// Wires the unit, starts its pumps and, for a non-hub unit, announces
    /// construction to the parent.
    pub async fn start(self) -> Result<Unit> {
        self.validate()?;
        let Self { config, parent, acceptor, handlers: user_handlers } = self;

        let id = UnitId::generate();
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(Router::new(config.hub, config.parent_role, parent.clone(), registry.clone()));
        let pending = Arc::new(PendingTable::new());
        let store = Arc::new(ConfigStore::new());
        let assigned = Arc::new(OnceLock::new());
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let mut handlers = HandlerTable::new();
        builtins::install(
            &mut handlers,
            (config.role, config.peer_role),
            config.hub.then(|| registry.clone()),
            store.clone(),
            config.application.clone(),
            assigned.clone(),
            events.clone(),
        );
        handlers.extend(user_handlers);

        let dispatcher = Dispatcher::new(Arc::from(id.to_string()), handlers, pending.clone(), router.clone());
        let hub = config.hub;
        let role = config.role;
        let in_flight = config.max_in_flight.map(|limit| Arc::new(Semaphore::new(limit)));

        let shared = Arc::new(Shared {
            id,
            config,
            state: Mutex::new(UnitState::Initializing),
            pending,
            in_flight,
            registry,
            router,
            dispatcher,
            store,
            assigned,
            events,
            tasks: Mutex::new(Vec::new()),
        });
        let unit = Unit::from_shared(shared);

        if let Some(parent) = parent {
            unit.spawn_pump(parent, Route::Parent);
        }
        if let Some(acceptor) = acceptor.filter(|_| hub) {
            unit.spawn_accept_loop(acceptor);
        }

        unit.set_state(UnitState::Ready);
        info!(unit = %unit.id(), role = %role, hub, "unit ready");

        if !hub {
            unit.announce_constructed().await?;
        }
        Ok(unit)
    }
}

impl Unit {
    pub fn builder(role: Role) -> UnitBuilder {
        UnitBuilder::new(role)
    }
}
