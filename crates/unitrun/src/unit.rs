//! # Unit
//!
//! The top-level object of one execution context. A unit owns its pending table,
//! its connection registry (hub only), its handler table and its config store,
//! and drives one pump task per inbound channel.
//!
//! Units are built with [`crate::builder::UnitBuilder`]. There is one unit per
//! execution context, passed around explicitly; cloning a `Unit` clones a handle.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::PoisonError;

use serde_json::Value;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use unitwire::Envelope;
use unitwire::Role;
use unitwire::Transferable;
use unitwire::actions;

use crate::builtins;
use crate::config::ConfigStore;
use crate::config::UnitConfig;
use crate::dispatch::Dispatcher;
use crate::pending;
use crate::pending::PendingReply;
use crate::pending::PendingTable;
use crate::registry::ConnectionId;
use crate::registry::ConnectionRegistry;
use crate::router;
use crate::router::Addressing;
use crate::router::Route;
use crate::router::Router;
use crate::transport;
use crate::transport::Acceptor;
use crate::transport::Channel;

/// Strong type for unit identifiers.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct UnitId(pub String);

impl UnitId {
    pub fn generate() -> Self {
        Self(unitwire::EnvelopeId::generate().to_string())
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit-{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnitState {
    Initializing,
    Ready,
    Stopped,
}

/// Lifecycle notifications published by a unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnitEvent {
    /// A hub accepted a new connection.
    Connected(ConnectionId),
    /// An application name was bound to a connection.
    ApplicationRegistered { connection: ConnectionId, application: String },
    /// A connection acknowledged the handshake.
    ConnectionReady { connection: ConnectionId, application: Option<String> },
    /// A connection's channel ended and it left the registry.
    ConnectionClosed(ConnectionId),
    /// The parent link ended.
    ParentClosed,
}

#[derive(Debug)]
pub enum Error {
    /// The envelope could not be built or encoded.
    Envelope(unitwire::Error),
    /// No channel matches the destination.
    Routing(router::Error),
    Transport(transport::Error),
    /// The peer answered with a rejection.
    Rejected(String),
    Timeout,
    ChannelClosed,
    /// The configured in-flight limit was reached.
    TooManyInFlight(usize),
    /// The unit was shut down.
    Stopped,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Envelope(e) => write!(f, "Envelope error: {}", e),
            Self::Routing(e) => write!(f, "Routing error: {}", e),
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Rejected(reason) => write!(f, "Rejected: {}", reason),
            Self::Timeout => write!(f, "Request timed out"),
            Self::ChannelClosed => write!(f, "Channel closed before reply"),
            Self::TooManyInFlight(limit) => write!(f, "Too many requests in flight (limit {})", limit),
            Self::Stopped => write!(f, "Unit stopped"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Envelope(e) => Some(e),
            Self::Routing(e) => Some(e),
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<unitwire::Error> for Error {
    fn from(e: unitwire::Error) -> Self {
        Self::Envelope(e)
    }
}

impl From<router::Error> for Error {
    fn from(e: router::Error) -> Self {
        Self::Routing(e)
    }
}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<pending::Error> for Error {
    fn from(e: pending::Error) -> Self {
        match e {
            pending::Error::Rejected(reason) => Self::Rejected(reason),
            pending::Error::Timeout => Self::Timeout,
            pending::Error::ChannelClosed => Self::ChannelClosed,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// An outbound call: action, payload, optional hub addressing and transfer parts.
#[derive(Debug)]
pub struct Call {
    action: String,
    data: Value,
    addressing: Addressing,
    transfer: Vec<Transferable>,
}

impl Call {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            data: Value::Null,
            addressing: Addressing::default(),
            transfer: Vec::new(),
        }
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Addresses a specific hub connection.
    pub fn connection(mut self, id: ConnectionId) -> Self {
        self.addressing.connection = Some(id);
        self
    }

    /// Addresses the connection bound to an application.
    pub fn application(mut self, name: impl Into<String>) -> Self {
        self.addressing.application = Some(name.into());
        self
    }

    /// Parts whose ownership moves to the receiver.
    pub fn transfer(mut self, parts: Vec<Transferable>) -> Self {
        self.transfer = parts;
        self
    }
}

pub(crate) struct Shared {
    pub(crate) id: UnitId,
    pub(crate) config: UnitConfig,
    pub(crate) state: Mutex<UnitState>,
    pub(crate) pending: Arc<PendingTable>,
    /// One permit per request allowed in flight, when limited.
    pub(crate) in_flight: Option<Arc<Semaphore>>,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) router: Arc<Router>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) store: Arc<ConfigStore>,
    pub(crate) assigned: Arc<OnceLock<ConnectionId>>,
    pub(crate) events: broadcast::Sender<UnitEvent>,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to the unit of this execution context.
#[derive(Clone)]
pub struct Unit {
    shared: Arc<Shared>,
}

impl Unit {
    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> &UnitId {
        &self.shared.id
    }

    pub fn role(&self) -> Role {
        self.shared.config.role
    }

    pub fn is_hub(&self) -> bool {
        self.shared.config.hub
    }

    pub fn settings(&self) -> &UnitConfig {
        &self.shared.config
    }

    pub fn state(&self) -> UnitState {
        *self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runtime settings merged through `registerConfig`.
    pub fn config(&self) -> &ConfigStore {
        &self.shared.store
    }

    /// Inbound connections (empty outside hub mode).
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.shared.registry
    }

    /// Number of requests still awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    /// The connection id a hub assigned to this unit during the handshake.
    pub fn assigned_connection(&self) -> Option<ConnectionId> {
        self.shared.assigned.get().copied()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UnitEvent> {
        self.shared.events.subscribe()
    }

    /// Sends a call without waiting for a reply.
    ///
    /// Returns the envelope that was sent; its transfer parts now belong to the receiver.
    pub async fn send(&self, destination: Role, call: Call) -> Result<Envelope> {
        self.ensure_running()?;
        let (_, channel) = self.shared.router.resolve(destination, &call.addressing)?;
        let mut envelope = self.build(destination, call)?;
        let packet = unitwire::seal(&mut envelope)?;
        channel.send(packet).await?;
        debug!(unit = %self.shared.id, id = %envelope.id(), "sent");
        Ok(envelope)
    }

    /// Sends a call and parks it in the pending table. Await the returned
    /// [`PendingReply`] for the answer.
    pub async fn issue(&self, destination: Role, call: Call) -> Result<PendingReply> {
        self.ensure_running()?;
        let slot = match &self.shared.in_flight {
            Some(slots) => {
                let limit = self.shared.config.max_in_flight.unwrap_or_default();
                Some(slots.clone().try_acquire_owned().map_err(|_| Error::TooManyInFlight(limit))?)
            }
            None => None,
        };

        let (route, channel) = self.shared.router.resolve(destination, &call.addressing)?;
        let mut envelope = self.build(destination, call)?;
        let packet = unitwire::seal(&mut envelope)?;
        let id = envelope.id().clone();
        let deadline = Instant::now() + self.shared.config.request_timeout;

        // Register before sending so a fast reply always finds its entry
        let pending = &self.shared.pending;
        let rx = match slot {
            Some(slot) => pending.register_limited(id.clone(), route, slot),
            None => pending.register(id.clone(), route),
        };
        if let Err(e) = channel.send(packet).await {
            pending.remove(&id);
            return Err(e.into());
        }

        let table = pending.clone();
        let expiring = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            table.expire(&expiring);
        });

        debug!(unit = %self.shared.id, id = %id, "request issued");
        Ok(PendingReply::new(id, rx, pending.clone(), deadline))
    }

    /// Sends a call and waits for the reply payload.
    pub async fn request(&self, destination: Role, call: Call) -> Result<Value> {
        let pending = self.issue(destination, call).await?;
        Ok(pending.wait().await?.into_data())
    }

    /// Binds `name` to the first unbound connection and tells the other
    /// applications. Prefer the handshake or the `registerApplication` action,
    /// which bind an explicit connection.
    pub async fn register_application(&self, name: &str) -> Option<ConnectionId> {
        let id = self.shared.registry.register_application(name)?;
        info!(unit = %self.shared.id, connection = %id, application = name, "application registered (first unbound)");
        let config = &self.shared.config;
        self.shared.registry.broadcast_to_peers(name, config.role, config.peer_role).await;
        let _ = self.shared.events.send(UnitEvent::ApplicationRegistered {
            connection: id,
            application: name.to_string(),
        });
        Some(id)
    }

    /// Stops every pump and fails all outstanding requests.
    ///
    /// Pump tasks hold the unit's shared state, so a unit that is dropped without
    /// `shutdown` lives until its channels close.
    pub fn shutdown(&self) {
        *self.shared.state.lock().unwrap_or_else(PoisonError::into_inner) = UnitState::Stopped;
        let tasks = std::mem::take(&mut *self.shared.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
        let failed = self.shared.pending.fail_all(pending::Error::ChannelClosed);
        info!(unit = %self.shared.id, failed, "unit stopped");
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state() {
            UnitState::Stopped => Err(Error::Stopped),
            _ => Ok(()),
        }
    }

    fn build(&self, destination: Role, call: Call) -> Result<Envelope> {
        let envelope = Envelope::call(self.role(), destination, call.action, call.data)?;
        Ok(envelope.with_transfer(call.transfer))
    }

    pub(crate) fn set_state(&self, state: UnitState) {
        *self.shared.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub(crate) fn track(&self, task: JoinHandle<()>) {
        self.shared.tasks.lock().unwrap_or_else(PoisonError::into_inner).push(task);
    }

    /// Starts draining `channel`, dispatching everything it yields.
    pub(crate) fn spawn_pump(&self, channel: Arc<dyn Channel>, route: Route) {
        let unit = self.clone();
        let task = tokio::spawn(async move { unit.pump(channel, route).await });
        self.track(task);
    }

    async fn pump(self, channel: Arc<dyn Channel>, route: Route) {
        let (lane, worker) = self.shared.dispatcher.lane(route.clone());
        self.track(worker);
        loop {
            match channel.recv().await {
                Ok(Some(packet)) => lane.dispatch(packet),
                Ok(None) => {
                    debug!(unit = %self.shared.id, route = %route, "channel closed");
                    break;
                }
                Err(e) => {
                    warn!(unit = %self.shared.id, route = %route, error = %e, "channel failed");
                    break;
                }
            }
        }
        // The worker drains what is queued, then stops
        drop(lane);
        self.on_closed(route);
    }

    fn on_closed(&self, route: Route) {
        let failed = self.shared.pending.fail_route(&route, pending::Error::ChannelClosed);
        match route {
            Route::Parent => {
                info!(unit = %self.shared.id, failed, "parent link closed");
                let _ = self.shared.events.send(UnitEvent::ParentClosed);
            }
            Route::Connection(id) => {
                let info = self.shared.registry.remove(id);
                info!(
                    unit = %self.shared.id,
                    connection = %id,
                    application = ?info.and_then(|i| i.application),
                    failed,
                    "connection closed"
                );
                let _ = self.shared.events.send(UnitEvent::ConnectionClosed(id));
            }
        }
    }

    /// Accepts connections until the acceptor runs dry.
    pub(crate) fn spawn_accept_loop(&self, acceptor: Box<dyn Acceptor>) {
        let unit = self.clone();
        let task = tokio::spawn(async move { unit.accept_loop(acceptor).await });
        self.track(task);
    }

    async fn accept_loop(self, acceptor: Box<dyn Acceptor>) {
        loop {
            match acceptor.accept().await {
                Ok(Some(channel)) => self.on_accepted(Arc::from(channel)),
                Ok(None) => {
                    debug!(unit = %self.shared.id, "acceptor exhausted");
                    break;
                }
                Err(e) => {
                    error!(unit = %self.shared.id, error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn on_accepted(&self, channel: Arc<dyn Channel>) {
        let id = self.shared.registry.accept(channel.clone());
        info!(unit = %self.shared.id, connection = %id, "connection accepted");

        self.spawn_pump(channel, Route::Connection(id));
        let _ = self.shared.events.send(UnitEvent::Connected(id));

        let unit = self.clone();
        let task = tokio::spawn(async move { unit.handshake(id).await });
        self.track(task);
    }

    /// Waits for the new connection to acknowledge before treating it as ready.
    async fn handshake(self, id: ConnectionId) {
        let call = Call::new(actions::HANDSHAKE)
            .data(json!({ "connectionId": id.to_string() }))
            .connection(id);

        let ack = match self.request(self.shared.config.peer_role, call).await {
            Ok(ack) => ack,
            Err(e) => {
                warn!(unit = %self.shared.id, connection = %id, error = %e, "handshake failed");
                return;
            }
        };

        let application = ack.get("application").and_then(Value::as_str).map(str::to_string);
        if let Some(name) = &application {
            let bound = builtins::bind_and_announce(
                &self.shared.registry,
                &self.shared.events,
                (self.shared.config.role, self.shared.config.peer_role),
                id,
                name,
            )
            .await;
            if let Err(e) = bound {
                warn!(unit = %self.shared.id, connection = %id, error = %e, "handshake binding refused");
            }
        }

        if self.shared.router.has_parent() {
            let announce = Call::new(actions::CONNECTION_READY).data(json!({ "connectionId": id.to_string() }));
            if let Err(e) = self.send(self.shared.config.parent_role, announce).await {
                warn!(unit = %self.shared.id, connection = %id, error = %e, "readiness announcement failed");
            }
        }

        info!(unit = %self.shared.id, connection = %id, application = ?application, "connection ready");
        let _ = self.shared.events.send(UnitEvent::ConnectionReady { connection: id, application });
    }

    /// Tells the parent this unit finished construction.
    pub(crate) async fn announce_constructed(&self) -> Result<()> {
        let call = Call::new(actions::CONSTRUCTED).data(json!({
            "unitId": self.shared.id.0,
            "role": self.role(),
        }));
        self.send(self.shared.config.parent_role, call).await?;
        Ok(())
    }
}
