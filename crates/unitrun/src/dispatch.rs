//! # Action Dispatcher
//!
//! Turns inbound packets into handler invocations and handler outcomes into
//! replies.
//!
//! ## Architecture
//!
//! - **Handler table**: an explicit map from action tag to [`Handler`], fixed when
//!   the unit is built.
//! - **Lanes**: every inbound channel gets one [`Lane`]. Calls from a lane run one
//!   after another in arrival order, on a worker task separate from the pump.
//! - **Replies** are settled by the pump itself and never wait behind a handler, so a
//!   handler may issue requests over the channel it was called on.
//! - **Containment**: each handler runs on its own task. An error, a panic or a
//!   missing handler becomes a rejection reply; the lane keeps going.
//! - **Protocol violations** are logged at `error` and answered with a rejection
//!   when the frame still yields an id to answer.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::warn;
use unitwire::Envelope;
use unitwire::Packet;

use crate::pending::PendingTable;
use crate::router::Route;
use crate::router::Router;

/// An inbound call, as seen by a handler.
pub struct Incoming {
    envelope: Envelope,
    origin: Route,
}

impl Incoming {
    pub fn new(envelope: Envelope, origin: Route) -> Self {
        Self { envelope, origin }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Mutable access, e.g. to take the transfer parts.
    pub fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }

    pub fn into_envelope(self) -> Envelope {
        self.envelope
    }

    /// The link the call arrived on.
    pub fn origin(&self) -> &Route {
        &self.origin
    }

    pub fn data(&self) -> &Value {
        self.envelope.data()
    }
}

/// Application code bound to one action.
///
/// The returned value becomes the reply payload; an error becomes a rejection
/// carrying the error's description.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, incoming: Incoming) -> anyhow::Result<Value>;
}

/// Adapts an async closure into a [`Handler`].
pub struct FnHandler<F>(F);

/// Wraps `f` as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Incoming) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait::async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Incoming) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn handle(&self, incoming: Incoming) -> anyhow::Result<Value> {
        (self.0)(incoming).await
    }
}

/// Capability table: action tag to handler.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `action` to `handler`, replacing any previous binding.
    pub fn insert(&mut self, action: impl Into<String>, handler: Arc<dyn Handler>) {
        let action = action.into();
        if self.handlers.insert(action.clone(), handler).is_some() {
            debug!(action = %action, "handler replaced");
        }
    }

    /// Moves every binding of `other` into this table. `other` wins on conflicts.
    pub fn extend(&mut self, other: HandlerTable) {
        for (action, handler) in other.handlers {
            self.insert(action, handler);
        }
    }

    pub fn get(&self, action: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(action).cloned()
    }

    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    pub fn actions(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    unit: Arc<str>,
    handlers: Arc<HandlerTable>,
    pending: Arc<PendingTable>,
    router: Arc<Router>,
}

impl Dispatcher {
    pub fn new(
        unit: Arc<str>,
        handlers: HandlerTable,
        pending: Arc<PendingTable>,
        router: Arc<Router>,
    ) -> Self {
        Self {
            unit,
            handlers: Arc::new(handlers),
            pending,
            router,
        }
    }

    /// Opens the lane for calls arriving over `origin`.
    ///
    /// The returned task drains the lane and ends once the [`Lane`] is dropped.
    pub fn lane(&self, origin: Route) -> (Lane, JoinHandle<()>) {
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        let dispatcher = self.clone();
        let worker_origin = origin.clone();

        let task = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    Job::Call(envelope) => dispatcher.invoke(envelope, &worker_origin).await,
                    Job::Respond(reply) => dispatcher.respond(&worker_origin, reply).await,
                }
            }
            debug!(unit = %dispatcher.unit, route = %worker_origin, "lane closed");
        });

        let lane = Lane {
            dispatcher: self.clone(),
            origin,
            jobs,
        };
        (lane, task)
    }

    async fn invoke(&self, envelope: Envelope, origin: &Route) {
        let Some(action) = envelope.action().map(str::to_string) else {
            return;
        };

        let Some(handler) = self.handlers.get(&action) else {
            warn!(unit = %self.unit, action = %action, "no handler registered");
            let reply = Envelope::reply_to(
                &envelope,
                json!(format!("no handler registered for action '{}'", action)),
                true,
            );
            self.respond(origin, reply).await;
            return;
        };

        let (source, destination, id) = (envelope.destination(), envelope.source(), envelope.id().clone());
        let incoming = Incoming::new(envelope, origin.clone());

        let outcome = tokio::spawn(async move { handler.handle(incoming).await }).await;

        let (data, rejected) = match outcome {
            Ok(Ok(value)) => (value, false),
            Ok(Err(e)) => {
                warn!(unit = %self.unit, action = %action, error = %e, "handler failed");
                (json!(format!("{:#}", e)), true)
            }
            Err(join) => {
                error!(unit = %self.unit, action = %action, error = %join, "handler panicked");
                (json!(format!("handler for action '{}' panicked", action)), true)
            }
        };

        let reply = Envelope::reply(source, destination, id, data, rejected);
        self.respond(origin, reply).await;
    }

    fn malformed(&self, frame: &[u8], err: &unitwire::Error, origin: &Route) -> Option<Envelope> {
        error!(unit = %self.unit, route = %origin, error = %err, "protocol violation in inbound frame");

        let salvage = unitwire::salvage(frame).ok()?;
        if salvage.is_reply {
            return None;
        }
        let (Some(source), Some(destination)) = (salvage.destination, salvage.source) else {
            return None;
        };
        if source == destination {
            return None;
        }
        Some(Envelope::reply(source, destination, salvage.id, json!(err.to_string()), true))
    }

    async fn respond(&self, origin: &Route, mut reply: Envelope) {
        let channel = match self.router.channel_for(origin) {
            Ok(channel) => channel,
            Err(e) => {
                warn!(unit = %self.unit, route = %origin, error = %e, "reply has nowhere to go");
                return;
            }
        };

        let packet = match unitwire::seal(&mut reply) {
            Ok(packet) => packet,
            Err(e) => {
                error!(unit = %self.unit, error = %e, "cannot encode reply");
                return;
            }
        };

        if let Err(e) = channel.send(packet).await {
            warn!(unit = %self.unit, route = %origin, error = %e, "reply not delivered");
        }
    }
}

enum Job {
    Call(Envelope),
    Respond(Envelope),
}

/// The inbound side of one channel, fed by its pump.
pub struct Lane {
    dispatcher: Dispatcher,
    origin: Route,
    jobs: mpsc::UnboundedSender<Job>,
}

impl Lane {
    /// Routes one inbound packet. Settles replies at once and queues everything else.
    pub fn dispatch(&self, packet: Packet) {
        let Packet { frame, transfer } = packet;

        let job = match unitwire::decode(&frame) {
            Ok(envelope) if envelope.is_reply() => {
                self.dispatcher.pending.settle(envelope.with_transfer(transfer));
                return;
            }
            Ok(envelope) => Job::Call(envelope.with_transfer(transfer)),
            Err(err) => match self.dispatcher.malformed(&frame, &err, &self.origin) {
                Some(rejection) => Job::Respond(rejection),
                None => return,
            },
        };

        if self.jobs.send(job).is_err() {
            warn!(unit = %self.dispatcher.unit, route = %self.origin, "lane worker gone, call dropped");
        }
    }

    pub fn origin(&self) -> &Route {
        &self.origin
    }
}
