//! # unitrun
//!
//! Runtime for units: isolated execution contexts that talk only by passing
//! envelopes over bidirectional channels.
//!
//! ## Architecture
//!
//! - [`unit::Unit`]: one per execution context. Sends calls, correlates replies and
//!   pumps its inbound channels.
//! - [`router`]: picks the channel for an outbound call. A plain unit always talks to
//!   its parent; a hub multiplexes many inbound connections.
//! - [`dispatch`]: runs the handler bound to an inbound action and answers it.
//! - [`registry`]: the hub's accepted connections and the applications bound to them.
//! - [`transport`]: the channel abstraction. [`memory`] implements it in process.

pub mod builder;
pub mod builtins;
pub mod config;
pub mod dispatch;
pub mod memory;
pub mod pending;
pub mod registry;
pub mod router;
pub mod transport;
pub mod unit;

pub use builder::UnitBuilder;
pub use config::ConfigStore;
pub use config::UnitConfig;
pub use dispatch::Handler;
pub use dispatch::HandlerTable;
pub use dispatch::Incoming;
pub use dispatch::handler_fn;
pub use pending::PendingReply;
pub use registry::ConnectionId;
pub use registry::ConnectionInfo;
pub use router::Route;
pub use transport::Acceptor;
pub use transport::Channel;
pub use unit::Call;
pub use unit::Error;
pub use unit::Result;
pub use unit::Unit;
pub use unit::UnitEvent;
pub use unit::UnitId;
pub use unit::UnitState;
