//! # Message Envelope
//!
//! The value exchanged between units. An envelope is either a *call*, which
//! carries an action tag, or a *reply*, which carries the id of the call it
//! answers. The two shapes are variants of [`Kind`], so an envelope can never
//! hold both or neither.
//!
//! ## Invariants
//! - The id is generated at construction and never changes.
//! - A call always has a non-empty action.
//! - The destination never equals the source.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::Error;
use crate::error::Result;

/// Built-in action names understood by every unit.
pub mod actions {
    /// Implicit tag of reply envelopes. Never dispatched to a handler.
    pub const REPLY: &str = "reply";
    /// Replies with the original envelope.
    pub const PING: &str = "ping";
    /// Merges the payload into the receiving unit's configuration store.
    pub const REGISTER_CONFIG: &str = "registerConfig";
    /// Hub-to-connection acknowledgement exchange.
    pub const HANDSHAKE: &str = "handshake";
    /// Binds an application name to the connection the message arrived on.
    pub const REGISTER_APPLICATION: &str = "registerApplication";
    /// Hub notification that another application joined.
    pub const PEER_CONNECTED: &str = "peerConnected";
    /// Readiness announcement of a freshly started unit.
    pub const CONSTRUCTED: &str = "constructed";
    /// Hub announcement that an accepted connection finished its handshake.
    pub const CONNECTION_READY: &str = "connectionReady";
}

/// Well-known logical roles a unit can play.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Main,
    Renderer,
    Worker,
    Shared,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Main => "main",
            Role::Renderer => "renderer",
            Role::Worker => "worker",
            Role::Shared => "shared",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "main" => Ok(Role::Main),
            "renderer" => Ok(Role::Renderer),
            "worker" => Ok(Role::Worker),
            "shared" => Ok(Role::Shared),
            other => Err(Error::ProtocolViolation(format!("unknown role '{}'", other))),
        }
    }
}

/// Opaque unique envelope identity, used as the correlation key.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(String);

impl EnvelopeId {
    /// Generates a fresh random identity.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for EnvelopeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EnvelopeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A payload part whose ownership moves to the receiver.
///
/// Not `Clone`: once handed to `send` the sender has nothing left to read.
#[derive(Debug, PartialEq, Eq)]
pub struct Transferable(Vec<u8>);

impl Transferable {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Transferable {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// Call or reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Kind {
    Call { action: String },
    Reply { reply_id: EnvelopeId, rejected: bool },
}

/// An immutable message between two units.
#[derive(Debug, PartialEq)]
pub struct Envelope {
    id: EnvelopeId,
    kind: Kind,
    source: Role,
    destination: Role,
    data: Value,
    transfer: Vec<Transferable>,
}

impl Envelope {
    /// Builds a call envelope.
    ///
    /// Fails with [`Error::MissingAction`] when `action` is empty and with
    /// [`Error::SelfAddressed`] when `source == destination`.
    pub fn call(source: Role, destination: Role, action: impl Into<String>, data: Value) -> Result<Self> {
        let action = action.into();
        if action.is_empty() {
            return Err(Error::MissingAction);
        }
        if action == actions::REPLY {
            return Err(Error::ProtocolViolation("'reply' is reserved for reply envelopes".into()));
        }
        if source == destination {
            return Err(Error::SelfAddressed(source));
        }
        Ok(Self {
            id: EnvelopeId::generate(),
            kind: Kind::Call { action },
            source,
            destination,
            data,
            transfer: Vec::new(),
        })
    }

    /// Builds a reply to `original`, addressed back to its sender.
    pub fn reply_to(original: &Envelope, data: Value, rejected: bool) -> Self {
        Self::reply(original.destination, original.source, original.id.clone(), data, rejected)
    }

    /// Builds a reply from raw addressing, for when only the id of the call is known.
    pub fn reply(source: Role, destination: Role, reply_id: EnvelopeId, data: Value, rejected: bool) -> Self {
        Self {
            id: EnvelopeId::generate(),
            kind: Kind::Reply { reply_id, rejected },
            source,
            destination,
            data,
            transfer: Vec::new(),
        }
    }

    /// Attaches parts whose ownership moves to the receiver.
    pub fn with_transfer(mut self, transfer: Vec<Transferable>) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn id(&self) -> &EnvelopeId {
        &self.id
    }

    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    /// The action tag, `None` for replies.
    pub fn action(&self) -> Option<&str> {
        match &self.kind {
            Kind::Call { action } => Some(action),
            Kind::Reply { .. } => None,
        }
    }

    pub fn reply_id(&self) -> Option<&EnvelopeId> {
        match &self.kind {
            Kind::Call { .. } => None,
            Kind::Reply { reply_id, .. } => Some(reply_id),
        }
    }

    pub fn is_reply(&self) -> bool {
        matches!(self.kind, Kind::Reply { .. })
    }

    pub fn is_rejection(&self) -> bool {
        matches!(self.kind, Kind::Reply { rejected: true, .. })
    }

    pub fn source(&self) -> Role {
        self.source
    }

    pub fn destination(&self) -> Role {
        self.destination
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn into_data(self) -> Value {
        self.data
    }

    pub fn transfer(&self) -> &[Transferable] {
        &self.transfer
    }

    /// Detaches the transfer list, leaving the envelope without one.
    pub fn take_transfer(&mut self) -> Vec<Transferable> {
        std::mem::take(&mut self.transfer)
    }

    /// The logical wire shape of this envelope (transfer parts travel out of band).
    pub fn to_wire(&self) -> crate::frame::WireEnvelope {
        let (action, reply_id, reject) = match &self.kind {
            Kind::Call { action } => (Some(action.clone()), None, None),
            Kind::Reply { reply_id, rejected } => (
                Some(actions::REPLY.to_string()),
                Some(reply_id.as_str().to_string()),
                rejected.then_some(true),
            ),
        };
        crate::frame::WireEnvelope {
            id: self.id.as_str().to_string(),
            action,
            destination: self.destination,
            source: self.source,
            data: self.data.clone(),
            reply_id,
            reject,
        }
    }

    pub(crate) fn from_parts(id: EnvelopeId, kind: Kind, source: Role, destination: Role, data: Value) -> Self {
        Self { id, kind, source, destination, data, transfer: Vec::new() }
    }
}
