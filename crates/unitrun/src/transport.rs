//! # Transport Abstraction
//!
//! A minimal, async interface for moving packets between units.
//!
//! ## Philosophy
//!
//! - **Frame-Oriented**: A channel moves opaque [`Packet`]s. It knows nothing about
//!   actions, replies or routing, and never looks inside the frame.
//! - **Ownership Transfer**: `send` takes the packet by value, so transfer parts are
//!   gone from the sender once handed over.
//! - **Bidirectional**: The same channel is used for outbound calls and inbound
//!   replies; a background pump drains `recv`.

use std::fmt;

use unitwire::Packet;

/// Errors that occur at the channel layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The peer is gone or the link was dropped.
    ConnectionLost(String),
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// One end of a bidirectional link between two units.
///
/// This trait is designed to be object-safe (`Arc<dyn Channel>`).
#[async_trait::async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Hands a packet to the peer. Packets on one channel arrive in send order.
    async fn send(&self, packet: Packet) -> Result<()>;

    /// Waits for the next inbound packet.
    ///
    /// # invariants
    /// - Returns `Ok(None)` once the peer has closed the link.
    /// - Only one task calls `recv` on a given channel.
    async fn recv(&self) -> Result<Option<Packet>>;
}

/// Source of inbound links for a hub.
#[async_trait::async_trait]
pub trait Acceptor: Send + Sync + 'static {
    /// Waits for the next peer to connect. `Ok(None)` means no more peers will arrive.
    async fn accept(&self) -> Result<Option<Box<dyn Channel>>>;
}
