//! # unitwire
//!
//! The message envelope exchanged between isolated units, and its wire shape.
//!
//! ## Architecture
//!
//! - [`Envelope`]: an immutable call or reply, built through checked constructors.
//! - [`frame`]: the JSON wire shape, plus the [`Packet`] that pairs an encoded
//!   frame with the parts whose ownership moves to the receiver.
//! - [`Error`]: construction and protocol failures.

pub mod envelope;
pub mod error;
pub mod frame;

pub use envelope::actions;
pub use envelope::Envelope;
pub use envelope::EnvelopeId;
pub use envelope::Kind;
pub use envelope::Role;
pub use envelope::Transferable;
pub use error::Error;
pub use error::Result;
pub use frame::decode;
pub use frame::encode;
pub use frame::open;
pub use frame::salvage;
pub use frame::seal;
pub use frame::Packet;
pub use frame::Salvage;
pub use frame::WireEnvelope;
