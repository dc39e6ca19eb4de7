//! # Wire Frames
//!
//! The serialized form of an envelope and the packet handed to a channel.
//!
//! ## Invariants
//! - **Panic Safety**: All decoding paths return `Result`, never panicking on unknown data.
//! - **Forward Compatibility**: Unknown fields are ignored.
//! - Transfer parts never enter the frame; they ride next to it in the [`Packet`].

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::envelope::actions;
use crate::envelope::Envelope;
use crate::envelope::EnvelopeId;
use crate::envelope::Kind;
use crate::envelope::Role;
use crate::envelope::Transferable;
use crate::error::Error;
use crate::error::Result;

/// Logical fields of an envelope as they appear on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEnvelope {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub destination: Role,
    pub source: Role,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject: Option<bool>,
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = Error;

    fn try_from(wire: WireEnvelope) -> Result<Self> {
        if wire.id.is_empty() {
            return Err(Error::ProtocolViolation("missing id".into()));
        }
        if wire.source == wire.destination {
            return Err(Error::SelfAddressed(wire.source));
        }

        let kind = match (wire.reply_id, wire.action) {
            (Some(reply_id), action) => {
                if let Some(action) = action.filter(|a| a != actions::REPLY) {
                    return Err(Error::ProtocolViolation(format!("reply carries action '{}'", action)));
                }
                Kind::Reply {
                    reply_id: EnvelopeId::from(reply_id),
                    rejected: wire.reject.unwrap_or(false),
                }
            }
            (None, Some(action)) if action == actions::REPLY => {
                return Err(Error::ProtocolViolation("reply without replyId".into()));
            }
            (None, Some(action)) if !action.is_empty() => Kind::Call { action },
            (None, _) => {
                return Err(Error::ProtocolViolation("message has neither action nor replyId".into()));
            }
        };

        Ok(Envelope::from_parts(EnvelopeId::from(wire.id), kind, wire.source, wire.destination, wire.data))
    }
}

/// The unit a channel moves: an encoded frame plus the parts it transfers.
#[derive(Debug, PartialEq)]
pub struct Packet {
    pub frame: Vec<u8>,
    pub transfer: Vec<Transferable>,
}

/// Encodes an envelope into its frame bytes.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&envelope.to_wire())?)
}

/// Decodes and validates a frame.
pub fn decode(frame: &[u8]) -> Result<Envelope> {
    let wire: WireEnvelope = serde_json::from_slice(frame)?;
    Envelope::try_from(wire)
}

/// Moves the transfer list out of `envelope` and packs it with the encoded frame.
///
/// The envelope stays usable as a record of what was sent.
pub fn seal(envelope: &mut Envelope) -> Result<Packet> {
    let frame = encode(envelope)?;
    Ok(Packet { frame, transfer: envelope.take_transfer() })
}

/// Decodes a packet, handing its transfer parts to the resulting envelope.
pub fn open(packet: Packet) -> Result<Envelope> {
    Ok(decode(&packet.frame)?.with_transfer(packet.transfer))
}

/// Addressing recovered from a frame that failed full validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Salvage {
    pub id: EnvelopeId,
    pub source: Option<Role>,
    pub destination: Option<Role>,
    pub is_reply: bool,
}

/// Extracts just the addressing of a raw frame.
///
/// Used to answer malformed calls with a rejection when full decoding fails.
pub fn salvage(frame: &[u8]) -> Result<Salvage> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Partial {
        id: Option<String>,
        source: Option<Role>,
        destination: Option<Role>,
        reply_id: Option<String>,
    }

    let partial: Partial = serde_json::from_slice(frame)?;
    let id = partial
        .id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::ProtocolViolation("missing id".into()))?;

    Ok(Salvage {
        id: EnvelopeId::from(id),
        source: partial.source,
        destination: partial.destination,
        is_reply: partial.reply_id.is_some(),
    })
}
