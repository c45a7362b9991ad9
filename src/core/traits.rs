//! Collaborator traits for Tether.
//!
//! The transport never looks inside application payloads. A [`Codec`] maps
//! application values to a named byte payload and back, and a [`Balancer`]
//! is told when a supervised address becomes reachable again.

use bytes::Bytes;

use super::error::CodecError;

/// A named application payload as carried on the wire.
///
/// The name selects the application decoder on the receiving side. It must
/// be ASCII, at most 255 bytes, and must not collide with the reserved
/// protocol names (see [`RESERVED_NAMES`](super::RESERVED_NAMES)).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    /// Type discriminator.
    pub name: String,
    /// Serialized body.
    pub body: Bytes,
}

impl Payload {
    /// Create a payload.
    pub fn new(name: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
        }
    }
}

/// Application payload codec, selected when a connection is built.
///
/// # Example
///
/// ```ignore
/// struct Utf8Codec;
///
/// impl Codec for Utf8Codec {
///     type Item = String;
///
///     fn encode(&self, item: &String) -> Result<Payload, CodecError> {
///         Ok(Payload::new("Text", item.clone().into_bytes()))
///     }
///
///     fn decode(&self, payload: Payload) -> Result<String, CodecError> {
///         String::from_utf8(payload.body.to_vec()).map_err(|e| CodecError::Decode(e.to_string()))
///     }
/// }
/// ```
pub trait Codec: Send + Sync + 'static {
    /// Application message type.
    type Item: Send + 'static;

    /// Serialize an application value.
    fn encode(&self, item: &Self::Item) -> Result<Payload, CodecError>;

    /// Deserialize an application value.
    fn decode(&self, payload: Payload) -> Result<Self::Item, CodecError>;
}

/// Identity codec: the application works with [`Payload`] directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    type Item = Payload;

    fn encode(&self, item: &Payload) -> Result<Payload, CodecError> {
        Ok(item.clone())
    }

    fn decode(&self, payload: Payload) -> Result<Payload, CodecError> {
        Ok(payload)
    }
}

/// Node registry owned by the load balancer.
///
/// Selection algorithms live outside this crate; the reconnector only
/// reports addresses it has managed to dial again.
pub trait Balancer: Send + Sync + 'static {
    /// Make `addr` available for selection.
    fn register(&self, addr: &str);

    /// Mark whether `addr` has been confirmed alive.
    fn set_alive(&self, addr: &str, alive: bool);
}
