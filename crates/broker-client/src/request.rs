use crate::error::Error;
use bytes::{Bytes, BytesMut};
use kafka_protocol::messages;
use kafka_protocol::protocol::{Decodable, Request as ProtoRequest};
use std::any::Any;
use std::fmt;

/// A request the broker layer can version, encode, and correlate without
/// knowing its shape. The wire codec itself stays opaque: implementations
/// encode their body and hand back an empty response to decode into.
///
/// [`Typed`] adapts any `kafka_protocol` request message; callers with their
/// own codecs implement the trait directly.
pub trait Request: Send + Sync + fmt::Debug {
    /// The Kafka API key of this request.
    fn key(&self) -> i16;

    /// The highest version this request's codec can encode.
    fn max_version(&self) -> i16;

    /// The version the request is currently pinned to.
    fn version(&self) -> i16;

    /// Pin the request to a version. The broker's writer calls this after
    /// clamping against the learned and configured version tables.
    fn set_version(&mut self, version: i16);

    /// The request header version at the current request version.
    fn header_version(&self) -> i16;

    /// Whether the request header carries tagged fields at the current
    /// version. Note that the *response* header flexibility additionally
    /// special-cases ApiVersions; the broker layer handles that quirk.
    fn is_flexible(&self) -> bool {
        self.header_version() >= 2
    }

    /// Encode the request body (no header) at the current version.
    fn encode_body(&self, buf: &mut BytesMut) -> anyhow::Result<()>;

    /// An empty response value at the current version, to decode the
    /// broker's reply into.
    fn response(&self) -> Box<dyn Response>;

    /// Produce requests expose their acks and timeout fields for rewriting;
    /// everything else returns `None`.
    fn as_produce(&mut self) -> Option<&mut dyn ProduceRequest> {
        None
    }
}

/// The mutable surface of a produce request: the writer overwrites acks with
/// the client-configured value, and the timeout when acks is zero.
pub trait ProduceRequest {
    fn set_acks(&mut self, acks: i16);
    fn set_timeout_millis(&mut self, timeout_millis: i32);
}

impl ProduceRequest for messages::ProduceRequest {
    fn set_acks(&mut self, acks: i16) {
        self.acks = acks;
    }

    fn set_timeout_millis(&mut self, timeout_millis: i32) {
        self.timeout_ms = timeout_millis;
    }
}

/// Server throttling reported by a decoded response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttle {
    pub millis: i32,
    /// Brokers at protocol versions past KIP-219 throttle *after* sending
    /// the response, so the client must delay its next write. Older brokers
    /// have already applied the delay themselves.
    pub after_response: bool,
}

/// A decode target produced by [`Request::response`].
pub trait Response: Send + fmt::Debug + 'static {
    fn version(&self) -> i16;

    fn set_version(&mut self, version: i16);

    /// Decode the response body (header already consumed) at the current
    /// version.
    fn decode_body(&mut self, body: Bytes) -> anyhow::Result<()>;

    /// Throttling reported by this response, if its schema carries it.
    fn throttle(&self) -> Option<Throttle> {
        None
    }

    /// Downcast surface for callers to recover the concrete response.
    fn as_any(&self) -> &dyn Any;
}

/// Completion callback of a submitted request, invoked exactly once.
pub type Promise = Box<dyn FnOnce(Result<Box<dyn Response>, Error>) + Send + 'static>;

/// Adapts a `kafka_protocol` request message to [`Request`].
///
/// The version defaults to the message's maximum known version and is
/// clamped by the broker writer before encoding.
#[derive(Debug)]
pub struct Typed<T: ProtoRequest> {
    msg: T,
    version: i16,
}

impl<T: ProtoRequest> Typed<T> {
    pub fn new(msg: T) -> Self {
        Self {
            msg,
            version: T::VERSIONS.max,
        }
    }

    pub fn inner(&self) -> &T {
        &self.msg
    }

    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.msg
    }
}

impl<T: ProtoRequest> From<T> for Typed<T> {
    fn from(msg: T) -> Self {
        Self::new(msg)
    }
}

impl<T> Request for Typed<T>
where
    T: ProtoRequest + fmt::Debug + Send + Sync + 'static,
    T::Response: Default + fmt::Debug + Send + 'static,
{
    fn key(&self) -> i16 {
        T::KEY
    }

    fn max_version(&self) -> i16 {
        T::VERSIONS.max
    }

    fn version(&self) -> i16 {
        self.version
    }

    fn set_version(&mut self, version: i16) {
        self.version = version;
    }

    fn header_version(&self) -> i16 {
        T::header_version(self.version)
    }

    fn encode_body(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        self.msg
            .encode(buf, self.version)
            .map_err(|err| anyhow::anyhow!("encoding {}: {err}", std::any::type_name::<T>()))
    }

    fn response(&self) -> Box<dyn Response> {
        Box::new(TypedResponse::<T::Response> {
            msg: T::Response::default(),
            version: self.version,
        })
    }

    fn as_produce(&mut self) -> Option<&mut dyn ProduceRequest> {
        let msg: &mut dyn Any = &mut self.msg;
        msg.downcast_mut::<messages::ProduceRequest>()
            .map(|produce| produce as &mut dyn ProduceRequest)
    }
}

/// The decode target paired with [`Typed`]. Recover the message with
/// `resp.as_any().downcast_ref::<TypedResponse<M>>()`.
#[derive(Debug)]
pub struct TypedResponse<R> {
    msg: R,
    version: i16,
}

impl<R> TypedResponse<R> {
    pub fn inner(&self) -> &R {
        &self.msg
    }
}

impl<R> Response for TypedResponse<R>
where
    R: Decodable + fmt::Debug + Send + 'static,
{
    fn version(&self) -> i16 {
        self.version
    }

    fn set_version(&mut self, version: i16) {
        self.version = version;
    }

    fn decode_body(&mut self, mut body: Bytes) -> anyhow::Result<()> {
        self.msg = R::decode(&mut body, self.version)
            .map_err(|err| anyhow::anyhow!("decoding {}: {err}", std::any::type_name::<R>()))?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
