//! Per-broker connection layer of a Kafka client.
//!
//! Each [`Broker`] owns up to three pipelined connections (normal, produce,
//! fetch) behind a single writer task; each live connection runs one reader
//! task that consumes response expectations in write order and matches them
//! by correlation id. Connections negotiate API versions and SASL on
//! creation (re-authenticating in place when the broker's session lifetime
//! lapses), honor server throttling before writes, and are reaped when
//! idle.
//!
//! Request and response codecs stay opaque behind [`Request`] and
//! [`Response`]; [`Typed`] bridges any `kafka_protocol` message. Retries,
//! metadata discovery, and message semantics belong to higher layers: every
//! submission resolves its promise exactly once, and the caller decides
//! what to do with a failure.

mod broker;
mod client;
mod config;
mod connection;
mod error;
mod hooks;
mod pool;
mod request;
mod sasl;
mod versions;

pub use broker::{Broker, BrokerId};
pub use client::Client;
pub use config::{Acks, BoxedConn, Config, Conn, ConnTimeoutFn, DialFn, RequestFormatter};
pub use error::Error;
pub use hooks::{BrokerMeta, Hooks};
pub use request::{
    ProduceRequest, Promise, Request, Response, Throttle, Typed, TypedResponse,
};
pub use sasl::{Mechanism, Session};
pub use versions::{VersionTable, MAX_API_KEY};

/// Node id reported while the cluster controller is unknown.
pub const UNKNOWN_CONTROLLER: i32 = -1;
