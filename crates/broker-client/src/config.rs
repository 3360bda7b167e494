use crate::hooks::Hooks;
use crate::request::Request;
use crate::sasl::Mechanism;
use crate::versions::VersionTable;
use bytes::{BufMut, BytesMut};
use futures::future::BoxFuture;
use kafka_protocol::messages::RequestHeader;
use kafka_protocol::protocol::{Encodable, StrBytes};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A bidirectional stream to a broker. TLS (or anything else) plugs in by
/// swapping [`Config::dial`].
pub trait Conn: AsyncRead + AsyncWrite + Send + Sync + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> Conn for T {}

pub type BoxedConn = Box<dyn Conn>;

/// Dials a `host:port` address and returns the connected stream.
pub type DialFn = Arc<dyn Fn(String) -> BoxFuture<'static, io::Result<BoxedConn>> + Send + Sync>;

/// Per-request `(read, write)` socket deadlines.
pub type ConnTimeoutFn = Arc<dyn Fn(&dyn Request) -> (Duration, Duration) + Send + Sync>;

/// The acks value rewritten onto every produce request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acks {
    /// Wait for all in-sync replicas (-1).
    All,
    /// Wait for the leader only (1).
    Leader,
    /// Fire and forget (0). Produce connections run a discard reader and
    /// requests complete as soon as they are written.
    None,
}

impl Acks {
    pub fn value(self) -> i16 {
        match self {
            Acks::All => -1,
            Acks::Leader => 1,
            Acks::None => 0,
        }
    }
}

/// Encodes `[size][header][body]` frames for outgoing requests.
///
/// The header version comes from the request itself; flexible headers carry
/// an (empty) tagged-fields block, which `RequestHeader` encoding handles.
#[derive(Clone)]
pub struct RequestFormatter {
    pub client_id: Option<StrBytes>,
}

impl RequestFormatter {
    pub fn new(client_id: Option<String>) -> Self {
        Self {
            client_id: client_id.map(StrBytes::from_string),
        }
    }

    /// Append a complete request frame with the writer-assigned correlation
    /// id. The request must already be pinned to its final version.
    pub fn append_request(
        &self,
        buf: &mut BytesMut,
        req: &dyn Request,
        correlation_id: i32,
    ) -> anyhow::Result<()> {
        buf.put_i32(0); // Length placeholder.
        let offset = buf.len();

        let header = RequestHeader::default()
            .with_request_api_key(req.key())
            .with_request_api_version(req.version())
            .with_correlation_id(correlation_id)
            .with_client_id(self.client_id.clone());
        header
            .encode(buf, req.header_version())
            .map_err(|err| anyhow::anyhow!("encoding request header: {err}"))?;
        req.encode_body(buf)?;

        let size = (buf.len() - offset) as i32;
        buf[offset - 4..offset].copy_from_slice(&size.to_be_bytes());
        Ok(())
    }
}

/// Configuration consumed read-only by brokers and their connections.
///
/// Everything has a usable default except `sasls`, which stays empty for
/// unauthenticated clusters.
#[derive(Clone)]
pub struct Config {
    /// Transport injection. Defaults to plain TCP with `TCP_NODELAY`.
    pub dial: DialFn,
    /// Request frame encoding, including the client id sent to brokers.
    pub formatter: RequestFormatter,
    /// Per-request socket deadlines. Defaults to 20s for both directions.
    pub conn_timeouts: ConnTimeoutFn,
    /// Optional per-key ceiling; keys absent from the table are rejected
    /// with `UnknownRequestKey`. Also gates ApiVersions discovery: a table
    /// without key 18 skips discovery entirely.
    pub max_versions: Option<VersionTable>,
    /// Optional per-key floor; a clamped version below the floor fails with
    /// `BrokerTooOld`.
    pub min_versions: Option<VersionTable>,
    /// Software name reported in ApiVersions requests (v3+).
    pub software_name: String,
    /// Software version reported in ApiVersions requests (v3+).
    pub software_version: String,
    /// Acks rewritten onto every produce request.
    pub acks: Acks,
    /// Produce timeout, rewritten onto acks-0 produce requests and used as
    /// the body-read deadline of the discard reader.
    pub produce_timeout: Duration,
    /// SASL mechanisms in preference order; the first is used, the rest are
    /// fallbacks when the broker rejects it as unsupported.
    pub sasls: Vec<Arc<dyn Mechanism>>,
    /// Connections idle longer than this are reaped; also the reaper's
    /// cadence.
    pub conn_idle_timeout: Duration,
    /// Hard cap on a single response frame.
    pub max_broker_read_bytes: i32,
    /// Observers of connection activity.
    pub hooks: Vec<Arc<dyn Hooks>>,
}

fn tcp_dial(addr: String) -> BoxFuture<'static, io::Result<BoxedConn>> {
    Box::pin(async move {
        let stream = TcpStream::connect(&addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream) as BoxedConn)
    })
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dial: Arc::new(tcp_dial),
            formatter: RequestFormatter::new(Some("broker-client".to_string())),
            conn_timeouts: Arc::new(|_req| (Duration::from_secs(20), Duration::from_secs(20))),
            max_versions: None,
            min_versions: None,
            software_name: "broker-client".to_string(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
            acks: Acks::All,
            produce_timeout: Duration::from_secs(10),
            sasls: Vec::new(),
            conn_idle_timeout: Duration::from_secs(20),
            max_broker_read_bytes: 100 << 20,
            hooks: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Typed;
    use kafka_protocol::messages::MetadataRequest;

    #[test]
    fn acks_values() {
        assert_eq!(Acks::All.value(), -1);
        assert_eq!(Acks::Leader.value(), 1);
        assert_eq!(Acks::None.value(), 0);
    }

    #[test]
    fn formatter_frames_a_request() {
        let formatter = RequestFormatter::new(Some("tester".to_string()));
        let mut req = Typed::new(MetadataRequest::default());
        req.set_version(9);

        let mut buf = BytesMut::new();
        formatter.append_request(&mut buf, &req, 7).unwrap();

        let size = i32::from_be_bytes(buf[0..4].try_into().unwrap());
        assert_eq!(size as usize, buf.len() - 4);
        // api key, api version, correlation id.
        assert_eq!(i16::from_be_bytes(buf[4..6].try_into().unwrap()), 3);
        assert_eq!(i16::from_be_bytes(buf[6..8].try_into().unwrap()), 9);
        assert_eq!(i32::from_be_bytes(buf[8..12].try_into().unwrap()), 7);
    }
}
