use crate::error::Error;
use std::time::Duration;

/// Read-only broker metadata passed to every hook invocation: a snapshot of
/// the owning broker's identity ([`crate::BrokerId`]) taken when the
/// connection was created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMeta {
    pub node_id: i32,
    pub host: String,
    pub port: u16,
    pub rack: Option<String>,
}

impl BrokerMeta {
    pub(crate) fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Observer callbacks fired around broker connection activity.
///
/// Hooks are best effort: they run inline on the writer or reader task, and
/// nothing they do affects request flow. All methods default to no-ops.
pub trait Hooks: Send + Sync {
    /// A dial completed (successfully or not).
    fn on_connect(&self, _meta: &BrokerMeta, _dial: Duration, _err: Option<&Error>) {}

    /// A connection died.
    fn on_disconnect(&self, _meta: &BrokerMeta) {}

    /// A request write completed. `write_wait` is the time between the
    /// request being queued and the write starting.
    fn on_write(
        &self,
        _meta: &BrokerMeta,
        _key: i16,
        _bytes_written: usize,
        _write_wait: Duration,
        _time_to_write: Duration,
        _err: Option<&Error>,
    ) {
    }

    /// A response read completed. `read_wait` is the time between the
    /// response being expected and the read starting.
    fn on_read(
        &self,
        _meta: &BrokerMeta,
        _key: i16,
        _bytes_read: usize,
        _read_wait: Duration,
        _time_to_read: Duration,
        _err: Option<&Error>,
    ) {
    }

    /// A response reported server-side throttling.
    fn on_throttle(&self, _meta: &BrokerMeta, _throttle: Duration, _throttled_after_response: bool) {
    }
}

