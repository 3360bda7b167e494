use crate::connection::Connection;
use crate::error::Error;
use crate::request::{Request, Typed};
use kafka_protocol::messages::{ApiVersionsRequest, ApiVersionsResponse};
use kafka_protocol::protocol::{Decodable, StrBytes};
use tokio::time::Instant;

/// The highest API key the version tables track. Responses advertising keys
/// above this are silently ignored.
pub const MAX_API_KEY: i16 = 67;

pub(crate) const SASL_HANDSHAKE_KEY: i16 = 17;
pub(crate) const API_VERSIONS_KEY: i16 = 18;
pub(crate) const SASL_AUTHENTICATE_KEY: i16 = 36;

/// A dense per-API-key table of maximum versions. `-1` means unknown or
/// unsupported; a table of all `-1` is what a pre-0.10 broker (which does
/// not speak ApiVersions) looks like.
///
/// Users supply tables as allow-lists and clamps through
/// `Config::max_versions` / `Config::min_versions`; connections fill one in
/// from the broker's ApiVersions response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionTable {
    max: [i16; (MAX_API_KEY + 1) as usize],
}

impl VersionTable {
    pub fn unknown() -> Self {
        Self {
            max: [-1; (MAX_API_KEY + 1) as usize],
        }
    }

    pub fn len(&self) -> usize {
        self.max.len()
    }

    /// Record a version for a key, ignoring keys outside the table range.
    pub fn set(&mut self, key: i16, version: i16) {
        if let Ok(idx) = usize::try_from(key) {
            if idx < self.max.len() {
                self.max[idx] = version;
            }
        }
    }

    /// The recorded max version for a key, or `-1` when unknown or out of
    /// range.
    pub fn lookup(&self, key: i16) -> i16 {
        usize::try_from(key)
            .ok()
            .and_then(|idx| self.max.get(idx).copied())
            .unwrap_or(-1)
    }

    pub fn has_key(&self, key: i16) -> bool {
        self.lookup(key) >= 0
    }
}

impl Default for VersionTable {
    fn default() -> Self {
        Self::unknown()
    }
}

const UNSUPPORTED_VERSION: i16 = 35;

// Kafka < 2.4 replies to a too-new ApiVersions request with exactly this v0
// body; EventHubs replies with the ten-byte v1 variant. Only these two
// literal forms trigger a downgrade.
const UNSUPPORTED_V0_BODY: &[u8] = &[0x00, 0x23, 0x00, 0x00, 0x00, 0x00];
const UNSUPPORTED_V1_BODY: &[u8] = &[
    0x00, 0x23, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// First request on every new connection: learn the broker's max version
/// for every API key it knows.
pub(crate) async fn discover(cxn: &mut Connection) -> Result<(), Error> {
    let client = cxn.client().clone();
    let user_max = client
        .cfg
        .max_versions
        .as_ref()
        .map_or(-1, |t| t.lookup(API_VERSIONS_KEY));
    let mut version: i16 = if user_max >= 0 { user_max.min(3) } else { 3 };

    loop {
        // The software name/version fields only exist at v3+; encoding them
        // at lower versions is an error.
        let msg = if version >= 3 {
            ApiVersionsRequest::default()
                .with_client_software_name(StrBytes::from_string(
                    client.cfg.software_name.clone(),
                ))
                .with_client_software_version(StrBytes::from_string(
                    client.cfg.software_version.clone(),
                ))
        } else {
            ApiVersionsRequest::default()
        };
        let mut req = Typed::new(msg);
        req.set_version(version);

        let (read_timeout, write_timeout) = (client.cfg.conn_timeouts)(&req);
        let enqueued = Instant::now();
        let correlation_id = cxn.write_request(None, &req, write_timeout, enqueued).await?;
        // ApiVersions responses use a non-flexible header at every version.
        let body = cxn
            .read_direct(API_VERSIONS_KEY, correlation_id, false, read_timeout, enqueued)
            .await?;

        let mut decode_version = version;
        if body.len() >= 2 && i16::from_be_bytes([body[0], body[1]]) == UNSUPPORTED_VERSION {
            if body[..] == *UNSUPPORTED_V0_BODY || body[..] == *UNSUPPORTED_V1_BODY {
                if version > 0 {
                    tracing::debug!(
                        broker = cxn.core().meta.node_id,
                        from = version,
                        "broker rejected our ApiVersions version, retrying at v0",
                    );
                    version = 0;
                    continue;
                }
                return Err(Error::Protocol(anyhow::anyhow!(
                    "broker replied UNSUPPORTED_VERSION to an ApiVersions request of version 0"
                )));
            }
            // Brokers predating v3 reply with a v0-shaped body regardless of
            // the version we asked for.
            decode_version = 0;
        }

        let mut body = body;
        let resp = ApiVersionsResponse::decode(&mut body, decode_version)
            .map_err(|err| anyhow::anyhow!("decoding ApiVersionsResponse: {err}"))?;
        if resp.api_keys.is_empty() {
            return Err(Error::Protocol(anyhow::anyhow!(
                "ApiVersions response invalidly contained no ApiKeys"
            )));
        }

        let table = cxn.versions_mut();
        for key in &resp.api_keys {
            table.set(key.api_key, key.max_version);
        }
        tracing::debug!(
            broker = cxn.core().meta.node_id,
            keys = resp.api_keys.len(),
            version = decode_version,
            "discovered broker api versions",
        );
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unknown() {
        let t = VersionTable::unknown();
        assert_eq!(t.lookup(0), -1);
        assert_eq!(t.lookup(MAX_API_KEY), -1);
        assert!(!t.has_key(18));
    }

    #[test]
    fn set_and_lookup_boundaries() {
        let mut t = VersionTable::unknown();
        t.set(0, 9);
        t.set(MAX_API_KEY, 2);
        assert_eq!(t.lookup(0), 9);
        assert_eq!(t.lookup(MAX_API_KEY), 2);
        assert!(t.has_key(0));

        // Out-of-range keys are ignored on write and unknown on read.
        t.set(MAX_API_KEY + 1, 5);
        t.set(-3, 5);
        assert_eq!(t.lookup(MAX_API_KEY + 1), -1);
        assert_eq!(t.lookup(-3), -1);
        assert_eq!(t.lookup(1000), -1);
    }

    #[test]
    fn zero_version_counts_as_known() {
        let mut t = VersionTable::unknown();
        t.set(17, 0);
        assert!(t.has_key(17));
        assert_eq!(t.lookup(17), 0);
    }

    #[test]
    fn unsupported_version_literals() {
        assert_eq!(UNSUPPORTED_V0_BODY.len(), 6);
        assert_eq!(UNSUPPORTED_V1_BODY.len(), 10);
        assert_eq!(
            i16::from_be_bytes([UNSUPPORTED_V0_BODY[0], UNSUPPORTED_V0_BODY[1]]),
            UNSUPPORTED_VERSION
        );
    }
}
