use crate::connection::Connection;
use crate::error::Error;
use crate::request::{Request, Typed};
use crate::versions::{SASL_AUTHENTICATE_KEY, SASL_HANDSHAKE_KEY};
use async_trait::async_trait;
use bytes::Bytes;
use kafka_protocol::error::ResponseError;
use kafka_protocol::messages::{
    SaslAuthenticateRequest, SaslAuthenticateResponse, SaslHandshakeRequest,
    SaslHandshakeResponse,
};
use kafka_protocol::protocol::{Decodable, StrBytes};
use std::time::Duration;
use tokio::time::Instant;

/// A SASL mechanism, e.g. PLAIN or SCRAM-SHA-256. Implementations live
/// outside this crate; the connection layer only drives the
/// challenge/response exchange and the wire framing around it.
#[async_trait]
pub trait Mechanism: Send + Sync {
    /// The mechanism name sent in the SASLHandshake request.
    fn name(&self) -> &str;

    /// Begin an authentication session against `host`, returning the
    /// session and the first client-sent bytes.
    async fn authenticate(&self, host: &str) -> anyhow::Result<(Box<dyn Session>, Vec<u8>)>;
}

/// An in-progress authentication exchange.
pub trait Session: Send {
    /// Consume a server challenge, returning whether the exchange is done
    /// and the next client-sent bytes. A finished exchange with nothing
    /// left to send must return `(true, vec![])`, not an error.
    fn challenge(&mut self, challenge: &[u8]) -> anyhow::Result<(bool, Vec<u8>)>;
}

// KIP-368 brokers advertise how long the authenticated session lasts.
// Anything under five seconds is nonsensical and treated as a broken broker.
const MIN_SESSION_LIFETIME_MS: i64 = 5_000;

/// Run the full SASL flow on a connection: optional handshake (with a
/// single mechanism switch if the broker rejects our first choice), then
/// the challenge/response loop, wrapped in SaslAuthenticate requests when
/// the handshake completed at v1+ and as raw frames otherwise.
///
/// Also invoked in place on a live connection when its session lifetime
/// lapses; the writer task owns the socket during that window.
pub(crate) async fn authenticate(cxn: &mut Connection) -> Result<(), Error> {
    let Some(mut mechanism) = cxn.mechanism() else {
        return Ok(());
    };
    let client = cxn.client().clone();

    // GSSAPI predates the handshake API; and a broker without a known
    // SASLHandshake version gets raw auth frames directly.
    let handshake_version = cxn.versions().lookup(SASL_HANDSHAKE_KEY);
    let mut wrap = false;
    if mechanism.name() != "GSSAPI" && handshake_version >= 0 {
        let mut switched = false;
        loop {
            let mut req = Typed::new(
                SaslHandshakeRequest::default()
                    .with_mechanism(StrBytes::from_string(mechanism.name().to_string())),
            );
            let version = handshake_version.min(req.max_version());
            req.set_version(version);

            let (read_timeout, write_timeout) = (client.cfg.conn_timeouts)(&req);
            let enqueued = Instant::now();
            let correlation_id = cxn.write_request(None, &req, write_timeout, enqueued).await?;
            let mut body = cxn
                .read_direct(
                    SASL_HANDSHAKE_KEY,
                    correlation_id,
                    req.is_flexible(),
                    read_timeout,
                    enqueued,
                )
                .await?;
            let resp = SaslHandshakeResponse::decode(&mut body, version)
                .map_err(|err| anyhow::anyhow!("decoding SaslHandshakeResponse: {err}"))?;

            if resp.error_code != 0 {
                // The broker told us which mechanisms it does support; if a
                // configured fallback intersects, switch once and retry.
                let unsupported =
                    resp.error_code == ResponseError::UnsupportedSaslMechanism.code();
                if unsupported && !switched {
                    let supported: Vec<String> =
                        resp.mechanisms.iter().map(|m| m.to_string()).collect();
                    let fallback = client.cfg.sasls.iter().find(|m| {
                        m.name() != mechanism.name()
                            && supported.iter().any(|s| s.as_str() == m.name())
                    });
                    if let Some(next) = fallback {
                        tracing::debug!(
                            from = mechanism.name(),
                            to = next.name(),
                            "broker rejected sasl mechanism, switching",
                        );
                        mechanism = next.clone();
                        cxn.set_mechanism(next.clone());
                        switched = true;
                        continue;
                    }
                }
                return Err(Error::server(resp.error_code, None));
            }

            // At handshake v1+ auth bytes travel inside SaslAuthenticate
            // requests; at v0 they are raw size-prefixed frames.
            wrap = version >= 1;
            break;
        }
    }

    let host = cxn.host().to_string();
    let (mut session, mut client_write) = mechanism
        .authenticate(&host)
        .await
        .map_err(|err| Error::Protocol(err.context("starting sasl session")))?;

    let raw_timeouts =
        (client.cfg.conn_timeouts)(&Typed::new(SaslAuthenticateRequest::default()));
    let mut done = false;

    // One trailing server response may be consumed after the session
    // reports done, which some mechanisms require; and a final non-empty
    // client write is always flushed.
    while !done || !client_write.is_empty() {
        let auth_bytes = std::mem::take(&mut client_write);
        if wrap {
            let mut req = Typed::new(
                SaslAuthenticateRequest::default().with_auth_bytes(Bytes::from(auth_bytes)),
            );
            let learned = cxn.versions().lookup(SASL_AUTHENTICATE_KEY);
            let version = if learned >= 0 {
                learned.min(req.max_version())
            } else {
                0
            };
            req.set_version(version);

            let (read_timeout, write_timeout) = (client.cfg.conn_timeouts)(&req);
            let enqueued = Instant::now();
            let correlation_id = cxn.write_request(None, &req, write_timeout, enqueued).await?;
            let mut body = cxn
                .read_direct(
                    SASL_AUTHENTICATE_KEY,
                    correlation_id,
                    req.is_flexible(),
                    read_timeout,
                    enqueued,
                )
                .await?;
            let resp = SaslAuthenticateResponse::decode(&mut body, version)
                .map_err(|err| anyhow::anyhow!("decoding SaslAuthenticateResponse: {err}"))?;

            if resp.error_code != 0 {
                let message = resp.error_message.as_ref().map(|m| m.to_string());
                return Err(Error::server(resp.error_code, message.as_deref()));
            }
            if resp.session_lifetime_ms > 0 {
                if resp.session_lifetime_ms < MIN_SESSION_LIFETIME_MS {
                    return Err(Error::Protocol(anyhow::anyhow!(
                        "broker granted a sasl session lifetime of {}ms, below the \
                         {MIN_SESSION_LIFETIME_MS}ms minimum",
                        resp.session_lifetime_ms,
                    )));
                }
                // Re-authenticate one second before the broker cuts us off.
                cxn.set_reauth_at(
                    Instant::now() + Duration::from_millis(resp.session_lifetime_ms as u64)
                        - Duration::from_secs(1),
                );
            }
            if !done {
                let (d, next) = session
                    .challenge(&resp.auth_bytes)
                    .map_err(|err| Error::Protocol(err.context("sasl challenge")))?;
                done = d;
                client_write = next;
            }
        } else {
            cxn.write_raw(&auth_bytes, raw_timeouts.1).await?;
            if !done {
                let challenge = cxn.read_raw_frame(raw_timeouts.0).await?;
                let (d, next) = session
                    .challenge(&challenge)
                    .map_err(|err| Error::Protocol(err.context("sasl challenge")))?;
                done = d;
                client_write = next;
            }
        }
    }

    tracing::debug!(mechanism = mechanism.name(), "sasl authentication complete");
    Ok(())
}
