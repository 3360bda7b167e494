use kafka_protocol::error::ResponseError;
use std::sync::Arc;

/// Errors surfaced through request promises and connection bootstrap.
///
/// I/O failures kill the connection they occurred on, so the next request to
/// the same broker dials a fresh socket. Version and key validation failures
/// leave the connection untouched.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The broker was stopped with `stop_forever`, or the connection chosen
    /// for this request died before the response arrived.
    #[error("the broker is dead and no longer accepting requests")]
    ChosenBrokerDead,

    /// The request's API key is outside the known key range, or the
    /// user-configured max-versions table does not allow it.
    #[error("request key {0} is unknown")]
    UnknownRequestKey(i16),

    /// The broker's maximum supported version for this key is below the
    /// configured minimum.
    #[error(
        "broker is too old for key {key}: the maximum usable version {max} is \
         below the configured minimum {min}"
    )]
    BrokerTooOld { key: i16, min: i16, max: i16 },

    /// A socket read or write failed. The connection has been killed.
    #[error("connection is dead")]
    DeadConnection(#[source] Arc<std::io::Error>),

    /// The client's shutdown signal fired while the request was in flight.
    #[error("client is closing")]
    ClientClosing,

    /// The caller's cancellation token fired.
    #[error("request was cancelled")]
    Cancelled,

    /// The broker replied with a correlation id other than the one at the
    /// head of the expectation queue. Fatal for the connection.
    #[error("correlation id mismatch: read {got}, expected {expected}")]
    CorrelationIdMismatch { got: i32, expected: i32 },

    /// The response length prefix was negative.
    #[error("invalid negative response size {size}")]
    InvalidResponseSize { size: i32 },

    /// The response length prefix exceeds the configured read limit. When the
    /// size bytes look like a TLS alert record, `tls` carries a best-effort
    /// protocol version guess.
    #[error(
        "invalid large response size {size} > limit {limit}{}",
        .tls.map(|v| format!(
            "; the first three bytes look like a {v} alert record: is this a \
             plaintext connection to a tls endpoint?"
        )).unwrap_or_default()
    )]
    ResponseTooLarge {
        size: i32,
        limit: i32,
        tls: Option<&'static str>,
    },

    /// A response frame was too short to contain a correlation id.
    #[error("response did not contain enough data")]
    NotEnoughData,

    /// The broker replied with a Kafka error code, optionally with a
    /// server-provided message.
    #[error("broker error {err:?}{}", .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    Server {
        err: ResponseError,
        message: Option<String>,
    },

    /// Dialing, version discovery, SASL, or response decoding failed.
    #[error(transparent)]
    Protocol(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn dead(err: std::io::Error) -> Self {
        Error::DeadConnection(Arc::new(err))
    }

    pub(crate) fn timeout() -> Self {
        Error::dead(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "i/o deadline exceeded",
        ))
    }

    /// Map a Kafka error code to `Error::Server`, prefixing the server's
    /// message when it provided one.
    pub(crate) fn server(code: i16, message: Option<&str>) -> Self {
        match ResponseError::try_from_code(code) {
            Some(err) => Error::Server {
                err,
                message: message.map(str::to_owned),
            },
            None => Error::Protocol(anyhow::anyhow!(
                "broker replied with unknown error code {code}{}",
                message.map(|m| format!(": {m}")).unwrap_or_default()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_response_mentions_tls_guess() {
        let err = Error::ResponseTooLarge {
            size: 352387850,
            limit: 104857600,
            tls: Some("TLS v1.2"),
        };
        let msg = err.to_string();
        assert!(msg.contains("TLS v1.2"), "{msg}");
        assert!(msg.contains("352387850"), "{msg}");

        let err = Error::ResponseTooLarge {
            size: i32::MAX,
            limit: 1,
            tls: None,
        };
        assert!(!err.to_string().contains("alert record"));
    }

    #[test]
    fn server_error_prefixes_message() {
        let err = Error::server(33, Some("mechanism not enabled"));
        let msg = err.to_string();
        assert!(msg.contains("UnsupportedSaslMechanism"), "{msg}");
        assert!(msg.contains("mechanism not enabled"), "{msg}");
    }
}
