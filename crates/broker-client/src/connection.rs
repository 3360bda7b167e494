use crate::client::Core;
use crate::config::{Acks, BoxedConn};
use crate::error::Error;
use crate::hooks::BrokerMeta;
use crate::request::{Promise, Request, Response};
use crate::sasl::{self, Mechanism};
use crate::versions::{self, VersionTable};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Which of a broker's three connection slots a request lands on. Produce
/// and fetch traffic get their own sockets so a slow fetch never delays a
/// produce (and vice versa); everything else shares the normal slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    Normal,
    Produce,
    Fetch,
}

impl Slot {
    pub(crate) fn for_key(key: i16) -> Slot {
        match key {
            0 => Slot::Produce,
            1 => Slot::Fetch,
            _ => Slot::Normal,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Slot::Normal => 0,
            Slot::Produce => 1,
            Slot::Fetch => 2,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Slot::Normal => "normal",
            Slot::Produce => "produce",
            Slot::Fetch => "fetch",
        }
    }
}

/// A response the connection's reader owes a caller: produced by the broker
/// writer immediately after a successful request write, consumed in FIFO
/// order by the reader task.
pub(crate) struct PromisedResponse {
    pub(crate) ctx: Option<CancellationToken>,
    pub(crate) key: i16,
    pub(crate) correlation_id: i32,
    pub(crate) read_timeout: Duration,
    pub(crate) flexible_header: bool,
    pub(crate) resp: Box<dyn Response>,
    pub(crate) promise: Promise,
    pub(crate) enqueued: Instant,
}

/// State shared between the broker writer task, the connection's reader
/// task, and the client's idle reaper.
pub(crate) struct ConnCore {
    pub(crate) meta: BrokerMeta,
    pub(crate) client: Arc<Core>,
    dead: AtomicBool,
    death: CancellationToken,
    // All timestamps are nanoseconds from the client's epoch.
    throttle_until: AtomicU64,
    last_write: AtomicU64,
    last_read: AtomicU64,
    writing: AtomicBool,
    reading: AtomicBool,
    resps: RwLock<Option<mpsc::Sender<PromisedResponse>>>,
}

impl ConnCore {
    fn new(meta: BrokerMeta, client: Arc<Core>) -> Arc<Self> {
        let now = client.now_nanos();
        Arc::new(Self {
            meta,
            client,
            dead: AtomicBool::new(false),
            death: CancellationToken::new(),
            throttle_until: AtomicU64::new(0),
            last_write: AtomicU64::new(now),
            last_read: AtomicU64::new(now),
            writing: AtomicBool::new(false),
            reading: AtomicBool::new(false),
            resps: RwLock::new(None),
        })
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Kill the connection. Idempotent. Fires disconnect hooks, wakes every
    /// task blocked on this connection, and closes the expectation channel
    /// so the reader task drains whatever is still queued with
    /// `ChosenBrokerDead`.
    pub(crate) async fn die(&self) {
        if self.dead.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(
            broker = self.meta.node_id,
            host = %self.meta.host,
            "killing connection",
        );
        for hook in &self.client.cfg.hooks {
            hook.on_disconnect(&self.meta);
        }
        self.death.cancel();
        // Writers hold the read half of this lock while sending, so by the
        // time the write half is held no sender can still be in flight.
        *self.resps.write().await = None;
    }

    /// Hand a response expectation to the reader task, failing it with
    /// `ChosenBrokerDead` if the connection died first.
    ///
    /// Reserving capacity (rather than sending directly) keeps the
    /// expectation recoverable when death interrupts a blocked send: `die`
    /// cancels the death token before it takes the write half of `resps`,
    /// so a sender parked on a full channel always wakes and releases the
    /// read half.
    pub(crate) async fn send_expectation(&self, pr: PromisedResponse) {
        let rejected = {
            let guard = self.resps.read().await;
            match guard.as_ref() {
                Some(tx) if !self.is_dead() => {
                    tokio::select! {
                        permit = tx.reserve() => match permit {
                            Ok(permit) => {
                                permit.send(pr);
                                None
                            }
                            Err(_) => Some(pr),
                        },
                        _ = self.death.cancelled() => Some(pr),
                    }
                }
                _ => Some(pr),
            }
        };
        if let Some(pr) = rejected {
            (pr.promise)(Err(Error::ChosenBrokerDead));
        }
    }

    /// Advance the write-throttle deadline. Never moves it backwards.
    pub(crate) fn bump_throttle(&self, millis: i32) {
        let until = self.client.now_nanos() + millis.max(0) as u64 * 1_000_000;
        self.throttle_until.fetch_max(until, Ordering::AcqRel);
    }

    fn throttle_deadline(&self) -> Option<Instant> {
        let until = self.throttle_until.load(Ordering::Acquire);
        if until > self.client.now_nanos() {
            Some(self.client.epoch + Duration::from_nanos(until))
        } else {
            None
        }
    }

    /// Whether the idle reaper should kill this connection: one direction
    /// has been quiet past the timeout and is not currently mid-I/O.
    pub(crate) fn should_reap(&self, idle: Duration) -> bool {
        let now = self.client.now_nanos();
        let idle = idle.as_nanos() as u64;
        let stale_write = !self.writing.load(Ordering::Relaxed)
            && now.saturating_sub(self.last_write.load(Ordering::Relaxed)) > idle;
        let stale_read = !self.reading.load(Ordering::Relaxed)
            && now.saturating_sub(self.last_read.load(Ordering::Relaxed)) > idle;
        stale_write || stale_read
    }
}

/// One TCP connection to one broker.
///
/// The broker's writer task owns the `Connection` (and with it the write
/// half and the correlation-id counter); the reader task owns the receive
/// side of the expectation channel and shares the framed read half.
pub(crate) struct Connection {
    core: Arc<ConnCore>,
    w: WriteHalf<BoxedConn>,
    reader: Arc<Mutex<FrameReader>>,
    correlation_id: i32,
    versions: VersionTable,
    mechanism: Option<Arc<dyn Mechanism>>,
    reauth_at: Option<Instant>,
}

impl Connection {
    /// Dial and fully initialize a connection: API version discovery (unless
    /// the user's max-versions table excludes ApiVersions), SASL, and the
    /// reader task appropriate for the slot.
    pub(crate) async fn connect(
        client: Arc<Core>,
        meta: BrokerMeta,
        slot: Slot,
        ctx: Option<&CancellationToken>,
    ) -> Result<Connection, Error> {
        let addr = meta.addr();
        let start = Instant::now();
        let dialed: Result<BoxedConn, Error> = tokio::select! {
            conn = (client.cfg.dial)(addr.clone()) => conn.map_err(|err| {
                Error::Protocol(anyhow::Error::new(err).context(format!("dialing {addr}")))
            }),
            _ = client.shutdown.cancelled() => Err(Error::ClientClosing),
            _ = cancelled_or_pending(ctx) => Err(Error::Cancelled),
        };
        for hook in &client.cfg.hooks {
            hook.on_connect(&meta, start.elapsed(), dialed.as_ref().err());
        }
        let conn = dialed?;
        tracing::debug!(
            broker = meta.node_id,
            addr = %addr,
            slot = slot.name(),
            "connected to broker",
        );

        let (r, w) = tokio::io::split(conn);
        let max_bytes = client.cfg.max_broker_read_bytes;
        let mechanism = client.cfg.sasls.first().cloned();
        let core = ConnCore::new(meta, client);
        let mut cxn = Connection {
            core,
            w,
            reader: Arc::new(Mutex::new(FrameReader { r, max_bytes })),
            correlation_id: 0,
            versions: VersionTable::unknown(),
            mechanism,
            reauth_at: None,
        };

        if let Err(err) = cxn.init().await {
            cxn.core.die().await;
            return Err(err);
        }

        let (tx, rx) = mpsc::channel(10);
        *cxn.core.resps.write().await = Some(tx);
        let discard_reads =
            slot == Slot::Produce && cxn.core.client.cfg.acks == Acks::None;
        let (core, reader) = (cxn.core.clone(), cxn.reader.clone());
        if discard_reads {
            tokio::spawn(discard(core, reader, rx));
        } else {
            tokio::spawn(handle_responses(core, reader, rx));
        }
        Ok(cxn)
    }

    async fn init(&mut self) -> Result<(), Error> {
        let discover = self
            .core
            .client
            .cfg
            .max_versions
            .as_ref()
            .map_or(true, |t| t.has_key(versions::API_VERSIONS_KEY));
        if discover {
            versions::discover(self).await?;
        }
        sasl::authenticate(self).await
    }

    pub(crate) fn core(&self) -> &Arc<ConnCore> {
        &self.core
    }

    pub(crate) fn client(&self) -> &Arc<Core> {
        &self.core.client
    }

    pub(crate) fn host(&self) -> &str {
        &self.core.meta.host
    }

    pub(crate) fn versions(&self) -> &VersionTable {
        &self.versions
    }

    pub(crate) fn versions_mut(&mut self) -> &mut VersionTable {
        &mut self.versions
    }

    pub(crate) fn mechanism(&self) -> Option<Arc<dyn Mechanism>> {
        self.mechanism.clone()
    }

    pub(crate) fn set_mechanism(&mut self, mechanism: Arc<dyn Mechanism>) {
        self.mechanism = Some(mechanism);
    }

    pub(crate) fn set_reauth_at(&mut self, at: Instant) {
        self.reauth_at = Some(at);
    }

    /// Whether the SASL session lifetime granted by the broker has lapsed,
    /// requiring re-authentication before the next write (KIP-368).
    pub(crate) fn reauth_due(&self) -> bool {
        self.reauth_at.is_some_and(|at| Instant::now() > at)
    }

    /// Encode and write one request frame, returning the correlation id it
    /// was assigned. A `None` ctx marks a client-internal request: it skips
    /// the throttle sleep and cannot be cancelled from outside.
    pub(crate) async fn write_request(
        &mut self,
        ctx: Option<&CancellationToken>,
        req: &dyn Request,
        write_timeout: Duration,
        enqueued: Instant,
    ) -> Result<i32, Error> {
        if ctx.is_some() {
            if let Some(until) = self.core.throttle_deadline() {
                tracing::debug!(
                    broker = self.core.meta.node_id,
                    delay_ms = (until - Instant::now()).as_millis() as u64,
                    "sleeping off broker throttle before write",
                );
                tokio::select! {
                    _ = tokio::time::sleep_until(until) => {}
                    _ = cancelled_or_pending(ctx) => return Err(Error::Cancelled),
                    _ = self.core.client.shutdown.cancelled() => return Err(Error::ClientClosing),
                    _ = self.core.death.cancelled() => return Err(Error::ChosenBrokerDead),
                }
            }
        }

        let mut buf = self.core.client.pool.get();
        if let Err(err) = self
            .core
            .client
            .cfg
            .formatter
            .append_request(&mut buf, req, self.correlation_id)
        {
            self.core.client.pool.put(buf);
            return Err(Error::Protocol(err));
        }

        let write_start = Instant::now();
        let res = self.write_all(ctx, &buf, write_timeout).await;
        let bytes = buf.len();
        self.core.client.pool.put(buf);

        for hook in &self.core.client.cfg.hooks {
            hook.on_write(
                &self.core.meta,
                req.key(),
                if res.is_ok() { bytes } else { 0 },
                write_start.saturating_duration_since(enqueued),
                write_start.elapsed(),
                res.as_ref().err(),
            );
        }
        res?;

        let id = self.correlation_id;
        self.correlation_id += 1;
        Ok(id)
    }

    /// Write a raw size-prefixed frame, as SASL authentication bytes are
    /// exchanged when no SaslAuthenticate wrapping is in effect.
    pub(crate) async fn write_raw(
        &mut self,
        bytes: &[u8],
        write_timeout: Duration,
    ) -> Result<(), Error> {
        let mut buf = self.core.client.pool.get();
        buf.put_i32(bytes.len() as i32);
        buf.extend_from_slice(bytes);
        let res = self.write_all(None, &buf, write_timeout).await;
        self.core.client.pool.put(buf);
        res
    }

    async fn write_all(
        &mut self,
        ctx: Option<&CancellationToken>,
        buf: &[u8],
        write_timeout: Duration,
    ) -> Result<(), Error> {
        self.core.writing.store(true, Ordering::Relaxed);
        let res = tokio::select! {
            r = tokio::time::timeout(write_timeout, self.w.write_all(buf)) => match r {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(Error::dead(err)),
                Err(_) => Err(Error::timeout()),
            },
            _ = cancelled_or_pending(ctx) => Err(Error::Cancelled),
            _ = self.core.client.shutdown.cancelled() => Err(Error::ClientClosing),
            _ = self.core.death.cancelled() => Err(Error::ChosenBrokerDead),
        };
        self.core
            .last_write
            .store(self.core.client.now_nanos(), Ordering::Relaxed);
        self.core.writing.store(false, Ordering::Relaxed);
        res
    }

    /// Read and parse one response frame in place, bypassing the reader
    /// task. Used during bootstrap and re-authentication, when the caller
    /// owns the socket exclusively.
    pub(crate) async fn read_direct(
        &self,
        key: i16,
        correlation_id: i32,
        flexible_header: bool,
        read_timeout: Duration,
        enqueued: Instant,
    ) -> Result<Bytes, Error> {
        read_response(
            &self.core,
            &self.reader,
            None,
            key,
            correlation_id,
            flexible_header,
            read_timeout,
            enqueued,
        )
        .await
    }

    /// Read one raw size-prefixed frame (no correlation id), as SASL
    /// challenges arrive outside SaslAuthenticate wrapping.
    pub(crate) async fn read_raw_frame(&self, read_timeout: Duration) -> Result<Bytes, Error> {
        let frame = read_framed(&self.core, &self.reader, None, read_timeout).await?;
        Ok(frame.freeze())
    }
}

/// Reads length-prefixed frames off the connection. Negative sizes and
/// frames past the configured cap are fatal, and an oversize frame whose
/// prefix looks like a TLS alert record is reported as a probable TLS
/// misconfiguration.
pub(crate) struct FrameReader {
    r: ReadHalf<BoxedConn>,
    max_bytes: i32,
}

impl FrameReader {
    async fn read_size(&mut self) -> Result<i32, Error> {
        let mut prefix = [0u8; 4];
        self.r.read_exact(&mut prefix).await.map_err(Error::dead)?;
        let size = i32::from_be_bytes(prefix);
        if size < 0 {
            return Err(Error::InvalidResponseSize { size });
        }
        if size > self.max_bytes {
            return Err(Error::ResponseTooLarge {
                size,
                limit: self.max_bytes,
                tls: tls_alert_guess(&prefix),
            });
        }
        Ok(size)
    }

    async fn read_body(&mut self, size: i32) -> Result<BytesMut, Error> {
        let mut body = BytesMut::zeroed(size as usize);
        self.r.read_exact(&mut body).await.map_err(Error::dead)?;
        Ok(body)
    }

    async fn read_frame(&mut self) -> Result<BytesMut, Error> {
        let size = self.read_size().await?;
        self.read_body(size).await
    }

    async fn discard_body(&mut self, size: i32, scratch: &mut [u8]) -> Result<(), Error> {
        let mut remaining = size as usize;
        while remaining > 0 {
            let cap = scratch.len().min(remaining);
            let n = self
                .r
                .read(&mut scratch[..cap])
                .await
                .map_err(Error::dead)?;
            if n == 0 {
                return Err(Error::dead(std::io::ErrorKind::UnexpectedEof.into()));
            }
            remaining -= n;
        }
        Ok(())
    }
}

/// Best-effort TLS version guess for an oversize length prefix: a TLS alert
/// record starts with content type 21 and a 0x03xx protocol version.
fn tls_alert_guess(prefix: &[u8; 4]) -> Option<&'static str> {
    if prefix[0] != 21 || prefix[1] != 3 {
        return None;
    }
    Some(match prefix[2] {
        0 => "SSL v3",
        1 => "TLS v1.0",
        2 => "TLS v1.1",
        3 => "TLS v1.2",
        4 => "TLS v1.3",
        _ => "TLS",
    })
}

/// Strip the response header from a frame: the correlation id, and for
/// flexible headers a tagged-fields block. ApiVersions responses use a
/// non-flexible header even when the body is flexible; the caller accounts
/// for that when it computes `flexible_header`.
pub(crate) fn parse_response(
    mut frame: BytesMut,
    expected: i32,
    flexible_header: bool,
) -> Result<Bytes, Error> {
    if frame.len() < 4 {
        return Err(Error::NotEnoughData);
    }
    let got = i32::from_be_bytes(frame[0..4].try_into().expect("four bytes"));
    frame.advance(4);
    if got != expected {
        return Err(Error::CorrelationIdMismatch { got, expected });
    }
    if flexible_header {
        skip_tagged_fields(&mut frame)?;
    }
    Ok(frame.freeze())
}

fn skip_tagged_fields(b: &mut BytesMut) -> Result<(), Error> {
    let num = read_unsigned_varint(b)?;
    for _ in 0..num {
        let _tag = read_unsigned_varint(b)?;
        let size = read_unsigned_varint(b)? as usize;
        if b.len() < size {
            return Err(Error::NotEnoughData);
        }
        b.advance(size);
    }
    Ok(())
}

fn read_unsigned_varint(b: &mut BytesMut) -> Result<u32, Error> {
    let mut value = 0u32;
    let mut shift = 0;
    loop {
        if b.is_empty() {
            return Err(Error::NotEnoughData);
        }
        let byte = b[0];
        b.advance(1);
        value |= ((byte & 0x7f) as u32) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 28 {
            return Err(Error::Protocol(anyhow::anyhow!(
                "unsigned varint is longer than five bytes"
            )));
        }
    }
}

/// Read one deadlined frame, interruptible by the caller's token, client
/// shutdown, and connection death, stamping the idle-reaper bookkeeping.
async fn read_framed(
    core: &Arc<ConnCore>,
    reader: &Mutex<FrameReader>,
    ctx: Option<&CancellationToken>,
    read_timeout: Duration,
) -> Result<BytesMut, Error> {
    core.reading.store(true, Ordering::Relaxed);
    let res = tokio::select! {
        r = tokio::time::timeout(read_timeout, async {
            reader.lock().await.read_frame().await
        }) => match r {
            Ok(r) => r,
            Err(_) => Err(Error::timeout()),
        },
        _ = cancelled_or_pending(ctx) => Err(Error::Cancelled),
        _ = core.client.shutdown.cancelled() => Err(Error::ClientClosing),
        _ = core.death.cancelled() => Err(Error::ChosenBrokerDead),
    };
    core.last_read
        .store(core.client.now_nanos(), Ordering::Relaxed);
    core.reading.store(false, Ordering::Relaxed);
    res
}

#[allow(clippy::too_many_arguments)]
async fn read_response(
    core: &Arc<ConnCore>,
    reader: &Mutex<FrameReader>,
    ctx: Option<&CancellationToken>,
    key: i16,
    correlation_id: i32,
    flexible_header: bool,
    read_timeout: Duration,
    enqueued: Instant,
) -> Result<Bytes, Error> {
    let read_start = Instant::now();
    let res = read_framed(core, reader, ctx, read_timeout)
        .await
        .and_then(|frame| {
            let bytes = 4 + frame.len();
            parse_response(frame, correlation_id, flexible_header).map(|body| (bytes, body))
        });
    for hook in &core.client.cfg.hooks {
        hook.on_read(
            &core.meta,
            key,
            res.as_ref().map_or(0, |(bytes, _)| *bytes),
            read_start.saturating_duration_since(enqueued),
            read_start.elapsed(),
            res.as_ref().err(),
        );
    }
    res.map(|(_, body)| body)
}

/// Reader task of a normal connection: consume expectations in the order
/// the writer enqueued them, read and decode each response, and resolve its
/// promise. Any framing or correlation failure is fatal for the connection.
pub(crate) async fn handle_responses(
    core: Arc<ConnCore>,
    reader: Arc<Mutex<FrameReader>>,
    mut rx: mpsc::Receiver<PromisedResponse>,
) {
    loop {
        let pr = tokio::select! {
            pr = rx.recv() => match pr {
                Some(pr) => pr,
                None => break,
            },
            _ = core.death.cancelled() => break,
        };

        let res = read_response(
            &core,
            &reader,
            pr.ctx.as_ref(),
            pr.key,
            pr.correlation_id,
            pr.flexible_header,
            pr.read_timeout,
            pr.enqueued,
        )
        .await;

        match res {
            Err(err) => {
                (pr.promise)(Err(err));
                break;
            }
            Ok(body) => {
                let mut resp = pr.resp;
                match resp.decode_body(body) {
                    Err(err) => (pr.promise)(Err(Error::Protocol(
                        err.context("decoding response body"),
                    ))),
                    Ok(()) => {
                        if let Some(throttle) = resp.throttle() {
                            if throttle.millis > 0 {
                                if throttle.after_response {
                                    core.bump_throttle(throttle.millis);
                                }
                                let duration = Duration::from_millis(throttle.millis as u64);
                                for hook in &core.client.cfg.hooks {
                                    hook.on_throttle(&core.meta, duration, throttle.after_response);
                                }
                            }
                        }
                        (pr.promise)(Ok(resp));
                    }
                }
            }
        }
    }

    // The connection is dead or dying: nothing further will be read, so
    // every queued expectation resolves with a dead-broker error.
    core.die().await;
    rx.close();
    while let Some(pr) = rx.recv().await {
        (pr.promise)(Err(Error::ChosenBrokerDead));
    }
}

/// Reader task of a produce connection running with acks=0. A conforming
/// broker never replies, but some implementations do; if those bytes are
/// left unread the kernel eventually blocks the broker's writes, which in
/// turn stalls our produces. So: read and throw away anything that arrives.
pub(crate) async fn discard(
    core: Arc<ConnCore>,
    reader: Arc<Mutex<FrameReader>>,
    mut rx: mpsc::Receiver<PromisedResponse>,
) {
    let mut scratch = [0u8; 256];
    loop {
        core.reading.store(true, Ordering::Relaxed);
        // No deadline on the prefix: we have no idea when, if ever, the
        // broker will send anything.
        let size = tokio::select! {
            size = async { reader.lock().await.read_size().await } => size,
            _ = core.client.shutdown.cancelled() => break,
            _ = core.death.cancelled() => break,
        };
        let size = match size {
            Ok(size) => size,
            Err(err) => {
                tracing::debug!(broker = core.meta.node_id, ?err, "discard reader exiting");
                break;
            }
        };
        if core.client.shutdown.is_cancelled() {
            break;
        }

        let body_start = Instant::now();
        let res = tokio::select! {
            r = tokio::time::timeout(core.client.cfg.produce_timeout, async {
                reader.lock().await.discard_body(size, &mut scratch).await
            }) => match r {
                Ok(r) => r,
                Err(_) => Err(Error::timeout()),
            },
            _ = core.client.shutdown.cancelled() => break,
            _ = core.death.cancelled() => break,
        };
        if let Err(err) = res {
            tracing::debug!(broker = core.meta.node_id, ?err, "discard reader exiting");
            break;
        }
        core.last_read
            .store(core.client.now_nanos(), Ordering::Relaxed);
        core.reading.store(false, Ordering::Relaxed);

        for hook in &core.client.cfg.hooks {
            hook.on_read(
                &core.meta,
                0,
                4 + size as usize,
                Duration::ZERO,
                body_start.elapsed(),
                None,
            );
        }
    }
    core.die().await;
    rx.close();
    while let Some(pr) = rx.recv().await {
        (pr.promise)(Err(Error::ChosenBrokerDead));
    }
}

async fn cancelled_or_pending(ctx: Option<&CancellationToken>) {
    match ctx {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Core;
    use crate::config::Config;
    use crate::pool::BufPool;

    fn test_core() -> Arc<Core> {
        Arc::new(Core {
            cfg: Config::default(),
            shutdown: CancellationToken::new(),
            pool: BufPool::new(),
            epoch: Instant::now(),
        })
    }

    fn test_meta() -> BrokerMeta {
        BrokerMeta {
            node_id: 1,
            host: "localhost".to_string(),
            port: 9092,
            rack: None,
        }
    }

    #[test]
    fn tls_guesses() {
        assert_eq!(tls_alert_guess(&[21, 3, 1, 0]), Some("TLS v1.0"));
        assert_eq!(tls_alert_guess(&[21, 3, 3, 10]), Some("TLS v1.2"));
        assert_eq!(tls_alert_guess(&[21, 3, 4, 0]), Some("TLS v1.3"));
        assert_eq!(tls_alert_guess(&[21, 3, 9, 0]), Some("TLS"));
        assert_eq!(tls_alert_guess(&[22, 3, 3, 0]), None);
        assert_eq!(tls_alert_guess(&[21, 2, 3, 0]), None);
    }

    #[test]
    fn parse_strips_correlation_id() {
        let mut frame = BytesMut::new();
        frame.put_i32(7);
        frame.put_slice(b"body");
        let body = parse_response(frame, 7, false).unwrap();
        assert_eq!(&body[..], b"body");
    }

    #[test]
    fn parse_rejects_short_frames() {
        let mut frame = BytesMut::new();
        frame.put_slice(&[0, 0, 1]);
        assert!(matches!(
            parse_response(frame, 0, false),
            Err(Error::NotEnoughData)
        ));
    }

    #[test]
    fn parse_rejects_correlation_mismatch() {
        let mut frame = BytesMut::new();
        frame.put_i32(3);
        match parse_response(frame, 4, false) {
            Err(Error::CorrelationIdMismatch { got, expected }) => {
                assert_eq!((got, expected), (3, 4));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parse_skips_flexible_tagged_fields() {
        let mut frame = BytesMut::new();
        frame.put_i32(0);
        // One tagged field: tag 0, three bytes, then the real body.
        frame.put_slice(&[0x01, 0x00, 0x03, 0xaa, 0xbb, 0xcc]);
        frame.put_slice(b"rest");
        let body = parse_response(frame, 0, true).unwrap();
        assert_eq!(&body[..], b"rest");

        let mut frame = BytesMut::new();
        frame.put_i32(0);
        frame.put_u8(0x00); // Empty tagged-fields block.
        frame.put_slice(b"rest");
        let body = parse_response(frame, 0, true).unwrap();
        assert_eq!(&body[..], b"rest");
    }

    #[test]
    fn throttle_only_advances() {
        let core = ConnCore::new(test_meta(), test_core());
        core.bump_throttle(1_000);
        let first = core.throttle_until.load(Ordering::Relaxed);
        core.bump_throttle(10);
        assert!(core.throttle_until.load(Ordering::Relaxed) >= first);
        core.bump_throttle(5_000);
        assert!(core.throttle_until.load(Ordering::Relaxed) > first);
    }

    #[tokio::test]
    async fn die_is_idempotent() {
        let core = ConnCore::new(test_meta(), test_core());
        core.die().await;
        assert!(core.is_dead());
        core.die().await;
        assert!(core.is_dead());
    }

    #[tokio::test]
    async fn frame_reader_boundaries() {
        let (client, mut server) = tokio::io::duplex(1 << 16);
        let (r, _w) = tokio::io::split(Box::new(client) as BoxedConn);
        let mut reader = FrameReader { r, max_bytes: 8 };

        // Exactly at the limit: accepted.
        server.write_all(&8i32.to_be_bytes()).await.unwrap();
        server.write_all(&[0u8; 8]).await.unwrap();
        let frame = reader.read_frame().await.unwrap();
        assert_eq!(frame.len(), 8);

        // One past the limit: fatal.
        server.write_all(&9i32.to_be_bytes()).await.unwrap();
        match reader.read_size().await {
            Err(Error::ResponseTooLarge { size, limit, tls }) => {
                assert_eq!((size, limit), (9, 8));
                assert!(tls.is_none());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn frame_reader_rejects_negative_sizes() {
        let (client, mut server) = tokio::io::duplex(64);
        let (r, _w) = tokio::io::split(Box::new(client) as BoxedConn);
        let mut reader = FrameReader { r, max_bytes: 1024 };

        server.write_all(&(-1i32).to_be_bytes()).await.unwrap();
        assert!(matches!(
            reader.read_size().await,
            Err(Error::InvalidResponseSize { size: -1 })
        ));
    }

    #[tokio::test]
    async fn oversize_tls_alert_is_reported() {
        let (client, mut server) = tokio::io::duplex(64);
        let (r, _w) = tokio::io::split(Box::new(client) as BoxedConn);
        let mut reader = FrameReader {
            r,
            max_bytes: 100 << 20,
        };

        server.write_all(&[0x15, 0x03, 0x03, 0x0a]).await.unwrap();
        match reader.read_size().await {
            Err(Error::ResponseTooLarge { tls, .. }) => assert_eq!(tls, Some("TLS v1.2")),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
