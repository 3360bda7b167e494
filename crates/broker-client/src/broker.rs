use crate::client::Core;
use crate::config::Acks;
use crate::connection::{ConnCore, Connection, PromisedResponse, Slot};
use crate::error::Error;
use crate::hooks::BrokerMeta;
use crate::request::{Promise, Request, Response};
use crate::sasl;
use crate::versions::API_VERSIONS_KEY;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A request queued toward a broker, destroyed once its promise has been
/// invoked exactly once.
pub(crate) struct PromisedRequest {
    ctx: Option<CancellationToken>,
    req: Box<dyn Request>,
    promise: Promise,
    enqueued: Instant,
}

/// Identity of a broker as seen by this client.
///
/// Two identities are equal only when every field matches, with absent
/// racks comparing equal to absent. Seed brokers carry synthetic node ids
/// of `i32::MIN + seed_index` so they can never collide with ids discovered
/// from metadata; an unknown controller is node `-1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerId {
    pub node: i32,
    pub host: String,
    pub port: u16,
    pub rack: Option<String>,
}

impl BrokerId {
    /// The metadata snapshot handed to hooks and connections.
    pub(crate) fn meta(&self) -> BrokerMeta {
        BrokerMeta {
            node_id: self.node,
            host: self.host.clone(),
            port: self.port,
            rack: self.rack.clone(),
        }
    }
}

/// One logical broker: up to three lazily-created connections (normal,
/// produce, fetch), a bounded inbound queue, and a single writer task that
/// serializes every outbound request across them.
///
/// A `Broker` lives until [`Broker::stop_forever`]; a dead broker fails all
/// submissions with [`Error::ChosenBrokerDead`].
pub struct Broker {
    id: BrokerId,
    client: Arc<Core>,
    dead: AtomicBool,
    // Submitters hold the read half across the dead-flag check and the
    // send; the stop path sets the flag, then takes the write half to drop
    // the sender. No submission can race the close.
    reqs: RwLock<Option<mpsc::Sender<PromisedRequest>>>,
    // Live connection registry for the idle reaper. This mutex serializes
    // reaping against new-connection installation.
    cxns: Mutex<[Option<Arc<ConnCore>>; 3]>,
}

impl Broker {
    pub(crate) fn spawn(client: Arc<Core>, id: BrokerId) -> Arc<Broker> {
        let (tx, rx) = mpsc::channel(10);
        let broker = Arc::new(Broker {
            id,
            client,
            dead: AtomicBool::new(false),
            reqs: RwLock::new(Some(tx)),
            cxns: Mutex::new([None, None, None]),
        });
        tokio::spawn(Broker::run(broker.clone(), rx));
        broker
    }

    pub fn id(&self) -> &BrokerId {
        &self.id
    }

    /// Queue a request. The promise is invoked exactly once, off the writer
    /// task, with the decoded response or the failure. A `None` ctx marks
    /// the request non-cancellable.
    pub async fn submit(
        &self,
        ctx: Option<CancellationToken>,
        req: Box<dyn Request>,
        promise: Promise,
    ) {
        let guard = self.reqs.read().await;
        if self.dead.load(Ordering::Acquire) {
            drop(guard);
            promise(Err(Error::ChosenBrokerDead));
            return;
        }
        let Some(tx) = guard.as_ref() else {
            drop(guard);
            promise(Err(Error::ChosenBrokerDead));
            return;
        };
        let pr = PromisedRequest {
            ctx,
            req,
            promise,
            enqueued: Instant::now(),
        };
        if let Err(mpsc::error::SendError(pr)) = tx.send(pr).await {
            (pr.promise)(Err(Error::ChosenBrokerDead));
        }
    }

    /// Submit and block for the response.
    pub async fn wait_response(
        &self,
        ctx: Option<CancellationToken>,
        req: Box<dyn Request>,
    ) -> Result<Box<dyn Response>, Error> {
        let (tx, rx) = oneshot::channel();
        self.submit(
            ctx,
            req,
            Box::new(move |res| {
                let _ = tx.send(res);
            }),
        )
        .await;
        match rx.await {
            Ok(res) => res,
            Err(_) => Err(Error::ChosenBrokerDead),
        }
    }

    /// Permanently stop this broker. Idempotent. Every request already
    /// queued (and every later submission) fails with `ChosenBrokerDead`;
    /// the writer task kills all connections and exits.
    pub fn stop_forever(self: &Arc<Self>) {
        if self.dead.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(broker = self.id.node, "stopping broker forever");
        // The writer task drains everything already queued. Closing the
        // channel must wait for in-flight submitters, who hold the read
        // half of the lock; it cannot run inline or a full queue would
        // deadlock a caller invoking stop from a submission path.
        let broker = self.clone();
        tokio::spawn(async move {
            *broker.reqs.write().await = None;
        });
    }

    /// Kill idle connections. Called by the client's reaper.
    pub(crate) async fn reap_connections(&self, idle: std::time::Duration) {
        let cxns = self.cxns.lock().await;
        for core in cxns.iter().flatten() {
            if !core.is_dead() && core.should_reap(idle) {
                tracing::debug!(broker = self.id.node, "reaping idle connection");
                core.die().await;
            }
        }
    }

    /// The writer task: drain the queue serially, routing each request to
    /// its slot's connection and pipelining the response expectation to
    /// that connection's reader.
    async fn run(broker: Arc<Broker>, mut rx: mpsc::Receiver<PromisedRequest>) {
        let mut slots: [Option<Connection>; 3] = [None, None, None];
        while let Some(pr) = rx.recv().await {
            if broker.dead.load(Ordering::Acquire) {
                (pr.promise)(Err(Error::ChosenBrokerDead));
                continue;
            }
            broker.handle_request(&mut slots, pr).await;
        }
        for slot in slots.iter_mut() {
            if let Some(cxn) = slot.take() {
                cxn.core().die().await;
            }
        }
        *broker.cxns.lock().await = [None, None, None];
        tracing::debug!(broker = broker.id.node, "broker writer task exited");
    }

    async fn handle_request(&self, slots: &mut [Option<Connection>; 3], pr: PromisedRequest) {
        let PromisedRequest {
            ctx,
            mut req,
            promise,
            enqueued,
        } = pr;
        let key = req.key();
        let slot = Slot::for_key(key);

        let cxn = match self.load_connection(slots, slot, ctx.as_ref()).await {
            Ok(cxn) => cxn,
            Err(err) => {
                promise(Err(err));
                return;
            }
        };
        let cfg = &self.client.cfg;

        // The key must be inside our table range and, when the user
        // configured a max-versions allow-list, present in it.
        if key < 0
            || key as usize >= cxn.versions().len()
            || cfg.max_versions.as_ref().is_some_and(|t| !t.has_key(key))
        {
            promise(Err(Error::UnknownRequestKey(key)));
            return;
        }

        // Start from the request's own max, clamp to the user's max and the
        // broker's learned max, then check the user's floor.
        let mut version = req.max_version();
        if let Some(maxes) = &cfg.max_versions {
            version = version.min(maxes.lookup(key));
        }
        let learned = cxn.versions().lookup(key);
        if learned >= 0 {
            version = version.min(learned);
        }
        if let Some(mins) = &cfg.min_versions {
            let min = mins.lookup(key);
            if min >= 0 && version < min {
                promise(Err(Error::BrokerTooOld {
                    key,
                    min,
                    max: version,
                }));
                return;
            }
        }
        req.set_version(version);

        // KIP-368: the session lifetime lapsed, so re-authenticate in place
        // on the same socket before this write.
        if cxn.reauth_due() {
            tracing::debug!(broker = self.id.node, "sasl session expired, re-authenticating");
            if let Err(err) = sasl::authenticate(cxn).await {
                tracing::warn!(broker = self.id.node, ?err, "sasl re-authentication failed");
                cxn.core().die().await;
                slots[slot.index()] = None;
                promise(Err(err));
                return;
            }
        }

        // Last chance to honor cancellation before bytes hit the socket.
        if ctx.as_ref().is_some_and(|t| t.is_cancelled()) {
            promise(Err(Error::Cancelled));
            return;
        }

        if let Some(produce) = req.as_produce() {
            produce.set_acks(cfg.acks.value());
            if cfg.acks == Acks::None {
                produce.set_timeout_millis(cfg.produce_timeout.as_millis() as i32);
            }
        }
        // Acks-0 produce gets no reply. Key 0 always routes to the produce
        // slot, whose reader under acks 0 discards bytes rather than
        // parsing responses, so no expectation may be queued there.
        let no_response = key == 0 && cfg.acks == Acks::None;

        let (read_timeout, write_timeout) = (cfg.conn_timeouts)(req.as_ref());
        match cxn
            .write_request(ctx.as_ref(), req.as_ref(), write_timeout, enqueued)
            .await
        {
            Err(err) => {
                cxn.core().die().await;
                slots[slot.index()] = None;
                promise(Err(err));
            }
            Ok(correlation_id) => {
                if no_response {
                    // Acks-0 produce: the broker will not reply, so resolve
                    // immediately with an empty response at the version the
                    // request went out with.
                    promise(Ok(req.response()));
                    return;
                }
                // ApiVersions responses use a non-flexible header even when
                // the body is flexible.
                let flexible_header = req.is_flexible() && key != API_VERSIONS_KEY;
                let expectation = PromisedResponse {
                    ctx,
                    key,
                    correlation_id,
                    read_timeout,
                    flexible_header,
                    resp: req.response(),
                    promise,
                    enqueued,
                };
                cxn.core().send_expectation(expectation).await;
            }
        }
    }

    /// Return the slot's connection, dialing a fresh one if the slot is
    /// empty or its connection has died.
    async fn load_connection<'a>(
        &self,
        slots: &'a mut [Option<Connection>; 3],
        slot: Slot,
        ctx: Option<&CancellationToken>,
    ) -> Result<&'a mut Connection, Error> {
        let entry = &mut slots[slot.index()];
        let stale = entry.as_ref().map_or(true, |cxn| cxn.core().is_dead());
        if stale {
            let cxn =
                Connection::connect(self.client.clone(), self.id.meta(), slot, ctx).await?;
            let mut registry = self.cxns.lock().await;
            registry[slot.index()] = Some(cxn.core().clone());
            *entry = Some(cxn);
        }
        Ok(entry.as_mut().expect("just installed"))
    }
}
