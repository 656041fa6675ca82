//! Node lifecycle orchestration
//!
//! Ties every other module together. Background loops follow a
//! `loop { tick().await; sleep(...).await }` shape, but each observes a
//! [`CancellationToken`] instead of running forever, so shutdown can stop
//! them cleanly.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex as PLMutex;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use async_trait::async_trait;

use crate::broadcast::{retransmit_limit, BroadcastEntry, BroadcastQueues};
use crate::clock::LamportClock;
use crate::coalesce::{CoalescableEvent, DefaultCoalescer, EventCoalescer};
use crate::codec::{
    decode_body, decode_envelope, decode_relay, encode_envelope, encode_ip, encode_relay,
    filters_match, ConflictResponseMessage, Filter, JoinMessage, LeaveMessage, MessageType,
    PushPullBody, QueryMessage, QueryResponseMessage, UserEventMessage,
};
use crate::config::Config;
use crate::coordinate::CoordinateClient;
use crate::error::{MeshError, Result};
use crate::event::{EventBuffer, UserEvent};
use crate::keymanager::KeyManager;
use crate::member::{
    encode_node_meta, IntentResult, Member, MemberEventKind, MemberStatus, MemberStore,
};
use crate::query::{route, InternalQuery, QueryEngine, QueryHandle, QueryResponse, RouterOutcome, INTERNAL_PREFIX};
use crate::reaper::Reaper;
use crate::snapshot::Snapshotter;
use crate::transport::{MembershipSink, TransportHandle};

/// The node's own lifecycle state: Alive -> Left -> Shutdown, or Alive ->
/// Shutdown directly. Transitions are not reversible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeState {
    Alive = 0,
    Left = 1,
    Shutdown = 2,
}

impl NodeState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Alive,
            1 => Self::Left,
            _ => Self::Shutdown,
        }
    }
}

/// Outbound event sink handed back to the caller of [`Node::create`].
pub enum OutboundEvent {
    Member { kind: MemberEventKind, member: Member },
    User(UserEvent),
    /// A non-internal inbound query, handed to the user with a respondable
    /// handle.
    Query {
        name: String,
        payload: Vec<u8>,
        ltime: u64,
        deadline: Instant,
        handle: Arc<QueryHandle>,
    },
}

/// Everything a freshly created node needs that this crate cannot supply
/// itself.
pub struct NodeDeps {
    pub transport: Arc<dyn TransportHandle>,
}

/// Parameters for an outbound query, all optional.
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pub ack: bool,
    pub no_broadcast: bool,
    pub relay_factor: u8,
    pub filters: Vec<Filter>,
    pub timeout: Option<Duration>,
}

/// Placeholder gossip-interval hint for `Config::query_timeout`'s default
/// calculation; the real interval lives in the transport, out of scope here.
const DEFAULT_GOSSIP_INTERVAL_HINT: Duration = Duration::from_millis(200);

/// Recovering a lower query-clock than was actually in use before a crash
/// risks issuing a query id that collides with one from the prior process
/// within the same clock slot. Bump the recovered clock by this margin
/// before the query engine issues anything from it.
const QUERY_CLOCK_RECOVERY_MARGIN: u64 = 1_000;

/// Convert a deadline expressed as a peer's wall-clock unix-ms timestamp
/// into a local monotonic `Instant`, since `Instant` carries no epoch.
fn deadline_from_unix_ms(unix_ms: u64) -> Instant {
    let now_unix_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let remaining = Duration::from_millis(unix_ms.saturating_sub(now_unix_ms));
    Instant::now() + remaining
}

/// The membership-and-event engine.
pub struct Node {
    config: Config,
    state: AtomicU8,
    status_clock: LamportClock,
    event_clock: LamportClock,
    members: MemberStore,
    broadcasts: BroadcastQueues,
    events: EventBuffer,
    member_coalescer: PLMutex<EventCoalescer<DefaultCoalescer>>,
    user_coalescer: PLMutex<EventCoalescer<DefaultCoalescer>>,
    queries: QueryEngine,
    keys: KeyManager,
    coordinates: CoordinateClient,
    reaper: Reaper,
    snapshot: Option<PLMutex<Snapshotter>>,
    transport: Arc<dyn TransportHandle>,
    cancel: CancellationToken,
    event_tx: mpsc::Sender<OutboundEvent>,
}

impl Node {
    /// `Create`: validate config, build every subsystem, start background
    /// tasks.
    pub fn create(
        config: Config,
        deps: NodeDeps,
    ) -> Result<(Arc<Self>, mpsc::Receiver<OutboundEvent>)> {
        if !(2..=5).contains(&config.protocol_version) {
            return Err(MeshError::Fatal {
                message: format!(
                    "protocol version {} outside supported range [2, 5]",
                    config.protocol_version
                ),
            });
        }
        const HARD_CAP: usize = 8192;
        if config.user_event_size_limit > HARD_CAP {
            return Err(MeshError::Fatal {
                message: format!(
                    "UserEventSizeLimit {} exceeds hard cap {HARD_CAP}",
                    config.user_event_size_limit
                ),
            });
        }
        if config.node_name.is_empty() {
            return Err(MeshError::InvalidInput {
                message: "NodeName must not be empty".into(),
            });
        }

        // `recovered` carries forward what a just-opened snapshot replayed
        // from disk (status/event/query clocks, alive-set rejoin hints) so
        // it can be wired into the live node below, after construction.
        let mut recovered: Option<(u64, u64, u64, Vec<SocketAddr>)> = None;
        let snapshot = match &config.snapshot_path {
            Some(path) => {
                let snap = Snapshotter::open(path, config.snapshot_max_size_bytes).map_err(
                    |e| MeshError::Fatal {
                        message: format!("failed to open snapshot: {e}"),
                    },
                )?;
                recovered = Some((
                    snap.last_clock(),
                    snap.last_event_clock(),
                    snap.last_query_clock(),
                    snap.alive_addrs(),
                ));
                Some(PLMutex::new(snap))
            }
            None => None,
        };

        let members = MemberStore::new(config.node_name.clone(), config.bind_addr);
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(16));

        let node = Arc::new(Self {
            member_coalescer: PLMutex::new(EventCoalescer::new(
                DefaultCoalescer,
                config.coalesce_period,
                config.quiescent_period,
            )),
            user_coalescer: PLMutex::new(EventCoalescer::new(
                DefaultCoalescer,
                config.user_coalesce_period,
                config.user_quiescent_period,
            )),
            events: EventBuffer::new(config.event_buffer),
            queries: QueryEngine::new(config.query_buffer),
            keys: KeyManager::disabled(),
            coordinates: CoordinateClient::new(),
            reaper: Reaper::new(),
            snapshot,
            transport: deps.transport,
            cancel: CancellationToken::new(),
            event_tx,
            status_clock: LamportClock::new(),
            event_clock: LamportClock::new(),
            broadcasts: BroadcastQueues::new(),
            members,
            state: AtomicU8::new(NodeState::Alive as u8),
            config,
        });

        if let Some((status_clock, event_clock, query_clock, alive_addrs)) = recovered {
            node.status_clock.witness(status_clock);
            node.event_clock.witness(event_clock);
            node.queries
                .clock()
                .witness(query_clock.saturating_add(QUERY_CLOCK_RECOVERY_MARGIN));

            if !alive_addrs.is_empty() {
                let rejoin = node.clone();
                tokio::spawn(async move {
                    if let Err(e) = rejoin.join(&alive_addrs, true).await {
                        warn!(error = %e, "rejoin against snapshot-recovered addresses failed");
                    }
                });
            }
        }

        node.clone().spawn_background_tasks();
        Ok((node, event_rx))
    }

    pub fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn require_alive(&self, operation: &'static str) -> Result<()> {
        let state = self.state();
        if state != NodeState::Alive {
            return Err(MeshError::InvalidState {
                operation,
                state: match state {
                    NodeState::Alive => "alive",
                    NodeState::Left => "left",
                    NodeState::Shutdown => "shutdown",
                },
            });
        }
        Ok(())
    }

    /// `Join(addresses, ignoreOld)`.
    pub async fn join(&self, addresses: &[SocketAddr], ignore_old: bool) -> Result<usize> {
        self.require_alive("Join")?;
        if addresses.is_empty() {
            return Err(MeshError::InvalidInput {
                message: "Join requires at least one address".into(),
            });
        }
        if ignore_old {
            // The event coalescer drops events until join returns; the
            // coalescer's own quiescent window already drains independently,
            // so here we simply clear anything buffered so far.
            self.member_coalescer.lock().drain_ready();
            self.user_coalescer.lock().drain_ready();
        }
        self.transport.join(addresses, ignore_old).await
    }

    /// `Leave()`: idempotent, transitions Alive -> Leaving -> Left locally,
    /// regardless of transport health.
    pub async fn leave(&self) -> Result<()> {
        if self.state() != NodeState::Alive {
            return Ok(());
        }

        let ltime = self.status_clock.increment();
        let name = self.members.local_name().to_string();
        self.members.handle_leave_intent(&name, ltime, true);

        if let Ok(msg) = encode_envelope(
            MessageType::Leave,
            &LeaveMessage {
                name: name.clone(),
                ltime,
            },
        ) {
            let (tx, rx) = tokio::sync::oneshot::channel();
            self.broadcasts
                .membership
                .queue(BroadcastEntry::new(msg, name.clone()).with_notify(tx));
            let _ = tokio::time::timeout(self.config.broadcast_timeout, rx).await;
        }

        self.members.handle_authoritative_leave(&name, ltime);
        self.state.store(NodeState::Left as u8, Ordering::SeqCst);

        if let Some(snapshot) = &self.snapshot {
            let mut snap = snapshot.lock();
            if let Err(e) = snap.leave(self.config.rejoin_after_leave) {
                warn!(error = %e, "failed to record leave in snapshot");
            }
        }

        // Leave after the transport is already dead still succeeds locally;
        // transport errors here are intentionally not propagated.
        let _ = self.transport.broadcast_leave().await;
        Ok(())
    }

    /// `Shutdown()`: idempotent, cancels background tasks, closes the
    /// transport, flushes and closes the snapshotter.
    pub async fn shutdown(&self) {
        if self.state() == NodeState::Shutdown {
            return;
        }
        self.state.store(NodeState::Shutdown as u8, Ordering::SeqCst);
        self.cancel.cancel();
        self.transport.shutdown().await;
        if let Some(snapshot) = &self.snapshot {
            snapshot.lock().flush_warn_on_error();
        }
        info!("node shutdown complete");
    }

    pub fn members(&self) -> Vec<Member> {
        self.members.members()
    }

    pub fn num_members(&self) -> usize {
        self.members.num_members()
    }

    /// Send a user event, subject to `UserEventSizeLimit`, and gossip it to
    /// the rest of the cluster.
    pub fn send_user_event(&self, name: &str, payload: Vec<u8>, coalesce: bool) -> Result<()> {
        if payload.len() > self.config.user_event_size_limit {
            return Err(MeshError::SizeLimitExceeded {
                what: "user event payload",
                size: payload.len(),
                limit: self.config.user_event_size_limit,
            });
        }
        let ltime = self.event_clock.increment();
        let event = UserEvent {
            name: name.to_string(),
            payload,
            ltime,
            coalesce,
        };
        self.accept_user_event(event.clone());
        if let Ok(bytes) = encode_envelope(
            MessageType::UserEvent,
            &UserEventMessage {
                name: event.name.clone(),
                payload: event.payload.clone(),
                ltime: event.ltime,
                coalesce: event.coalesce,
            },
        ) {
            self.broadcasts.user_event.queue(BroadcastEntry::new(
                bytes,
                format!("{}-{}", event.name, event.ltime),
            ));
        }
        Ok(())
    }

    /// `Query(name, payload, params)`: broadcast a query and return the
    /// response tracker the caller drains acks/responses from.
    pub async fn query(
        &self,
        name: &str,
        payload: Vec<u8>,
        params: QueryParams,
    ) -> Result<Arc<QueryResponse>> {
        self.require_alive("Query")?;
        let wire_estimate = name.len() + payload.len() + 64;
        let timeout = params.timeout.unwrap_or_else(|| {
            self.config
                .query_timeout(DEFAULT_GOSSIP_INTERVAL_HINT, self.members.num_members())
        });
        let (id, response) =
            self.queries
                .prepare_query(wire_estimate, self.config.query_size_limit, timeout)?;

        let local = self.transport.local_addr();
        let deadline_unix_ms = (SystemTime::now() + timeout)
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let msg = QueryMessage {
            id,
            ltime: id,
            name: name.to_string(),
            payload,
            deadline_unix_ms,
            ack: params.ack,
            no_broadcast: params.no_broadcast,
            relay_factor: params.relay_factor,
            filters: params.filters,
            from_ip: encode_ip(local.ip()),
            from_port: local.port(),
        };
        let bytes = encode_envelope(MessageType::Query, &msg)?;
        self.broadcasts
            .query
            .queue(BroadcastEntry::new(bytes, format!("query-{id}")));
        self.tee_query_clock();
        Ok(response)
    }

    /// Tee the query-clock's current value to the snapshot, the same way
    /// [`Self::accept_user_event`] tees the event-clock.
    fn tee_query_clock(&self) {
        if let Some(snapshot) = &self.snapshot {
            let mut snap = snapshot.lock();
            if let Err(e) = snap.record(crate::snapshot::SnapshotEvent::QueryClock(
                self.queries.clock().time(),
            )) {
                warn!(error = %e, "snapshot write failed for query clock");
            }
        }
    }

    fn retransmit_limit(&self) -> u32 {
        retransmit_limit(self.members.num_members(), 3)
    }

    /// Insert into the event buffer, tee to the snapshot, and route through
    /// the user-event coalescer. Returns `true` if this was a new event
    /// (dedup against `EventBuffer`), `false` if it was a duplicate.
    fn accept_user_event(&self, event: UserEvent) -> bool {
        if !self.events.insert(event.clone()) {
            return false;
        }
        if let Some(snapshot) = &self.snapshot {
            let mut snap = snapshot.lock();
            if let Err(e) = snap.record(crate::snapshot::SnapshotEvent::UserEventClock(event.ltime)) {
                warn!(error = %e, "snapshot write failed for user event");
            }
        }
        let coalesced = self.user_coalescer.lock().offer(CoalescableEvent::User(event));
        if let Some(CoalescableEvent::User(e)) = coalesced {
            let _ = self.event_tx.try_send(OutboundEvent::User(e));
        }
        true
    }

    /// Tee a membership transition to the snapshot and route it through the
    /// member coalescer, delivering it to the user if it passes straight
    /// through.
    fn emit_member_event(&self, kind: MemberEventKind, member: Member) {
        if let Some(snapshot) = &self.snapshot {
            let addr = matches!(kind, MemberEventKind::Join | MemberEventKind::Update)
                .then(|| member.addr.to_string());
            let mut snap = snapshot.lock();
            if let Err(e) = snap.record(crate::snapshot::SnapshotEvent::Member {
                kind,
                name: member.name.clone(),
                addr,
            }) {
                warn!(error = %e, "snapshot write failed for member event");
            }
        }
        let coalesced = self.member_coalescer.lock().offer(CoalescableEvent::Member {
            kind,
            name: member.name.clone(),
        });
        if coalesced.is_some() {
            let _ = self.event_tx.try_send(OutboundEvent::Member { kind, member });
        }
    }

    /// Process a decoded `IntentResult` against the broadcast queue and the
    /// event sink: rebroadcast the original envelope when told to, and
    /// surface the one event kind an intent can itself emit (a leave intent
    /// against an already-Failed member).
    fn apply_intent_result(&self, result: IntentResult, name: &str, raw: &[u8]) {
        match result {
            IntentResult::Stale => {}
            IntentResult::Ignored { rebroadcast } => {
                if rebroadcast {
                    self.broadcasts
                        .membership
                        .queue(BroadcastEntry::new(raw.to_vec(), name.to_string()));
                }
            }
            IntentResult::Applied { rebroadcast, event } => {
                if rebroadcast {
                    self.broadcasts
                        .membership
                        .queue(BroadcastEntry::new(raw.to_vec(), name.to_string()));
                }
                if let Some(kind) = event {
                    if let Some(member) = self.members.get(name) {
                        self.emit_member_event(kind, member);
                    }
                }
            }
        }
    }

    /// Refute a leave intent naming this still-Alive node by broadcasting a
    /// fresher join intent.
    fn refute_leave(&self) {
        let ltime = self.status_clock.increment();
        let name = self.members.local_name().to_string();
        if let Ok(msg) = encode_envelope(
            MessageType::Join,
            &JoinMessage {
                name: name.clone(),
                ltime,
            },
        ) {
            self.broadcasts.membership.queue(BroadcastEntry::new(msg, name));
        }
    }

    async fn unicast_query_ack(&self, id: u64, origin: SocketAddr) {
        let local = self.transport.local_addr();
        let msg = QueryResponseMessage {
            id,
            from_ip: encode_ip(local.ip()),
            from_port: local.port(),
            payload: Vec::new(),
            ack: true,
        };
        if let Ok(bytes) = encode_envelope(MessageType::QueryResponse, &msg) {
            let _ = self.transport.send_to(origin, bytes).await;
        }
    }

    /// Unicast an internal-query response back to `origin`, fanning out
    /// `relay_factor` redundant copies the way [`QueryHandle::respond`]
    /// does for user-handled queries.
    async fn unicast_query_response(
        &self,
        id: u64,
        origin: SocketAddr,
        payload: Vec<u8>,
        relay_factor: u8,
    ) {
        if payload.len() > self.config.query_response_size_limit {
            warn!(
                id,
                size = payload.len(),
                "internal query response exceeds QueryResponseSizeLimit, dropping"
            );
            return;
        }
        let local = self.transport.local_addr();
        let msg = QueryResponseMessage {
            id,
            from_ip: encode_ip(local.ip()),
            from_port: local.port(),
            payload,
            ack: false,
        };
        let Ok(bytes) = encode_envelope(MessageType::QueryResponse, &msg) else {
            return;
        };
        let _ = self.transport.send_to(origin, bytes.clone()).await;
        if relay_factor > 0 {
            for m in self
                .members
                .random_others(relay_factor as usize, &[self.members.local_name()])
            {
                if let Ok(relayed) = encode_relay(origin, &m.name, bytes.clone()) {
                    let _ = self.transport.send_to(m.addr, relayed).await;
                }
            }
        }
    }

    /// Resolve a conflict naming this node's own name: query every other
    /// node for its record of the name, tally the addresses that agree with
    /// this node's own, and shut down on a lost majority vote.
    async fn resolve_self_conflict(&self, other: &str) {
        let self_name = self.members.local_name().to_string();
        let response = match self
            .query(
                &format!("{INTERNAL_PREFIX}conflict"),
                self_name.into_bytes(),
                QueryParams {
                    timeout: Some(crate::conflict::DEFAULT_CONFLICT_TIMEOUT),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "failed to send self-conflict query");
                return;
            }
        };
        let Some(mut responses_rx) = response.take_responses() else {
            return;
        };

        let mut addrs = Vec::new();
        let sleep_fut = sleep(crate::conflict::DEFAULT_CONFLICT_TIMEOUT);
        tokio::pin!(sleep_fut);
        loop {
            tokio::select! {
                _ = &mut sleep_fut => break,
                item = responses_rx.recv() => {
                    match item {
                        Some(item) => {
                            if let Ok(resp) = decode_body::<ConflictResponseMessage>(&item.payload) {
                                if let Ok(addr) = resp.addr() {
                                    addrs.push(addr);
                                }
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        let local_addr = self.transport.local_addr();
        if crate::conflict::resolve(local_addr, &addrs) == crate::conflict::ConflictOutcome::Shutdown
        {
            warn!(other, "lost name conflict resolution vote; shutting down");
            self.shutdown().await;
        }
    }

    fn spawn_background_tasks(self: Arc<Self>) {
        let reaper = self.clone();
        tokio::spawn(async move { reaper.run_reaper_loop().await });

        let deadlines = self.clone();
        tokio::spawn(async move { deadlines.run_query_deadline_loop().await });

        let coalesce = self.clone();
        tokio::spawn(async move { coalesce.run_coalesce_drain_loop().await });

        if self.snapshot.is_some() {
            let snapshotter = self.clone();
            tokio::spawn(async move { snapshotter.run_snapshot_clock_loop().await });
        }
    }

    async fn run_reaper_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = sleep(self.config.reap_interval) => {}
            }
            let outcome = self.reaper.sweep(
                &self.members,
                &self.coordinates,
                self.config.reconnect_timeout,
                self.config.tombstone_timeout,
                self.config.reconnect_interval,
            );
            for name in outcome.reaped {
                info!(name, "member reaped");
            }
            for member in outcome.reconnect_candidates {
                if let Err(e) = self.transport.reconnect(&member.name, member.addr).await {
                    warn!(name = %member.name, error = %e, "reconnect attempt failed");
                }
            }
            self.members.expire_intents(self.config.recent_intent_timeout);
        }
    }

    async fn run_query_deadline_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = sleep(Duration::from_millis(250)) => {}
            }
            self.queries.close_expired();
        }
    }

    /// Drain both coalescers on their shared quiescent cadence, re-fetching
    /// the current `Member` record for drained member events since the
    /// coalescer only retains the name.
    async fn run_coalesce_drain_loop(self: Arc<Self>) {
        let interval = self
            .config
            .quiescent_period
            .min(self.config.user_quiescent_period)
            .max(Duration::from_millis(10));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = sleep(interval) => {}
            }
            for event in self.member_coalescer.lock().drain_ready() {
                if let CoalescableEvent::Member { kind, name } = event {
                    if let Some(member) = self.members.get(&name) {
                        let _ = self.event_tx.try_send(OutboundEvent::Member { kind, member });
                    }
                }
            }
            for event in self.user_coalescer.lock().drain_ready() {
                if let CoalescableEvent::User(e) = event {
                    let _ = self.event_tx.try_send(OutboundEvent::User(e));
                }
            }
        }
    }

    async fn run_snapshot_clock_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = sleep(Duration::from_secs(30)) => {}
            }
            if let Some(snapshot) = &self.snapshot {
                let mut snap = snapshot.lock();
                if let Err(e) = snap.record(crate::snapshot::SnapshotEvent::StatusClock(
                    self.status_clock.time(),
                )) {
                    warn!(error = %e, "periodic snapshot clock flush failed");
                    return;
                }
            }
        }
    }

    #[cfg(test)]
    fn force_cancel_for_test(&self) {
        self.cancel.cancel();
    }
}

/// The node is the transport's callback target; see `transport.rs`'s module
/// doc for why the ownership only runs one way.
#[async_trait]
impl MembershipSink for Node {
    fn node_meta(&self, limit: usize) -> Result<Vec<u8>> {
        encode_node_meta(&self.config.tags, self.config.protocol_version, limit)
    }

    async fn notify_msg(&self, bytes: &[u8]) {
        let Ok(envelope) = decode_envelope(bytes) else {
            return;
        };
        match envelope.kind {
            MessageType::Join => {
                if let Ok(msg) = decode_body::<JoinMessage>(&envelope.body) {
                    self.status_clock.witness(msg.ltime);
                    let result = self.members.handle_join_intent(&msg.name, msg.ltime);
                    self.apply_intent_result(result, &msg.name, bytes);
                }
            }
            MessageType::Leave => {
                if let Ok(msg) = decode_body::<LeaveMessage>(&envelope.body) {
                    self.status_clock.witness(msg.ltime);
                    let is_local = msg.name == self.members.local_name();
                    let result = self.members.handle_leave_intent(&msg.name, msg.ltime, is_local);
                    if is_local && matches!(result, IntentResult::Ignored { rebroadcast: false }) {
                        self.refute_leave();
                    } else {
                        self.apply_intent_result(result, &msg.name, bytes);
                    }
                }
            }
            MessageType::UserEvent => {
                if let Ok(msg) = decode_body::<UserEventMessage>(&envelope.body) {
                    self.event_clock.witness(msg.ltime);
                    let event = UserEvent {
                        name: msg.name.clone(),
                        payload: msg.payload.clone(),
                        ltime: msg.ltime,
                        coalesce: msg.coalesce,
                    };
                    if self.accept_user_event(event) {
                        self.broadcasts.user_event.queue(BroadcastEntry::new(
                            bytes.to_vec(),
                            format!("{}-{}", msg.name, msg.ltime),
                        ));
                    }
                }
            }
            MessageType::Query => {
                if let Ok(msg) = decode_body::<QueryMessage>(&envelope.body) {
                    if !self.queries.accept_inbound(msg.ltime, msg.id) {
                        return;
                    }
                    self.tee_query_clock();
                    if !msg.no_broadcast {
                        self.broadcasts
                            .query
                            .queue(BroadcastEntry::new(bytes.to_vec(), format!("query-{}", msg.id)));
                    }
                    if !filters_match(&msg.filters, self.members.local_name(), &self.config.tags) {
                        return;
                    }
                    let Ok(origin) = msg.from_addr() else {
                        return;
                    };
                    if msg.ack {
                        self.unicast_query_ack(msg.id, origin).await;
                    }
                    if let Some(internal) = InternalQuery::classify(&msg.name) {
                        let outcome = route(
                            internal,
                            &msg.payload,
                            self.members.local_name(),
                            &self.members,
                            &self.keys,
                        );
                        if let RouterOutcome::Respond(body) = outcome {
                            self.unicast_query_response(msg.id, origin, body, msg.relay_factor)
                                .await;
                        }
                    } else {
                        let local_name = self.members.local_name().to_string();
                        let relay_targets = self
                            .members
                            .random_others(msg.relay_factor as usize, &[&local_name])
                            .into_iter()
                            .map(|m| (m.name, m.addr))
                            .collect();
                        let deadline = deadline_from_unix_ms(msg.deadline_unix_ms);
                        let handle = Arc::new(QueryHandle::new(
                            self.transport.clone(),
                            msg.id,
                            origin,
                            relay_targets,
                            self.config.query_response_size_limit,
                            deadline,
                        ));
                        let _ = self.event_tx.try_send(OutboundEvent::Query {
                            name: msg.name.clone(),
                            payload: msg.payload.clone(),
                            ltime: msg.ltime,
                            deadline,
                            handle,
                        });
                    }
                }
            }
            MessageType::QueryResponse => {
                if let Ok(msg) = decode_body::<QueryResponseMessage>(&envelope.body) {
                    if let (Ok(from), Some(resp)) =
                        (msg.from_addr(), self.queries.response_for(msg.id))
                    {
                        if msg.ack {
                            resp.deliver_ack(from);
                        } else {
                            resp.deliver_response(from, msg.payload);
                        }
                    }
                }
            }
            MessageType::Relay => {
                if let Ok((header, inner)) = decode_relay(&envelope.body) {
                    if let Ok(dest) = header.dest_addr() {
                        let _ = self.transport.send_to(dest, inner).await;
                    }
                }
            }
            _ => {}
        }
    }

    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let retransmit = self.retransmit_limit();
        let mut out = self.broadcasts.membership.get_broadcasts(overhead, limit, retransmit);
        out.extend(self.broadcasts.user_event.get_broadcasts(overhead, limit, retransmit));
        out.extend(self.broadcasts.query.get_broadcasts(overhead, limit, retransmit));
        out
    }

    fn local_state(&self, _join: bool) -> PushPullBody {
        let member_clocks = self
            .members
            .members()
            .into_iter()
            .map(|m| (m.name, m.status_ltime))
            .collect();
        PushPullBody {
            status_ltime: self.status_clock.time(),
            member_clocks,
            left_members: self.members.left_names(),
            event_ltime: self.event_clock.time(),
            recent_events: Vec::new(),
            query_ltime: self.queries.clock().time(),
        }
    }

    async fn merge_remote_state(&self, remote: PushPullBody, _join: bool) {
        self.status_clock.witness(remote.status_ltime);
        self.event_clock.witness(remote.event_ltime);
        self.queries.clock().witness(remote.query_ltime);
        for (name, ltime) in remote.member_clocks {
            let result = self.members.handle_join_intent(&name, ltime);
            if let IntentResult::Applied { event: Some(kind), .. } = result {
                if let Some(member) = self.members.get(&name) {
                    self.emit_member_event(kind, member);
                }
            }
        }
        for name in remote.left_members {
            let ltime = self.status_clock.time();
            let result = self.members.handle_leave_intent(&name, ltime, false);
            if let IntentResult::Applied { event: Some(kind), .. } = result {
                if let Some(member) = self.members.get(&name) {
                    self.emit_member_event(kind, member);
                }
            }
        }
    }

    async fn notify_join(&self, name: &str, addr: SocketAddr) {
        let member = self.members.get(name).unwrap_or_else(|| Member::new(name, addr));
        self.emit_member_event(MemberEventKind::Join, member);
    }

    async fn notify_leave(&self, name: &str) {
        let was_leaving = self.members.status_of(name) == MemberStatus::Leaving;
        let ltime = self.status_clock.time();
        let kind = if was_leaving {
            self.members.handle_authoritative_leave(name, ltime)
        } else {
            self.members.handle_authoritative_fail(name, ltime)
        };
        self.reaper.note_departure(name);
        if let Some(member) = self.members.get(name) {
            self.emit_member_event(kind, member);
        }
    }

    async fn notify_update(&self, name: &str, _addr: SocketAddr) {
        if let Some(member) = self.members.get(name) {
            self.emit_member_event(MemberEventKind::Update, member);
        }
    }

    async fn notify_conflict(&self, existing: &str, other: &str) {
        if existing == self.members.local_name() && self.config.enable_name_conflict_resolution {
            self.resolve_self_conflict(other).await;
        } else {
            crate::conflict::log_remote_conflict(existing, other);
        }
    }

    async fn notify_alive(&self, name: &str, addr: SocketAddr) -> Result<()> {
        if self.reaper.check_flap(name, self.config.flap_timeout) {
            warn!(name, "member rejoined within FlapTimeout of its last departure");
        }
        let ltime = self.status_clock.increment();
        self.members.handle_authoritative_join(name, addr, ltime);
        Ok(())
    }

    async fn notify_ping_complete(&self, name: &str, rtt_ms: f64, _ack_payload: &[u8]) {
        if !self.config.disable_coordinates {
            self.coordinates.update(name, rtt_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NullTransport {
        addr: SocketAddr,
    }

    #[async_trait]
    impl TransportHandle for NullTransport {
        async fn join(&self, addresses: &[SocketAddr], _ignore_old: bool) -> Result<usize> {
            Ok(addresses.len())
        }
        async fn broadcast_leave(&self) -> Result<()> {
            Ok(())
        }
        async fn shutdown(&self) {}
        fn local_addr(&self) -> SocketAddr {
            self.addr
        }
        async fn send_to(&self, _addr: SocketAddr, _bytes: Vec<u8>) -> Result<()> {
            Ok(())
        }
        async fn reconnect(&self, _name: &str, _addr: SocketAddr) -> Result<()> {
            Ok(())
        }
    }

    fn test_config() -> Config {
        let mut cfg = Config::default();
        cfg.node_name = "self".into();
        cfg.bind_addr = "127.0.0.1:7946".parse().unwrap();
        cfg.reap_interval = Duration::from_secs(3600);
        cfg
    }

    #[tokio::test]
    async fn create_rejects_empty_node_name() {
        let mut cfg = test_config();
        cfg.node_name.clear();
        let deps = NodeDeps {
            transport: Arc::new(NullTransport {
                addr: cfg.bind_addr,
            }),
        };
        let err = Node::create(cfg, deps).unwrap_err();
        assert!(matches!(err, MeshError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn leave_is_idempotent_and_transitions_to_left() {
        let cfg = test_config();
        let deps = NodeDeps {
            transport: Arc::new(NullTransport {
                addr: cfg.bind_addr,
            }),
        };
        let (node, _rx) = Node::create(cfg, deps).unwrap();
        node.leave().await.unwrap();
        assert_eq!(node.state(), NodeState::Left);
        node.leave().await.unwrap();
        assert_eq!(node.state(), NodeState::Left);
        node.force_cancel_for_test();
    }

    #[tokio::test]
    async fn join_fails_with_empty_address_list() {
        let cfg = test_config();
        let deps = NodeDeps {
            transport: Arc::new(NullTransport {
                addr: cfg.bind_addr,
            }),
        };
        let (node, _rx) = Node::create(cfg, deps).unwrap();
        let err = node.join(&[], false).await.unwrap_err();
        assert!(matches!(err, MeshError::InvalidInput { .. }));
        node.force_cancel_for_test();
    }

    #[tokio::test]
    async fn send_user_event_rejects_oversized_payload() {
        let mut cfg = test_config();
        cfg.user_event_size_limit = 4;
        let deps = NodeDeps {
            transport: Arc::new(NullTransport {
                addr: cfg.bind_addr,
            }),
        };
        let (node, _rx) = Node::create(cfg, deps).unwrap();
        let err = node
            .send_user_event("deploy", vec![0u8; 5], false)
            .unwrap_err();
        assert!(matches!(err, MeshError::SizeLimitExceeded { .. }));
        node.force_cancel_for_test();
    }

    #[tokio::test]
    async fn send_user_event_queues_a_broadcast() {
        let cfg = test_config();
        let deps = NodeDeps {
            transport: Arc::new(NullTransport {
                addr: cfg.bind_addr,
            }),
        };
        let (node, _rx) = Node::create(cfg, deps).unwrap();
        node.send_user_event("deploy", b"v1".to_vec(), false).unwrap();
        let out = node.get_broadcasts(0, 65536);
        assert!(!out.is_empty());
        node.force_cancel_for_test();
    }

    #[tokio::test]
    async fn notify_msg_join_applies_the_intent_to_the_member_store() {
        let cfg = test_config();
        let deps = NodeDeps {
            transport: Arc::new(NullTransport {
                addr: cfg.bind_addr,
            }),
        };
        let (node, _rx) = Node::create(cfg, deps).unwrap();
        let msg = encode_envelope(
            MessageType::Join,
            &JoinMessage {
                name: "peer-1".into(),
                ltime: 1,
            },
        )
        .unwrap();
        node.notify_msg(&msg).await;
        assert_eq!(node.members().len(), 2);
        node.force_cancel_for_test();
    }

    #[tokio::test]
    async fn notify_msg_join_rebroadcasts_the_original_envelope() {
        let cfg = test_config();
        let deps = NodeDeps {
            transport: Arc::new(NullTransport {
                addr: cfg.bind_addr,
            }),
        };
        let (node, _rx) = Node::create(cfg, deps).unwrap();
        let msg = encode_envelope(
            MessageType::Join,
            &JoinMessage {
                name: "peer-1".into(),
                ltime: 1,
            },
        )
        .unwrap();
        node.notify_msg(&msg).await;
        let out = node.get_broadcasts(0, 65536);
        assert!(out.contains(&msg));
        node.force_cancel_for_test();
    }

    #[tokio::test]
    async fn notify_msg_leave_naming_local_alive_node_triggers_refutation() {
        let cfg = test_config();
        let deps = NodeDeps {
            transport: Arc::new(NullTransport {
                addr: cfg.bind_addr,
            }),
        };
        let (node, _rx) = Node::create(cfg, deps).unwrap();
        let msg = encode_envelope(
            MessageType::Leave,
            &LeaveMessage {
                name: "self".into(),
                ltime: 999,
            },
        )
        .unwrap();
        node.notify_msg(&msg).await;
        assert_eq!(node.members.status_of("self"), MemberStatus::Alive);
        let out = node.get_broadcasts(0, 65536);
        assert!(!out.is_empty());
        node.force_cancel_for_test();
    }

    #[tokio::test]
    async fn notify_msg_ignores_garbage_instead_of_panicking() {
        let cfg = test_config();
        let deps = NodeDeps {
            transport: Arc::new(NullTransport {
                addr: cfg.bind_addr,
            }),
        };
        let (node, _rx) = Node::create(cfg, deps).unwrap();
        node.notify_msg(&[]).await;
        node.notify_msg(&[250, 1, 2, 3]).await;
        assert_eq!(node.members().len(), 1);
        node.force_cancel_for_test();
    }

    #[tokio::test]
    async fn notify_leave_for_alive_member_marks_it_failed() {
        let cfg = test_config();
        let deps = NodeDeps {
            transport: Arc::new(NullTransport {
                addr: cfg.bind_addr,
            }),
        };
        let (node, _rx) = Node::create(cfg, deps).unwrap();
        node.members.handle_authoritative_join("peer", "10.0.0.2:7946".parse().unwrap(), 1);
        node.notify_leave("peer").await;
        assert_eq!(node.members.status_of("peer"), MemberStatus::Failed);
        node.force_cancel_for_test();
    }

    #[tokio::test]
    async fn query_rejects_oversized_payload() {
        let mut cfg = test_config();
        cfg.query_size_limit = 4;
        let deps = NodeDeps {
            transport: Arc::new(NullTransport {
                addr: cfg.bind_addr,
            }),
        };
        let (node, _rx) = Node::create(cfg, deps).unwrap();
        let err = node
            .query("deploy", vec![0u8; 64], QueryParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::SizeLimitExceeded { .. }));
        node.force_cancel_for_test();
    }

    #[tokio::test]
    async fn query_queues_a_broadcast_and_registers_a_response() {
        let cfg = test_config();
        let deps = NodeDeps {
            transport: Arc::new(NullTransport {
                addr: cfg.bind_addr,
            }),
        };
        let (node, _rx) = Node::create(cfg, deps).unwrap();
        let response = node
            .query("deploy", b"v1".to_vec(), QueryParams::default())
            .await
            .unwrap();
        assert!(!response.finished());
        let out = node.get_broadcasts(0, 65536);
        assert!(!out.is_empty());
        node.force_cancel_for_test();
    }

    #[tokio::test]
    async fn notify_msg_query_response_delivers_to_the_registered_response() {
        let cfg = test_config();
        let deps = NodeDeps {
            transport: Arc::new(NullTransport {
                addr: cfg.bind_addr,
            }),
        };
        let (node, _rx) = Node::create(cfg, deps).unwrap();
        let response = node
            .query("deploy", b"v1".to_vec(), QueryParams::default())
            .await
            .unwrap();
        let mut rx = response.take_responses().unwrap();

        let out = node.get_broadcasts(0, 65536);
        let envelope = decode_envelope(&out[0]).unwrap();
        let query: QueryMessage = decode_body(&envelope.body).unwrap();

        let reply = encode_envelope(
            MessageType::QueryResponse,
            &QueryResponseMessage {
                id: query.id,
                from_ip: vec![10, 0, 0, 9],
                from_port: 7946,
                payload: b"ack".to_vec(),
                ack: false,
            },
        )
        .unwrap();
        node.notify_msg(&reply).await;
        let item = rx.try_recv().unwrap();
        assert_eq!(item.payload, b"ack");
        node.force_cancel_for_test();
    }

    #[test]
    fn local_state_reflects_current_clocks_and_membership() {
        let cfg = test_config();
        let deps = NodeDeps {
            transport: Arc::new(NullTransport {
                addr: cfg.bind_addr,
            }),
        };
        let (node, _rx) = Node::create(cfg, deps).unwrap();
        let state = node.local_state(false);
        assert_eq!(state.member_clocks.len(), 1);
        assert_eq!(state.status_ltime, node.status_clock.time());
        node.force_cancel_for_test();
    }
}
