//! Polres store: the async engine loop.
//!
//! A single task owns the [`CalcGraph`]; producers talk to it over an mpsc channel. Resource
//! updates are coalesced per key between drains, the graph is flushed on a ticker, and every
//! flush that changed something publishes a fresh [`ResolvedSnapshot`] through `ArcSwap`.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use polres_calc::{CalcGraph, EndpointTierListener, TierInfo};
use polres_core::{
    Endpoint, EndpointBgpPeer, EndpointComputedData, EndpointComputedDataKind, EndpointKey, PolicyKey, ResourceKey,
    SyncStatus, Update, WorkloadEndpoint,
};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Engine loop settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Channel capacity, also the coalescer size that forces an early drain.
    pub queue_cap: usize,
    pub flush_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self { Self { queue_cap: 2048, flush_interval: Duration::from_millis(10) } }
}

impl EngineConfig {
    /// Defaults overridden by `POLRES_QUEUE_CAP` and `POLRES_FLUSH_MS`; unparsable values are ignored.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(cap) = std::env::var("POLRES_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()) {
            cfg.queue_cap = cap.max(1);
        }
        if let Some(ms) = std::env::var("POLRES_FLUSH_MS").ok().and_then(|s| s.parse::<u64>().ok()) {
            cfg.flush_interval = Duration::from_millis(ms.max(1));
        }
        cfg
    }
}

/// Everything the engine loop accepts.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Update(Update),
    Status(SyncStatus),
    ComputedData {
        endpoint: EndpointKey,
        kind: EndpointComputedDataKind,
        value: Option<Arc<dyn EndpointComputedData>>,
    },
    PeerData {
        endpoint: EndpointKey,
        peer: Option<EndpointBgpPeer>,
    },
    BindComputedSelector {
        selector: String,
        kind: EndpointComputedDataKind,
        value: Arc<dyn EndpointComputedData>,
    },
    UnbindComputedSelector(String),
}

/// Coalescing queue keyed by resource key: the last value wins, order is first arrival.
/// Nothing is dropped; `push` reports when the queue reached capacity so the caller drains.
/// A pending deletion is never folded into a later upsert; see [`Coalescer::would_resurrect`].
pub struct Coalescer {
    map: FxHashMap<ResourceKey, Update>,
    order: VecDeque<ResourceKey>,
    cap: usize,
    coalesced: u64,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1), coalesced: 0 }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    /// Updates superseded by a later one for the same key.
    pub fn coalesced(&self) -> u64 { self.coalesced }

    /// True if `u` recreates a key whose pending update is a deletion. The caller must drain
    /// first so the deletion (and its cascade) is applied before the new value.
    pub fn would_resurrect(&self, u: &Update) -> bool {
        u.value.is_some() && self.map.get(&u.key).map(|pending| pending.value.is_none()).unwrap_or(false)
    }

    /// Returns true once the queue holds `cap` distinct keys.
    pub fn push(&mut self, u: Update) -> bool {
        if self.map.contains_key(&u.key) {
            self.coalesced += 1;
        } else {
            self.order.push_back(u.key.clone());
        }
        self.map.insert(u.key.clone(), u);
        self.order.len() >= self.cap
    }

    pub fn drain_ready(&mut self) -> Vec<Update> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(u) = self.map.remove(&key) {
                out.push(u);
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedTier {
    pub name: String,
    pub valid: bool,
    pub order: Option<f64>,
    pub policies: Vec<PolicyKey>,
}

impl From<&TierInfo> for ResolvedTier {
    fn from(t: &TierInfo) -> Self {
        Self {
            name: t.name.clone(),
            valid: t.valid,
            order: t.order,
            policies: t.ordered_policies.iter().map(|p| p.key.clone()).collect(),
        }
    }
}

/// One endpoint's resolved view as last flushed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedEndpoint {
    pub key: EndpointKey,
    pub name: String,
    pub tiers: Vec<ResolvedTier>,
    pub computed_data: usize,
    /// Annotations contributed by computed data.
    pub annotations: BTreeMap<String, String>,
    pub peer: Option<EndpointBgpPeer>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedSnapshot {
    pub epoch: u64,
    pub endpoints: BTreeMap<EndpointKey, ResolvedEndpoint>,
}

impl ResolvedSnapshot {
    pub fn get(&self, key: &EndpointKey) -> Option<&ResolvedEndpoint> { self.endpoints.get(key) }
    pub fn len(&self) -> usize { self.endpoints.len() }
    pub fn is_empty(&self) -> bool { self.endpoints.is_empty() }
}

/// Collects resolver output into a map and freezes it into snapshots.
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    epoch: u64,
    endpoints: BTreeMap<EndpointKey, ResolvedEndpoint>,
    changed: bool,
}

impl SnapshotBuilder {
    pub fn new() -> Self { Self::default() }

    pub fn epoch(&self) -> u64 { self.epoch }

    /// True if any update arrived since the last [`SnapshotBuilder::freeze`].
    pub fn has_changes(&self) -> bool { self.changed }

    pub fn freeze(&mut self) -> Arc<ResolvedSnapshot> {
        if self.changed {
            self.epoch = self.epoch.saturating_add(1);
            self.changed = false;
        }
        Arc::new(ResolvedSnapshot { epoch: self.epoch, endpoints: self.endpoints.clone() })
    }
}

impl EndpointTierListener for SnapshotBuilder {
    fn on_endpoint_tier_update(
        &mut self,
        key: &EndpointKey,
        endpoint: Option<&Arc<Endpoint>>,
        computed_data: &[Arc<dyn EndpointComputedData>],
        peer_data: Option<&EndpointBgpPeer>,
        tiers: &[TierInfo],
    ) {
        self.changed = true;
        let Some(ep) = endpoint else {
            self.endpoints.remove(key);
            return;
        };
        let mut scratch = WorkloadEndpoint::default();
        for cd in computed_data {
            cd.apply_to(&mut scratch);
        }
        self.endpoints.insert(
            key.clone(),
            ResolvedEndpoint {
                key: key.clone(),
                name: ep.name().to_string(),
                tiers: tiers.iter().map(ResolvedTier::from).collect(),
                computed_data: computed_data.len(),
                annotations: scratch.annotations,
                peer: peer_data.cloned(),
            },
        );
    }
}

/// Handle for readers to access the current snapshot and subscribe to swaps.
pub struct EngineHandle {
    snap: Arc<ArcSwap<ResolvedSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
    task: Option<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn current(&self) -> Arc<ResolvedSnapshot> { self.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    /// Wait for the loop to exit. It exits after every sender is dropped and the final flush is published.
    pub async fn wait_stopped(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "engine loop ended abnormally");
            }
        }
    }
}

struct EngineLoop {
    graph: CalcGraph,
    builder: Arc<Mutex<SnapshotBuilder>>,
    coalescer: Coalescer,
    snap: Arc<ArcSwap<ResolvedSnapshot>>,
    epoch_tx: watch::Sender<u64>,
}

impl EngineLoop {
    fn handle(&mut self, ev: EngineEvent) {
        metrics::counter!("engine_events_total", 1u64);
        match ev {
            EngineEvent::Update(u) => {
                if self.coalescer.would_resurrect(&u) {
                    debug!(key = ?u.key, "recreate after pending delete; draining first");
                    self.drain();
                }
                if self.coalescer.push(u) {
                    debug!(len = self.coalescer.len(), "coalescer full; draining early");
                    self.drain();
                }
            }
            other => {
                // Keep resource updates ahead of anything that arrived after them.
                self.drain();
                self.apply(other);
            }
        }
    }

    fn apply(&mut self, ev: EngineEvent) {
        match ev {
            EngineEvent::Update(u) => {
                // Rejections are logged by the graph; the loop keeps going.
                let _ = self.graph.on_update(&u);
            }
            EngineEvent::Status(s) => self.graph.on_status(s),
            EngineEvent::ComputedData { endpoint, kind, value } => {
                self.graph.on_endpoint_computed_data_update(&endpoint, &kind, value)
            }
            EngineEvent::PeerData { endpoint, peer } => self.graph.on_endpoint_bgp_peer_data_update(&endpoint, peer),
            EngineEvent::BindComputedSelector { selector, kind, value } => {
                if let Err(e) = self.graph.bind_computed_selector(&selector, kind, value) {
                    warn!(error = %e, selector = %selector, "rejecting computed selector");
                }
            }
            EngineEvent::UnbindComputedSelector(selector) => self.graph.unbind_computed_selector(&selector),
        }
    }

    fn drain(&mut self) {
        for u in self.coalescer.drain_ready() {
            self.apply(EngineEvent::Update(u));
        }
    }

    fn flush_and_publish(&mut self) {
        self.drain();
        self.graph.flush();
        let mut builder = self.builder.lock().unwrap_or_else(PoisonError::into_inner);
        if !builder.has_changes() {
            return;
        }
        let next = builder.freeze();
        drop(builder);
        let epoch = next.epoch;
        debug!(epoch, endpoints = next.len(), "publishing snapshot");
        metrics::gauge!("engine_snapshot_epoch", epoch as f64);
        self.snap.store(next);
        let _ = self.epoch_tx.send(epoch);
    }
}

/// Spawn the engine loop around `graph`. Returns a sender for events and a handle for reads.
/// Must be called from within a tokio runtime.
pub fn spawn_engine(config: EngineConfig, mut graph: CalcGraph) -> (mpsc::Sender<EngineEvent>, EngineHandle) {
    let (tx, mut rx) = mpsc::channel::<EngineEvent>(config.queue_cap.max(1));
    let snap = Arc::new(ArcSwap::from_pointee(ResolvedSnapshot::default()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let builder = Arc::new(Mutex::new(SnapshotBuilder::new()));
    graph.register_tier_listener(Arc::clone(&builder));

    let mut engine = EngineLoop {
        graph,
        builder,
        coalescer: Coalescer::with_capacity(config.queue_cap),
        snap: Arc::clone(&snap),
        epoch_tx,
    };
    let flush_interval = config.flush_interval;

    let task = tokio::spawn(async move {
        info!(queue_cap = config.queue_cap, flush_ms = flush_interval.as_millis() as u64, "engine loop started");
        let mut ticker = tokio::time::interval(flush_interval);
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(ev) => engine.handle(ev),
                        None => {
                            debug!("event channel closed; flushing and exiting engine loop");
                            engine.flush_and_publish();
                            break;
                        }
                    }
                }
                _ = ticker.tick() => engine.flush_and_publish(),
            }
        }
        info!(coalesced = engine.coalescer.coalesced(), "engine loop stopped");
    });

    (tx, EngineHandle { snap, epoch_rx, task: Some(task) })
}
