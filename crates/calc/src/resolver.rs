//! Policy resolver: the per-endpoint, tier-grouped view of matching policies.
//!
//! Mutations only mark endpoints dirty; [`PolicyResolver::flush`] turns the dirty set into
//! one consistent snapshot per endpoint for every registered [`EndpointTierListener`].
//! Nothing is emitted until the datastore has reported [`SyncStatus::InSync`].

use std::sync::{Arc, Mutex, PoisonError};

use polres_core::{
    Endpoint, EndpointBgpPeer, EndpointComputedData, EndpointComputedDataKind, EndpointKey, PolicyKey, PolicyMetadata,
    ResourceKey, ResourceValue, SyncStatus, Update,
};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info};

use crate::active_rules::PolicyMatchListener;
use crate::bimap::BiMap;
use crate::sorter::{PolicySorter, TierInfo};

/// Consumer of resolved endpoint views (typically the dataplane renderer).
pub trait EndpointTierListener: Send {
    fn on_endpoint_tier_update(
        &mut self,
        key: &EndpointKey,
        endpoint: Option<&Arc<Endpoint>>,
        computed_data: &[Arc<dyn EndpointComputedData>],
        peer_data: Option<&EndpointBgpPeer>,
        tiers: &[TierInfo],
    );
}

impl<L: EndpointTierListener> EndpointTierListener for Arc<Mutex<L>> {
    fn on_endpoint_tier_update(
        &mut self,
        key: &EndpointKey,
        endpoint: Option<&Arc<Endpoint>>,
        computed_data: &[Arc<dyn EndpointComputedData>],
        peer_data: Option<&EndpointBgpPeer>,
        tiers: &[TierInfo],
    ) {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .on_endpoint_tier_update(key, endpoint, computed_data, peer_data, tiers)
    }
}

type ComputedDataMap = FxHashMap<EndpointComputedDataKind, Arc<dyn EndpointComputedData>>;

pub struct PolicyResolver {
    all_policies: FxHashMap<PolicyKey, Arc<PolicyMetadata>>,
    endpoints: FxHashMap<EndpointKey, Arc<Endpoint>>,
    policy_endpoints: BiMap<PolicyKey, EndpointKey>,
    endpoint_computed_data: FxHashMap<EndpointKey, ComputedDataMap>,
    endpoint_peer_data: FxHashMap<EndpointKey, EndpointBgpPeer>,
    dirty_endpoints: FxHashSet<EndpointKey>,
    sorter: PolicySorter,
    in_sync: bool,
    callbacks: Vec<Box<dyn EndpointTierListener>>,
}

impl Default for PolicyResolver {
    fn default() -> Self { Self::new() }
}

impl PolicyResolver {
    pub fn new() -> Self { Self::with_sorter(PolicySorter::new()) }

    /// Build around an existing sorter (which may already hold policies and tiers).
    pub fn with_sorter(sorter: PolicySorter) -> Self {
        Self {
            all_policies: FxHashMap::default(),
            endpoints: FxHashMap::default(),
            policy_endpoints: BiMap::new(),
            endpoint_computed_data: FxHashMap::default(),
            endpoint_peer_data: FxHashMap::default(),
            dirty_endpoints: FxHashSet::default(),
            sorter,
            in_sync: false,
            callbacks: Vec::new(),
        }
    }

    pub fn register_callback(&mut self, listener: impl EndpointTierListener + 'static) {
        self.callbacks.push(Box::new(listener));
    }

    pub fn on_update(&mut self, update: &Update) {
        match (&update.key, &update.value) {
            (ResourceKey::Policy(key), Some(ResourceValue::Policy(policy))) => {
                let meta = Arc::new(PolicyMetadata::new(key, policy));
                if self.all_policies.get(key) == Some(&meta) {
                    return;
                }
                self.all_policies.insert(key.clone(), Arc::clone(&meta));
                self.sorter.update_policy(key, Some(meta));
                self.mark_policy_endpoints_dirty(key);
            }
            (ResourceKey::Policy(key), None) => {
                if self.all_policies.remove(key).is_none() {
                    return;
                }
                self.sorter.update_policy(key, None);
                self.mark_policy_endpoints_dirty(key);
            }
            (ResourceKey::Tier(key), value) => {
                let tier = match value {
                    Some(ResourceValue::Tier(t)) => Some(t.as_ref()),
                    _ => None,
                };
                if self.sorter.update_tier(&key.name, tier) {
                    self.mark_tier_endpoints_dirty(&key.name);
                }
            }
            (ResourceKey::Endpoint(key), Some(ResourceValue::Endpoint(ep))) => {
                self.endpoints.insert(key.clone(), Arc::clone(ep));
                self.dirty_endpoints.insert(key.clone());
            }
            (ResourceKey::Endpoint(key), None) => {
                self.endpoints.remove(key);
                self.policy_endpoints.remove_right(key);
                self.endpoint_computed_data.remove(key);
                self.endpoint_peer_data.remove(key);
                self.dirty_endpoints.insert(key.clone());
                debug!(endpoint = %key, "endpoint deleted");
            }
            // Profiles only matter to the active rules calculator.
            _ => {}
        }
    }

    pub fn on_datamodel_status(&mut self, status: SyncStatus) {
        if status == SyncStatus::InSync && !self.in_sync {
            info!(pending = self.dirty_endpoints.len(), "datamodel in sync; flushing enabled");
            self.in_sync = true;
        }
    }

    /// Upsert (`Some`) or remove (`None`) one kind of computed data. Removing an absent kind
    /// and re-setting the identical value are no-ops that leave the endpoint clean.
    pub fn on_endpoint_computed_data_update(
        &mut self,
        key: &EndpointKey,
        kind: &EndpointComputedDataKind,
        value: Option<Arc<dyn EndpointComputedData>>,
    ) {
        match value {
            Some(v) => {
                let kinds = self.endpoint_computed_data.entry(key.clone()).or_default();
                if let Some(old) = kinds.get(kind) {
                    if Arc::ptr_eq(old, &v) {
                        return;
                    }
                }
                kinds.insert(kind.clone(), v);
            }
            None => {
                let Some(kinds) = self.endpoint_computed_data.get_mut(key) else { return };
                if kinds.remove(kind).is_none() {
                    return;
                }
                if kinds.is_empty() {
                    self.endpoint_computed_data.remove(key);
                }
            }
        }
        self.dirty_endpoints.insert(key.clone());
    }

    pub fn on_endpoint_bgp_peer_data_update(&mut self, key: &EndpointKey, peer: Option<EndpointBgpPeer>) {
        let changed = match peer {
            Some(p) => self.endpoint_peer_data.insert(key.clone(), p.clone()).as_ref() != Some(&p),
            None => self.endpoint_peer_data.remove(key).is_some(),
        };
        if changed {
            self.dirty_endpoints.insert(key.clone());
        }
    }

    /// Deliver one snapshot per dirty endpoint to every callback, then clear the dirty set.
    /// Does nothing (and keeps the dirty set) until the datamodel is in sync.
    pub fn flush(&mut self) {
        if !self.in_sync {
            debug!(pending = self.dirty_endpoints.len(), "not in sync; deferring flush");
            return;
        }
        let dirty = std::mem::take(&mut self.dirty_endpoints);
        metrics::gauge!("resolver_dirty_endpoints", dirty.len() as f64);
        for key in dirty.iter() {
            self.send_endpoint_update(key);
        }
        metrics::counter!("resolver_flushes_total", 1u64);
        metrics::counter!("resolver_endpoint_updates_total", dirty.len() as u64);
    }

    pub fn in_sync(&self) -> bool { self.in_sync }
    pub fn is_dirty(&self, key: &EndpointKey) -> bool { self.dirty_endpoints.contains(key) }
    pub fn dirty_len(&self) -> usize { self.dirty_endpoints.len() }
    pub fn policy_metadata(&self, key: &PolicyKey) -> Option<&Arc<PolicyMetadata>> { self.all_policies.get(key) }
    pub fn endpoint(&self, key: &EndpointKey) -> Option<&Arc<Endpoint>> { self.endpoints.get(key) }
    pub fn sorter(&self) -> &PolicySorter { &self.sorter }

    /// Policies currently matching `key`, unordered.
    pub fn matched_policies(&self, key: &EndpointKey) -> Vec<PolicyKey> {
        self.policy_endpoints.lefts(key).map(|s| s.iter().cloned().collect()).unwrap_or_default()
    }

    /// Endpoints currently matched by `key`, unordered.
    pub fn matching_endpoints(&self, key: &PolicyKey) -> Vec<EndpointKey> {
        self.policy_endpoints.rights(key).map(|s| s.iter().cloned().collect()).unwrap_or_default()
    }

    pub fn has_computed_data(&self, key: &EndpointKey) -> bool { self.endpoint_computed_data.contains_key(key) }

    /// The tiered view of `key` as the next flush would deliver it.
    pub fn resolve_tiers(&self, key: &EndpointKey) -> Vec<TierInfo> {
        let Some(matched) = self.policy_endpoints.lefts(key) else { return Vec::new() };
        let mut out = Vec::new();
        for tier in self.sorter.tiers() {
            let ordered: Vec<_> = tier.policies().filter(|kv| matched.contains(&kv.key)).cloned().collect();
            if ordered.is_empty() {
                continue;
            }
            out.push(TierInfo { name: tier.name().to_string(), valid: tier.valid(), order: tier.order(), ordered_policies: ordered });
        }
        out
    }

    fn send_endpoint_update(&mut self, key: &EndpointKey) {
        let endpoint = self.endpoints.get(key);
        let tiers = self.resolve_tiers(key);
        let computed: Vec<Arc<dyn EndpointComputedData>> = self
            .endpoint_computed_data
            .get(key)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        let peer = self.endpoint_peer_data.get(key);
        debug!(endpoint = %key, tiers = tiers.len(), computed = computed.len(), "sending endpoint tier update");
        for cb in self.callbacks.iter_mut() {
            cb.on_endpoint_tier_update(key, endpoint, &computed, peer, &tiers);
        }
    }

    fn mark_policy_endpoints_dirty(&mut self, key: &PolicyKey) {
        if let Some(eps) = self.policy_endpoints.rights(key) {
            self.dirty_endpoints.extend(eps.iter().cloned());
        }
    }

    fn mark_tier_endpoints_dirty(&mut self, tier: &str) {
        let Some(t) = self.sorter.tier(tier) else { return };
        for kv in t.policies() {
            if let Some(eps) = self.policy_endpoints.rights(&kv.key) {
                self.dirty_endpoints.extend(eps.iter().cloned());
            }
        }
    }
}

impl PolicyMatchListener for PolicyResolver {
    fn on_policy_match(&mut self, policy: &PolicyKey, endpoint: &EndpointKey) {
        self.policy_endpoints.insert(policy.clone(), endpoint.clone());
        self.dirty_endpoints.insert(endpoint.clone());
    }

    fn on_policy_match_stopped(&mut self, policy: &PolicyKey, endpoint: &EndpointKey) {
        if !self.policy_endpoints.remove(policy, endpoint) {
            debug!(policy = %policy, endpoint = %endpoint, "match stopped for unknown pair");
        }
        self.dirty_endpoints.insert(endpoint.clone());
    }

    // Computed selectors feed computed-data producers, not the policy view.
    fn on_computed_selector_match(&mut self, _: &str, _: &EndpointKey) {}
    fn on_computed_selector_match_stopped(&mut self, _: &str, _: &EndpointKey) {}
}
