//! Per-tier total order over every known policy.
//!
//! Policies are kept pre-sorted so that resolving an endpoint is a subsequence filter,
//! never a sort. Order: explicit `order` ascending (absent sorts last), then name,
//! namespace and kind. Tiers use the same rule with the tier resource's order.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use polres_core::{PolicyKey, PolicyKind, PolicyMetadata, Tier, DEFAULT_TIER};
use rustc_hash::FxHashMap;
use tracing::debug;

/// A policy key paired with its current metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct PolKv {
    pub key: PolicyKey,
    pub value: Arc<PolicyMetadata>,
}

/// One tier of an endpoint's resolved view: only the policies matching that endpoint, in tier order.
#[derive(Debug, Clone, PartialEq)]
pub struct TierInfo {
    pub name: String,
    /// False when the tier resource is gone but policies still reference the tier.
    pub valid: bool,
    pub order: Option<f64>,
    pub ordered_policies: Vec<PolKv>,
}

fn cmp_order(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[derive(Debug, Clone)]
struct PolicySortKey {
    order: Option<f64>,
    name: String,
    namespace: Option<String>,
    kind: PolicyKind,
}

impl PolicySortKey {
    fn new(key: &PolicyKey, meta: &PolicyMetadata) -> Self {
        Self { order: meta.order, name: key.name.clone(), namespace: key.namespace.clone(), kind: key.kind }
    }
}

impl Ord for PolicySortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_order(self.order, other.order)
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| self.namespace.cmp(&other.namespace))
            .then_with(|| self.kind.cmp(&other.kind))
    }
}

impl PartialOrd for PolicySortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl PartialEq for PolicySortKey {
    fn eq(&self, other: &Self) -> bool { self.cmp(other) == Ordering::Equal }
}

impl Eq for PolicySortKey {}

#[derive(Debug)]
pub struct SortedTier {
    name: String,
    order: Option<f64>,
    has_resource: bool,
    policies: BTreeMap<PolicySortKey, PolKv>,
}

impl SortedTier {
    fn new(name: &str) -> Self {
        Self { name: name.to_string(), order: None, has_resource: false, policies: BTreeMap::new() }
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn order(&self) -> Option<f64> { self.order }
    pub fn valid(&self) -> bool { self.has_resource || self.name == DEFAULT_TIER }

    /// Every policy in the tier, in tier order.
    pub fn policies(&self) -> impl Iterator<Item = &PolKv> { self.policies.values() }

    pub fn len(&self) -> usize { self.policies.len() }
    pub fn is_empty(&self) -> bool { self.policies.is_empty() }

    fn is_prunable(&self) -> bool { self.policies.is_empty() && !self.has_resource }
}

#[derive(Debug, Default)]
pub struct PolicySorter {
    tiers: FxHashMap<String, SortedTier>,
    tier_order: Vec<String>,
    locations: FxHashMap<PolicyKey, (String, PolicySortKey)>,
}

impl PolicySorter {
    pub fn new() -> Self { Self::default() }

    /// Upsert (`Some`) or remove (`None`) a policy. Returns true if the sorted view changed.
    pub fn update_policy(&mut self, key: &PolicyKey, meta: Option<Arc<PolicyMetadata>>) -> bool {
        let old = self.locations.remove(key).and_then(|(tier, sk)| {
            let t = self.tiers.get_mut(&tier)?;
            let kv = t.policies.remove(&sk);
            Some((tier, kv))
        });
        let mut tiers_changed = false;
        if let Some((tier, _)) = &old {
            tiers_changed |= self.prune_tier(tier);
        }
        let changed = match (&old, &meta) {
            (Some((_, Some(old_kv))), Some(m)) => old_kv.value != *m,
            (None, None) | (Some((_, None)), None) => false,
            _ => true,
        };
        if let Some(meta) = meta {
            let sk = PolicySortKey::new(key, &meta);
            let tier_name = meta.tier.clone();
            let tier = self.tiers.entry(tier_name.clone()).or_insert_with(|| {
                tiers_changed = true;
                SortedTier::new(&tier_name)
            });
            tier.policies.insert(sk.clone(), PolKv { key: key.clone(), value: meta });
            self.locations.insert(key.clone(), (tier_name, sk));
        }
        if tiers_changed {
            self.resort_tiers();
        }
        if changed {
            debug!(policy = %key, "policy sorter updated");
        }
        changed
    }

    /// Upsert (`Some`) or remove (`None`) a tier resource. Returns true if anything changed.
    pub fn update_tier(&mut self, name: &str, tier: Option<&Tier>) -> bool {
        let changed = match tier {
            Some(t) => {
                let st = self.tiers.entry(name.to_string()).or_insert_with(|| SortedTier::new(name));
                let changed = !st.has_resource || cmp_order(st.order, t.order) != Ordering::Equal;
                st.has_resource = true;
                st.order = t.order;
                changed
            }
            None => match self.tiers.get_mut(name) {
                Some(st) if st.has_resource => {
                    st.has_resource = false;
                    st.order = None;
                    self.prune_tier(name);
                    true
                }
                _ => false,
            },
        };
        if changed {
            self.resort_tiers();
            debug!(tier = name, present = tier.is_some(), "tier updated");
        }
        changed
    }

    /// Tiers in evaluation order.
    pub fn tiers(&self) -> impl Iterator<Item = &SortedTier> {
        self.tier_order.iter().filter_map(|n| self.tiers.get(n))
    }

    pub fn tier(&self, name: &str) -> Option<&SortedTier> { self.tiers.get(name) }

    pub fn policy_tier(&self, key: &PolicyKey) -> Option<&str> {
        self.locations.get(key).map(|(t, _)| t.as_str())
    }

    pub fn len(&self) -> usize { self.locations.len() }
    pub fn is_empty(&self) -> bool { self.locations.is_empty() }

    fn prune_tier(&mut self, name: &str) -> bool {
        if self.tiers.get(name).map(|t| t.is_prunable()).unwrap_or(false) {
            self.tiers.remove(name);
            return true;
        }
        false
    }

    fn resort_tiers(&mut self) {
        let mut order: Vec<(Option<f64>, String)> = self.tiers.values().map(|t| (t.order, t.name.clone())).collect();
        order.sort_by(|a, b| cmp_order(a.0, b.0).then_with(|| a.1.cmp(&b.1)));
        self.tier_order = order.into_iter().map(|(_, n)| n).collect();
    }
}
