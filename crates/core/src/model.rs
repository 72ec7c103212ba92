//! Resource values carried by updates and the resolver-relevant projections of them.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::keys::PolicyKey;

/// Opaque rule body. Rule syntax is interpreted downstream, never here.
pub type Rule = serde_json::Value;

/// Label set kept sorted by key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct Labels(SmallVec<[(String, String); 8]>);

impl Labels {
    pub fn new() -> Self { Self::default() }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .binary_search_by(|(k, _)| k.as_str().cmp(key))
            .ok()
            .map(|i| self.0[i].1.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool { self.get(key).is_some() }

    /// Insert or replace; returns the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        let value = value.into();
        match self.0.binary_search_by(|(k, _)| k.as_str().cmp(&key)) {
            Ok(i) => Some(std::mem::replace(&mut self.0[i].1, value)),
            Err(i) => {
                self.0.insert(i, (key, value));
                None
            }
        }
    }

    /// Insert only when the key is absent.
    pub fn insert_missing(&mut self, key: &str, value: &str) {
        if let Err(i) = self.0.binary_search_by(|(k, _)| k.as_str().cmp(key)) {
            self.0.insert(i, (key.to_string(), value.to_string()));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl From<BTreeMap<String, String>> for Labels {
    fn from(m: BTreeMap<String, String>) -> Self { Labels(m.into_iter().collect()) }
}

impl From<Labels> for BTreeMap<String, String> {
    fn from(l: Labels) -> Self { l.0.into_iter().collect() }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Labels {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut out = Labels::new();
        for (k, v) in iter { out.insert(k, v); }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyType {
    Ingress,
    Egress,
}

/// Full policy resource as delivered by the datastore feed. The tier is part of the key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub order: Option<f64>,
    pub selector: String,
    pub inbound_rules: Vec<Rule>,
    pub outbound_rules: Vec<Rule>,
    pub types: SmallVec<[PolicyType; 2]>,
    pub do_not_track: bool,
    pub pre_dnat: bool,
    pub apply_on_forward: bool,
}

/// Resolver-relevant projection of a [`Policy`]. Replaced wholesale on update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyMetadata {
    pub tier: String,
    pub order: Option<f64>,
    pub selector: String,
    pub types: SmallVec<[PolicyType; 2]>,
    pub do_not_track: bool,
    pub pre_dnat: bool,
    pub apply_on_forward: bool,
}

impl PolicyMetadata {
    pub fn new(key: &PolicyKey, policy: &Policy) -> Self {
        Self {
            tier: key.tier.clone(),
            order: policy.order,
            selector: policy.selector.clone(),
            types: policy.types.clone(),
            do_not_track: policy.do_not_track,
            pre_dnat: policy.pre_dnat,
            apply_on_forward: policy.apply_on_forward,
        }
    }

    /// Policies without explicit types apply in both directions.
    pub fn applies_to(&self, t: PolicyType) -> bool {
        self.types.is_empty() || self.types.contains(&t)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tier {
    pub order: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileRules {
    pub inbound_rules: Vec<Rule>,
    pub outbound_rules: Vec<Rule>,
}

impl ProfileRules {
    /// Rules reported for a profile that endpoints reference but the datastore does not (yet) hold.
    pub fn missing() -> Self {
        let deny = serde_json::json!({ "action": "deny" });
        Self { inbound_rules: vec![deny.clone()], outbound_rules: vec![deny] }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileLabels {
    pub labels: Labels,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadEndpoint {
    pub name: String,
    pub labels: Labels,
    pub profile_ids: Vec<String>,
    pub ipv4_nets: Vec<String>,
    pub ipv6_nets: Vec<String>,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostEndpoint {
    pub name: String,
    pub expected_ipv4_addrs: Vec<Ipv4Addr>,
    pub labels: Labels,
    pub profile_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Workload(WorkloadEndpoint),
    Host(HostEndpoint),
}

impl Endpoint {
    pub fn labels(&self) -> &Labels {
        match self {
            Endpoint::Workload(w) => &w.labels,
            Endpoint::Host(h) => &h.labels,
        }
    }

    pub fn profile_ids(&self) -> &[String] {
        match self {
            Endpoint::Workload(w) => &w.profile_ids,
            Endpoint::Host(h) => &h.profile_ids,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Endpoint::Workload(w) => &w.name,
            Endpoint::Host(h) => &h.name,
        }
    }
}

/// Local BGP peering data delivered alongside an endpoint's resolved view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointBgpPeer {
    pub v4_address: Option<Ipv4Addr>,
    pub v6_address: Option<Ipv6Addr>,
}
