//! Polres core types: resource keys, values, updates and the computed-data capability.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod keys;
pub mod model;

pub use keys::{
    EndpointKey, HostEndpointKey, PolicyKey, PolicyKind, ProfileLabelsKey, ProfileRulesKey, TierKey,
    WorkloadEndpointKey, DEFAULT_TIER,
};
pub use model::{
    Endpoint, EndpointBgpPeer, HostEndpoint, Labels, Policy, PolicyMetadata, PolicyType, ProfileLabels,
    ProfileRules, Rule, Tier, WorkloadEndpoint,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("value of kind {value} cannot be stored under a {key} key")]
    KindMismatch { key: &'static str, value: &'static str },
}

/// Key half of an update.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKey {
    Policy(PolicyKey),
    Tier(TierKey),
    ProfileRules(ProfileRulesKey),
    ProfileLabels(ProfileLabelsKey),
    Endpoint(EndpointKey),
}

impl ResourceKey {
    fn kind_name(&self) -> &'static str {
        match self {
            ResourceKey::Policy(_) => "policy",
            ResourceKey::Tier(_) => "tier",
            ResourceKey::ProfileRules(_) => "profile_rules",
            ResourceKey::ProfileLabels(_) => "profile_labels",
            ResourceKey::Endpoint(EndpointKey::Workload(_)) => "workload_endpoint",
            ResourceKey::Endpoint(EndpointKey::Host(_)) => "host_endpoint",
        }
    }
}

/// Value half of an update. Payloads are shared so one update can fan out to several consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceValue {
    Policy(Arc<Policy>),
    Tier(Arc<Tier>),
    ProfileRules(Arc<ProfileRules>),
    ProfileLabels(Arc<ProfileLabels>),
    Endpoint(Arc<Endpoint>),
}

impl ResourceValue {
    fn kind_name(&self) -> &'static str {
        match self {
            ResourceValue::Policy(_) => "policy",
            ResourceValue::Tier(_) => "tier",
            ResourceValue::ProfileRules(_) => "profile_rules",
            ResourceValue::ProfileLabels(_) => "profile_labels",
            ResourceValue::Endpoint(ep) => match ep.as_ref() {
                Endpoint::Workload(_) => "workload_endpoint",
                Endpoint::Host(_) => "host_endpoint",
            },
        }
    }
}

/// One create/update (`value: Some`) or delete (`value: None`) from the datastore feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub key: ResourceKey,
    #[serde(default)]
    pub value: Option<ResourceValue>,
}

impl Update {
    /// Build an update, rejecting values that do not belong under `key`.
    pub fn new(key: ResourceKey, value: Option<ResourceValue>) -> Result<Self, ModelError> {
        let u = Self { key, value };
        u.validate()?;
        Ok(u)
    }

    pub fn deletion(key: ResourceKey) -> Self { Self { key, value: None } }

    pub fn validate(&self) -> Result<(), ModelError> {
        match &self.value {
            None => Ok(()),
            Some(v) if v.kind_name() == self.key.kind_name() => Ok(()),
            Some(v) => Err(ModelError::KindMismatch { key: self.key.kind_name(), value: v.kind_name() }),
        }
    }

    pub fn policy(key: PolicyKey, policy: Policy) -> Self {
        Self { key: ResourceKey::Policy(key), value: Some(ResourceValue::Policy(Arc::new(policy))) }
    }

    pub fn tier(name: &str, tier: Tier) -> Self {
        Self { key: ResourceKey::Tier(TierKey { name: name.to_string() }), value: Some(ResourceValue::Tier(Arc::new(tier))) }
    }

    pub fn profile_rules(name: &str, rules: ProfileRules) -> Self {
        Self {
            key: ResourceKey::ProfileRules(ProfileRulesKey { name: name.to_string() }),
            value: Some(ResourceValue::ProfileRules(Arc::new(rules))),
        }
    }

    pub fn profile_labels(name: &str, labels: Labels) -> Self {
        Self {
            key: ResourceKey::ProfileLabels(ProfileLabelsKey { name: name.to_string() }),
            value: Some(ResourceValue::ProfileLabels(Arc::new(ProfileLabels { labels }))),
        }
    }

    /// Endpoint upsert. The key must match the endpoint flavour.
    pub fn endpoint(key: EndpointKey, endpoint: Endpoint) -> Result<Self, ModelError> {
        Self::new(ResourceKey::Endpoint(key), Some(ResourceValue::Endpoint(Arc::new(endpoint))))
    }
}

/// Datastore sync status. Only `InSync` permits the resolver to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    WaitingForDatastore,
    ResyncInProgress,
    InSync,
}

/// Category of auxiliary per-endpoint data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointComputedDataKind(Arc<str>);

impl EndpointComputedDataKind {
    pub fn new(kind: &str) -> Self { Self(Arc::from(kind)) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for EndpointComputedDataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for EndpointComputedDataKind {
    fn from(s: &str) -> Self { Self::new(s) }
}

/// Auxiliary per-endpoint value rendered by the dataplane. The resolver only tracks presence.
pub trait EndpointComputedData: fmt::Debug + Send + Sync {
    fn apply_to(&self, endpoint: &mut WorkloadEndpoint);
}

pub mod prelude {
    pub use super::{
        Endpoint, EndpointComputedData, EndpointComputedDataKind, EndpointKey, PolicyKey, PolicyMetadata, ResourceKey,
        ResourceValue, SyncStatus, Update,
    };
}
