//! Resource keys.
//!
//! Every key is an immutable, totally ordered composite so it can be used both in
//! hash maps (hot paths) and in ordered collections (deterministic output).

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of the tier that exists without a backing `Tier` resource.
pub const DEFAULT_TIER: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadEndpointKey {
    pub hostname: String,
    #[serde(default)]
    pub orchestrator_id: String,
    #[serde(default)]
    pub workload_id: String,
    #[serde(default)]
    pub endpoint_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostEndpointKey {
    pub hostname: String,
    pub endpoint_id: String,
}

/// Identifies one workload or host endpoint. The sole key into per-endpoint state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKey {
    Workload(WorkloadEndpointKey),
    Host(HostEndpointKey),
}

impl EndpointKey {
    pub fn workload(hostname: &str, orchestrator_id: &str, workload_id: &str, endpoint_id: &str) -> Self {
        EndpointKey::Workload(WorkloadEndpointKey {
            hostname: hostname.to_string(),
            orchestrator_id: orchestrator_id.to_string(),
            workload_id: workload_id.to_string(),
            endpoint_id: endpoint_id.to_string(),
        })
    }

    pub fn host(hostname: &str, endpoint_id: &str) -> Self {
        EndpointKey::Host(HostEndpointKey { hostname: hostname.to_string(), endpoint_id: endpoint_id.to_string() })
    }

    pub fn hostname(&self) -> &str {
        match self {
            EndpointKey::Workload(k) => &k.hostname,
            EndpointKey::Host(k) => &k.hostname,
        }
    }

    pub fn is_workload(&self) -> bool { matches!(self, EndpointKey::Workload(_)) }
}

impl From<WorkloadEndpointKey> for EndpointKey {
    fn from(k: WorkloadEndpointKey) -> Self { EndpointKey::Workload(k) }
}

impl From<HostEndpointKey> for EndpointKey {
    fn from(k: HostEndpointKey) -> Self { EndpointKey::Host(k) }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointKey::Workload(k) => write!(f, "wep:{}/{}/{}/{}", k.hostname, k.orchestrator_id, k.workload_id, k.endpoint_id),
            EndpointKey::Host(k) => write!(f, "hep:{}/{}", k.hostname, k.endpoint_id),
        }
    }
}

/// Policy flavours. Declaration order is the final tie-break when sorting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PolicyKind {
    #[default]
    NetworkPolicy,
    GlobalNetworkPolicy,
    StagedNetworkPolicy,
    StagedGlobalNetworkPolicy,
    StagedKubernetesNetworkPolicy,
    KubernetesNetworkPolicy,
}

impl PolicyKind {
    /// Staged policies are reported to consumers but never enforced.
    pub fn is_staged(self) -> bool {
        matches!(
            self,
            PolicyKind::StagedNetworkPolicy | PolicyKind::StagedGlobalNetworkPolicy | PolicyKind::StagedKubernetesNetworkPolicy
        )
    }

    pub fn is_namespaced(self) -> bool {
        !matches!(self, PolicyKind::GlobalNetworkPolicy | PolicyKind::StagedGlobalNetworkPolicy)
    }
}

/// Identifies one policy resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyKey {
    pub tier: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub kind: PolicyKind,
}

impl PolicyKey {
    pub fn new(kind: PolicyKind, tier: &str, namespace: Option<&str>, name: &str) -> Self {
        Self { tier: tier.to_string(), name: name.to_string(), namespace: namespace.map(|s| s.to_string()), kind }
    }

    /// Cluster-wide policy in the given tier.
    pub fn global(tier: &str, name: &str) -> Self { Self::new(PolicyKind::GlobalNetworkPolicy, tier, None, name) }

    /// Namespaced network policy in the given tier.
    pub fn namespaced(tier: &str, namespace: &str, name: &str) -> Self {
        Self::new(PolicyKind::NetworkPolicy, tier, Some(namespace), name)
    }
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{:?}({}/{}/{})", self.kind, self.tier, ns, self.name),
            None => write!(f, "{:?}({}/{})", self.kind, self.tier, self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TierKey {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProfileRulesKey {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProfileLabelsKey {
    pub name: String,
}
