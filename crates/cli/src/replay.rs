//! JSON-lines replay format: one tagged event per line, `#` comments and blank lines skipped.

use std::io::BufRead;
use std::sync::Arc;

use anyhow::{Context, Result};
use polres_calc::AnnotationData;
use polres_core::{
    Endpoint, EndpointBgpPeer, EndpointComputedDataKind, EndpointKey, Labels, ModelError, Policy, PolicyKey,
    ProfileLabelsKey, ProfileRules, ProfileRulesKey, ResourceKey, SyncStatus, Tier, TierKey, Update,
};
use polres_store::EngineEvent;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplayEvent {
    Policy { key: PolicyKey, value: Option<Policy> },
    Tier { name: String, value: Option<Tier> },
    ProfileRules { name: String, value: Option<ProfileRules> },
    ProfileLabels { name: String, labels: Option<Labels> },
    Endpoint { key: EndpointKey, value: Option<Endpoint> },
    Status { status: SyncStatus },
    Peer { endpoint: EndpointKey, peer: Option<EndpointBgpPeer> },
    /// Annotate every endpoint matching `selector` with `key=value`.
    Annotate { selector: String, key: String, value: String },
    Unannotate { selector: String },
}

impl ReplayEvent {
    pub fn into_engine_event(self) -> Result<EngineEvent, ModelError> {
        Ok(match self {
            ReplayEvent::Policy { key, value: Some(p) } => EngineEvent::Update(Update::policy(key, p)),
            ReplayEvent::Policy { key, value: None } => EngineEvent::Update(Update::deletion(ResourceKey::Policy(key))),
            ReplayEvent::Tier { name, value: Some(t) } => EngineEvent::Update(Update::tier(&name, t)),
            ReplayEvent::Tier { name, value: None } => EngineEvent::Update(Update::deletion(ResourceKey::Tier(TierKey { name }))),
            ReplayEvent::ProfileRules { name, value: Some(r) } => EngineEvent::Update(Update::profile_rules(&name, r)),
            ReplayEvent::ProfileRules { name, value: None } => {
                EngineEvent::Update(Update::deletion(ResourceKey::ProfileRules(ProfileRulesKey { name })))
            }
            ReplayEvent::ProfileLabels { name, labels: Some(l) } => EngineEvent::Update(Update::profile_labels(&name, l)),
            ReplayEvent::ProfileLabels { name, labels: None } => {
                EngineEvent::Update(Update::deletion(ResourceKey::ProfileLabels(ProfileLabelsKey { name })))
            }
            ReplayEvent::Endpoint { key, value: Some(ep) } => EngineEvent::Update(Update::endpoint(key, ep)?),
            ReplayEvent::Endpoint { key, value: None } => EngineEvent::Update(Update::deletion(ResourceKey::Endpoint(key))),
            ReplayEvent::Status { status } => EngineEvent::Status(status),
            ReplayEvent::Peer { endpoint, peer } => EngineEvent::PeerData { endpoint, peer },
            ReplayEvent::Annotate { selector, key, value } => annotate(selector, &key, &value),
            ReplayEvent::Unannotate { selector } => EngineEvent::UnbindComputedSelector(selector),
        })
    }
}

/// Binding that tags matching endpoints with an annotation; one data kind per selector.
pub fn annotate(selector: String, key: &str, value: &str) -> EngineEvent {
    EngineEvent::BindComputedSelector {
        kind: EndpointComputedDataKind::new(&format!("annotate:{selector}")),
        value: Arc::new(AnnotationData::new(key, value)),
        selector,
    }
}

pub fn parse_events(reader: impl BufRead) -> Result<Vec<EngineEvent>> {
    let mut out = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let lineno = idx + 1;
        let line = line.with_context(|| format!("reading line {lineno}"))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let ev: ReplayEvent = serde_json::from_str(trimmed).with_context(|| format!("parsing line {lineno}"))?;
        out.push(ev.into_engine_event().with_context(|| format!("line {lineno}"))?);
    }
    Ok(out)
}
