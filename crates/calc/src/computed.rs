//! Computed data driven by computed selectors.
//!
//! A binding says "while an endpoint matches selector S, attach value V of kind K".
//! [`ComputedSelectorBridge`] listens to the active rules calculator and forwards each
//! computed-selector edge to the resolver as a computed-data upsert or removal.

use std::sync::{Arc, Mutex, PoisonError};

use polres_core::{EndpointComputedData, EndpointComputedDataKind, EndpointKey, PolicyKey, WorkloadEndpoint};
use rustc_hash::FxHashMap;

use crate::active_rules::PolicyMatchListener;
use crate::error::{CalcError, CalcResult};
use crate::resolver::PolicyResolver;

/// Computed data that renders as a single endpoint annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationData {
    pub key: String,
    pub value: String,
}

impl AnnotationData {
    pub fn new(key: &str, value: &str) -> Self { Self { key: key.to_string(), value: value.to_string() } }
}

impl EndpointComputedData for AnnotationData {
    fn apply_to(&self, endpoint: &mut WorkloadEndpoint) {
        endpoint.annotations.insert(self.key.clone(), self.value.clone());
    }
}

struct Binding {
    kind: EndpointComputedDataKind,
    value: Arc<dyn EndpointComputedData>,
}

pub struct ComputedSelectorBridge {
    resolver: Arc<Mutex<PolicyResolver>>,
    bindings: FxHashMap<String, Binding>,
}

impl ComputedSelectorBridge {
    pub fn new(resolver: Arc<Mutex<PolicyResolver>>) -> Self { Self { resolver, bindings: FxHashMap::default() } }

    /// Each kind belongs to at most one selector: the resolver keys computed data by kind, so two
    /// selectors sharing one would remove each other's data.
    pub fn check_kind(&self, selector: &str, kind: &EndpointComputedDataKind) -> CalcResult<()> {
        match self.bindings.iter().find(|(s, b)| b.kind == *kind && s.as_str() != selector) {
            Some((owner, _)) => Err(CalcError::KindInUse { kind: kind.to_string(), selector: owner.clone() }),
            None => Ok(()),
        }
    }

    pub fn bind(
        &mut self,
        selector: &str,
        kind: EndpointComputedDataKind,
        value: Arc<dyn EndpointComputedData>,
    ) -> CalcResult<()> {
        self.check_kind(selector, &kind)?;
        self.bindings.insert(selector.to_string(), Binding { kind, value });
        Ok(())
    }

    pub fn unbind(&mut self, selector: &str) -> bool { self.bindings.remove(selector).is_some() }

    pub fn is_bound(&self, selector: &str) -> bool { self.bindings.contains_key(selector) }
}

impl PolicyMatchListener for ComputedSelectorBridge {
    fn on_policy_match(&mut self, _: &PolicyKey, _: &EndpointKey) {}
    fn on_policy_match_stopped(&mut self, _: &PolicyKey, _: &EndpointKey) {}

    fn on_computed_selector_match(&mut self, selector: &str, endpoint: &EndpointKey) {
        let Some(b) = self.bindings.get(selector) else { return };
        self.resolver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .on_endpoint_computed_data_update(endpoint, &b.kind, Some(Arc::clone(&b.value)));
    }

    fn on_computed_selector_match_stopped(&mut self, selector: &str, endpoint: &EndpointKey) {
        let Some(b) = self.bindings.get(selector) else { return };
        self.resolver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .on_endpoint_computed_data_update(endpoint, &b.kind, None);
    }
}
