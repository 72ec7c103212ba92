//! Calculation graph: routes the inbound stream through the active rules calculator and
//! into the policy resolver. Callers drive it from a single thread (or task).

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use polres_core::{EndpointBgpPeer, EndpointComputedData, EndpointComputedDataKind, EndpointKey, SyncStatus, Update};
use tracing::{info, warn};

use crate::active_rules::{ActiveRulesCalculator, NoopRuleScanner, PolicyMatchListener, RuleScanner};
use crate::computed::ComputedSelectorBridge;
use crate::error::CalcResult;
use crate::resolver::{EndpointTierListener, PolicyResolver};

pub struct CalcGraph {
    arc: ActiveRulesCalculator,
    resolver: Arc<Mutex<PolicyResolver>>,
    bridge: Arc<Mutex<ComputedSelectorBridge>>,
}

impl Default for CalcGraph {
    fn default() -> Self { Self::new() }
}

impl CalcGraph {
    pub fn new() -> Self { Self::with_rule_scanner(NoopRuleScanner) }

    pub fn with_rule_scanner(scanner: impl RuleScanner + 'static) -> Self {
        let resolver = Arc::new(Mutex::new(PolicyResolver::new()));
        let bridge = Arc::new(Mutex::new(ComputedSelectorBridge::new(Arc::clone(&resolver))));
        let mut arc = ActiveRulesCalculator::with_rule_scanner(scanner);
        arc.register_policy_match_listener(Arc::clone(&resolver));
        arc.register_policy_match_listener(Arc::clone(&bridge));
        Self { arc, resolver, bridge }
    }

    pub fn register_policy_match_listener(&mut self, listener: impl PolicyMatchListener + 'static) {
        self.arc.register_policy_match_listener(listener);
    }

    pub fn register_tier_listener(&mut self, listener: impl EndpointTierListener + 'static) {
        self.resolver().register_callback(listener);
    }

    /// Route one datastore update. A rejected update reaches neither component.
    pub fn on_update(&mut self, update: &Update) -> CalcResult<()> {
        if let Err(e) = self.arc.on_update(update) {
            warn!(error = %e, key = ?update.key, "rejecting update");
            metrics::counter!("calc_rejected_updates_total", 1u64);
            return Err(e);
        }
        self.resolver().on_update(update);
        Ok(())
    }

    pub fn on_status(&mut self, status: SyncStatus) {
        info!(status = ?status, "datastore status");
        self.resolver().on_datamodel_status(status);
    }

    pub fn flush(&mut self) { self.resolver().flush(); }

    pub fn add_computed_selector(&mut self, expr: &str) -> CalcResult<()> { self.arc.add_extra_computed_selector(expr) }

    pub fn remove_computed_selector(&mut self, expr: &str) { self.arc.remove_extra_computed_selector(expr) }

    /// Attach `value` (of `kind`) to every endpoint matching `expr` for as long as it matches.
    pub fn bind_computed_selector(
        &mut self,
        expr: &str,
        kind: EndpointComputedDataKind,
        value: Arc<dyn EndpointComputedData>,
    ) -> CalcResult<()> {
        self.bridge().check_kind(expr, &kind)?;
        // Re-registering replays matches so existing endpoints drop the old binding and pick up the new one.
        if self.arc.has_computed_selector(expr) {
            self.arc.remove_extra_computed_selector(expr);
        }
        self.bridge().bind(expr, kind, value)?;
        if let Err(e) = self.arc.add_extra_computed_selector(expr) {
            self.bridge().unbind(expr);
            return Err(e);
        }
        Ok(())
    }

    pub fn unbind_computed_selector(&mut self, expr: &str) {
        self.arc.remove_extra_computed_selector(expr);
        self.bridge().unbind(expr);
    }

    pub fn on_endpoint_computed_data_update(
        &mut self,
        key: &EndpointKey,
        kind: &EndpointComputedDataKind,
        value: Option<Arc<dyn EndpointComputedData>>,
    ) {
        self.resolver().on_endpoint_computed_data_update(key, kind, value);
    }

    pub fn on_endpoint_bgp_peer_data_update(&mut self, key: &EndpointKey, peer: Option<EndpointBgpPeer>) {
        self.resolver().on_endpoint_bgp_peer_data_update(key, peer);
    }

    pub fn active_rules(&self) -> &ActiveRulesCalculator { &self.arc }

    /// Shared handle to the resolver, for inspection.
    pub fn resolver_handle(&self) -> Arc<Mutex<PolicyResolver>> { Arc::clone(&self.resolver) }

    fn resolver(&self) -> MutexGuard<'_, PolicyResolver> { self.resolver.lock().unwrap_or_else(PoisonError::into_inner) }

    fn bridge(&self) -> MutexGuard<'_, ComputedSelectorBridge> { self.bridge.lock().unwrap_or_else(PoisonError::into_inner) }
}
