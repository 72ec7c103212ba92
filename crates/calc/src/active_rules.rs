//! Active rules calculator.
//!
//! Decides which policies and profiles are *active* (referenced by at least one endpoint),
//! reports active/inactive transitions to a [`RuleScanner`] and fans match edges out to
//! [`PolicyMatchListener`]s. Computed selectors registered through
//! [`ActiveRulesCalculator::add_extra_computed_selector`] share the label index but never
//! touch the policy bookkeeping.

use std::sync::{Arc, Mutex, PoisonError};

use polres_core::{
    EndpointKey, Policy, PolicyKey, ProfileRules, ProfileRulesKey, ResourceKey, ResourceValue, Update,
};
use polres_selector::Selector;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info};

use crate::bimap::BiMap;
use crate::error::{CalcError, CalcResult};
use crate::label_index::{IndexEvent, LabelIndex};

/// Receives match edges. Every registered listener sees every event.
pub trait PolicyMatchListener: Send {
    fn on_policy_match(&mut self, policy: &PolicyKey, endpoint: &EndpointKey);
    fn on_policy_match_stopped(&mut self, policy: &PolicyKey, endpoint: &EndpointKey);
    fn on_computed_selector_match(&mut self, selector: &str, endpoint: &EndpointKey);
    fn on_computed_selector_match_stopped(&mut self, selector: &str, endpoint: &EndpointKey);
}

/// Receives policies/profiles as they become (in)active so rule extraction can skip unused ones.
pub trait RuleScanner: Send {
    fn on_policy_active(&mut self, key: &PolicyKey, policy: &Arc<Policy>);
    fn on_policy_inactive(&mut self, key: &PolicyKey);
    fn on_profile_active(&mut self, key: &ProfileRulesKey, rules: &Arc<ProfileRules>);
    fn on_profile_inactive(&mut self, key: &ProfileRulesKey);
}

impl<L: PolicyMatchListener> PolicyMatchListener for Arc<Mutex<L>> {
    fn on_policy_match(&mut self, policy: &PolicyKey, endpoint: &EndpointKey) {
        self.lock().unwrap_or_else(PoisonError::into_inner).on_policy_match(policy, endpoint)
    }
    fn on_policy_match_stopped(&mut self, policy: &PolicyKey, endpoint: &EndpointKey) {
        self.lock().unwrap_or_else(PoisonError::into_inner).on_policy_match_stopped(policy, endpoint)
    }
    fn on_computed_selector_match(&mut self, selector: &str, endpoint: &EndpointKey) {
        self.lock().unwrap_or_else(PoisonError::into_inner).on_computed_selector_match(selector, endpoint)
    }
    fn on_computed_selector_match_stopped(&mut self, selector: &str, endpoint: &EndpointKey) {
        self.lock().unwrap_or_else(PoisonError::into_inner).on_computed_selector_match_stopped(selector, endpoint)
    }
}

impl<S: RuleScanner> RuleScanner for Arc<Mutex<S>> {
    fn on_policy_active(&mut self, key: &PolicyKey, policy: &Arc<Policy>) {
        self.lock().unwrap_or_else(PoisonError::into_inner).on_policy_active(key, policy)
    }
    fn on_policy_inactive(&mut self, key: &PolicyKey) {
        self.lock().unwrap_or_else(PoisonError::into_inner).on_policy_inactive(key)
    }
    fn on_profile_active(&mut self, key: &ProfileRulesKey, rules: &Arc<ProfileRules>) {
        self.lock().unwrap_or_else(PoisonError::into_inner).on_profile_active(key, rules)
    }
    fn on_profile_inactive(&mut self, key: &ProfileRulesKey) {
        self.lock().unwrap_or_else(PoisonError::into_inner).on_profile_inactive(key)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRuleScanner;

impl RuleScanner for NoopRuleScanner {
    fn on_policy_active(&mut self, _: &PolicyKey, _: &Arc<Policy>) {}
    fn on_policy_inactive(&mut self, _: &PolicyKey) {}
    fn on_profile_active(&mut self, _: &ProfileRulesKey, _: &Arc<ProfileRules>) {}
    fn on_profile_inactive(&mut self, _: &ProfileRulesKey) {}
}

/// Logs transitions at info level. Used by the CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingRuleScanner;

impl RuleScanner for LoggingRuleScanner {
    fn on_policy_active(&mut self, key: &PolicyKey, policy: &Arc<Policy>) {
        info!(policy = %key, inbound = policy.inbound_rules.len(), outbound = policy.outbound_rules.len(), "policy active");
    }
    fn on_policy_inactive(&mut self, key: &PolicyKey) {
        info!(policy = %key, "policy inactive");
    }
    fn on_profile_active(&mut self, key: &ProfileRulesKey, rules: &Arc<ProfileRules>) {
        info!(profile = %key.name, inbound = rules.inbound_rules.len(), outbound = rules.outbound_rules.len(), "profile active");
    }
    fn on_profile_inactive(&mut self, key: &ProfileRulesKey) {
        info!(profile = %key.name, "profile inactive");
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SelectorId {
    Policy(PolicyKey),
    Computed(Arc<str>),
}

pub struct ActiveRulesCalculator {
    label_index: LabelIndex<SelectorId>,
    all_policies: FxHashMap<PolicyKey, Arc<Policy>>,
    policy_id_to_endpoint_keys: BiMap<PolicyKey, EndpointKey>,
    all_profile_rules: FxHashMap<String, Arc<ProfileRules>>,
    profile_id_to_endpoint_keys: BiMap<String, EndpointKey>,
    computed_selectors: FxHashSet<Arc<str>>,
    listeners: Vec<Box<dyn PolicyMatchListener>>,
    rule_scanner: Box<dyn RuleScanner>,
    missing_profile_rules: Arc<ProfileRules>,
}

impl Default for ActiveRulesCalculator {
    fn default() -> Self { Self::new() }
}

impl ActiveRulesCalculator {
    pub fn new() -> Self { Self::with_rule_scanner(NoopRuleScanner) }

    pub fn with_rule_scanner(scanner: impl RuleScanner + 'static) -> Self {
        Self {
            label_index: LabelIndex::new(),
            all_policies: FxHashMap::default(),
            policy_id_to_endpoint_keys: BiMap::new(),
            all_profile_rules: FxHashMap::default(),
            profile_id_to_endpoint_keys: BiMap::new(),
            computed_selectors: FxHashSet::default(),
            listeners: Vec::new(),
            rule_scanner: Box::new(scanner),
            missing_profile_rules: Arc::new(ProfileRules::missing()),
        }
    }

    pub fn set_rule_scanner(&mut self, scanner: impl RuleScanner + 'static) {
        self.rule_scanner = Box::new(scanner);
    }

    pub fn register_policy_match_listener(&mut self, listener: impl PolicyMatchListener + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Track `expr` against every endpoint. Idempotent; fires matches for endpoints already known.
    pub fn add_extra_computed_selector(&mut self, expr: &str) -> CalcResult<()> {
        if self.computed_selectors.contains(expr) {
            return Ok(());
        }
        let sel = Selector::parse(expr).map_err(|e| CalcError::invalid_selector(expr, e))?;
        let id: Arc<str> = Arc::from(expr);
        self.computed_selectors.insert(Arc::clone(&id));
        let events = self.label_index.update_selector(SelectorId::Computed(id), sel);
        debug!(selector = expr, matches = events.len(), "computed selector added");
        self.dispatch(events);
        Ok(())
    }

    /// Stop tracking `expr`, firing a stopped event for every endpoint it currently matches.
    pub fn remove_extra_computed_selector(&mut self, expr: &str) {
        let Some(id) = self.computed_selectors.take(expr) else {
            debug!(selector = expr, "removing unknown computed selector; ignoring");
            return;
        };
        let events = self.label_index.delete_selector(&SelectorId::Computed(id));
        self.dispatch(events);
    }

    /// Apply one datastore update. A policy with an unparsable selector is rejected and the
    /// previously registered version (if any) stays in place.
    pub fn on_update(&mut self, update: &Update) -> CalcResult<()> {
        update.validate()?;
        match (&update.key, &update.value) {
            (ResourceKey::Policy(key), Some(ResourceValue::Policy(policy))) => {
                let sel = Selector::parse(&policy.selector).map_err(|e| CalcError::invalid_selector(&policy.selector, e))?;
                let was_active = self.policy_id_to_endpoint_keys.contains_left(key);
                let changed = self.all_policies.get(key).map(|old| old != policy).unwrap_or(true);
                self.all_policies.insert(key.clone(), Arc::clone(policy));
                let events = self.label_index.update_selector(SelectorId::Policy(key.clone()), sel);
                self.dispatch(events);
                if was_active && changed && self.policy_id_to_endpoint_keys.contains_left(key) {
                    self.rule_scanner.on_policy_active(key, policy);
                }
            }
            (ResourceKey::Policy(key), None) => {
                if self.all_policies.remove(key).is_none() {
                    debug!(policy = %key, "delete of unknown policy; ignoring");
                    return Ok(());
                }
                let events = self.label_index.delete_selector(&SelectorId::Policy(key.clone()));
                self.dispatch(events);
            }
            (ResourceKey::ProfileRules(key), value) => {
                match value {
                    Some(ResourceValue::ProfileRules(rules)) => {
                        self.all_profile_rules.insert(key.name.clone(), Arc::clone(rules));
                    }
                    _ => {
                        if self.all_profile_rules.remove(&key.name).is_none() {
                            return Ok(());
                        }
                    }
                }
                if self.profile_id_to_endpoint_keys.contains_left(&key.name) {
                    self.send_profile_active(&key.name);
                }
            }
            (ResourceKey::ProfileLabels(key), value) => {
                let labels = match value {
                    Some(ResourceValue::ProfileLabels(pl)) => Some(&pl.labels),
                    _ => None,
                };
                let events = self.label_index.update_parent_labels(&key.name, labels);
                self.dispatch(events);
            }
            (ResourceKey::Endpoint(key), Some(ResourceValue::Endpoint(ep))) => {
                self.update_endpoint_profiles(key, ep.profile_ids());
                let events = self.label_index.update_endpoint(key, ep.labels(), ep.profile_ids());
                self.dispatch(events);
            }
            (ResourceKey::Endpoint(key), None) => {
                let events = self.label_index.delete_endpoint(key);
                self.dispatch(events);
                self.update_endpoint_profiles(key, &[]);
            }
            _ => {}
        }
        Ok(())
    }

    pub fn is_policy_active(&self, key: &PolicyKey) -> bool { self.policy_id_to_endpoint_keys.contains_left(key) }

    pub fn is_profile_active(&self, name: &str) -> bool {
        self.profile_id_to_endpoint_keys.contains_left(&name.to_string())
    }

    pub fn policy_match_count(&self, key: &PolicyKey) -> usize { self.policy_id_to_endpoint_keys.count_rights(key) }

    pub fn active_policy_count(&self) -> usize { self.policy_id_to_endpoint_keys.len_left() }

    pub fn active_profile_count(&self) -> usize { self.profile_id_to_endpoint_keys.len_left() }

    pub fn has_computed_selector(&self, expr: &str) -> bool { self.computed_selectors.contains(expr) }

    fn update_endpoint_profiles(&mut self, key: &EndpointKey, profiles: &[String]) {
        let old: Vec<String> = self
            .profile_id_to_endpoint_keys
            .lefts(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        for p in profiles {
            let was_active = self.profile_id_to_endpoint_keys.contains_left(p);
            self.profile_id_to_endpoint_keys.insert(p.clone(), key.clone());
            if !was_active {
                self.send_profile_active(p);
            }
        }
        for p in old.iter().filter(|p| !profiles.contains(p)) {
            self.profile_id_to_endpoint_keys.remove(p, key);
            if !self.profile_id_to_endpoint_keys.contains_left(p) {
                self.rule_scanner.on_profile_inactive(&ProfileRulesKey { name: p.clone() });
            }
        }
        metrics::gauge!("arc_active_profiles", self.profile_id_to_endpoint_keys.len_left() as f64);
    }

    fn send_profile_active(&mut self, name: &str) {
        let key = ProfileRulesKey { name: name.to_string() };
        let rules = match self.all_profile_rules.get(name) {
            Some(r) => r,
            None => {
                debug!(profile = name, "active profile has no rules yet; reporting missing-profile rules");
                &self.missing_profile_rules
            }
        };
        self.rule_scanner.on_profile_active(&key, rules);
    }

    fn dispatch(&mut self, events: Vec<IndexEvent<SelectorId>>) {
        for ev in events {
            match ev {
                IndexEvent::Matched(SelectorId::Policy(pol), ep) => {
                    if !self.policy_id_to_endpoint_keys.contains_left(&pol) {
                        if let Some(p) = self.all_policies.get(&pol) {
                            self.rule_scanner.on_policy_active(&pol, p);
                        }
                    }
                    self.policy_id_to_endpoint_keys.insert(pol.clone(), ep.clone());
                    for l in self.listeners.iter_mut() {
                        l.on_policy_match(&pol, &ep);
                    }
                }
                IndexEvent::Unmatched(SelectorId::Policy(pol), ep) => {
                    self.policy_id_to_endpoint_keys.remove(&pol, &ep);
                    for l in self.listeners.iter_mut() {
                        l.on_policy_match_stopped(&pol, &ep);
                    }
                    if !self.policy_id_to_endpoint_keys.contains_left(&pol) {
                        self.rule_scanner.on_policy_inactive(&pol);
                    }
                }
                IndexEvent::Matched(SelectorId::Computed(sel), ep) => {
                    for l in self.listeners.iter_mut() {
                        l.on_computed_selector_match(&sel, &ep);
                    }
                }
                IndexEvent::Unmatched(SelectorId::Computed(sel), ep) => {
                    for l in self.listeners.iter_mut() {
                        l.on_computed_selector_match_stopped(&sel, &ep);
                    }
                }
            }
        }
        metrics::gauge!("arc_active_policies", self.policy_id_to_endpoint_keys.len_left() as f64);
    }
}
