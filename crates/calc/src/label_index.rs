//! Incremental selector/endpoint matcher.
//!
//! Tracks registered selectors and endpoint label sets (including labels inherited from
//! parent profiles) and reports only the match edges that flip.

use std::hash::Hash;

use polres_core::{EndpointKey, Labels};
use polres_selector::Selector;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::bimap::BiMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexEvent<Id> {
    Matched(Id, EndpointKey),
    Unmatched(Id, EndpointKey),
}

#[derive(Debug)]
struct IndexedEndpoint {
    own: Labels,
    parents: SmallVec<[String; 4]>,
    effective: Labels,
}

#[derive(Debug)]
pub struct LabelIndex<Id> {
    selectors: FxHashMap<Id, Selector>,
    endpoints: FxHashMap<EndpointKey, IndexedEndpoint>,
    parent_labels: FxHashMap<String, Labels>,
    matches: BiMap<Id, EndpointKey>,
}

impl<Id> Default for LabelIndex<Id> {
    fn default() -> Self {
        Self {
            selectors: FxHashMap::default(),
            endpoints: FxHashMap::default(),
            parent_labels: FxHashMap::default(),
            matches: BiMap::default(),
        }
    }
}

impl<Id: Eq + Hash + Clone> LabelIndex<Id> {
    pub fn new() -> Self { Self::default() }

    /// Register or replace a selector and evaluate it against every known endpoint.
    pub fn update_selector(&mut self, id: Id, selector: Selector) -> Vec<IndexEvent<Id>> {
        if self.selectors.get(&id) == Some(&selector) {
            return Vec::new();
        }
        let mut events = Vec::new();
        for (key, ep) in self.endpoints.iter() {
            let now = selector.matches(&ep.effective);
            Self::record(&mut self.matches, &mut events, &id, key, now);
        }
        self.selectors.insert(id, selector);
        events
    }

    pub fn delete_selector(&mut self, id: &Id) -> Vec<IndexEvent<Id>> {
        if self.selectors.remove(id).is_none() {
            return Vec::new();
        }
        self.matches
            .remove_left(id)
            .into_iter()
            .map(|ep| IndexEvent::Unmatched(id.clone(), ep))
            .collect()
    }

    /// Upsert an endpoint's own labels and parent (profile) list, re-evaluating every selector.
    pub fn update_endpoint(&mut self, key: &EndpointKey, own: &Labels, parents: &[String]) -> Vec<IndexEvent<Id>> {
        let effective = self.effective_labels(own, parents);
        let unchanged = self.endpoints.get(key).map(|ep| ep.effective == effective).unwrap_or(false);
        let events = if unchanged { Vec::new() } else { self.evaluate_endpoint(key, &effective) };
        self.endpoints.insert(
            key.clone(),
            IndexedEndpoint { own: own.clone(), parents: parents.iter().cloned().collect(), effective },
        );
        events
    }

    pub fn delete_endpoint(&mut self, key: &EndpointKey) -> Vec<IndexEvent<Id>> {
        if self.endpoints.remove(key).is_none() {
            return Vec::new();
        }
        self.matches
            .remove_right(key)
            .into_iter()
            .map(|id| IndexEvent::Unmatched(id, key.clone()))
            .collect()
    }

    /// Upsert (`Some`) or remove (`None`) the labels a parent contributes to its children.
    pub fn update_parent_labels(&mut self, parent: &str, labels: Option<&Labels>) -> Vec<IndexEvent<Id>> {
        match labels {
            Some(l) if self.parent_labels.get(parent) == Some(l) => return Vec::new(),
            Some(l) => { self.parent_labels.insert(parent.to_string(), l.clone()); }
            None => {
                if self.parent_labels.remove(parent).is_none() {
                    return Vec::new();
                }
            }
        }
        let children: Vec<EndpointKey> = self
            .endpoints
            .iter()
            .filter(|(_, ep)| ep.parents.iter().any(|p| p == parent))
            .map(|(k, _)| k.clone())
            .collect();
        let mut events = Vec::new();
        for key in children {
            let Some(ep) = self.endpoints.get(&key) else { continue };
            let effective = self.effective_labels(&ep.own, &ep.parents);
            if effective == ep.effective {
                continue;
            }
            events.extend(self.evaluate_endpoint(&key, &effective));
            if let Some(ep) = self.endpoints.get_mut(&key) {
                ep.effective = effective;
            }
        }
        events
    }

    pub fn is_match(&self, id: &Id, key: &EndpointKey) -> bool { self.matches.contains(id, key) }

    pub fn matching_endpoints(&self, id: &Id) -> impl Iterator<Item = &EndpointKey> {
        self.matches.rights(id).into_iter().flatten()
    }

    pub fn has_selector(&self, id: &Id) -> bool { self.selectors.contains_key(id) }

    /// Effective labels of a known endpoint.
    pub fn endpoint_labels(&self, key: &EndpointKey) -> Option<&Labels> {
        self.endpoints.get(key).map(|ep| &ep.effective)
    }

    // Own labels win; earlier parents win over later ones.
    fn effective_labels(&self, own: &Labels, parents: &[String]) -> Labels {
        let mut out = own.clone();
        for p in parents {
            if let Some(pl) = self.parent_labels.get(p) {
                for (k, v) in pl.iter() {
                    out.insert_missing(k, v);
                }
            }
        }
        out
    }

    fn evaluate_endpoint(&mut self, key: &EndpointKey, labels: &Labels) -> Vec<IndexEvent<Id>> {
        let mut events = Vec::new();
        for (id, sel) in self.selectors.iter() {
            let now = sel.matches(labels);
            Self::record(&mut self.matches, &mut events, id, key, now);
        }
        events
    }

    fn record(matches: &mut BiMap<Id, EndpointKey>, events: &mut Vec<IndexEvent<Id>>, id: &Id, key: &EndpointKey, now: bool) {
        if now {
            if matches.insert(id.clone(), key.clone()) {
                events.push(IndexEvent::Matched(id.clone(), key.clone()));
            }
        } else if matches.remove(id, key) {
            events.push(IndexEvent::Unmatched(id.clone(), key.clone()));
        }
    }
}
