//! Set-valued bidirectional index.
//!
//! Both directions are updated together by every mutator so they can never diverge.
//! Pairs are set members, not counted: inserting a pair twice is the same as once.

use std::hash::Hash;

use rustc_hash::{FxHashMap, FxHashSet};

#[derive(Debug, Clone)]
pub struct BiMap<L, R> {
    fwd: FxHashMap<L, FxHashSet<R>>,
    rev: FxHashMap<R, FxHashSet<L>>,
}

impl<L, R> Default for BiMap<L, R> {
    fn default() -> Self { Self { fwd: FxHashMap::default(), rev: FxHashMap::default() } }
}

impl<L, R> BiMap<L, R>
where
    L: Eq + Hash + Clone,
    R: Eq + Hash + Clone,
{
    pub fn new() -> Self { Self::default() }

    /// Returns true if the pair was not present before.
    pub fn insert(&mut self, l: L, r: R) -> bool {
        let added = self.fwd.entry(l.clone()).or_default().insert(r.clone());
        if added {
            self.rev.entry(r).or_default().insert(l);
        }
        added
    }

    /// Returns true if the pair was present. Empty neighbour sets are dropped.
    pub fn remove(&mut self, l: &L, r: &R) -> bool {
        let removed = match self.fwd.get_mut(l) {
            Some(rs) => {
                let removed = rs.remove(r);
                if rs.is_empty() { self.fwd.remove(l); }
                removed
            }
            None => false,
        };
        if removed {
            if let Some(ls) = self.rev.get_mut(r) {
                ls.remove(l);
                if ls.is_empty() { self.rev.remove(r); }
            }
        }
        removed
    }

    /// Drop every pair with left side `l`, returning the right sides it was paired with.
    pub fn remove_left(&mut self, l: &L) -> Vec<R> {
        let rs: Vec<R> = match self.fwd.remove(l) {
            Some(rs) => rs.into_iter().collect(),
            None => return Vec::new(),
        };
        for r in rs.iter() {
            if let Some(ls) = self.rev.get_mut(r) {
                ls.remove(l);
                if ls.is_empty() { self.rev.remove(r); }
            }
        }
        rs
    }

    /// Drop every pair with right side `r`, returning the left sides it was paired with.
    pub fn remove_right(&mut self, r: &R) -> Vec<L> {
        let ls: Vec<L> = match self.rev.remove(r) {
            Some(ls) => ls.into_iter().collect(),
            None => return Vec::new(),
        };
        for l in ls.iter() {
            if let Some(rs) = self.fwd.get_mut(l) {
                rs.remove(r);
                if rs.is_empty() { self.fwd.remove(l); }
            }
        }
        ls
    }

    pub fn contains(&self, l: &L, r: &R) -> bool {
        self.fwd.get(l).map(|rs| rs.contains(r)).unwrap_or(false)
    }

    pub fn contains_left(&self, l: &L) -> bool { self.fwd.contains_key(l) }
    pub fn contains_right(&self, r: &R) -> bool { self.rev.contains_key(r) }

    /// Right-hand neighbours of `l`.
    pub fn rights(&self, l: &L) -> Option<&FxHashSet<R>> { self.fwd.get(l) }

    /// Left-hand neighbours of `r`.
    pub fn lefts(&self, r: &R) -> Option<&FxHashSet<L>> { self.rev.get(r) }

    pub fn count_rights(&self, l: &L) -> usize { self.fwd.get(l).map(|s| s.len()).unwrap_or(0) }

    /// Number of distinct left keys with at least one pair.
    pub fn len_left(&self) -> usize { self.fwd.len() }
    pub fn len_right(&self) -> usize { self.rev.len() }
    pub fn is_empty(&self) -> bool { self.fwd.is_empty() }
}
