//! Polres calc: the policy resolution engine.
//!
//! Data flow: datastore updates → [`ActiveRulesCalculator`] (selector evaluation,
//! active/inactive bookkeeping) → match edges → [`PolicyResolver`] (indices, dirty
//! tracking) → [`PolicyResolver::flush`] → [`EndpointTierListener`]s.

#![forbid(unsafe_code)]

pub mod active_rules;
pub mod bimap;
pub mod computed;
pub mod error;
pub mod graph;
pub mod label_index;
pub mod resolver;
pub mod sorter;

pub use active_rules::{ActiveRulesCalculator, LoggingRuleScanner, NoopRuleScanner, PolicyMatchListener, RuleScanner};
pub use bimap::BiMap;
pub use computed::{AnnotationData, ComputedSelectorBridge};
pub use error::{CalcError, CalcResult};
pub use graph::CalcGraph;
pub use resolver::{EndpointTierListener, PolicyResolver};
pub use sorter::{PolKv, PolicySorter, TierInfo};
