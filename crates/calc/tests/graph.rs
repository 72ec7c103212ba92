#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use polres_calc::{AnnotationData, CalcError, CalcGraph, EndpointTierListener, TierInfo};
use polres_core::{
    Endpoint, EndpointBgpPeer, EndpointComputedData, EndpointComputedDataKind, EndpointKey, Labels, Policy, PolicyKey,
    SyncStatus, Update, WorkloadEndpoint,
};

#[derive(Debug, Clone)]
struct Flushed {
    key: EndpointKey,
    present: bool,
    annotations: Vec<(String, String)>,
    tiers: Vec<TierInfo>,
}

#[derive(Default)]
struct Sink(Vec<Flushed>);

impl EndpointTierListener for Sink {
    fn on_endpoint_tier_update(
        &mut self,
        key: &EndpointKey,
        endpoint: Option<&Arc<Endpoint>>,
        computed_data: &[Arc<dyn EndpointComputedData>],
        _peer_data: Option<&EndpointBgpPeer>,
        tiers: &[TierInfo],
    ) {
        let mut wep = WorkloadEndpoint::default();
        for cd in computed_data {
            cd.apply_to(&mut wep);
        }
        self.0.push(Flushed {
            key: key.clone(),
            present: endpoint.is_some(),
            annotations: wep.annotations.into_iter().collect(),
            tiers: tiers.to_vec(),
        });
    }
}

fn graph() -> (CalcGraph, Arc<Mutex<Sink>>) {
    let sink = Arc::new(Mutex::new(Sink::default()));
    let mut g = CalcGraph::new();
    g.register_tier_listener(Arc::clone(&sink));
    (g, sink)
}

fn drain(sink: &Arc<Mutex<Sink>>) -> Vec<Flushed> { std::mem::take(&mut sink.lock().unwrap().0) }

fn endpoint(labels: &[(&str, &str)], profiles: &[&str]) -> Endpoint {
    Endpoint::Workload(WorkloadEndpoint {
        name: "eth0".into(),
        labels: labels.iter().copied().collect::<Labels>(),
        profile_ids: profiles.iter().map(|p| p.to_string()).collect(),
        ..Default::default()
    })
}

fn policy(selector: &str) -> Policy { Policy { selector: selector.into(), ..Default::default() } }

fn names(tier: &TierInfo) -> Vec<&str> { tier.ordered_policies.iter().map(|p| p.key.name.as_str()).collect() }

#[test]
fn end_to_end_match_produces_one_resolved_update() {
    let (mut g, sink) = graph();
    let p1 = PolicyKey::global("default", "p1");
    let e1 = EndpointKey::workload("h1", "k8s", "ns/pod-a", "eth0");

    g.on_update(&Update::policy(p1.clone(), policy("app == 'web'"))).unwrap();
    g.on_update(&Update::endpoint(e1.clone(), endpoint(&[("app", "web")], &[])).unwrap()).unwrap();
    g.flush();
    assert!(drain(&sink).is_empty(), "nothing leaves before in-sync");

    g.on_status(SyncStatus::InSync);
    g.flush();
    let out = drain(&sink);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].key, e1);
    assert!(out[0].present);
    assert_eq!(out[0].tiers.len(), 1);
    assert_eq!(out[0].tiers[0].name, "default");
    assert!(out[0].tiers[0].valid);
    assert_eq!(names(&out[0].tiers[0]), vec!["p1"]);
    assert!(g.active_rules().is_policy_active(&p1));

    g.flush();
    assert!(drain(&sink).is_empty());
}

#[test]
fn label_change_moves_endpoint_out_of_policy() {
    let (mut g, sink) = graph();
    g.on_status(SyncStatus::InSync);
    let p1 = PolicyKey::global("default", "p1");
    let e1 = EndpointKey::workload("h1", "k8s", "ns/pod-a", "eth0");
    g.on_update(&Update::policy(p1.clone(), policy("app == 'web'"))).unwrap();
    g.on_update(&Update::endpoint(e1.clone(), endpoint(&[("app", "web")], &[])).unwrap()).unwrap();
    g.flush();
    drain(&sink);

    g.on_update(&Update::endpoint(e1.clone(), endpoint(&[("app", "db")], &[])).unwrap()).unwrap();
    g.flush();
    let out = drain(&sink);
    assert_eq!(out.len(), 1);
    assert!(out[0].tiers.is_empty());
    assert!(!g.active_rules().is_policy_active(&p1));
}

#[test]
fn endpoint_inherits_profile_labels() {
    let (mut g, sink) = graph();
    g.on_status(SyncStatus::InSync);
    let pol = PolicyKey::namespaced("default", "prod", "allow-prod");
    let e1 = EndpointKey::workload("h1", "k8s", "prod/pod-a", "eth0");

    g.on_update(&Update::policy(pol.clone(), policy("env == 'prod'"))).unwrap();
    g.on_update(&Update::endpoint(e1.clone(), endpoint(&[("app", "web")], &["kns.prod"])).unwrap()).unwrap();
    assert!(!g.active_rules().is_policy_active(&pol));

    g.on_update(&Update::profile_labels("kns.prod", [("env", "prod")].into_iter().collect())).unwrap();
    assert!(g.active_rules().is_policy_active(&pol));
    g.flush();
    let out = drain(&sink);
    assert_eq!(out.len(), 1);
    assert_eq!(names(&out[0].tiers[0]), vec!["allow-prod"]);

    // own labels shadow inherited ones
    g.on_update(&Update::endpoint(e1, endpoint(&[("env", "dev")], &["kns.prod"])).unwrap()).unwrap();
    assert!(!g.active_rules().is_policy_active(&pol));
}

#[test]
fn bad_selector_reaches_neither_component() {
    let (mut g, sink) = graph();
    g.on_status(SyncStatus::InSync);
    let e1 = EndpointKey::workload("h1", "k8s", "ns/pod-a", "eth0");
    g.on_update(&Update::endpoint(e1, endpoint(&[("app", "web")], &[])).unwrap()).unwrap();
    g.flush();
    drain(&sink);

    let bad = PolicyKey::global("default", "broken");
    let err = g.on_update(&Update::policy(bad.clone(), policy("app == "))).unwrap_err();
    assert!(matches!(err, CalcError::InvalidSelector { .. }));
    assert!(!g.active_rules().is_policy_active(&bad));
    let resolver = g.resolver_handle();
    assert!(resolver.lock().unwrap().policy_metadata(&bad).is_none());
    assert_eq!(resolver.lock().unwrap().dirty_len(), 0);
}

#[test]
fn bound_computed_selector_attaches_and_detaches_data() {
    let (mut g, sink) = graph();
    g.on_status(SyncStatus::InSync);
    let e1 = EndpointKey::workload("h1", "k8s", "ns/pod-a", "eth0");
    let e2 = EndpointKey::workload("h1", "k8s", "ns/pod-b", "eth0");
    g.on_update(&Update::endpoint(e1.clone(), endpoint(&[("team", "blue")], &[])).unwrap()).unwrap();
    g.on_update(&Update::endpoint(e2.clone(), endpoint(&[("team", "red")], &[])).unwrap()).unwrap();
    g.flush();
    drain(&sink);

    g.bind_computed_selector(
        "team == 'blue'",
        EndpointComputedDataKind::new("team-tag"),
        Arc::new(AnnotationData::new("example.org/team", "blue")),
    )
    .unwrap();
    g.flush();
    let out = drain(&sink);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].key, e1);
    assert_eq!(out[0].annotations, vec![("example.org/team".to_string(), "blue".to_string())]);
    assert!(out[0].tiers.is_empty(), "computed selectors never show up as policies");

    g.on_update(&Update::endpoint(e1.clone(), endpoint(&[("team", "green")], &[])).unwrap()).unwrap();
    g.flush();
    let out = drain(&sink);
    assert_eq!(out.len(), 1);
    assert!(out[0].annotations.is_empty());
    assert!(!g.resolver_handle().lock().unwrap().has_computed_data(&e1));
}

#[test]
fn rebinding_a_selector_replaces_the_data() {
    let (mut g, sink) = graph();
    g.on_status(SyncStatus::InSync);
    let e1 = EndpointKey::workload("h1", "k8s", "ns/pod-a", "eth0");
    g.on_update(&Update::endpoint(e1, endpoint(&[("team", "blue")], &[])).unwrap()).unwrap();
    let kind = EndpointComputedDataKind::new("team-tag");
    g.bind_computed_selector("has(team)", kind.clone(), Arc::new(AnnotationData::new("t", "v1"))).unwrap();
    g.bind_computed_selector("has(team)", kind, Arc::new(AnnotationData::new("t", "v2"))).unwrap();
    g.flush();
    let out = drain(&sink);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].annotations, vec![("t".to_string(), "v2".to_string())]);

    g.unbind_computed_selector("has(team)");
    g.flush();
    let out = drain(&sink);
    assert_eq!(out.len(), 1);
    assert!(out[0].annotations.is_empty());
}

#[test]
fn malformed_binding_is_rejected() {
    let (mut g, _sink) = graph();
    let res = g.bind_computed_selector(
        "has(team",
        EndpointComputedDataKind::new("team-tag"),
        Arc::new(AnnotationData::new("t", "v")),
    );
    assert!(res.is_err());
    assert!(!g.active_rules().has_computed_selector("has(team"));
}

#[test]
fn kind_stays_with_its_first_selector() {
    let (mut g, sink) = graph();
    g.on_status(SyncStatus::InSync);
    let e1 = EndpointKey::workload("h1", "k8s", "ns/pod-a", "eth0");
    g.on_update(&Update::endpoint(e1.clone(), endpoint(&[("team", "blue"), ("app", "web")], &[])).unwrap()).unwrap();
    let kind = EndpointComputedDataKind::new("tag");
    g.bind_computed_selector("has(team)", kind.clone(), Arc::new(AnnotationData::new("t", "team"))).unwrap();

    let err = g
        .bind_computed_selector("has(app)", kind.clone(), Arc::new(AnnotationData::new("t", "app")))
        .unwrap_err();
    assert!(matches!(&err, CalcError::KindInUse { selector, .. } if selector == "has(team)"));
    assert!(!g.active_rules().has_computed_selector("has(app)"));
    g.flush();
    let out = drain(&sink);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].annotations, vec![("t".to_string(), "team".to_string())]);

    // the kind is free again once its selector is unbound
    g.unbind_computed_selector("has(team)");
    g.bind_computed_selector("has(app)", kind, Arc::new(AnnotationData::new("t", "app"))).unwrap();
    g.flush();
    let out = drain(&sink);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].annotations, vec![("t".to_string(), "app".to_string())]);
}
