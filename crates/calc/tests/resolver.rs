#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use polres_calc::{EndpointTierListener, PolKv, PolicyMatchListener, PolicyResolver, TierInfo};
use polres_core::{
    Endpoint, EndpointBgpPeer, EndpointComputedData, EndpointComputedDataKind, EndpointKey, Policy, PolicyKey,
    PolicyMetadata, ResourceKey, SyncStatus, Tier, Update, WorkloadEndpoint,
};

#[derive(Debug)]
struct TestComputedData(String);

impl EndpointComputedData for TestComputedData {
    fn apply_to(&self, endpoint: &mut WorkloadEndpoint) {
        endpoint.annotations.insert("test-computed".into(), self.0.clone());
    }
}

#[derive(Debug, Clone)]
struct Recorded {
    key: EndpointKey,
    endpoint: Option<Arc<Endpoint>>,
    computed: Vec<String>,
    peer: Option<EndpointBgpPeer>,
    tiers: Vec<TierInfo>,
}

#[derive(Default)]
struct Recorder(Vec<Recorded>);

impl EndpointTierListener for Recorder {
    fn on_endpoint_tier_update(
        &mut self,
        key: &EndpointKey,
        endpoint: Option<&Arc<Endpoint>>,
        computed_data: &[Arc<dyn EndpointComputedData>],
        peer_data: Option<&EndpointBgpPeer>,
        tiers: &[TierInfo],
    ) {
        let computed = computed_data
            .iter()
            .map(|cd| {
                let mut wep = WorkloadEndpoint::default();
                cd.apply_to(&mut wep);
                wep.annotations.get("test-computed").cloned().unwrap_or_default()
            })
            .collect();
        self.0.push(Recorded {
            key: key.clone(),
            endpoint: endpoint.cloned(),
            computed,
            peer: peer_data.cloned(),
            tiers: tiers.to_vec(),
        });
    }
}

fn create_resolver() -> (PolicyResolver, Arc<Mutex<Recorder>>) {
    let rec = Arc::new(Mutex::new(Recorder::default()));
    let mut pr = PolicyResolver::new();
    pr.register_callback(Arc::clone(&rec));
    (pr, rec)
}

fn updates(rec: &Arc<Mutex<Recorder>>) -> Vec<Recorded> { rec.lock().unwrap().0.clone() }

fn clear(rec: &Arc<Mutex<Recorder>>) { rec.lock().unwrap().0.clear(); }

fn ep_key() -> EndpointKey { EndpointKey::workload("host1", "k8s", "ns/pod", "eth0") }

fn wep() -> Endpoint { Endpoint::Workload(WorkloadEndpoint { name: "we1".into(), ..Default::default() }) }

fn add_policy(pr: &mut PolicyResolver, key: &PolicyKey, order: Option<f64>) {
    pr.on_update(&Update::policy(key.clone(), Policy { order, ..Default::default() }));
}

fn add_endpoint(pr: &mut PolicyResolver, key: &EndpointKey) {
    pr.on_update(&Update::endpoint(key.clone(), wep()).unwrap());
}

fn kind_a() -> EndpointComputedDataKind { EndpointComputedDataKind::new("kindA") }
fn kind_b() -> EndpointComputedDataKind { EndpointComputedDataKind::new("kindB") }

#[test]
fn policy_add_then_delete_leaves_nothing_to_flush() {
    let (mut pr, rec) = create_resolver();
    let pol = PolicyKey::global("default", "test-policy");
    add_policy(&mut pr, &pol, None);
    assert!(pr.policy_metadata(&pol).is_some());
    pr.on_update(&Update::deletion(ResourceKey::Policy(pol.clone())));
    assert!(pr.policy_metadata(&pol).is_none());
    assert!(pr.sorter().is_empty());

    pr.on_datamodel_status(SyncStatus::InSync);
    pr.flush();
    assert!(updates(&rec).is_empty());
}

#[test]
fn single_match_flushes_one_tiered_update() {
    let (mut pr, rec) = create_resolver();
    let pol = PolicyKey::namespaced("default", "ns", "p1");
    let ep = ep_key();
    add_policy(&mut pr, &pol, None);
    add_endpoint(&mut pr, &ep);

    pr.on_policy_match(&pol, &ep);
    assert!(updates(&rec).is_empty(), "nothing is sent before flush");
    assert_eq!(pr.matched_policies(&ep), vec![pol.clone()]);
    assert_eq!(pr.matching_endpoints(&pol), vec![ep.clone()]);
    assert!(pr.is_dirty(&ep));

    pr.on_datamodel_status(SyncStatus::InSync);
    pr.flush();
    let got = updates(&rec);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].key, ep);
    assert_eq!(got[0].endpoint.as_deref(), Some(&wep()));
    assert!(got[0].computed.is_empty());
    assert!(got[0].peer.is_none());
    let meta = Arc::new(PolicyMetadata { tier: "default".into(), ..Default::default() });
    assert_eq!(
        got[0].tiers,
        vec![TierInfo { name: "default".into(), valid: true, order: None, ordered_policies: vec![PolKv { key: pol, value: meta }] }]
    );
    assert_eq!(pr.dirty_len(), 0);
}

#[test]
fn duplicate_match_is_idempotent() {
    let (mut pr, rec) = create_resolver();
    pr.on_datamodel_status(SyncStatus::InSync);
    let pol = PolicyKey::global("default", "p1");
    let ep = ep_key();
    add_policy(&mut pr, &pol, None);
    pr.on_policy_match(&pol, &ep);
    pr.on_policy_match(&pol, &ep);
    assert_eq!(pr.dirty_len(), 1);
    pr.flush();
    let got = updates(&rec);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].tiers.len(), 1);
    assert_eq!(got[0].tiers[0].ordered_policies.len(), 1);
}

#[test]
fn match_stopped_twice_flushes_once_with_no_tiers() {
    let (mut pr, rec) = create_resolver();
    pr.on_datamodel_status(SyncStatus::InSync);
    let pol = PolicyKey::global("default", "test-policy");
    let ep = ep_key();
    add_policy(&mut pr, &pol, None);

    pr.on_policy_match(&pol, &ep);
    pr.on_policy_match_stopped(&pol, &ep);
    assert!(pr.matching_endpoints(&pol).is_empty());
    assert!(pr.matched_policies(&ep).is_empty());
    assert!(pr.is_dirty(&ep));

    pr.on_policy_match_stopped(&pol, &ep);
    assert!(updates(&rec).is_empty());
    pr.flush();
    let got = updates(&rec);
    assert_eq!(got.len(), 1);
    assert!(got[0].endpoint.is_none());
    assert!(got[0].tiers.is_empty());
}

#[test]
fn nothing_is_emitted_before_in_sync() {
    let (mut pr, rec) = create_resolver();
    let pol = PolicyKey::global("default", "p1");
    let e1 = ep_key();
    let e2 = EndpointKey::host("host1", "eth1");
    add_policy(&mut pr, &pol, None);
    add_endpoint(&mut pr, &e1);
    pr.on_policy_match(&pol, &e1);
    pr.on_policy_match(&pol, &e2);
    pr.flush();
    pr.on_datamodel_status(SyncStatus::ResyncInProgress);
    pr.flush();
    assert!(updates(&rec).is_empty());
    assert_eq!(pr.dirty_len(), 2);

    pr.on_datamodel_status(SyncStatus::InSync);
    pr.flush();
    let mut keys: Vec<EndpointKey> = updates(&rec).into_iter().map(|u| u.key).collect();
    keys.sort();
    assert_eq!(keys, vec![e1, e2]);
}

#[test]
fn tiers_and_policies_follow_sorter_order() {
    let (mut pr, rec) = create_resolver();
    pr.on_datamodel_status(SyncStatus::InSync);
    let ep = ep_key();
    pr.on_update(&Update::tier("security", Tier { order: Some(1.0) }));
    let s1 = PolicyKey::global("security", "s1");
    let d_late = PolicyKey::global("default", "a-late");
    let d_early = PolicyKey::global("default", "z-early");
    let d_unmatched = PolicyKey::global("default", "m-unmatched");
    add_policy(&mut pr, &s1, None);
    add_policy(&mut pr, &d_late, None);
    add_policy(&mut pr, &d_early, Some(10.0));
    add_policy(&mut pr, &d_unmatched, Some(5.0));
    for p in [&d_late, &s1, &d_early] {
        pr.on_policy_match(p, &ep);
    }
    pr.flush();
    let got = updates(&rec);
    assert_eq!(got.len(), 1);
    let view: Vec<(String, Vec<String>)> = got[0]
        .tiers
        .iter()
        .map(|t| (t.name.clone(), t.ordered_policies.iter().map(|kv| kv.key.name.clone()).collect()))
        .collect();
    assert_eq!(
        view,
        vec![
            ("security".to_string(), vec!["s1".to_string()]),
            ("default".to_string(), vec!["z-early".to_string(), "a-late".to_string()]),
        ]
    );
}

#[test]
fn policy_and_tier_updates_dirty_matched_endpoints() {
    let (mut pr, rec) = create_resolver();
    pr.on_datamodel_status(SyncStatus::InSync);
    let ep = ep_key();
    let other = EndpointKey::host("host1", "eth9");
    let pol = PolicyKey::global("app", "p");
    add_policy(&mut pr, &pol, None);
    pr.on_policy_match(&pol, &ep);
    add_endpoint(&mut pr, &other);
    pr.flush();
    clear(&rec);

    add_policy(&mut pr, &pol, None);
    assert_eq!(pr.dirty_len(), 0, "identical policy update is quiet");
    add_policy(&mut pr, &pol, Some(3.0));
    assert!(pr.is_dirty(&ep));
    assert!(!pr.is_dirty(&other));
    pr.flush();
    assert_eq!(updates(&rec)[0].tiers[0].ordered_policies[0].value.order, Some(3.0));
    assert!(!updates(&rec)[0].tiers[0].valid);
    clear(&rec);

    pr.on_update(&Update::tier("app", Tier { order: Some(2.0) }));
    assert!(pr.is_dirty(&ep));
    pr.flush();
    let t = &updates(&rec)[0].tiers[0];
    assert!(t.valid);
    assert_eq!(t.order, Some(2.0));
    clear(&rec);

    pr.on_update(&Update::deletion(ResourceKey::Tier(polres_core::TierKey { name: "app".into() })));
    pr.flush();
    assert!(!updates(&rec)[0].tiers[0].valid, "deleted tier is still reported, as invalid");
}

#[test]
fn computed_data_is_included_in_flush() {
    let (mut pr, rec) = create_resolver();
    pr.on_datamodel_status(SyncStatus::InSync);
    let ep = ep_key();
    add_endpoint(&mut pr, &ep);
    let pol = PolicyKey::global("default", "test-policy");
    add_policy(&mut pr, &pol, None);
    pr.on_policy_match(&pol, &ep);
    pr.on_endpoint_computed_data_update(&ep, &kind_a(), Some(Arc::new(TestComputedData("hello".into()))));
    pr.flush();
    let got = updates(&rec);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].computed, vec!["hello".to_string()]);
}

#[test]
fn computed_data_nil_removes_and_cleans_up() {
    let (mut pr, rec) = create_resolver();
    pr.on_datamodel_status(SyncStatus::InSync);
    let ep = ep_key();
    add_endpoint(&mut pr, &ep);
    pr.on_endpoint_computed_data_update(&ep, &kind_a(), Some(Arc::new(TestComputedData("hello".into()))));
    pr.flush();
    clear(&rec);

    pr.on_endpoint_computed_data_update(&ep, &kind_a(), None);
    pr.flush();
    let got = updates(&rec);
    assert_eq!(got.len(), 1);
    assert!(got[0].computed.is_empty());
    assert!(!pr.has_computed_data(&ep));
}

#[test]
fn computed_data_nil_to_nil_does_not_dirty() {
    let (mut pr, _rec) = create_resolver();
    pr.on_datamodel_status(SyncStatus::InSync);
    let ep = ep_key();
    add_endpoint(&mut pr, &ep);
    pr.flush();
    assert!(!pr.is_dirty(&ep));

    pr.on_endpoint_computed_data_update(&ep, &kind_a(), None);
    assert!(!pr.is_dirty(&ep));

    // removing one kind while another exists is also a no-op
    pr.on_endpoint_computed_data_update(&ep, &kind_b(), Some(Arc::new(TestComputedData("b".into()))));
    pr.flush();
    pr.on_endpoint_computed_data_update(&ep, &kind_a(), None);
    assert!(!pr.is_dirty(&ep));
}

#[test]
fn computed_data_same_value_is_a_noop() {
    let (mut pr, _rec) = create_resolver();
    pr.on_datamodel_status(SyncStatus::InSync);
    let ep = ep_key();
    let v: Arc<dyn EndpointComputedData> = Arc::new(TestComputedData("x".into()));
    pr.on_endpoint_computed_data_update(&ep, &kind_a(), Some(Arc::clone(&v)));
    pr.flush();
    pr.on_endpoint_computed_data_update(&ep, &kind_a(), Some(v));
    assert!(!pr.is_dirty(&ep));
}

#[test]
fn computed_data_multiple_kinds() {
    let (mut pr, rec) = create_resolver();
    pr.on_datamodel_status(SyncStatus::InSync);
    let ep = ep_key();
    add_endpoint(&mut pr, &ep);
    let pol = PolicyKey::global("default", "test-policy");
    add_policy(&mut pr, &pol, None);
    pr.on_policy_match(&pol, &ep);
    pr.on_endpoint_computed_data_update(&ep, &kind_a(), Some(Arc::new(TestComputedData("a".into()))));
    pr.on_endpoint_computed_data_update(&ep, &kind_b(), Some(Arc::new(TestComputedData("b".into()))));
    pr.flush();
    let got = updates(&rec);
    assert_eq!(got.len(), 1);
    let mut values = got[0].computed.clone();
    values.sort();
    assert_eq!(values, vec!["a".to_string(), "b".to_string()]);
}

#[test]
fn endpoint_delete_cascades() {
    let (mut pr, rec) = create_resolver();
    pr.on_datamodel_status(SyncStatus::InSync);
    let ep = ep_key();
    let pol = PolicyKey::global("default", "p");
    add_endpoint(&mut pr, &ep);
    add_policy(&mut pr, &pol, None);
    pr.on_policy_match(&pol, &ep);
    pr.on_endpoint_computed_data_update(&ep, &kind_a(), Some(Arc::new(TestComputedData("hello".into()))));
    pr.on_endpoint_bgp_peer_data_update(&ep, Some(EndpointBgpPeer { v4_address: Some("10.0.0.1".parse().unwrap()), v6_address: None }));
    pr.flush();
    assert_eq!(updates(&rec)[0].peer.as_ref().and_then(|p| p.v4_address), Some("10.0.0.1".parse().unwrap()));
    clear(&rec);

    pr.on_update(&Update::deletion(ResourceKey::Endpoint(ep.clone())));
    assert!(!pr.has_computed_data(&ep));
    assert!(pr.matched_policies(&ep).is_empty());
    assert!(pr.matching_endpoints(&pol).is_empty());
    assert!(pr.is_dirty(&ep));
    pr.flush();
    let got = updates(&rec);
    assert_eq!(got.len(), 1);
    assert!(got[0].endpoint.is_none());
    assert!(got[0].computed.is_empty());
    assert!(got[0].peer.is_none());
    assert!(got[0].tiers.is_empty());
}

#[test]
fn peer_data_only_dirties_on_change() {
    let (mut pr, _rec) = create_resolver();
    pr.on_datamodel_status(SyncStatus::InSync);
    let ep = ep_key();
    let peer = EndpointBgpPeer { v4_address: None, v6_address: Some("fd00::1".parse().unwrap()) };
    pr.on_endpoint_bgp_peer_data_update(&ep, Some(peer.clone()));
    assert!(pr.is_dirty(&ep));
    pr.flush();
    pr.on_endpoint_bgp_peer_data_update(&ep, Some(peer));
    assert!(!pr.is_dirty(&ep));
    pr.on_endpoint_bgp_peer_data_update(&ep, None);
    assert!(pr.is_dirty(&ep));
    pr.flush();
    pr.on_endpoint_bgp_peer_data_update(&ep, None);
    assert!(!pr.is_dirty(&ep));
}
