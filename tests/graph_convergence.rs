//! End-to-end scenarios exercising the full façade: two independent writers,
//! a sync round trip, and the CAS conflict a concurrent commit must raise.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::time::Duration;

use warp_graph::builder::{DeletePolicy, PatchBuilder};
use warp_graph::clock::Dot;
use warp_graph::config::GraphConfig;
use warp_graph::graph::Graph;
use warp_graph::model::{GraphName, WriterId};
use warp_graph::persistence::{InMemoryPersistence, Persistence};
use warp_graph::state::WarpState;
use warp_graph::sync::{AbortSignal, SyncRequest, SyncResponse, SyncTransport};

fn graph_name() -> GraphName {
    GraphName::new("social").unwrap()
}

fn writer(name: &str) -> WriterId {
    WriterId::new(name).unwrap()
}

struct DirectTransport<'a> {
    remote: &'a mut Graph<InMemoryPersistence>,
}

impl SyncTransport for DirectTransport<'_> {
    fn send_sync_request(
        &mut self,
        _remote: &str,
        request: &SyncRequest,
        _timeout: Duration,
        _abort: &AbortSignal,
    ) -> Result<SyncResponse, warp_graph::error::SyncError> {
        self.remote
            .process_sync_request(request)
            .map_err(|e| warp_graph::error::SyncError::Protocol { reason: e.to_string() })
    }
}

#[test]
fn two_writers_adding_the_same_node_converge_after_sync() {
    let mut alice_graph = Graph::open(InMemoryPersistence::new(), graph_name(), GraphConfig::default());
    alice_graph
        .commit(writer("alice"), DeletePolicy::Reject, |b| {
            b.add_node("user:x");
        })
        .unwrap();

    let mut bob_graph = Graph::open(InMemoryPersistence::new(), graph_name(), GraphConfig::default());
    bob_graph
        .commit(writer("bob"), DeletePolicy::Reject, |b| {
            b.add_node("user:x");
        })
        .unwrap();

    let abort = AbortSignal::new();
    {
        let mut transport = DirectTransport { remote: &mut alice_graph };
        bob_graph.sync_with(&mut transport, "alice", &abort).unwrap();
    }
    {
        let mut transport = DirectTransport { remote: &mut bob_graph };
        alice_graph.sync_with(&mut transport, "bob", &abort).unwrap();
    }

    let alice_state = &alice_graph.cached().unwrap().state;
    let bob_state = &bob_graph.cached().unwrap().state;
    assert_eq!(alice_state, bob_state);

    let live = alice_state.node_alive.live_dots(&"user:x".to_string()).unwrap();
    assert_eq!(live.len(), 2);
    assert!(live.contains(&Dot::new(writer("alice"), 1)));
    assert!(live.contains(&Dot::new(writer("bob"), 1)));
}

#[test]
fn removing_only_one_writers_dot_leaves_the_node_alive() {
    let mut state = WarpState::default();
    state.node_alive.add("user:x".to_string(), Dot::new(writer("alice"), 1));
    state.node_alive.add("user:x".to_string(), Dot::new(writer("bob"), 1));

    let removed = state.node_alive.remove(&"user:x".to_string(), &[Dot::new(writer("alice"), 1)]);
    assert_eq!(removed, vec![Dot::new(writer("alice"), 1)]);
    assert!(state.node_alive.contains(&"user:x".to_string()));
    assert_eq!(state.node_alive.live_dots(&"user:x".to_string()).unwrap().len(), 1);
}

#[test]
fn a_concurrent_commit_against_a_stale_tip_raises_cas_conflict() {
    let mut persistence = InMemoryPersistence::new();
    let state = WarpState::default();

    let mut first = PatchBuilder::new(&persistence, graph_name(), writer("alice"), &state, DeletePolicy::Reject).unwrap();
    first.add_node("user:a");

    let mut second = PatchBuilder::new(&persistence, graph_name(), writer("alice"), &state, DeletePolicy::Reject).unwrap();
    second.add_node("user:b");

    let first_outcome = first.commit(&mut persistence, |_, _| {}).unwrap();

    let err = second.commit(&mut persistence, |_, _| {}).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("CAS") || message.to_lowercase().contains("conflict"), "unexpected message: {message}");

    let ref_name = format!("refs/warp/{}/writers/{}", graph_name(), writer("alice"));
    let tip = persistence.read_ref(&ref_name).unwrap();
    assert_eq!(tip.as_deref(), Some(first_outcome.commit_sha.as_str()));
}

#[test]
fn sync_transfers_only_the_missing_suffix() {
    let mut remote_graph = Graph::open(InMemoryPersistence::new(), graph_name(), GraphConfig::default());
    let first = remote_graph.commit(writer("alice"), DeletePolicy::Reject, |b| { b.add_node("user:1"); }).unwrap();
    remote_graph.commit(writer("alice"), DeletePolicy::Reject, |b| { b.add_node("user:2"); }).unwrap();
    remote_graph.commit(writer("alice"), DeletePolicy::Reject, |b| { b.add_node("user:3"); }).unwrap();

    let mut known_frontier = BTreeMap::new();
    known_frontier.insert(writer("alice"), Some(first.commit_sha.clone()));
    let request = SyncRequest::new(known_frontier);

    let response = remote_graph.process_sync_request(&request).unwrap();
    assert_eq!(response.patches.len(), 2);
    assert!(response.patches.windows(2).all(|w| w[0].patch.lamport < w[1].patch.lamport));
    assert!(response.patches.iter().all(|p| p.patch.lamport > first.patch.lamport));
}

#[test]
fn subscriber_panic_does_not_prevent_other_subscribers_or_the_caller() {
    let mut graph = Graph::open(InMemoryPersistence::new(), graph_name(), GraphConfig::default());
    let seen = std::rc::Rc::new(RefCell::new(0usize));
    let seen_clone = seen.clone();
    graph.subscribe(|_diff| panic!("boom"));
    graph.subscribe(move |_diff| *seen_clone.borrow_mut() += 1);

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        graph.commit(writer("alice"), DeletePolicy::Reject, |b| { b.add_node("user:a"); })
    }));
    assert!(result.is_ok());
    assert_eq!(*seen.borrow(), 1);
}
