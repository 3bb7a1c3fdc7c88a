//! End-to-end scenarios across the public API: dispatch ordering, layer
//! precedence, provisioning arbitration, and journal sectioning.

use std::sync::Arc;

use serde_json::json;

use weft_core::behavior::{priority, Behavior, HandlerReply};
use weft_core::context::DispatchCtx;
use weft_core::cursor::{Cursor, StepOutcome};
use weft_core::dispatch::{BehaviorRegistry, DispatchArgs};
use weft_core::entity::{Criteria, ItemKind, Matchable};
use weft_core::graph::{Graph, Node};
use weft_core::provision::{
    provision_node, CloningProvisioner, GraphProvisioner, Provisioner, ProvisioningContext,
    TemplateProvisioner,
};
use weft_core::record::CallReceipt;
use weft_core::requirement::{ProvisioningPolicy, Requirement};
use weft_core::singleton::{Singleton, SingletonStore};
use weft_core::stream::StreamRegistry;
use weft_core::HandlerLayer;
use weft_core::Record;

fn reply(value: &'static str) -> impl Fn(weft_core::behavior::BoundCall<'_, '_>) -> weft_core::Result<HandlerReply> {
    move |_| Ok(HandlerReply::ok(json!(value)))
}

// S1: two handlers on one task run in priority order.
#[test]
fn simple_dispatch_runs_in_priority_order() {
    let mut registry = BehaviorRegistry::new(HandlerLayer::Global);
    registry
        .add_behavior(
            Behavior::new(reply("h1"))
                .labeled("h1")
                .with_task("greet")
                .with_priority(priority::LATE),
        )
        .unwrap();
    registry
        .add_behavior(
            Behavior::new(reply("h2"))
                .labeled("h2")
                .with_task("greet")
                .with_priority(priority::EARLY),
        )
        .unwrap();

    let mut graph = Graph::new();
    let caller = Node::new().labeled("x");
    let mut ctx = DispatchCtx::new(&mut graph);
    let receipts = registry
        .dispatch(&caller, DispatchArgs::new().task("greet"), &mut ctx)
        .unwrap()
        .drain();

    let labels: Vec<_> = receipts.iter().map(|r| r.result.clone()).collect();
    assert_eq!(labels, [json!("h2"), json!("h1")]);
}

// S2: a LOCAL-layer handler runs after (and clobbers) the GLOBAL one.
#[test]
fn layer_clobbering_prefers_local_result() {
    let mut global = BehaviorRegistry::new(HandlerLayer::Global);
    global
        .add_behavior(
            Behavior::new(reply("global"))
                .with_task("render")
                .for_caller(ItemKind::Node),
        )
        .unwrap();
    let mut local = BehaviorRegistry::new(HandlerLayer::Local);
    local
        .add_behavior(
            Behavior::new(reply("local"))
                .with_task("render")
                .for_caller(ItemKind::Node),
        )
        .unwrap();

    let mut graph = Graph::new();
    let node = Node::new().labeled("n");
    let mut ctx = DispatchCtx::new(&mut graph);
    let receipts = BehaviorRegistry::chain_dispatch(
        [&global, &local],
        &node,
        DispatchArgs::new().task("render"),
        &mut ctx,
    )
    .unwrap()
    .drain();

    assert_eq!(receipts.len(), 2);
    assert_eq!(receipts[0].result, json!("global"));
    assert_eq!(receipts[1].result, json!("local"));
    assert_eq!(CallReceipt::last_result(&receipts), Some(&json!("local")));
}

// S3: an EXISTING offer beats template creation on cost.
#[test]
fn provisioning_prefers_existing_over_create() {
    let mut graph = Graph::new();
    let hero = graph.add_node(Node::new().labeled("a").tagged(["hero"])).unwrap();
    let stage = graph.add_node(Node::new().labeled("b")).unwrap();

    let requirement = Requirement::new(ProvisioningPolicy::ANY)
        .with_criteria(Criteria::new().has_tags(["hero"]))
        .with_template(json!({"label": "stand-in", "tags": ["hero"]}));
    let (dep_edge, _) = graph.add_dependency(stage, requirement).unwrap();

    let existing = GraphProvisioner::new();
    let creator = TemplateProvisioner::new();
    let mut pctx = ProvisioningContext::new(1, Some(11));
    let mut result = provision_node(
        stage,
        &[&existing as &dyn Provisioner, &creator as &dyn Provisioner],
        &graph,
        &mut pctx,
    )
    .unwrap();
    let receipts = result.plan.execute(&mut graph, &mut pctx);

    assert!(receipts.iter().all(|r| r.accepted));
    assert_eq!(
        graph.edge_destination(graph.get_edge(dep_edge).unwrap()),
        Some(hero)
    );
    assert!(graph.find_node(&Criteria::new().label("stand-in")).is_none());
}

// S4: a hard requirement with no offers is reported, not bound.
#[test]
fn hard_requirement_without_offers_is_unresolved() {
    let mut graph = Graph::new();
    let stage = graph.add_node(Node::new().labeled("b")).unwrap();
    let requirement = Requirement::new(ProvisioningPolicy::EXISTING)
        .with_criteria(Criteria::new().has_tags(["dragon"]));
    let (_, req_uid) = graph.add_dependency(stage, requirement).unwrap();

    let existing = GraphProvisioner::new();
    let mut pctx = ProvisioningContext::new(1, None);
    let result =
        provision_node(stage, &[&existing as &dyn Provisioner], &graph, &mut pctx).unwrap();

    assert_eq!(result.unresolved_hard_requirements, vec![req_uid]);
    assert!(result.plan.steps.is_empty());
    assert!(graph.get_requirement(req_uid).unwrap().provider_id().is_none());
}

// S5: push_records batches land in disjoint half-open sections.
#[test]
fn journal_sections_match_batches() {
    let mut stream = StreamRegistry::new();
    let r1 = Record::new("fragment").labeled("r1");
    let r2 = Record::new("fragment").labeled("r2");
    let r3 = Record::new("fragment").labeled("r3");

    stream.push_records(vec![r1, r2], "entry", Some("a")).unwrap();
    stream.push_records(vec![r3], "entry", Some("b")).unwrap();

    let a: Vec<_> = stream
        .get_section("a", "entry", &Criteria::new())
        .unwrap()
        .iter()
        .map(|r| r.display_label())
        .collect();
    let b: Vec<_> = stream
        .get_section("b", "entry", &Criteria::new())
        .unwrap()
        .iter()
        .map(|r| r.display_label())
        .collect();
    assert_eq!(a, ["r1", "r2"]);
    assert_eq!(b, ["r3"]);
}

// S6: CLONE copies the reference node and applies template overrides.
#[test]
fn clone_policy_evolves_reference() {
    let mut graph = Graph::new();
    let reference = graph
        .add_node(Node::new().labeled("guard").with_attr("color", json!("red")))
        .unwrap();
    let stage = graph.add_node(Node::new().labeled("post")).unwrap();

    let requirement = Requirement::new(ProvisioningPolicy::CLONE)
        .with_reference(reference)
        .with_template(json!({"color": "blue"}));
    let (_, req_uid) = graph.add_dependency(stage, requirement).unwrap();

    let cloner = CloningProvisioner::new();
    let mut pctx = ProvisioningContext::new(1, None);
    let mut result =
        provision_node(stage, &[&cloner as &dyn Provisioner], &graph, &mut pctx).unwrap();
    let receipts = result.plan.execute(&mut graph, &mut pctx);

    assert_eq!(receipts.len(), 1);
    assert!(receipts[0].accepted);
    let clone_uid = receipts[0].provider_id.unwrap();
    assert_ne!(clone_uid, reference);
    assert_eq!(
        graph.get_node(clone_uid).unwrap().entity().attr("color"),
        Some(&json!("blue"))
    );
    assert_eq!(graph.get_requirement(req_uid).unwrap().provider_id(), Some(clone_uid));
}

// A full cursor drive: render, advance, render again, inspect the journal.
#[test]
fn cursor_walk_renders_each_node_once() {
    let mut graph = Graph::new();
    let start = graph.add_node(Node::new().labeled("start")).unwrap();
    let middle = graph.add_node(Node::new().labeled("middle")).unwrap();
    let finale = graph.add_node(Node::new().labeled("finale")).unwrap();
    graph.add_edge(weft_core::graph::Edge::link(Some(start), Some(middle))).unwrap();
    graph.add_edge(weft_core::graph::Edge::link(Some(middle), Some(finale))).unwrap();

    let mut cursor = Cursor::new(graph);
    cursor.set_position(start).unwrap();
    cursor
        .core_mut()
        .add_behavior(
            Behavior::new(|bound| {
                let here = bound.ctx.ns.get("here").cloned().unwrap_or_default();
                Ok(HandlerReply::fragment(json!({ "at": here })))
            })
            .with_task("render"),
        )
        .unwrap();
    cursor
        .core_mut()
        .add_behavior(
            Behavior::new(move |bound| {
                // walk the chain; stop at the finale
                match bound.call.caller_id {
                    Some(uid) if Some(uid) == bound.ctx.position => {
                        let edge = bound
                            .ctx
                            .graph
                            .edges_out(uid, &Criteria::new())
                            .next()
                            .map(|e| e.uid());
                        match edge {
                            Some(edge) => Ok(HandlerReply::edge(edge)),
                            None => Ok(HandlerReply::none()),
                        }
                    }
                    _ => Ok(HandlerReply::none()),
                }
            })
            .with_task("continue"),
        )
        .unwrap();

    assert_eq!(cursor.step().unwrap(), StepOutcome::Advanced(middle));
    assert_eq!(cursor.step().unwrap(), StepOutcome::Advanced(finale));
    assert_eq!(cursor.step().unwrap(), StepOutcome::AwaitingInput);

    let fragments = cursor.journal.iter_channel("fragment", &Criteria::new());
    let stops: Vec<_> = fragments.iter().map(|r| r.payload()["at"].clone()).collect();
    assert_eq!(stops, [json!("start"), json!("middle"), json!("finale")]);

    // three step entries, three disjoint sections
    for (step, label) in [(1, "start"), (2, "middle"), (3, "finale")] {
        let section = cursor
            .journal
            .get_section(&format!("step{step}"), "entry", &Criteria::new())
            .unwrap();
        assert_eq!(section.len(), 1);
        assert_eq!(section[0].payload()["at"], json!(label));
    }
}

// A cursor step resolves frontier dependencies before rendering.
#[test]
fn cursor_resolve_phase_binds_dependencies() {
    let mut graph = Graph::new();
    let hero = graph.add_node(Node::new().labeled("hero").tagged(["hero"])).unwrap();
    let stage = graph.add_node(Node::new().labeled("stage")).unwrap();
    let requirement = Requirement::new(ProvisioningPolicy::EXISTING)
        .with_criteria(Criteria::new().has_tags(["hero"]));
    let (_, req_uid) = graph.add_dependency(stage, requirement).unwrap();

    let mut cursor = Cursor::new(graph);
    cursor.set_position(stage).unwrap();
    cursor.add_provisioner(Box::new(GraphProvisioner::new()));

    assert_eq!(cursor.step().unwrap(), StepOutcome::AwaitingInput);
    assert_eq!(cursor.graph.get_requirement(req_uid).unwrap().provider_id(), Some(hero));

    // the planning receipt landed on its channel
    let planning = cursor.journal.last(Some("planning_receipt"), &Criteria::new()).unwrap();
    assert_eq!(planning.payload()["attached"], json!(1));
    assert_eq!(planning.payload()["resolved_dependencies"], json!(1));
}

// Property 9: records cannot be mutated after append; updates are new
// records with fresh seqs.
#[test]
fn record_updates_are_new_records() {
    let mut stream = StreamRegistry::new();
    let first = Record::new("state").labeled("door").with_payload(json!({"open": false}));
    let first_uid = first.uid();
    stream.add_record(first).unwrap();

    // the "update" idiom: construct a successor record
    let updated = Record::new("state").labeled("door").with_payload(json!({"open": true}));
    assert_ne!(updated.uid(), first_uid);
    stream.add_record(updated).unwrap();

    let latest = stream.last(Some("state"), &Criteria::new()).unwrap();
    assert_eq!(latest.payload()["open"], json!(true));
    assert_eq!(stream.len(), 2);
    assert!(stream.remove(first_uid).is_err());
}

// Property 10: singleton lookups are stable until cleared.
#[test]
fn singleton_idempotent_until_cleared() {
    let mut store = SingletonStore::new("Voice");
    store.register(Singleton::new("narrator")).unwrap();

    let a = store.get("narrator").unwrap();
    let b = store.get("narrator").unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.entity().uid(), b.entity().uid());

    store.clear();
    assert!(store.get("narrator").is_none());
    let fresh = store.register(Singleton::new("narrator")).unwrap();
    assert_ne!(fresh.entity().uid(), a.entity().uid());
}

// Property 8: dedup keeps the lower-cost EXISTING offer per provider.
#[test]
fn existing_offers_deduplicated_by_provider() {
    let mut graph = Graph::new();
    let hero = graph.add_node(Node::new().tagged(["hero"])).unwrap();
    let stage = graph.add_node(Node::new()).unwrap();
    let requirement = Requirement::new(ProvisioningPolicy::EXISTING)
        .with_criteria(Criteria::new().has_tags(["hero"]));
    let (_, req_uid) = graph.add_dependency(stage, requirement).unwrap();

    // two graph provisioners both offer the same hero; one survives dedup
    let near = GraphProvisioner::new();
    let far = GraphProvisioner::new();
    let mut pctx = ProvisioningContext::new(1, None);
    let result = provision_node(
        stage,
        &[&near as &dyn Provisioner, &far as &dyn Provisioner],
        &graph,
        &mut pctx,
    )
    .unwrap();

    let offers = &result.dependency_offers[&req_uid];
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].provider_id, Some(hero));

    let audit = &result.selection_metadata[&req_uid];
    assert_eq!(audit["num_offers"], json!(1));
    assert_eq!(audit["reason"], json!("best_cost"));
}

// Dead-letter check for ERROR receipts: handler failures surface, the
// pipeline continues.
#[test]
fn handler_failure_yields_error_receipt_and_continues() {
    let mut registry = BehaviorRegistry::new(HandlerLayer::Global);
    registry
        .add_behavior(
            Behavior::new(|_| Err(weft_core::EngineError::handler("boom")))
                .labeled("exploder")
                .with_priority(priority::EARLY),
        )
        .unwrap();
    registry
        .add_behavior(Behavior::new(reply("after")).with_priority(priority::LATE))
        .unwrap();

    let mut graph = Graph::new();
    let caller = Node::new();
    let mut ctx = DispatchCtx::new(&mut graph);
    let receipts = registry
        .dispatch(&caller, DispatchArgs::new(), &mut ctx)
        .unwrap()
        .drain();

    assert_eq!(receipts.len(), 2);
    assert_eq!(receipts[0].result_code, weft_core::ResultCode::Error);
    assert_eq!(receipts[1].result, json!("after"));
}
