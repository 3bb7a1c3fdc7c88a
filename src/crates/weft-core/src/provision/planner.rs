//! The provisioning planner: collect → dedup → select → plan → execute
//!
//! [`provision_node`] walks the caller node plus its ancestor chain,
//! enumerates unresolved outgoing dependencies and inbound affordances, and
//! collects offers from every provisioner in declared order (the iteration
//! index doubles as the default proximity hint). Offers are pure data;
//! selection is a sort by `(cost, proximity, emission index)` with full
//! audit metadata recorded per requirement.
//!
//! Execution is a separate, idempotent step: [`ProvisioningPlan::execute`]
//! runs each accepted offer, binds providers into the graph, and records a
//! [`BuildReceipt`] per step. A failing acceptor yields a rejected receipt
//! and execution continues; nothing aborts the remaining steps.

use std::collections::BTreeSet;

use crate::entity::Matchable;
use indexmap::IndexMap;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::graph::{EdgeKind, Graph};
use crate::requirement::ProvisioningPolicy;

use super::offer::{AffordanceOffer, BuildReceipt, DependencyOffer};
use super::provisioner::Provisioner;
use super::ProvisioningContext;

/// One step of a plan: an accepted offer plus its carriers.
#[derive(Debug, Clone)]
pub struct PlannedOffer {
    pub work: PlannedWork,
    pub requirement_id: Option<Uuid>,
    /// Dependency edge the requirement travelled on, if any.
    pub dependency_edge: Option<Uuid>,
    /// Affordance edge the requirement travelled on, if any.
    pub affordance_edge: Option<Uuid>,
    /// Destination node for affordance broadcasts.
    pub destination: Option<Uuid>,
    pub hard: bool,
}

/// The offer an accepted plan step will execute.
#[derive(Debug, Clone)]
pub enum PlannedWork {
    Dependency(DependencyOffer),
    Affordance(AffordanceOffer),
}

impl PlannedOffer {
    /// Execute this step, binding results into the graph. Failures are
    /// captured in the receipt, never propagated.
    fn execute(&self, graph: &mut Graph, ctx: &mut ProvisioningContext, at_node: Uuid) -> BuildReceipt {
        match &self.work {
            PlannedWork::Dependency(offer) => {
                let receipt = BuildReceipt {
                    provisioner_id: offer.source_provisioner_id,
                    requirement_id: Some(offer.requirement_id),
                    provider_id: None,
                    operation: offer.operation,
                    accepted: false,
                    hard_req: self.hard,
                    reason: None,
                    template_ref: offer.template_ref.clone(),
                    template_content_id: offer.template_content_id,
                };
                match offer.accept(graph, ctx).and_then(|provider| {
                    graph.validate_linkable(provider)?;
                    if graph
                        .get_requirement(offer.requirement_id)
                        .map(|r| r.provider_id().is_none())
                        .unwrap_or(false)
                    {
                        graph.bind_provider(offer.requirement_id, provider)?;
                    }
                    if let Some(req) = graph.get_requirement_mut(offer.requirement_id) {
                        req.satisfied_at_scope_id = Some(at_node);
                    }
                    Ok(provider)
                }) {
                    Ok(provider) => BuildReceipt {
                        provider_id: Some(provider),
                        accepted: true,
                        ..receipt
                    },
                    Err(e) => BuildReceipt {
                        reason: Some(EngineError::AcceptorFailure(e.to_string()).to_string()),
                        ..receipt
                    },
                }
            }
            PlannedWork::Affordance(offer) => {
                let destination = self.destination.unwrap_or(at_node);
                let receipt = BuildReceipt {
                    provisioner_id: offer.source_provisioner_id,
                    requirement_id: None,
                    provider_id: None,
                    operation: ProvisioningPolicy::EXISTING,
                    accepted: false,
                    hard_req: self.hard,
                    reason: None,
                    template_ref: None,
                    template_content_id: None,
                };
                match offer.accept(graph, ctx, destination) {
                    Ok(edge_uid) => {
                        let bound = graph
                            .get_edge(edge_uid)
                            .map(|e| (graph.edge_source(e), e.requirement_id()));
                        let mut provider = None;
                        if let Some((source, requirement)) = bound {
                            provider = source;
                            if let (Some(source), Some(requirement)) = (source, requirement) {
                                let unbound = graph
                                    .get_requirement(requirement)
                                    .map(|r| r.provider_id().is_none())
                                    .unwrap_or(false);
                                if unbound {
                                    if let Err(e) = graph.bind_provider(requirement, source) {
                                        return BuildReceipt {
                                            reason: Some(e.to_string()),
                                            ..receipt
                                        };
                                    }
                                }
                            }
                        }
                        BuildReceipt {
                            requirement_id: graph
                                .get_edge(edge_uid)
                                .and_then(|e| e.requirement_id()),
                            provider_id: provider,
                            accepted: true,
                            ..receipt
                        }
                    }
                    Err(e) => BuildReceipt {
                        reason: Some(EngineError::AcceptorFailure(e.to_string()).to_string()),
                        ..receipt
                    },
                }
            }
        }
    }
}

/// Ordered steps to satisfy one node's frontier. Execution is idempotent.
#[derive(Debug, Clone, Default)]
pub struct ProvisioningPlan {
    pub node: Option<Uuid>,
    pub steps: Vec<PlannedOffer>,
    pub satisfied_requirement_ids: BTreeSet<Uuid>,
    pub already_satisfied_requirement_ids: BTreeSet<Uuid>,
    executed: bool,
    receipts: Vec<BuildReceipt>,
}

impl ProvisioningPlan {
    /// Execute every step once; a second call returns the cached receipts.
    pub fn execute(&mut self, graph: &mut Graph, ctx: &mut ProvisioningContext) -> Vec<BuildReceipt> {
        if self.executed {
            return self.receipts.clone();
        }
        let at_node = self.node.unwrap_or_else(|| Uuid::nil());
        let mut receipts = Vec::new();
        for step in &self.steps {
            // a requirement bound earlier in this plan (or by a previous
            // pass) is not re-provisioned
            if let Some(requirement) = step.requirement_id {
                let bound = graph
                    .get_requirement(requirement)
                    .map(|r| r.provider_id().is_some())
                    .unwrap_or(false);
                if bound {
                    continue;
                }
            }
            receipts.push(step.execute(graph, ctx, at_node));
        }
        self.receipts = receipts.clone();
        self.executed = true;
        receipts
    }

    pub fn planned_accept_count(&self) -> usize {
        self.steps.len()
    }
}

/// Outcome of one planning pass over a node.
#[derive(Debug, Clone, Default)]
pub struct ProvisioningResult {
    pub node: Option<Uuid>,
    pub plan: ProvisioningPlan,
    /// Deduplicated offers per requirement, in arbitration order.
    pub dependency_offers: IndexMap<Uuid, Vec<DependencyOffer>>,
    /// Broadcast offers collected for the node.
    pub affordance_offers: Vec<AffordanceOffer>,
    pub unresolved_hard_requirements: Vec<Uuid>,
    pub waived_soft_requirements: Vec<Uuid>,
    /// Per-requirement audit of the arbitration.
    pub selection_metadata: IndexMap<Uuid, Value>,
}

impl ProvisioningResult {
    /// No hard requirements left dangling.
    pub fn is_viable(&self) -> bool {
        self.unresolved_hard_requirements.is_empty()
    }
}

/// Deduplicate EXISTING offers by provider, keeping the cheapest
/// `(cost, proximity, emission index)` per provider, then order the whole
/// list by the same key.
fn deduplicate_offers(offers: Vec<DependencyOffer>) -> Vec<(usize, DependencyOffer)> {
    let mut best_by_provider: IndexMap<Uuid, (usize, DependencyOffer)> = IndexMap::new();
    let mut rest: Vec<(usize, DependencyOffer)> = Vec::new();

    for (index, offer) in offers.into_iter().enumerate() {
        let key = (offer.cost.value(), offer.proximity.unwrap_or(u32::MAX), index);
        match (offer.operation == ProvisioningPolicy::EXISTING, offer.provider_id) {
            (true, Some(provider)) => match best_by_provider.get(&provider) {
                Some((held_index, held)) => {
                    let held_key =
                        (held.cost.value(), held.proximity.unwrap_or(u32::MAX), *held_index);
                    if key < held_key {
                        best_by_provider.insert(provider, (index, offer));
                    }
                }
                None => {
                    best_by_provider.insert(provider, (index, offer));
                }
            },
            _ => rest.push((index, offer)),
        }
    }

    let mut combined: Vec<(usize, DependencyOffer)> =
        best_by_provider.into_values().chain(rest).collect();
    combined.sort_by_key(|(index, offer)| {
        (offer.cost.value(), offer.proximity.unwrap_or(u32::MAX), *index)
    });
    combined
}

/// Audit metadata for one requirement's arbitration.
fn selection_audit(sorted: &[(usize, DependencyOffer)]) -> Value {
    if sorted.is_empty() {
        return json!({
            "reason": "no_offers",
            "num_offers": 0,
            "all_offers": [],
        });
    }
    let (best_index, best) = &sorted[0];
    json!({
        "reason": "best_cost",
        "selected_cost": best.cost.value(),
        "selected_provider_id": best.provider_id.map(|u| u.to_string()),
        "selected_index": best_index,
        "num_offers": sorted.len(),
        "all_offers": sorted.iter().map(|(i, o)| o.audit_entry(*i)).collect::<Vec<_>>(),
    })
}

/// Plan how to satisfy `node`'s open edges using `provisioners`.
///
/// Collection covers the node and its ancestor chain (outermost first) for
/// dependencies, and the node itself for inbound affordances and broadcast
/// offers. The returned result carries the plan; call
/// [`ProvisioningPlan::execute`] to perform the work.
pub fn provision_node(
    node: Uuid,
    provisioners: &[&dyn Provisioner],
    graph: &Graph,
    ctx: &mut ProvisioningContext,
) -> Result<ProvisioningResult> {
    if graph.get(node).is_none() {
        return Err(EngineError::NotFound(format!("node {node}")));
    }
    if provisioners.is_empty() {
        return Err(EngineError::InvalidCriteria(
            "provisioning requires at least one provisioner".into(),
        ));
    }

    let mut result = ProvisioningResult {
        node: Some(node),
        ..ProvisioningResult::default()
    };
    result.plan.node = Some(node);

    // dependencies flow out of the node and every enclosing scope;
    // outermost scopes resolve first
    let mut chain: Vec<Uuid> = graph.ancestors_of(node);
    chain.reverse();
    chain.push(node);

    // (requirement, dependency edge, source) in resolution order
    let mut dependencies: Vec<(Uuid, Uuid, Option<Uuid>)> = Vec::new();
    for scope in &chain {
        for edge in graph.edges_out(*scope, &crate::entity::Criteria::new()) {
            if edge.kind != EdgeKind::Dependency {
                continue;
            }
            if let Some(requirement) = edge.requirement_id() {
                dependencies.push((requirement, edge.uid(), edge.source_id()));
            }
        }
    }

    // inbound affordances carrying unresolved requirements
    let mut affordances: Vec<(Uuid, Uuid, Option<Uuid>)> = Vec::new();
    for edge in graph.edges_in(node, &crate::entity::Criteria::new()) {
        if edge.kind != EdgeKind::Affordance {
            continue;
        }
        if let Some(requirement) = edge.requirement_id() {
            affordances.push((requirement, edge.uid(), edge.destination_id()));
        }
    }

    // broadcast affordance offers, annotated with the provisioner index as
    // the default proximity
    for (index, provisioner) in provisioners.iter().enumerate() {
        if let Some(node_ref) = graph.get_node(node) {
            for mut offer in provisioner.affordance_offers(node_ref, graph, ctx) {
                if offer.source_provisioner_id.is_none() {
                    offer.source_provisioner_id = Some(provisioner.uid());
                }
                if offer.source_layer.is_none() {
                    offer.source_layer = Some(provisioner.layer().to_string());
                }
                offer.proximity.get_or_insert(index as u32);
                result.affordance_offers.push(offer);
            }
        }
    }

    // collect dependency offers per unresolved requirement
    let mut offer_map: IndexMap<Uuid, Vec<DependencyOffer>> = IndexMap::new();
    let mut carriers: IndexMap<Uuid, (Option<Uuid>, Option<Uuid>, bool)> = IndexMap::new();

    for (requirement_id, edge_uid, source, is_dependency) in dependencies
        .iter()
        .map(|(r, e, s)| (*r, *e, *s, true))
        .chain(affordances.iter().map(|(r, e, s)| (*r, *e, *s, false)))
    {
        let Some(requirement) = graph.get_requirement(requirement_id) else {
            continue;
        };
        let hard = requirement.hard_requirement;
        let entry = carriers.entry(requirement_id).or_insert((None, None, hard));
        if is_dependency {
            entry.0 = Some(edge_uid);
        } else {
            entry.1 = Some(edge_uid);
        }

        if requirement.provider_id().is_some() {
            result
                .plan
                .already_satisfied_requirement_ids
                .insert(requirement_id);
            continue;
        }
        if offer_map.contains_key(&requirement_id) {
            continue;
        }

        ctx.current_requirement_id = Some(requirement_id);
        ctx.current_requirement_label = requirement.entity().label.clone();
        ctx.current_requirement_source_id = source;

        let mut offers = Vec::new();
        for (index, provisioner) in provisioners.iter().enumerate() {
            for mut offer in provisioner.dependency_offers(requirement, graph, ctx) {
                if offer.source_provisioner_id.is_none() {
                    offer.source_provisioner_id = Some(provisioner.uid());
                }
                if offer.source_layer.is_none() {
                    offer.source_layer = Some(provisioner.layer().to_string());
                }
                offer.proximity.get_or_insert(index as u32);
                offers.push(offer);
            }
        }
        offer_map.insert(requirement_id, offers);
    }
    ctx.current_requirement_id = None;
    ctx.current_requirement_label = None;
    ctx.current_requirement_source_id = None;

    // affordance broadcast steps, deduplicated by label per node
    let mut used_labels: BTreeSet<String> = BTreeSet::new();
    if let Some(node_ref) = graph.get_node(node) {
        for offer in &result.affordance_offers {
            if used_labels.contains(&offer.label) {
                continue;
            }
            if !offer.available_for(node_ref) {
                continue;
            }
            used_labels.insert(offer.label.clone());
            result.plan.steps.push(PlannedOffer {
                work: PlannedWork::Affordance(offer.clone()),
                requirement_id: None,
                dependency_edge: None,
                affordance_edge: None,
                destination: Some(node),
                hard: false,
            });
        }
    }

    // arbitrate per requirement
    for (requirement_id, offers) in offer_map {
        let sorted = deduplicate_offers(offers);
        result
            .selection_metadata
            .insert(requirement_id, selection_audit(&sorted));
        result.dependency_offers.insert(
            requirement_id,
            sorted.iter().map(|(_, o)| o.clone()).collect(),
        );

        let (dependency_edge, affordance_edge, hard) =
            carriers.get(&requirement_id).copied().unwrap_or((None, None, true));

        match sorted.into_iter().next() {
            Some((_, best)) => {
                result.plan.satisfied_requirement_ids.insert(requirement_id);
                result.plan.steps.push(PlannedOffer {
                    work: PlannedWork::Dependency(best),
                    requirement_id: Some(requirement_id),
                    dependency_edge,
                    affordance_edge,
                    destination: None,
                    hard,
                });
            }
            None => {
                debug!(requirement = %requirement_id, hard, "no viable offers");
                if hard {
                    result.unresolved_hard_requirements.push(requirement_id);
                } else {
                    result.waived_soft_requirements.push(requirement_id);
                }
            }
        }
    }

    result.unresolved_hard_requirements.dedup();
    result.waived_soft_requirements.dedup();

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Criteria;
    use crate::graph::Node;
    use crate::provision::{GraphProvisioner, TemplateProvisioner};
    use crate::requirement::Requirement;
    use serde_json::json;
    use std::sync::Arc;

    fn ctx() -> ProvisioningContext {
        ProvisioningContext::new(1, Some(7))
    }

    #[test]
    fn test_existing_beats_create() {
        // S3: an existing hero wins over template creation
        let mut graph = Graph::new();
        let hero = graph.add_node(Node::new().labeled("a").tagged(["hero"])).unwrap();
        let stage = graph.add_node(Node::new().labeled("b")).unwrap();

        let requirement = Requirement::new(ProvisioningPolicy::ANY)
            .with_criteria(Criteria::new().has_tags(["hero"]))
            .with_template(json!({"label": "generated-hero", "tags": ["hero"]}));
        let (dep_edge, req_uid) = graph.add_dependency(stage, requirement).unwrap();

        let existing = GraphProvisioner::new();
        let creator = TemplateProvisioner::new();
        let mut pctx = ctx();
        let mut result = provision_node(
            stage,
            &[&existing as &dyn Provisioner, &creator as &dyn Provisioner],
            &graph,
            &mut pctx,
        )
        .unwrap();

        // both provisioners offered; the EXISTING offer sorts first
        assert_eq!(result.dependency_offers[&req_uid].len(), 2);
        assert_eq!(result.dependency_offers[&req_uid][0].provider_id, Some(hero));

        let receipts = result.plan.execute(&mut graph, &mut pctx);
        assert_eq!(receipts.len(), 1);
        assert!(receipts[0].accepted);
        assert_eq!(receipts[0].provider_id, Some(hero));
        assert_eq!(
            graph.edge_destination(graph.get_edge(dep_edge).unwrap()),
            Some(hero)
        );
        // no phantom node was created
        assert!(graph
            .find_node(&Criteria::new().label("generated-hero"))
            .is_none());
    }

    #[test]
    fn test_hard_requirement_unresolved() {
        // S4: nothing matches and nothing can be built
        let mut graph = Graph::new();
        let stage = graph.add_node(Node::new().labeled("b")).unwrap();
        let requirement = Requirement::new(ProvisioningPolicy::EXISTING)
            .with_criteria(Criteria::new().has_tags(["dragon"]));
        let (_, req_uid) = graph.add_dependency(stage, requirement).unwrap();

        let existing = GraphProvisioner::new();
        let mut pctx = ctx();
        let mut result =
            provision_node(stage, &[&existing as &dyn Provisioner], &graph, &mut pctx).unwrap();

        assert_eq!(result.unresolved_hard_requirements, vec![req_uid]);
        assert!(!result.is_viable());
        assert!(result.plan.steps.is_empty());

        result.plan.execute(&mut graph, &mut pctx);
        assert!(graph.get_requirement(req_uid).unwrap().provider_id().is_none());
    }

    #[test]
    fn test_soft_requirement_waived() {
        let mut graph = Graph::new();
        let stage = graph.add_node(Node::new()).unwrap();
        let requirement = Requirement::new(ProvisioningPolicy::EXISTING)
            .with_criteria(Criteria::new().has_tags(["optional"]))
            .soft();
        let (_, req_uid) = graph.add_dependency(stage, requirement).unwrap();

        let existing = GraphProvisioner::new();
        let mut pctx = ctx();
        let result =
            provision_node(stage, &[&existing as &dyn Provisioner], &graph, &mut pctx).unwrap();
        assert_eq!(result.waived_soft_requirements, vec![req_uid]);
        assert!(result.is_viable());
    }

    #[test]
    fn test_dedup_keeps_cheapest_per_provider() {
        // two EXISTING offers for the same provider at different proximities
        let requirement_id = Uuid::new_v4();
        let provider = Uuid::new_v4();
        let cheap = DependencyOffer::new(
            requirement_id,
            ProvisioningPolicy::EXISTING,
            super::super::ProvisionCost::Direct,
            Arc::new(move |_, _| Ok(provider)),
        )
        .with_provider(provider)
        .at_proximity(0, "same node");
        let dear = DependencyOffer::new(
            requirement_id,
            ProvisioningPolicy::EXISTING,
            super::super::ProvisionCost::Direct,
            Arc::new(move |_, _| Ok(provider)),
        )
        .with_provider(provider)
        .at_proximity(20, "distant");

        let sorted = deduplicate_offers(vec![dear, cheap]);
        assert_eq!(sorted.len(), 1);
        assert_eq!(sorted[0].1.proximity, Some(0));
    }

    #[test]
    fn test_plan_execute_idempotent() {
        let mut graph = Graph::new();
        let hero = graph.add_node(Node::new().tagged(["hero"])).unwrap();
        let stage = graph.add_node(Node::new()).unwrap();
        let requirement = Requirement::new(ProvisioningPolicy::EXISTING)
            .with_criteria(Criteria::new().has_tags(["hero"]));
        graph.add_dependency(stage, requirement).unwrap();

        let existing = GraphProvisioner::new();
        let mut pctx = ctx();
        let mut result =
            provision_node(stage, &[&existing as &dyn Provisioner], &graph, &mut pctx).unwrap();
        let first = result.plan.execute(&mut graph, &mut pctx);
        let second = result.plan.execute(&mut graph, &mut pctx);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].provider_id, Some(hero));
        assert_eq!(second.len(), first.len());
        assert!(second[0].accepted);
    }

    #[test]
    fn test_acceptor_failure_recorded_and_continues() {
        let mut graph = Graph::new();
        let stage = graph.add_node(Node::new()).unwrap();
        let req_a = Requirement::new(ProvisioningPolicy::ANY)
            .with_criteria(Criteria::new().has_tags(["broken"]))
            .with_template(json!({"label": "unused"}));
        let (_, req_a_uid) = graph.add_dependency(stage, req_a).unwrap();
        let req_b = Requirement::new(ProvisioningPolicy::ANY)
            .with_criteria(Criteria::new().has_tags(["fine"]))
            .with_template(json!({"label": "built", "tags": ["fine"]}));
        graph.add_dependency(stage, req_b).unwrap();

        // a provisioner whose acceptor always fails, for one requirement only
        struct Exploding {
            base: crate::entity::Entity,
            target: Uuid,
        }
        impl Provisioner for Exploding {
            fn uid(&self) -> Uuid {
                self.base.uid()
            }
            fn dependency_offers(
                &self,
                requirement: &Requirement,
                _graph: &Graph,
                _ctx: &mut ProvisioningContext,
            ) -> Vec<DependencyOffer> {
                if requirement.uid() != self.target {
                    return Vec::new();
                }
                vec![DependencyOffer::new(
                    requirement.uid(),
                    ProvisioningPolicy::CREATE,
                    super::super::ProvisionCost::Create,
                    Arc::new(|_, _| Err(EngineError::handler("kaboom"))),
                )]
            }
        }

        let exploding = Exploding {
            base: crate::entity::Entity::new(),
            target: req_a_uid,
        };
        let creator = TemplateProvisioner::new();
        let mut pctx = ctx();
        let mut result = provision_node(
            stage,
            &[&exploding as &dyn Provisioner, &creator as &dyn Provisioner],
            &graph,
            &mut pctx,
        )
        .unwrap();

        let receipts = result.plan.execute(&mut graph, &mut pctx);
        assert_eq!(receipts.len(), 2);
        let failed = receipts.iter().find(|r| !r.accepted).unwrap();
        assert_eq!(failed.requirement_id, Some(req_a_uid));
        assert!(failed.reason.as_deref().unwrap().contains("kaboom"));
        let ok = receipts.iter().find(|r| r.accepted).unwrap();
        assert!(ok.provider_id.is_some());
        // the successful step still built its node
        assert!(graph.find_node(&Criteria::new().label("built")).is_some());
    }

    #[test]
    fn test_ancestor_dependencies_collected() {
        let mut graph = Graph::new();
        let node = graph.add_node(Node::new().labeled("inner")).unwrap();
        let scene = graph
            .add_subgraph(crate::graph::Subgraph::new().labeled("scene"))
            .unwrap();
        graph.add_member(scene, node).unwrap();
        let hero = graph.add_node(Node::new().tagged(["hero"])).unwrap();

        // the *scene* needs a hero; provisioning the inner node resolves it
        let requirement = Requirement::new(ProvisioningPolicy::EXISTING)
            .with_criteria(Criteria::new().has_tags(["hero"]));
        let (_, req_uid) = graph.add_dependency(scene, requirement).unwrap();

        let existing = GraphProvisioner::new();
        let mut pctx = ctx();
        let mut result =
            provision_node(node, &[&existing as &dyn Provisioner], &graph, &mut pctx).unwrap();
        result.plan.execute(&mut graph, &mut pctx);
        assert_eq!(graph.get_requirement(req_uid).unwrap().provider_id(), Some(hero));
    }

    #[test]
    fn test_affordance_broadcast_deduped_by_label() {
        use crate::provision::{AffordanceSpec, CompanionProvisioner};

        let mut graph = Graph::new();
        let robot = graph.add_node(Node::new().labeled("robot")).unwrap();
        let twin = graph.add_node(Node::new().labeled("twin")).unwrap();
        let here = graph.add_node(Node::new().labeled("here")).unwrap();

        let first = CompanionProvisioner::new(robot).offering(AffordanceSpec::new("talk"));
        let second = CompanionProvisioner::new(twin).offering(AffordanceSpec::new("talk"));

        let mut pctx = ctx();
        let mut result = provision_node(
            here,
            &[&first as &dyn Provisioner, &second as &dyn Provisioner],
            &graph,
            &mut pctx,
        )
        .unwrap();

        // both broadcast "talk", only one step planned
        assert_eq!(result.affordance_offers.len(), 2);
        assert_eq!(result.plan.steps.len(), 1);

        let receipts = result.plan.execute(&mut graph, &mut pctx);
        assert_eq!(receipts.len(), 1);
        assert!(receipts[0].accepted);
        assert_eq!(receipts[0].provider_id, Some(robot));
        assert_eq!(graph.edges_in(here, &Criteria::new()).count(), 1);
    }
}
