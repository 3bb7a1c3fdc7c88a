//! The cursor: ordered phase execution against a graph
//!
//! One cursor advances through one graph. Each [`Cursor::step`] runs the
//! fixed phase order against the node under the cursor:
//!
//! 1. **Gather** — assemble the tiered namespace (globals < graph <
//!    ancestors < node).
//! 2. **Resolve** — run the provisioning planner over the frontier, execute
//!    the plan, journal a planning receipt, then dispatch the `redirect`
//!    task; an edge result advances the cursor immediately (chains are
//!    followed transitively with a cycle guard) and ends the step.
//! 3. **Gate** — dispatch `gate`; any falsy non-null verdict blocks the
//!    render phase for this step.
//! 4. **Render** — dispatch `render`; non-null OK results become fragment
//!    records pushed as one journal entry (one marker per step).
//! 5. **Finalize** — dispatch `continue`; the first edge result advances the
//!    cursor, otherwise the step blocks awaiting input.
//!
//! Every phase consults the same layer stack: the GLOBAL core, the active
//! layers (system / application / author), and the node-local registry.
//! Behaviors see a [`DispatchCtx`] with the single-writer graph and the
//! step's accumulating receipts; external input re-enters through
//! [`Cursor::choose`].

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::context::{DispatchCtx, ScopedMap, Tier};
use crate::dispatch::{BehaviorRegistry, DispatchArgs, LayeredDispatch};
use crate::entity::Matchable;
use crate::error::{EngineError, Result};
use crate::graph::Graph;
use crate::behavior::HandlerLayer;
use crate::provision::{provision_node, PlanningReceipt, Provisioner, ProvisioningContext};
use crate::record::{is_truthy, CallReceipt, Record, ResultCode};
use crate::stream::StreamRegistry;

/// How a step ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Resolution produced a redirect; the cursor moved without rendering.
    Redirected(Uuid),
    /// A continuation fired after rendering; the cursor moved.
    Advanced(Uuid),
    /// Rendered and blocked pending external input.
    AwaitingInput,
}

/// Single-threaded step driver owning the graph, the journal, and the
/// behavior layer stack.
pub struct Cursor {
    pub graph: Graph,
    pub journal: StreamRegistry,
    /// GLOBAL core dispatch, always consulted.
    pub dispatch: LayeredDispatch,
    /// Active system / application / author layers, in precedence order.
    pub layers: Vec<BehaviorRegistry>,
    // node-local registries (LOCAL layer), keyed by node
    local: HashMap<Uuid, BehaviorRegistry>,
    provisioners: Vec<Box<dyn Provisioner>>,
    /// Outermost namespace tier.
    pub globals: Map<String, Value>,
    /// Seed for deterministic provisioning RNG; falls back to the step
    /// counter when unset.
    pub rng_seed: Option<u64>,
    position: Option<Uuid>,
    step: u64,
    /// Receipts from the most recent step, in invocation order.
    pub last_receipts: Vec<CallReceipt>,
}

impl Cursor {
    pub fn new(graph: Graph) -> Self {
        Self {
            graph,
            journal: StreamRegistry::new(),
            dispatch: LayeredDispatch::new(),
            layers: Vec::new(),
            local: HashMap::new(),
            provisioners: Vec::new(),
            globals: Map::new(),
            rng_seed: None,
            position: None,
            step: 0,
            last_receipts: Vec::new(),
        }
    }

    pub fn position(&self) -> Option<Uuid> {
        self.position
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// Park the cursor on a registered node.
    pub fn set_position(&mut self, node: Uuid) -> Result<()> {
        self.graph.validate_linkable(node)?;
        self.position = Some(node);
        Ok(())
    }

    /// The GLOBAL core registry.
    pub fn core_mut(&mut self) -> &mut BehaviorRegistry {
        &mut self.dispatch.core
    }

    pub fn add_layer(&mut self, layer: BehaviorRegistry) {
        self.layers.push(layer);
    }

    pub fn add_provisioner(&mut self, provisioner: Box<dyn Provisioner>) {
        self.provisioners.push(provisioner);
    }

    /// Node-local registry, created on first use.
    pub fn local_mut(&mut self, node: Uuid) -> &mut BehaviorRegistry {
        self.local
            .entry(node)
            .or_insert_with(|| BehaviorRegistry::new(HandlerLayer::Local).labeled("local"))
    }

    /// Assemble the tiered namespace for a step at `node`.
    fn gather(&self, node: Uuid) -> ScopedMap {
        let mut ns = ScopedMap::new();
        ns.inject(Tier::Global, self.globals.clone());

        let mut graph_layer = Map::new();
        if let Some(label) = &self.graph.label {
            graph_layer.insert("graph".into(), Value::String(label.clone()));
        }
        graph_layer.insert("step".into(), Value::from(self.step));
        ns.inject(Tier::Graph, graph_layer);

        // outermost ancestors first so inner scopes shadow them
        let mut ancestors = self.graph.ancestors_of(node);
        ancestors.reverse();
        for ancestor in ancestors {
            if let Some(item) = self.graph.get(ancestor) {
                ns.inject(Tier::Ancestor, item.entity().attrs.clone());
            }
        }
        if let Some(item) = self.graph.get(node) {
            let mut node_layer = item.entity().attrs.clone();
            node_layer.insert("here".into(), Value::String(item.display_label()));
            ns.inject(Tier::Node, node_layer);
        }
        ns
    }

    /// Execute one full step at the current position.
    pub fn step(&mut self) -> Result<StepOutcome> {
        let position = self
            .position
            .ok_or_else(|| EngineError::NotFound("cursor position is not set".into()))?;
        if !self.graph.contains(position) {
            return Err(EngineError::NotFound(format!("cursor node {position}")));
        }
        self.step += 1;
        debug!(step = self.step, node = %position, "cursor step");

        // ---- phase 1: gather ----
        let ns = self.gather(position);

        // ---- phase 2: resolve ----
        let mut pctx = ProvisioningContext::new(self.step, self.rng_seed);
        if !self.provisioners.is_empty() {
            let refs: Vec<&dyn Provisioner> =
                self.provisioners.iter().map(|p| p.as_ref()).collect();
            let mut result = provision_node(position, &refs, &self.graph, &mut pctx)?;
            drop(refs);
            let builds = result.plan.execute(&mut self.graph, &mut pctx);
            for uid in &result.unresolved_hard_requirements {
                if let Some(requirement) = self.graph.get_requirement_mut(*uid) {
                    requirement.is_unresolvable = true;
                }
            }
            let summary = PlanningReceipt::summarize(
                &builds,
                &result.unresolved_hard_requirements,
                &result.waived_soft_requirements,
            );
            self.journal.add_record(summary.into_record().blamed(position))?;
        }

        let mut ctx = DispatchCtx::new(&mut self.graph)
            .with_ns(ns)
            .at_step(self.step)
            .at_position(position);
        let layer_refs: Vec<&BehaviorRegistry> = self.layers.iter().collect();

        // redirects chain transitively; a revisited node stops the chase
        let mut here = position;
        let mut visited: HashSet<Uuid> = HashSet::new();
        visited.insert(here);
        loop {
            let local = self.local.get(&here);
            let mut redirected = None;
            let run = self.dispatch.dispatch_at(
                here,
                DispatchArgs::new().task("redirect"),
                &layer_refs,
                local,
                &mut ctx,
            )?;
            for receipt in run {
                if let Some(edge) = receipt_edge(&receipt) {
                    redirected = Some(edge);
                    break; // short-circuit the rest of the phase
                }
            }
            let Some(edge) = redirected else { break };
            let Some(destination) = ctx
                .graph
                .get_edge(edge)
                .and_then(|e| ctx.graph.edge_destination(e))
            else {
                break;
            };
            if !visited.insert(destination) {
                debug!(node = %destination, "redirect cycle; stopping");
                break;
            }
            here = destination;
        }
        if here != position {
            self.last_receipts = std::mem::take(&mut ctx.receipts);
            drop(ctx);
            self.position = Some(here);
            return Ok(StepOutcome::Redirected(here));
        }

        let local = self.local.get(&position);

        // ---- phase 3: gate ----
        let gate_receipts = self
            .dispatch
            .dispatch_at(
                position,
                DispatchArgs::new().task("gate"),
                &layer_refs,
                local,
                &mut ctx,
            )?
            .drain();
        let gated = gate_receipts
            .iter()
            .any(|r| !r.result.is_null() && !is_truthy(&r.result));

        // ---- phase 4: render ----
        let mut fragments: Vec<Record> = Vec::new();
        if !gated {
            let render_receipts = self
                .dispatch
                .dispatch_at(
                    position,
                    DispatchArgs::new().task("render"),
                    &layer_refs,
                    local,
                    &mut ctx,
                )?
                .drain();
            for receipt in &render_receipts {
                if receipt.result_code == ResultCode::Ok && !receipt.result.is_null() {
                    fragments.push(
                        Record::new("fragment")
                            .blamed(position)
                            .with_payload(receipt.result.clone()),
                    );
                }
            }
        }

        // ---- phase 5: finalize / check continues ----
        let mut next = None;
        {
            let run = self.dispatch.dispatch_at(
                position,
                DispatchArgs::new().task("continue"),
                &layer_refs,
                local,
                &mut ctx,
            )?;
            for receipt in run {
                if let Some(edge) = receipt_edge(&receipt) {
                    next = Some(edge);
                    break;
                }
            }
        }
        let destination = next.and_then(|edge| {
            ctx.graph
                .get_edge(edge)
                .and_then(|e| ctx.graph.edge_destination(e))
        });

        self.last_receipts = std::mem::take(&mut ctx.receipts);
        drop(ctx);

        if !fragments.is_empty() {
            let marker = format!("step{}", self.step);
            self.journal.push_records(fragments, "entry", Some(&marker))?;
        }

        match destination {
            Some(node) => {
                self.position = Some(node);
                Ok(StepOutcome::Advanced(node))
            }
            None => Ok(StepOutcome::AwaitingInput),
        }
    }

    /// External input: follow an edge out of the current node.
    pub fn choose(&mut self, edge: Uuid) -> Result<Uuid> {
        let position = self
            .position
            .ok_or_else(|| EngineError::NotFound("cursor position is not set".into()))?;
        let (source, destination) = {
            let e = self
                .graph
                .get_edge(edge)
                .ok_or_else(|| EngineError::NotFound(format!("edge {edge}")))?;
            (self.graph.edge_source(e), self.graph.edge_destination(e))
        };
        if source != Some(position) {
            return Err(EngineError::Linkage(format!(
                "edge {edge} does not leave the cursor node"
            )));
        }
        let destination = destination.ok_or_else(|| {
            EngineError::Linkage(format!("edge {edge} has no resolved destination"))
        })?;
        self.position = Some(destination);
        Ok(destination)
    }
}

/// Extract an edge uid from a receipt typed as an edge result.
fn receipt_edge(receipt: &CallReceipt) -> Option<Uuid> {
    if receipt.result_type.as_deref() != Some("edge") {
        return None;
    }
    receipt.result.as_str().and_then(|s| Uuid::parse_str(s).ok())
}
