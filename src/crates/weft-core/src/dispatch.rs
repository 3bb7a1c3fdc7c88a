//! Behavior registries and the dispatch pipeline
//!
//! A [`BehaviorRegistry`] stores [`Behavior`]s and runs the deterministic
//! filter → sort → invoke pipeline:
//!
//! 1. Normalize inline criteria (`task=` is an alias for `has_task`; a
//!    disagreement between the two is an error).
//! 2. Filter through [`filter_for_selector`]: each behavior's merged criteria
//!    (registry ∪ behavior, behavior wins) are evaluated for the caller.
//! 3. Append `extra_handlers` unfiltered — loose handlers are opted in by the
//!    call site and bypass selection and specificity entirely.
//! 4. Sort by [`Behavior::sort_key`]: priority, then layer (GLOBAL before
//!    INLINE), caller-kind distance, specificity (general before specific),
//!    handler type, registration seq. Ordering is total and deterministic
//!    given fixed registration seqs.
//! 5. Lazily invoke, yielding one [`CallReceipt`] per behavior.
//!
//! # Laziness
//!
//! Dispatch returns a [`DispatchRun`] iterator. Nothing runs until it is
//! driven; a phase driver can stop early (a redirect short-circuits the rest
//! of a step) or drain it with [`DispatchRun::drain`].
//!
//! # Chaining and layers
//!
//! [`BehaviorRegistry::chain_dispatch_at`] composes several registries into
//! one pipeline, in caller-supplied order; the sort interleaves their
//! behaviors by layer and priority. [`LayeredDispatch`] is the call-time
//! assembly used by the cursor: GLOBAL core ∪ context-active layers ∪
//! caller-local ∪ INLINE extras.

use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::behavior::{Behavior, BoundCall, HandlerLayer, HandlerReply, Invocation, Origin};
use crate::context::DispatchCtx;
use crate::entity::{
    filter_for_selector, Criteria, Criterion, Entity, Matchable, MatchScope, Selectable,
};
use crate::error::{EngineError, Result};
use crate::record::CallReceipt;
use crate::registry::Registry;

/// Call-shaping arguments for one dispatch pass.
#[derive(Default)]
pub struct DispatchArgs {
    /// Alias for the `has_task` inline criterion.
    pub task: Option<String>,
    /// Additional selection criteria merged over each behavior's own.
    pub inline_criteria: Criteria,
    /// Positional values forwarded to handlers.
    pub args: Vec<Value>,
    /// Keyword values forwarded to handlers.
    pub kwargs: Map<String, Value>,
    /// Other participating entities (for multi-entity operations).
    pub other_ids: Vec<Uuid>,
    /// Ad-hoc INLINE-layer handlers; included without selection filtering.
    pub extra_handlers: Vec<Behavior>,
    /// Select and sort, but do not invoke.
    pub dry_run: bool,
}

impl DispatchArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    pub fn criteria(mut self, criteria: Criteria) -> Self {
        self.inline_criteria = criteria;
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_others(mut self, other_ids: Vec<Uuid>) -> Self {
        self.other_ids = other_ids;
        self
    }

    /// Include a loose handler at the INLINE layer. Loose handlers always
    /// fire; they bypass selection and specificity.
    pub fn extra_handler(mut self, behavior: Behavior) -> Self {
        self.extra_handlers.push(behavior);
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    /// Fold `task=` into the inline criteria, rejecting a conflicting
    /// explicit `has_task`.
    fn normalized_criteria(&self) -> Result<Criteria> {
        let mut criteria = self.inline_criteria.clone();
        if let Some(task) = &self.task {
            if let Some(Criterion::Has(existing)) = criteria.get("has_task") {
                if existing.as_str() != Some(task) {
                    return Err(EngineError::InvalidCriteria(format!(
                        "found both task={task:?} and has_task={existing} in inline criteria"
                    )));
                }
            } else {
                criteria = criteria.with("has_task", Value::String(task.clone()));
            }
        }
        Ok(criteria)
    }
}

/// Lazy receipt iterator; behaviors run as it is driven.
pub struct DispatchRun<'c, 'g> {
    queue: std::vec::IntoIter<Behavior>,
    invocation: Invocation,
    ctx: &'c mut DispatchCtx<'g>,
}

impl<'c, 'g> std::fmt::Debug for DispatchRun<'c, 'g> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchRun")
            .field("invocation", &self.invocation)
            .finish_non_exhaustive()
    }
}

impl<'c, 'g> DispatchRun<'c, 'g> {
    fn new(plan: Vec<Behavior>, invocation: Invocation, ctx: &'c mut DispatchCtx<'g>) -> Self {
        Self {
            queue: plan.into_iter(),
            invocation,
            ctx,
        }
    }

    /// Run every remaining behavior and collect the receipts.
    pub fn drain(self) -> Vec<CallReceipt> {
        self.collect()
    }

    /// Behaviors not yet invoked.
    pub fn remaining(&self) -> usize {
        self.queue.len()
    }
}

impl Iterator for DispatchRun<'_, '_> {
    type Item = CallReceipt;

    fn next(&mut self) -> Option<CallReceipt> {
        let behavior = self.queue.next()?;
        Some(behavior.invoke(self.ctx, &self.invocation))
    }
}

/// Filter, merge, and order behaviors from `pools` for `caller`.
fn select_plan<'a>(
    pools: impl IntoIterator<Item = &'a BehaviorRegistry>,
    caller: &dyn Matchable,
    args: &DispatchArgs,
    scope: MatchScope<'_>,
) -> Result<Vec<Behavior>> {
    let inline = args.normalized_criteria()?;
    let candidates: Vec<&Behavior> = pools
        .into_iter()
        .flat_map(|registry| registry.behaviors())
        .collect();
    let mut plan: Vec<Behavior> = filter_for_selector(candidates, caller, &inline, scope)
        .into_iter()
        .cloned()
        .collect();
    // loose handlers are opted in by the call site; no further filtering
    plan.extend(args.extra_handlers.iter().cloned());
    plan.sort_by_key(|b| b.sort_key(Some(caller.kind())));
    debug!(
        caller = %caller.entity().display_label(),
        task = args.task.as_deref().unwrap_or("-"),
        handlers = ?plan.iter().map(Behavior::display_label).collect::<Vec<_>>(),
        "dispatch plan"
    );
    Ok(plan)
}

/// Ordered, queryable registry of behaviors with deterministic dispatch.
#[derive(Debug, Clone)]
pub struct BehaviorRegistry {
    base: Entity,
    behaviors: Registry<Behavior>,
    /// Default layer stamped onto registered behaviors' origins.
    pub handler_layer: HandlerLayer,
    /// Default task inherited by behaviors without their own.
    pub task: Option<String>,
}

impl BehaviorRegistry {
    pub fn new(handler_layer: HandlerLayer) -> Self {
        Self {
            base: Entity::new(),
            behaviors: Registry::new(),
            handler_layer,
            task: None,
        }
    }

    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.base = self.base.labeled(label);
        self
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    /// Registry-level selection criteria; merged under each behavior's own.
    pub fn with_criteria(mut self, criteria: Criteria) -> Self {
        self.base = self.base.with_selection_criteria(criteria);
        self
    }

    pub fn uid(&self) -> Uuid {
        self.base.uid()
    }

    fn origin(&self) -> Origin {
        Origin {
            registry_uid: self.base.uid(),
            layer: self.handler_layer,
            task: self.task.clone(),
            criteria: self.base.selection_criteria.clone(),
        }
    }

    /// Register a behavior; it inherits this registry as its origin.
    pub fn add_behavior(&mut self, mut behavior: Behavior) -> Result<Uuid> {
        behavior.set_origin(self.origin());
        self.behaviors.add(behavior)
    }

    /// Wrap a bare handler closure and register it.
    pub fn register(
        &mut self,
        label: impl Into<String>,
        func: impl Fn(BoundCall<'_, '_>) -> Result<HandlerReply> + 'static,
    ) -> Result<Uuid> {
        self.add_behavior(Behavior::new(func).labeled(label))
    }

    pub fn behaviors(&self) -> impl Iterator<Item = &Behavior> {
        self.behaviors.values()
    }

    pub fn get(&self, uid: Uuid) -> Option<&Behavior> {
        self.behaviors.get(uid)
    }

    pub fn len(&self) -> usize {
        self.behaviors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.behaviors.is_empty()
    }

    /// Distinct non-empty behavior tasks present in this registry.
    pub fn all_tasks(&self) -> Vec<String> {
        let mut tasks: Vec<String> = self
            .behaviors
            .values()
            .filter_map(|b| b.task.clone())
            .collect();
        tasks.sort();
        tasks.dedup();
        tasks
    }

    /// Selection and ordering without invocation; the dry-run introspection
    /// surface.
    pub fn select_for(&self, caller: &dyn Matchable, args: &DispatchArgs, scope: MatchScope<'_>) -> Result<Vec<Behavior>> {
        select_plan([self], caller, args, scope)
    }

    /// Dispatch for a detached caller (not resident in the context's graph).
    pub fn dispatch<'c, 'g>(
        &self,
        caller: &dyn Matchable,
        args: DispatchArgs,
        ctx: &'c mut DispatchCtx<'g>,
    ) -> Result<DispatchRun<'c, 'g>> {
        Self::chain_dispatch([self], caller, args, ctx)
    }

    /// Dispatch for a caller resident in the context's graph.
    pub fn dispatch_at<'c, 'g>(
        &self,
        caller_id: Uuid,
        args: DispatchArgs,
        ctx: &'c mut DispatchCtx<'g>,
    ) -> Result<DispatchRun<'c, 'g>> {
        Self::chain_dispatch_at(&[self], caller_id, args, ctx)
    }

    /// One pipeline across several registries, in the supplied order.
    pub fn chain_dispatch<'a, 'c, 'g>(
        registries: impl IntoIterator<Item = &'a BehaviorRegistry>,
        caller: &dyn Matchable,
        args: DispatchArgs,
        ctx: &'c mut DispatchCtx<'g>,
    ) -> Result<DispatchRun<'c, 'g>> {
        let scope = MatchScope::in_graph(ctx.graph);
        let plan = select_plan(registries, caller, &args, scope)?;
        let invocation = Invocation {
            caller_id: Some(caller.entity().uid()),
            caller_kind: Some(caller.kind()),
            task: args.task.clone(),
            args: args.args,
            kwargs: args.kwargs,
            other_ids: args.other_ids,
        };
        let plan = if args.dry_run { Vec::new() } else { plan };
        Ok(DispatchRun::new(plan, invocation, ctx))
    }

    /// Chain dispatch for a caller looked up in the context's graph.
    pub fn chain_dispatch_at<'c, 'g>(
        registries: &[&BehaviorRegistry],
        caller_id: Uuid,
        args: DispatchArgs,
        ctx: &'c mut DispatchCtx<'g>,
    ) -> Result<DispatchRun<'c, 'g>> {
        let (plan, caller_kind) = {
            let graph = &*ctx.graph;
            let caller = graph
                .get(caller_id)
                .ok_or_else(|| EngineError::NotFound(format!("caller {caller_id}")))?;
            let scope = MatchScope::in_graph(graph);
            (
                select_plan(registries.iter().copied(), caller, &args, scope)?,
                caller.kind(),
            )
        };
        let invocation = Invocation {
            caller_id: Some(caller_id),
            caller_kind: Some(caller_kind),
            task: args.task.clone(),
            args: args.args,
            kwargs: args.kwargs,
            other_ids: args.other_ids,
        };
        let plan = if args.dry_run { Vec::new() } else { plan };
        Ok(DispatchRun::new(plan, invocation, ctx))
    }
}

impl Matchable for BehaviorRegistry {
    fn entity(&self) -> &Entity {
        &self.base
    }
}

impl Selectable for BehaviorRegistry {}

/// Call-time layer assembly: GLOBAL core ∪ active layers ∪ caller-local.
///
/// The cursor owns the active layer registries (system, application, author)
/// and the per-node local registries; this composer fixes the inclusion
/// rules so every step sees the same stack.
#[derive(Debug)]
pub struct LayeredDispatch {
    /// The always-included GLOBAL core registry.
    pub core: BehaviorRegistry,
}

impl LayeredDispatch {
    pub fn new() -> Self {
        Self {
            core: BehaviorRegistry::new(HandlerLayer::Global).labeled("core"),
        }
    }

    /// Dispatch with automatic layer assembly, deduplicated by registry uid.
    pub fn dispatch_at<'c, 'g>(
        &self,
        caller_id: Uuid,
        args: DispatchArgs,
        active_layers: &[&BehaviorRegistry],
        local: Option<&BehaviorRegistry>,
        ctx: &'c mut DispatchCtx<'g>,
    ) -> Result<DispatchRun<'c, 'g>> {
        let mut stack: Vec<&BehaviorRegistry> = vec![&self.core];
        for layer in active_layers {
            if !stack.iter().any(|r| r.uid() == layer.uid()) {
                stack.push(layer);
            }
        }
        if let Some(local) = local {
            if !stack.iter().any(|r| r.uid() == local.uid()) {
                stack.push(local);
            }
        }
        BehaviorRegistry::chain_dispatch_at(&stack, caller_id, args, ctx)
    }
}

impl Default for LayeredDispatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::priority;
    use crate::graph::{Graph, Node};
    use serde_json::json;

    fn value_handler(value: &'static str) -> impl Fn(BoundCall<'_, '_>) -> Result<HandlerReply> {
        move |_| Ok(HandlerReply::ok(json!(value)))
    }

    #[test]
    fn test_simple_dispatch_priority_order() {
        // S1: LATE and EARLY handlers on the same task run EARLY first
        let mut registry = BehaviorRegistry::new(HandlerLayer::Global);
        registry
            .add_behavior(
                Behavior::new(value_handler("h1"))
                    .labeled("h1")
                    .with_task("greet")
                    .with_priority(priority::LATE),
            )
            .unwrap();
        registry
            .add_behavior(
                Behavior::new(value_handler("h2"))
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

        let order: Vec<_> = receipts.iter().map(|r| r.result.clone()).collect();
        assert_eq!(order, [json!("h2"), json!("h1")]);
    }

    #[test]
    fn test_task_filter_excludes_other_tasks() {
        let mut registry = BehaviorRegistry::new(HandlerLayer::Global);
        registry
            .add_behavior(Behavior::new(value_handler("render")).with_task("render"))
            .unwrap();
        registry
            .add_behavior(Behavior::new(value_handler("greet")).with_task("greet"))
            .unwrap();

        let mut graph = Graph::new();
        let caller = Node::new();
        let mut ctx = DispatchCtx::new(&mut graph);
        let receipts = registry
            .dispatch(&caller, DispatchArgs::new().task("render"), &mut ctx)
            .unwrap()
            .drain();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].result, json!("render"));
    }

    #[test]
    fn test_no_task_matches_everything() {
        let mut registry = BehaviorRegistry::new(HandlerLayer::Global);
        registry
            .add_behavior(Behavior::new(value_handler("a")).with_task("render"))
            .unwrap();
        registry.add_behavior(Behavior::new(value_handler("b"))).unwrap();

        let mut graph = Graph::new();
        let caller = Node::new();
        let mut ctx = DispatchCtx::new(&mut graph);
        let receipts = registry
            .dispatch(&caller, DispatchArgs::new(), &mut ctx)
            .unwrap()
            .drain();
        assert_eq!(receipts.len(), 2);
    }

    #[test]
    fn test_conflicting_task_criteria_rejected() {
        let registry = BehaviorRegistry::new(HandlerLayer::Global);
        let mut graph = Graph::new();
        let caller = Node::new();
        let mut ctx = DispatchCtx::new(&mut graph);
        let args = DispatchArgs::new()
            .task("render")
            .criteria(Criteria::new().with("has_task", json!("greet")));
        let err = registry.dispatch(&caller, args, &mut ctx).unwrap_err();
        assert!(matches!(err, EngineError::InvalidCriteria(_)));
    }

    #[test]
    fn test_layer_clobbering_chain() {
        // S2: GLOBAL runs before LOCAL; the LOCAL result is the last word
        let mut global = BehaviorRegistry::new(HandlerLayer::Global);
        global
            .add_behavior(
                Behavior::new(value_handler("global"))
                    .with_task("render")
                    .for_caller(crate::entity::ItemKind::Node),
            )
            .unwrap();
        let mut local = BehaviorRegistry::new(HandlerLayer::Local);
        local
            .add_behavior(
                Behavior::new(value_handler("local"))
                    .with_task("render")
                    .for_caller(crate::entity::ItemKind::Node),
            )
            .unwrap();

        let mut graph = Graph::new();
        let caller = Node::new().labeled("n");
        let mut ctx = DispatchCtx::new(&mut graph);
        let receipts = BehaviorRegistry::chain_dispatch(
            [&global, &local],
            &caller,
            DispatchArgs::new().task("render"),
            &mut ctx,
        )
        .unwrap()
        .drain();

        let order: Vec<_> = receipts.iter().map(|r| r.result.clone()).collect();
        assert_eq!(order, [json!("global"), json!("local")]);
        assert_eq!(CallReceipt::last_result(&receipts), Some(&json!("local")));
    }

    #[test]
    fn test_extra_handlers_bypass_selection() {
        let registry = BehaviorRegistry::new(HandlerLayer::Global);
        let mut graph = Graph::new();
        let caller = Node::new();
        let mut ctx = DispatchCtx::new(&mut graph);
        // a loose handler with a non-matching task still fires
        let loose = Behavior::new(value_handler("loose")).with_task("unrelated");
        let receipts = registry
            .dispatch(
                &caller,
                DispatchArgs::new().task("render").extra_handler(loose),
                &mut ctx,
            )
            .unwrap()
            .drain();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].result, json!("loose"));
    }

    #[test]
    fn test_dry_run_invokes_nothing() {
        let mut registry = BehaviorRegistry::new(HandlerLayer::Global);
        registry.add_behavior(Behavior::new(value_handler("x"))).unwrap();

        let mut graph = Graph::new();
        let caller = Node::new();
        let mut ctx = DispatchCtx::new(&mut graph);
        let receipts = registry
            .dispatch(&caller, DispatchArgs::new().dry_run(), &mut ctx)
            .unwrap()
            .drain();
        assert!(receipts.is_empty());
        assert!(ctx.receipts.is_empty());

        // but selection still reports the plan
        let plan = registry
            .select_for(&caller, &DispatchArgs::new(), MatchScope::bare())
            .unwrap();
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn test_dispatch_is_lazy() {
        use std::cell::Cell;
        use std::rc::Rc;

        let count = Rc::new(Cell::new(0u32));
        let mut registry = BehaviorRegistry::new(HandlerLayer::Global);
        for _ in 0..3 {
            let count = Rc::clone(&count);
            registry
                .add_behavior(Behavior::new(move |_| {
                    count.set(count.get() + 1);
                    Ok(HandlerReply::ok(json!(null)))
                }))
                .unwrap();
        }

        let mut graph = Graph::new();
        let caller = Node::new();
        let mut ctx = DispatchCtx::new(&mut graph);
        let mut run = registry
            .dispatch(&caller, DispatchArgs::new(), &mut ctx)
            .unwrap();
        assert_eq!(count.get(), 0);
        run.next();
        assert_eq!(count.get(), 1);
        drop(run);
        // stopping early leaves the rest uninvoked
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_caller_class_constraint() {
        let mut registry = BehaviorRegistry::new(HandlerLayer::Global);
        registry
            .add_behavior(
                Behavior::new(value_handler("nodes-only"))
                    .for_caller(crate::entity::ItemKind::Node),
            )
            .unwrap();

        let mut graph = Graph::new();
        let node_caller = Node::new();
        let entity_caller = crate::entity::Entity::new();
        let mut ctx = DispatchCtx::new(&mut graph);
        let receipts = registry
            .dispatch(&node_caller, DispatchArgs::new(), &mut ctx)
            .unwrap()
            .drain();
        assert_eq!(receipts.len(), 1);

        let receipts = registry
            .dispatch(&entity_caller, DispatchArgs::new(), &mut ctx)
            .unwrap()
            .drain();
        assert!(receipts.is_empty());
    }

    #[test]
    fn test_dispatch_at_resident_caller() {
        let mut registry = BehaviorRegistry::new(HandlerLayer::Global);
        registry
            .add_behavior(Behavior::new(|bound| {
                // handlers may mutate the graph through the context
                let fresh = bound.ctx.graph.add_node(Node::new().labeled("spawned"))?;
                Ok(HandlerReply::ok(json!(fresh.to_string())))
            }))
            .unwrap();

        let mut graph = Graph::new();
        let caller = graph.add_node(Node::new().labeled("here")).unwrap();
        let mut ctx = DispatchCtx::new(&mut graph);
        let receipts = registry
            .dispatch_at(caller, DispatchArgs::new(), &mut ctx)
            .unwrap()
            .drain();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].caller_id, Some(caller));
        assert!(ctx.graph.find_node(&Criteria::new().label("spawned")).is_some());
    }

    #[test]
    fn test_all_tasks() {
        let mut registry = BehaviorRegistry::new(HandlerLayer::Global);
        registry
            .add_behavior(Behavior::new(value_handler("a")).with_task("render"))
            .unwrap();
        registry
            .add_behavior(Behavior::new(value_handler("b")).with_task("greet"))
            .unwrap();
        registry
            .add_behavior(Behavior::new(value_handler("c")).with_task("render"))
            .unwrap();
        assert_eq!(registry.all_tasks(), ["greet", "render"]);
    }

    #[test]
    fn test_layered_dispatch_assembly() {
        let mut layered = LayeredDispatch::new();
        layered
            .core
            .add_behavior(Behavior::new(value_handler("core")).with_task("render"))
            .unwrap();
        let mut system = BehaviorRegistry::new(HandlerLayer::System);
        system
            .add_behavior(Behavior::new(value_handler("system")).with_task("render"))
            .unwrap();
        let mut local = BehaviorRegistry::new(HandlerLayer::Local);
        local
            .add_behavior(Behavior::new(value_handler("local")).with_task("render"))
            .unwrap();

        let mut graph = Graph::new();
        let caller = graph.add_node(Node::new()).unwrap();
        let mut ctx = DispatchCtx::new(&mut graph);
        let receipts = layered
            .dispatch_at(
                caller,
                DispatchArgs::new().task("render"),
                &[&system],
                Some(&local),
                &mut ctx,
            )
            .unwrap()
            .drain();

        // global runs first, then system, then local: later layers clobber
        let order: Vec<_> = receipts.iter().map(|r| r.result.clone()).collect();
        assert_eq!(order, [json!("core"), json!("system"), json!("local")]);
    }
}
