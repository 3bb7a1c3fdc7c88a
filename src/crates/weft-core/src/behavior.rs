//! Behaviors: dispatchable routines with deterministic ordering
//!
//! A [`Behavior`] wraps a handler closure together with the metadata the
//! dispatch pipeline orders by: a priority, a handler layer inherited from
//! its origin registry, a binding mode ([`HandlerType`]), an optional task
//! tag, selection criteria, and a monotonic registration seq. Every
//! invocation produces a [`CallReceipt`] so pipelines stay auditable.
//!
//! # Binding
//!
//! The reference system bound Python functions to callers, owner instances,
//! or classes at call time. Here the handler is always a closure receiving a
//! [`BoundCall`]; the binding modes survive as metadata that (a) orders
//! handlers and (b) governs the weak-owner upgrade:
//!
//! - `Static` / `InstanceOnCaller` / `ClassOnCaller` — the caller travels in
//!   the invocation; `BoundCall::owner` is `None`.
//! - `ClassOnOwner` — requires `owner_kind`; no live owner instance.
//! - `InstanceOnOwner` — upgrades the weak owner at call time. A dead owner
//!   falls back to caller-as-self when `owner_kind` covers the caller's
//!   kind; otherwise the invocation yields an ERROR receipt carrying a
//!   [`EngineError::BindingFailure`].
//!
//! Behaviors hold their owner weakly on purpose: registering a manager's
//! method must not keep the manager alive.
//!
//! # Ordering
//!
//! [`Behavior::sort_key`] returns the tuple
//! `(priority, -layer, mro_dist, specificity, handler_type, seq)`. Lower
//! sorts earlier; later handlers observe (and can clobber) earlier results,
//! which is why more specific layers and criteria run later. The ordering is
//! total and deterministic for a fixed registration sequence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::context::DispatchCtx;
use crate::entity::{Criteria, Entity, ItemKind, Matchable, MatchScope, Selectable, Specificity};
use crate::error::{EngineError, Result};
use crate::record::{CallReceipt, ResultCode};

/// Logical origin of a behavior, used during chained registry sorting.
///
/// Lower values are more specific; the sort negates the layer so INLINE
/// handlers run *after* GLOBAL ones and can override what they observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandlerLayer {
    /// Injected for a single dispatch call.
    Inline = 1,
    /// Registered on the caller or its ancestors.
    Local = 2,
    /// World/domain-provided mixins.
    Author = 3,
    /// Application-level behaviors (story, discourse).
    Application = 4,
    /// Subsystem behaviors (vm, service, media).
    System = 5,
    /// Core defaults available everywhere.
    Global = 6,
}

impl HandlerLayer {
    pub fn value(self) -> i8 {
        self as i8
    }
}

/// Conventional priorities. Any `i32` is valid: values below `FIRST` run
/// before everything, values above `LAST` run after everything.
pub mod priority {
    pub const FIRST: i32 = 0;
    pub const EARLY: i32 = 25;
    pub const NORMAL: i32 = 50;
    pub const LATE: i32 = 75;
    pub const LAST: i32 = 100;
}

/// Binding mode. Sorts most-general first so more specifically bound
/// handlers run later on ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandlerType {
    /// Free function; the caller is just the first argument.
    Static = 1,
    /// Class-level routine on a foreign owner kind.
    ClassOnOwner = 2,
    /// Routine bound to a live owner instance (weak).
    InstanceOnOwner = 3,
    /// Class-level routine on the caller's own kind.
    ClassOnCaller = 4,
    /// Instance routine on the caller itself.
    InstanceOnCaller = 5,
}

/// Entities that can own behaviors (managers, forges, services).
///
/// Owners are held weakly; see the module docs for the upgrade rules.
pub trait Owner {
    /// Kind tag used for the caller-as-self fallback check.
    fn owner_kind(&self) -> ItemKind {
        ItemKind::Entity
    }

    fn as_any(&self) -> &dyn std::any::Any;
}

/// What a dispatch pass hands to each handler invocation.
pub struct BoundCall<'a, 'g> {
    /// Upgraded owner for `InstanceOnOwner` handlers; `None` otherwise (and
    /// in the caller-as-self fallback).
    pub owner: Option<Arc<dyn Owner>>,
    pub ctx: &'a mut DispatchCtx<'g>,
    pub call: &'a Invocation,
}

/// The per-dispatch call envelope: who is being dispatched, with what.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub caller_id: Option<Uuid>,
    pub caller_kind: Option<ItemKind>,
    pub task: Option<String>,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub other_ids: Vec<Uuid>,
}

/// What a handler returns; wrapped into a [`CallReceipt`] by the pipeline.
#[derive(Debug, Clone)]
pub struct HandlerReply {
    pub result: Value,
    pub code: ResultCode,
    pub result_type: Option<String>,
    pub message: Option<String>,
}

impl HandlerReply {
    pub fn ok(result: Value) -> Self {
        Self {
            result,
            code: ResultCode::Ok,
            result_type: None,
            message: None,
        }
    }

    /// OK with a null result.
    pub fn none() -> Self {
        Self {
            code: ResultCode::None,
            ..Self::ok(Value::Null)
        }
    }

    pub fn skip(message: Option<String>) -> Self {
        Self {
            code: ResultCode::Skip,
            message,
            ..Self::ok(Value::Null)
        }
    }

    pub fn invalid(message: Option<String>) -> Self {
        Self {
            code: ResultCode::Invalid,
            message,
            ..Self::ok(Value::Null)
        }
    }

    /// A continuation/redirect result: an edge for the cursor to follow.
    pub fn edge(edge: Uuid) -> Self {
        Self {
            result_type: Some("edge".into()),
            ..Self::ok(Value::String(edge.to_string()))
        }
    }

    /// A rendered fragment destined for the journal.
    pub fn fragment(content: Value) -> Self {
        Self {
            result_type: Some("fragment".into()),
            ..Self::ok(content)
        }
    }

    /// Parse the result back into an edge uid, when typed as one.
    pub fn edge_uid(&self) -> Option<Uuid> {
        if self.result_type.as_deref() != Some("edge") {
            return None;
        }
        self.result.as_str().and_then(|s| Uuid::parse_str(s).ok())
    }
}

/// Handler closure signature shared by every binding mode.
pub type HandlerFn = Arc<dyn Fn(BoundCall<'_, '_>) -> Result<HandlerReply>>;

static BEHAVIOR_SEQ: AtomicU64 = AtomicU64::new(0);

/// Snapshot of the registry a behavior was registered into.
///
/// A back-reference, not ownership: carries only the selection-relevant
/// registry state (layer, default task, registry criteria).
#[derive(Debug, Clone)]
pub struct Origin {
    pub registry_uid: Uuid,
    pub layer: HandlerLayer,
    pub task: Option<String>,
    pub criteria: Criteria,
}

/// A dispatchable routine plus its selection and ordering metadata.
#[derive(Clone)]
pub struct Behavior {
    base: Entity,
    func: HandlerFn,
    pub handler_type: HandlerType,
    pub caller_kind: Option<ItemKind>,
    owner: Option<Weak<dyn Owner>>,
    pub owner_kind: Option<ItemKind>,
    pub priority: i32,
    pub task: Option<String>,
    origin: Option<Origin>,
    seq: u64,
}

impl Behavior {
    pub fn new(func: impl Fn(BoundCall<'_, '_>) -> Result<HandlerReply> + 'static) -> Self {
        Self {
            base: Entity::new(),
            func: Arc::new(func),
            handler_type: HandlerType::Static,
            caller_kind: None,
            owner: None,
            owner_kind: None,
            priority: priority::NORMAL,
            task: None,
            origin: None,
            seq: BEHAVIOR_SEQ.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.base = self.base.labeled(label);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    /// Constrain to callers of `kind` (and subtypes); also folds an
    /// `is_instance` criterion into the merged selection criteria.
    pub fn for_caller(mut self, kind: ItemKind) -> Self {
        self.caller_kind = Some(kind);
        if self.handler_type == HandlerType::Static {
            self.handler_type = HandlerType::InstanceOnCaller;
        }
        self
    }

    pub fn typed(mut self, handler_type: HandlerType) -> Self {
        self.handler_type = handler_type;
        self
    }

    /// Bind to a live owner instance, held weakly.
    pub fn owned_by(mut self, owner: &Arc<dyn Owner>) -> Self {
        self.owner = Some(Arc::downgrade(owner));
        self.owner_kind = Some(owner.owner_kind());
        self.handler_type = HandlerType::InstanceOnOwner;
        self
    }

    /// Bind to a foreign owner kind without a live instance.
    pub fn owned_by_kind(mut self, kind: ItemKind) -> Self {
        self.owner_kind = Some(kind);
        self.handler_type = HandlerType::ClassOnOwner;
        self
    }

    pub fn with_criteria(mut self, criteria: Criteria) -> Self {
        self.base = self.base.with_selection_criteria(criteria);
        self
    }

    pub(crate) fn set_origin(&mut self, origin: Origin) {
        if self.origin.is_none() {
            self.origin = Some(origin);
        }
    }

    pub fn origin(&self) -> Option<&Origin> {
        self.origin.as_ref()
    }

    pub fn uid(&self) -> Uuid {
        self.base.uid()
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn display_label(&self) -> String {
        self.base.display_label()
    }

    /// The layer this behavior dispatches at: its origin registry's layer,
    /// or INLINE for loose handlers.
    pub fn handler_layer(&self) -> HandlerLayer {
        self.origin.as_ref().map(|o| o.layer).unwrap_or(HandlerLayer::Inline)
    }

    /// Task participation per the layered-dispatch rules: no task asked,
    /// inline layer, own task match, or origin default task match.
    pub fn has_task(&self, task: Option<&str>) -> bool {
        let Some(task) = task else { return true };
        if self.handler_layer() == HandlerLayer::Inline {
            return true;
        }
        if self.task.as_deref() == Some(task) {
            return true;
        }
        self.origin
            .as_ref()
            .and_then(|o| o.task.as_deref())
            .map(|t| t == task)
            .unwrap_or(false)
    }

    /// Kind distance from `caller_kind` to this behavior's caller constraint.
    /// Unconstrained or mismatched callers sort "very far".
    pub fn mro_dist(&self, caller_kind: Option<ItemKind>) -> u32 {
        match (caller_kind, self.caller_kind) {
            (Some(caller), Some(constraint)) => caller.distance_to(constraint).unwrap_or(u32::MAX),
            _ => u32::MAX,
        }
    }

    /// Merged criteria: origin registry criteria under the behavior's own
    /// (behavior wins on conflict), with the caller-kind constraint folded in
    /// as `is_instance` when absent.
    pub fn merged_criteria(&self) -> Criteria {
        let base = self
            .origin
            .as_ref()
            .map(|o| o.criteria.clone())
            .unwrap_or_default();
        let mut merged = self.base.selection_criteria.merged_over(&base);
        if let Some(kind) = self.caller_kind {
            if !merged.contains_key("is_instance") {
                merged = merged.kind(kind);
            }
        }
        merged
    }

    /// Specificity of the merged criteria (task participation excluded).
    pub fn specificity(&self) -> Specificity {
        self.merged_criteria().specificity()
    }

    /// Stable ordering tuple; see the module docs for the term order.
    ///
    /// Specificity ascends: a more specific behavior runs later, so it can
    /// observe and clobber what the general ones produced (same reasoning as
    /// the layer term, where INLINE runs after GLOBAL).
    pub fn sort_key(&self, caller_kind: Option<ItemKind>) -> SortKey {
        let Specificity(id, class, other) = self.specificity();
        (
            self.priority,
            -self.handler_layer().value(),
            self.mro_dist(caller_kind),
            (id, class, other),
            self.handler_type as u8,
            self.seq,
        )
    }

    /// Invoke the handler and wrap the outcome in a receipt. Binding or
    /// handler failures become ERROR receipts; nothing is dropped silently.
    pub fn invoke(&self, ctx: &mut DispatchCtx<'_>, call: &Invocation) -> CallReceipt {
        let receipt = match self.bind(call) {
            Ok(owner) => {
                let bound = BoundCall { owner, ctx, call };
                match (self.func)(bound) {
                    Ok(reply) => {
                        let mut receipt = CallReceipt::ok(self.uid(), reply.result);
                        receipt.result_code = reply.code;
                        receipt.result_type = reply.result_type;
                        receipt.message = reply
                            .message
                            .or_else(|| Some(format!("handler: {}", self.display_label())));
                        receipt
                    }
                    Err(e) => CallReceipt::error(self.uid(), e.to_string()),
                }
            }
            Err(e) => {
                debug!(behavior = %self.display_label(), error = %e, "binding failed");
                CallReceipt::error(self.uid(), e.to_string())
            }
        };
        let receipt = match call.caller_id {
            Some(caller) => receipt.with_caller(caller),
            None => receipt,
        }
        .with_others(call.other_ids.clone());
        ctx.receipts.push(receipt.clone());
        receipt
    }

    /// Resolve the owner per the binding mode.
    fn bind(&self, call: &Invocation) -> Result<Option<Arc<dyn Owner>>> {
        match self.handler_type {
            HandlerType::Static | HandlerType::InstanceOnCaller | HandlerType::ClassOnCaller => {
                Ok(None)
            }
            HandlerType::ClassOnOwner => {
                if self.owner_kind.is_none() {
                    return Err(EngineError::BindingFailure {
                        behavior: self.uid(),
                        reason: "class-on-owner handler has no owner kind".into(),
                    });
                }
                Ok(None)
            }
            HandlerType::InstanceOnOwner => {
                if let Some(owner) = self.owner.as_ref().and_then(Weak::upgrade) {
                    return Ok(Some(owner));
                }
                // dead owner: fall back to caller-as-self when the kinds line up
                if self.owner_matches_caller(call.caller_kind) {
                    return Ok(None);
                }
                Err(EngineError::BindingFailure {
                    behavior: self.uid(),
                    reason: "behavior owner is not defined".into(),
                })
            }
        }
    }

    fn owner_matches_caller(&self, caller_kind: Option<ItemKind>) -> bool {
        match (self.owner_kind, caller_kind) {
            (Some(owner), Some(caller)) => caller.is_a(owner) || owner.is_a(caller),
            _ => false,
        }
    }
}

/// Ordering tuple produced by [`Behavior::sort_key`].
pub type SortKey = (i32, i8, u32, (u8, u8, u16), u8, u64);

impl std::fmt::Debug for Behavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Behavior")
            .field("label", &self.display_label())
            .field("priority", &self.priority)
            .field("layer", &self.handler_layer())
            .field("task", &self.task)
            .field("handler_type", &self.handler_type)
            .field("seq", &self.seq)
            .finish()
    }
}

impl Matchable for Behavior {
    fn entity(&self) -> &Entity {
        &self.base
    }

    fn kind(&self) -> ItemKind {
        ItemKind::Behavior
    }

    fn capability(&self, key: &str, expected: &Value, _scope: MatchScope<'_>) -> Option<bool> {
        match key {
            "has_task" => Some(match expected {
                Value::Null => self.has_task(None),
                Value::String(task) => self.has_task(Some(task)),
                _ => false,
            }),
            "has_func_name" => {
                Some(expected.as_str().map(|n| self.display_label() == n).unwrap_or(false))
            }
            _ => self.base.base_capability(key, expected),
        }
    }

    fn attr(&self, key: &str) -> Option<Value> {
        match key {
            "priority" => Some(Value::from(self.priority)),
            "task" => self.task.clone().map(Value::String),
            "seq" => Some(Value::from(self.seq)),
            "label" => self.base.label.clone().map(Value::String),
            "uid" => Some(Value::String(self.base.uid().to_string())),
            other => self.base.attr(other).cloned(),
        }
    }
}

impl Selectable for Behavior {
    fn selection_criteria(&self) -> Criteria {
        self.merged_criteria()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use serde_json::json;

    fn noop() -> Behavior {
        Behavior::new(|_| Ok(HandlerReply::ok(json!("done"))))
    }

    #[test]
    fn test_seq_monotonic_registration_order() {
        let a = noop();
        let b = noop();
        assert!(a.seq() < b.seq());
    }

    #[test]
    fn test_sort_key_priority_first() {
        let early = noop().with_priority(priority::EARLY);
        let late = noop().with_priority(priority::LATE);
        assert!(early.sort_key(None) < late.sort_key(None));
    }

    #[test]
    fn test_sort_key_specificity_runs_later() {
        // identifier criteria outrank class criteria, so the
        // identifier-specific behavior sorts (and runs) later
        let by_class = noop().with_criteria(Criteria::new().kind(ItemKind::Node));
        let by_id = noop().with_criteria(Criteria::new().has_identifier("x"));
        assert!(by_id.sort_key(None) > by_class.sort_key(None));

        // and anything specific runs after a fully general behavior
        let general = noop();
        assert!(general.sort_key(None) < by_class.sort_key(None));
    }

    #[test]
    fn test_sort_key_handler_type_order() {
        let static_b = noop().typed(HandlerType::Static);
        let on_caller = noop().typed(HandlerType::InstanceOnCaller);
        assert!(static_b.sort_key(None) < on_caller.sort_key(None));
    }

    #[test]
    fn test_has_task_rules() {
        let b = noop().with_task("render");
        assert!(b.has_task(None));
        // no origin: inline layer, always participates
        assert!(b.has_task(Some("greet")));

        let mut b = noop().with_task("render");
        b.set_origin(Origin {
            registry_uid: Uuid::new_v4(),
            layer: HandlerLayer::Global,
            task: None,
            criteria: Criteria::new(),
        });
        assert!(b.has_task(Some("render")));
        assert!(!b.has_task(Some("greet")));

        let mut b = noop();
        b.set_origin(Origin {
            registry_uid: Uuid::new_v4(),
            layer: HandlerLayer::Global,
            task: Some("render".into()),
            criteria: Criteria::new(),
        });
        assert!(b.has_task(Some("render")));
    }

    #[test]
    fn test_mro_dist() {
        let unconstrained = noop();
        assert_eq!(unconstrained.mro_dist(Some(ItemKind::Node)), u32::MAX);

        let on_graph_item = noop().for_caller(ItemKind::GraphItem);
        assert_eq!(on_graph_item.mro_dist(Some(ItemKind::Node)), 1);
        assert_eq!(on_graph_item.mro_dist(Some(ItemKind::GraphItem)), 0);
        assert_eq!(on_graph_item.mro_dist(Some(ItemKind::Record)), u32::MAX);
    }

    #[test]
    fn test_invoke_produces_receipt_and_logs_to_ctx() {
        let mut graph = Graph::new();
        let mut ctx = DispatchCtx::new(&mut graph);
        let b = noop().labeled("greeter");
        let receipt = b.invoke(&mut ctx, &Invocation::default());
        assert_eq!(receipt.result, json!("done"));
        assert_eq!(receipt.result_code, ResultCode::Ok);
        assert_eq!(ctx.receipts.len(), 1);
        assert_eq!(receipt.message.as_deref(), Some("handler: greeter"));
    }

    #[test]
    fn test_handler_error_becomes_error_receipt() {
        let mut graph = Graph::new();
        let mut ctx = DispatchCtx::new(&mut graph);
        let b = Behavior::new(|_| Err(EngineError::handler("boom")));
        let receipt = b.invoke(&mut ctx, &Invocation::default());
        assert_eq!(receipt.result_code, ResultCode::Error);
        assert!(receipt.message.as_deref().unwrap().contains("boom"));
    }

    struct Forge;

    impl Owner for Forge {
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[test]
    fn test_weak_owner_upgrade_and_failure() {
        let mut graph = Graph::new();

        let owner: Arc<dyn Owner> = Arc::new(Forge);
        let b = Behavior::new(|bound| {
            Ok(HandlerReply::ok(json!(bound.owner.is_some())))
        })
        .owned_by(&owner);
        assert_eq!(b.handler_type, HandlerType::InstanceOnOwner);

        let mut ctx = DispatchCtx::new(&mut graph);
        let receipt = b.invoke(&mut ctx, &Invocation::default());
        assert_eq!(receipt.result, json!(true));

        // drop the owner: binding now fails (Entity kind does not cover a
        // caller-less invocation)
        drop(owner);
        let receipt = b.invoke(&mut ctx, &Invocation::default());
        assert_eq!(receipt.result_code, ResultCode::Error);
        assert!(receipt.message.as_deref().unwrap().contains("owner"));
    }

    #[test]
    fn test_dead_owner_falls_back_when_kinds_cover() {
        let mut graph = Graph::new();
        let owner: Arc<dyn Owner> = Arc::new(Forge);
        let b = Behavior::new(|bound| Ok(HandlerReply::ok(json!(bound.owner.is_none()))))
            .owned_by(&owner);
        drop(owner);

        let mut ctx = DispatchCtx::new(&mut graph);
        let call = Invocation {
            caller_kind: Some(ItemKind::Node),
            ..Invocation::default()
        };
        // Forge's owner kind is Entity, which covers Node: caller-as-self
        let receipt = b.invoke(&mut ctx, &call);
        assert_eq!(receipt.result, json!(true));
        assert_eq!(receipt.result_code, ResultCode::Ok);
    }
}
