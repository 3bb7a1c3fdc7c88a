//! # weft-core - Deterministic Narrative-Graph Runtime
//!
//! `weft-core` is the runtime core of an interactive story engine: a
//! graph-based virtual machine that advances a cursor through a narrative
//! directed graph, resolves structural requirements on demand, dispatches
//! behaviors in a deterministic, CSS-like priority order, and emits an
//! append-only journal of immutable records.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Cursor                              │
//! │   gather → resolve → gate → render → finalize               │
//! └───────┬───────────────┬─────────────────────┬────────────────┘
//!         │               │                     │
//!         ▼               ▼                     ▼
//!   LayeredDispatch   Provisioning          StreamRegistry
//!   (filter → sort    (collect → dedup →    (monotonic seqs,
//!    → invoke,         select → execute)     markers, channels)
//!    CallReceipts)     BuildReceipts         immutable Records
//!         │               │
//!         └───────┬───────┘
//!                 ▼
//!          Graph / Registry / Entity
//!          (uids, tags, criteria matching)
//! ```
//!
//! ## Core Concepts
//!
//! ### Entities and matching
//!
//! Every runtime object shares the [`entity::Entity`] substrate: a stable
//! uid, optional label, tags, and attributes. Selection is criteria-driven —
//! `has_*`/`is_*` keys dispatch to capability hooks, other keys compare
//! attributes — and ordered by CSS-style specificity. See [`entity`].
//!
//! ### The graph
//!
//! A [`graph::Graph`] is an insertion-ordered registry of nodes, edges,
//! subgraphs, and requirements, with linkage integrity checks, cached
//! parent/ancestor queries, and dotted label paths. Open edges (dependencies
//! and affordances) carry a [`requirement::Requirement`] instead of a fixed
//! endpoint. See [`graph`] and [`requirement`].
//!
//! ### Behavior dispatch
//!
//! [`dispatch::BehaviorRegistry`] runs the deterministic pipeline: filter by
//! merged criteria, sort by `(priority, -layer, mro distance, specificity,
//! handler type, seq)`, then lazily invoke, yielding one
//! [`record::CallReceipt`] per behavior. Registries chain across layers
//! (INLINE → LOCAL → AUTHOR → APPLICATION → SYSTEM → GLOBAL). See
//! [`behavior`] and [`dispatch`].
//!
//! ### Provisioning
//!
//! The planner satisfies a node's open edges by collecting
//! [`provision::DependencyOffer`]s from registered provisioners, arbitrating
//! by `(cost, proximity, emission index)`, and executing the winning offers
//! idempotently. Failures are recorded, never thrown mid-plan. See
//! [`provision`].
//!
//! ### The journal
//!
//! [`stream::StreamRegistry`] is append-only with strictly monotonic
//! sequence numbers, named section markers, and derived channels. Records
//! are immutable; an update is a new record. See [`stream`] and [`record`].
//!
//! ## Quick Start
//!
//! ```rust
//! use weft_core::behavior::{Behavior, HandlerReply};
//! use weft_core::cursor::{Cursor, StepOutcome};
//! use weft_core::entity::Criteria;
//! use weft_core::graph::{Edge, Graph, Node};
//! use serde_json::json;
//!
//! # fn main() -> weft_core::error::Result<()> {
//! let mut graph = Graph::new();
//! let start = graph.add_node(Node::new().labeled("start"))?;
//! let next = graph.add_node(Node::new().labeled("next"))?;
//! let onward = graph.add_edge(Edge::link(Some(start), Some(next)))?;
//!
//! let mut cursor = Cursor::new(graph);
//! cursor.set_position(start)?;
//!
//! // render a fragment at every node
//! cursor.core_mut().add_behavior(
//!     Behavior::new(|bound| {
//!         let here = bound.ctx.ns.get("here").cloned().unwrap_or_default();
//!         Ok(HandlerReply::fragment(json!({"text": format!("at {here}")})))
//!     })
//!     .with_task("render"),
//! )?;
//! // and always continue over the first link
//! cursor.core_mut().add_behavior(
//!     Behavior::new(move |_| Ok(HandlerReply::edge(onward))).with_task("continue"),
//! )?;
//!
//! assert_eq!(cursor.step()?, StepOutcome::Advanced(next));
//! assert_eq!(cursor.journal.iter_channel("fragment", &Criteria::new()).len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Determinism
//!
//! The engine is single-threaded and cooperative. Given identical graph
//! state, registration order, and caller history, every step produces
//! identical receipt sequences and journal contents; provisioning randomness
//! is seeded from the provisioning context.
//!
//! ## Scope
//!
//! Script loading, class resolution, asset and token backends are
//! collaborator seams ([`collab`]); the core defines no file format, network
//! protocol, or CLI of its own.

pub mod behavior;
pub mod collab;
pub mod context;
pub mod cursor;
pub mod dispatch;
pub mod entity;
pub mod error;
pub mod graph;
pub mod provision;
pub mod record;
pub mod registry;
pub mod requirement;
pub mod singleton;
pub mod stream;
pub mod template;
pub mod token;

pub use behavior::{Behavior, HandlerLayer, HandlerReply, HandlerType};
pub use context::{DispatchCtx, ScopedMap, Tier};
pub use cursor::{Cursor, StepOutcome};
pub use dispatch::{BehaviorRegistry, DispatchArgs, LayeredDispatch};
pub use entity::{Criteria, Entity, ItemKind, Matchable, MatchScope, Selectable};
pub use error::{EngineError, Result};
pub use graph::{Edge, EdgeKind, Graph, GraphItem, Node, Subgraph};
pub use provision::{
    provision_node, GraphProvisioner, Provisioner, ProvisioningContext, ProvisioningPlan,
    ProvisioningResult, TemplateProvisioner,
};
pub use record::{CallReceipt, Record, ResultCode};
pub use registry::Registry;
pub use requirement::{ProvisioningPolicy, Requirement};
pub use stream::StreamRegistry;
pub use template::Template;
