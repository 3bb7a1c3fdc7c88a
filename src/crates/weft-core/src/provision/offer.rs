//! Provision offers and build receipts
//!
//! Offers describe *how* a requirement could be satisfied without doing any
//! work up front: accepting an offer runs its closure against the graph. The
//! arbitration key is `(cost, proximity, emission index)` — costs are spaced
//! so new categories can slot in without disturbing the order.
//!
//! [`BuildReceipt`] summarizes what happened to one accepted (or failed)
//! offer; [`PlanningReceipt`] aggregates a whole pass.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::Result;
use crate::graph::{Graph, Node};
use crate::record::Record;
use crate::requirement::ProvisioningPolicy;

use super::ProvisioningContext;

/// Relative cost of satisfying a requirement; lower is cheaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProvisionCost {
    /// Existing provider reused as-is.
    Direct = 10,
    /// Existing provider needs light updates.
    LightIndirect = 50,
    /// Provider must be cloned and evolved.
    HeavyIndirect = 100,
    /// Provider must be created from scratch.
    Create = 200,
}

impl ProvisionCost {
    pub fn value(self) -> u32 {
        self as u32
    }
}

/// Acceptance closure for a dependency offer; returns the provider node uid.
pub type DependencyAcceptor = Arc<dyn Fn(&mut Graph, &mut ProvisioningContext) -> Result<Uuid>>;

/// Acceptance closure for an affordance offer; receives the destination node
/// and returns the created affordance edge uid.
pub type AffordanceAcceptor = Arc<dyn Fn(&mut Graph, &mut ProvisioningContext, Uuid) -> Result<Uuid>>;

/// Lazy proposal to satisfy a dependency requirement.
#[derive(Clone)]
pub struct DependencyOffer {
    pub requirement_id: Uuid,
    /// The policy this offer implements when accepted.
    pub operation: ProvisioningPolicy,
    /// Known provider for EXISTING-style offers; drives deduplication.
    pub provider_id: Option<Uuid>,
    pub cost: ProvisionCost,
    /// Distance hint; the planner fills in the provisioner's iteration index
    /// when the emitter leaves it unset.
    pub proximity: Option<u32>,
    /// Human-readable rationale ("same scope", "new instance", ...).
    pub proximity_detail: &'static str,
    pub source_provisioner_id: Option<Uuid>,
    pub source_layer: Option<String>,
    /// Template provenance, when the offer materializes from one.
    pub template_ref: Option<String>,
    pub template_content_id: Option<Uuid>,
    pub acceptor: DependencyAcceptor,
}

impl DependencyOffer {
    pub fn new(
        requirement_id: Uuid,
        operation: ProvisioningPolicy,
        cost: ProvisionCost,
        acceptor: DependencyAcceptor,
    ) -> Self {
        Self {
            requirement_id,
            operation,
            provider_id: None,
            cost,
            proximity: None,
            proximity_detail: "",
            source_provisioner_id: None,
            source_layer: None,
            template_ref: None,
            template_content_id: None,
            acceptor,
        }
    }

    pub fn with_provider(mut self, provider_id: Uuid) -> Self {
        self.provider_id = Some(provider_id);
        self
    }

    pub fn at_proximity(mut self, proximity: u32, detail: &'static str) -> Self {
        self.proximity = Some(proximity);
        self.proximity_detail = detail;
        self
    }

    pub fn from_provisioner(mut self, uid: Uuid, layer: &str) -> Self {
        self.source_provisioner_id = Some(uid);
        self.source_layer = Some(layer.to_string());
        self
    }

    pub fn with_template_provenance(mut self, template_ref: Option<String>, content_id: Uuid) -> Self {
        self.template_ref = template_ref;
        self.template_content_id = Some(content_id);
        self
    }

    /// Run the acceptance closure.
    pub fn accept(&self, graph: &mut Graph, ctx: &mut ProvisioningContext) -> Result<Uuid> {
        (self.acceptor)(graph, ctx)
    }

    /// Audit entry for selection metadata.
    pub(crate) fn audit_entry(&self, emission_index: usize) -> Value {
        json!({
            "provider_id": self.provider_id.map(|u| u.to_string()),
            "cost": self.cost.value(),
            "proximity": self.proximity,
            "proximity_detail": self.proximity_detail,
            "operation": self.operation.name(),
            "source_provisioner_id": self.source_provisioner_id.map(|u| u.to_string()),
            "source_layer": self.source_layer,
            "emission_index": emission_index,
        })
    }
}

impl fmt::Debug for DependencyOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyOffer")
            .field("requirement_id", &self.requirement_id)
            .field("operation", &self.operation.name())
            .field("provider_id", &self.provider_id)
            .field("cost", &self.cost)
            .field("proximity", &self.proximity)
            .finish()
    }
}

/// Lazy proposal to broadcast an affordance onto a node.
#[derive(Clone)]
pub struct AffordanceOffer {
    /// Affordance label; deduplicated per node during planning.
    pub label: String,
    /// When non-empty, the offer applies only to nodes sharing a tag.
    pub target_tags: BTreeSet<String>,
    pub cost: ProvisionCost,
    pub proximity: Option<u32>,
    pub source_provisioner_id: Option<Uuid>,
    pub source_layer: Option<String>,
    pub acceptor: AffordanceAcceptor,
}

impl AffordanceOffer {
    pub fn new(label: impl Into<String>, acceptor: AffordanceAcceptor) -> Self {
        Self {
            label: label.into(),
            target_tags: BTreeSet::new(),
            cost: ProvisionCost::Direct,
            proximity: None,
            source_provisioner_id: None,
            source_layer: None,
            acceptor,
        }
    }

    pub fn targeting<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn from_provisioner(mut self, uid: Uuid, layer: &str) -> Self {
        self.source_provisioner_id = Some(uid);
        self.source_layer = Some(layer.to_string());
        self
    }

    /// Open to every node when untargeted; otherwise requires a shared tag.
    pub fn available_for(&self, node: &Node) -> bool {
        use crate::entity::Matchable;
        if self.target_tags.is_empty() {
            return true;
        }
        self.target_tags.iter().any(|t| node.entity().tags.contains(t))
    }

    /// Run the acceptance closure against `destination`.
    pub fn accept(
        &self,
        graph: &mut Graph,
        ctx: &mut ProvisioningContext,
        destination: Uuid,
    ) -> Result<Uuid> {
        (self.acceptor)(graph, ctx, destination)
    }
}

impl fmt::Debug for AffordanceOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AffordanceOffer")
            .field("label", &self.label)
            .field("target_tags", &self.target_tags)
            .field("cost", &self.cost)
            .finish()
    }
}

/// What happened when one planned offer executed.
#[derive(Debug, Clone)]
pub struct BuildReceipt {
    pub provisioner_id: Option<Uuid>,
    pub requirement_id: Option<Uuid>,
    pub provider_id: Option<Uuid>,
    pub operation: ProvisioningPolicy,
    pub accepted: bool,
    pub hard_req: bool,
    /// Failure reason when `accepted` is false.
    pub reason: Option<String>,
    pub template_ref: Option<String>,
    pub template_content_id: Option<Uuid>,
}

impl BuildReceipt {
    /// Freeze into a journal record.
    pub fn into_record(self) -> Record {
        let payload = json!({
            "provisioner_id": self.provisioner_id.map(|u| u.to_string()),
            "requirement_id": self.requirement_id.map(|u| u.to_string()),
            "provider_id": self.provider_id.map(|u| u.to_string()),
            "operation": self.operation.name(),
            "accepted": self.accepted,
            "hard_req": self.hard_req,
            "reason": self.reason,
            "template_ref": self.template_ref,
            "template_content_id": self.template_content_id.map(|u| u.to_string()),
        });
        let record = Record::new("build_receipt").with_payload(payload);
        match self.provisioner_id {
            Some(blame) => record.blamed(blame),
            None => record,
        }
    }
}

/// Aggregated report for one provisioning pass.
#[derive(Debug, Clone, Default)]
pub struct PlanningReceipt {
    pub resolved_dependencies: usize,
    pub resolved_affordances: usize,
    pub attached: usize,
    pub updated: usize,
    pub created: usize,
    pub cloned: usize,
    pub tokens: usize,
    pub unresolved_hard_requirements: Vec<Uuid>,
    pub waived_soft_requirements: Vec<Uuid>,
}

impl PlanningReceipt {
    /// Count operations across `builds` and attach the unresolved/waived
    /// requirement lists from the pass.
    pub fn summarize(builds: &[BuildReceipt], unresolved: &[Uuid], waived: &[Uuid]) -> Self {
        let mut receipt = Self {
            unresolved_hard_requirements: unresolved.to_vec(),
            waived_soft_requirements: waived.to_vec(),
            ..Self::default()
        };
        for build in builds {
            if !build.accepted {
                continue;
            }
            if build.requirement_id.is_none() {
                receipt.resolved_affordances += 1;
                continue;
            }
            match build.operation {
                op if op == ProvisioningPolicy::EXISTING => receipt.attached += 1,
                op if op == ProvisioningPolicy::UPDATE => receipt.updated += 1,
                op if op == ProvisioningPolicy::CREATE => receipt.created += 1,
                op if op == ProvisioningPolicy::CLONE => receipt.cloned += 1,
                op if op == ProvisioningPolicy::CREATE_TOKEN => receipt.tokens += 1,
                _ => {}
            }
        }
        receipt.resolved_dependencies =
            receipt.attached + receipt.updated + receipt.created + receipt.cloned + receipt.tokens;
        receipt
    }

    /// Freeze into a journal record.
    pub fn into_record(self) -> Record {
        Record::new("planning_receipt").with_payload(json!({
            "resolved_dependencies": self.resolved_dependencies,
            "resolved_affordances": self.resolved_affordances,
            "attached": self.attached,
            "updated": self.updated,
            "created": self.created,
            "cloned": self.cloned,
            "tokens": self.tokens,
            "unresolved_hard_requirements":
                self.unresolved_hard_requirements.iter().map(|u| u.to_string()).collect::<Vec<_>>(),
            "waived_soft_requirements":
                self.waived_soft_requirements.iter().map(|u| u.to_string()).collect::<Vec<_>>(),
        }))
    }
}
