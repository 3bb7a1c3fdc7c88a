//! Requirements: what must be linked, and how
//!
//! A [`Requirement`] is a graph item describing a needed provider at the
//! resolution frontier. It travels on open edges (dependency / affordance)
//! and is satisfied by binding a provider node. The
//! [`ProvisioningPolicy`] bitflags say how a provider may be obtained;
//! construction validation enforces the field rules for each declared policy
//! and never allows a partially valid requirement into a graph.

use bitflags::bitflags;
use serde_json::Value;
use uuid::Uuid;

use crate::entity::{Criteria, Entity, ItemKind, Matchable, MatchScope};
use crate::error::{EngineError, Result};
use crate::graph::Graph;

bitflags! {
    /// Provisioning strategies for satisfying a requirement.
    ///
    /// Values are spaced as independent bits so policies can be combined
    /// (`EXISTING | CREATE`); [`ProvisioningPolicy::ANY`] is the standard
    /// union. `NOOP` exists as an explicit dead-end and is rejected by
    /// requirement validation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ProvisioningPolicy: u8 {
        /// Find a pre-existing provider by identifier and/or criteria.
        const EXISTING = 1 << 0;
        /// Find a provider and update it in place from a template.
        const UPDATE = 1 << 1;
        /// Create a new provider from a template.
        const CREATE = 1 << 2;
        /// Create a singleton-backed token through a token forge.
        const CREATE_TOKEN = 1 << 3;
        /// Deep-copy a reference provider, then evolve it via template.
        const CLONE = 1 << 4;
        /// Unsatisfiable; not allowed on a requirement.
        const NOOP = 1 << 5;
        /// Any of existing, update, create, create-token.
        const ANY = Self::EXISTING.bits()
            | Self::UPDATE.bits()
            | Self::CREATE.bits()
            | Self::CREATE_TOKEN.bits();
    }
}

impl ProvisioningPolicy {
    /// Template-driven creation; alias kept for offer metadata symmetry.
    pub const CREATE_TEMPLATE: ProvisioningPolicy = ProvisioningPolicy::CREATE;

    /// Stable name for receipts and audit metadata.
    pub fn name(self) -> &'static str {
        if self == ProvisioningPolicy::EXISTING {
            "existing"
        } else if self == ProvisioningPolicy::UPDATE {
            "update"
        } else if self == ProvisioningPolicy::CREATE {
            "create"
        } else if self == ProvisioningPolicy::CREATE_TOKEN {
            "create_token"
        } else if self == ProvisioningPolicy::CLONE {
            "clone"
        } else if self == ProvisioningPolicy::NOOP {
            "noop"
        } else if self == ProvisioningPolicy::ANY {
            "any"
        } else {
            "mixed"
        }
    }
}

/// Graph item describing a needed provider and how to obtain one.
#[derive(Debug, Clone)]
pub struct Requirement {
    base: Entity,
    /// Label or uid alias targeting one specific provider.
    pub identifier: Option<String>,
    /// Match criteria targeting any suitable provider.
    pub criteria: Criteria,
    /// Inline template payload for CREATE/UPDATE/CLONE.
    pub template: Option<Value>,
    /// Symbolic template lookup through the active script source.
    pub template_ref: Option<String>,
    /// Token type name for CREATE_TOKEN.
    pub token_type: Option<String>,
    /// Token label for CREATE_TOKEN.
    pub token_label: Option<String>,
    /// Explicit asset reference; the asset provisioner only answers this.
    pub asset_ref: Option<String>,
    policy: ProvisioningPolicy,
    /// Source node for CLONE.
    pub reference_id: Option<Uuid>,
    provider_id: Option<Uuid>,
    /// Hard requirements block progress when unresolved; soft ones are waived.
    pub hard_requirement: bool,
    /// Sticky flag: a prior resolution attempt failed.
    pub is_unresolvable: bool,
    /// Scope node where the binding occurred, for downstream reuse.
    pub satisfied_at_scope_id: Option<Uuid>,
}

impl Requirement {
    pub fn new(policy: ProvisioningPolicy) -> Self {
        Self {
            base: Entity::new(),
            identifier: None,
            criteria: Criteria::new(),
            template: None,
            template_ref: None,
            token_type: None,
            token_label: None,
            asset_ref: None,
            policy,
            reference_id: None,
            provider_id: None,
            hard_requirement: true,
            is_unresolvable: false,
            satisfied_at_scope_id: None,
        }
    }

    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.base = self.base.labeled(label);
        self
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn with_criteria(mut self, criteria: Criteria) -> Self {
        self.criteria = criteria;
        self
    }

    pub fn with_template(mut self, template: Value) -> Self {
        self.template = Some(template);
        self
    }

    pub fn with_template_ref(mut self, template_ref: impl Into<String>) -> Self {
        self.template_ref = Some(template_ref.into());
        self
    }

    pub fn with_token(mut self, token_type: impl Into<String>, token_label: impl Into<String>) -> Self {
        self.token_type = Some(token_type.into());
        self.token_label = Some(token_label.into());
        self
    }

    pub fn with_asset_ref(mut self, asset_ref: impl Into<String>) -> Self {
        self.asset_ref = Some(asset_ref.into());
        self
    }

    pub fn with_reference(mut self, reference_id: Uuid) -> Self {
        self.reference_id = Some(reference_id);
        self
    }

    /// Soft requirements do not block progress when unresolved.
    pub fn soft(mut self) -> Self {
        self.hard_requirement = false;
        self
    }

    pub fn uid(&self) -> Uuid {
        self.base.uid()
    }

    pub(crate) fn entity_mut(&mut self) -> &mut Entity {
        &mut self.base
    }

    pub fn policy(&self) -> ProvisioningPolicy {
        self.policy
    }

    pub fn provider_id(&self) -> Option<Uuid> {
        self.provider_id
    }

    pub(crate) fn set_provider(&mut self, provider: Option<Uuid>) {
        self.provider_id = provider;
    }

    /// Bound, or soft enough not to matter.
    pub fn satisfied(&self) -> bool {
        self.provider_id.is_some() || !self.hard_requirement
    }

    fn has_template_source(&self) -> bool {
        self.template.is_some() || self.template_ref.is_some()
    }

    fn has_targeting(&self) -> bool {
        self.identifier.is_some() || !self.criteria.is_empty()
    }

    /// Enforce the field rules of the declared policy.
    ///
    /// - NOOP is never allowed.
    /// - EXISTING / UPDATE need an identifier or criteria.
    /// - CLONE needs `reference_id` and a template source.
    /// - CREATE / UPDATE need a template source.
    /// - ANY needs at least one targeting field.
    pub fn validate(&self) -> Result<()> {
        if self.policy.is_empty() || self.policy.contains(ProvisioningPolicy::NOOP) {
            return Err(EngineError::InvalidPolicy("policy cannot be NOOP".into()));
        }

        if (self.policy == ProvisioningPolicy::EXISTING || self.policy == ProvisioningPolicy::UPDATE)
            && !self.has_targeting()
        {
            return Err(EngineError::InvalidPolicy(
                "EXISTING/UPDATE requires an identifier or match criteria".into(),
            ));
        }

        if self.policy == ProvisioningPolicy::CLONE {
            if self.reference_id.is_none() {
                return Err(EngineError::InvalidPolicy(
                    "CLONE requires reference_id to name the source node".into(),
                ));
            }
            if !self.has_template_source() {
                return Err(EngineError::InvalidPolicy(
                    "CLONE requires template data to evolve the copy".into(),
                ));
            }
        }

        if (self.policy == ProvisioningPolicy::CREATE || self.policy == ProvisioningPolicy::UPDATE)
            && !self.has_template_source()
        {
            return Err(EngineError::InvalidPolicy(format!(
                "{} requires a template",
                self.policy.name()
            )));
        }

        if self.policy == ProvisioningPolicy::ANY
            && !self.has_targeting()
            && !self.has_template_source()
            && self.token_label.is_none()
            && self.asset_ref.is_none()
        {
            return Err(EngineError::InvalidPolicy(
                "ANY requires at least one of identifier, criteria, template, or template_ref".into(),
            ));
        }

        Ok(())
    }

    /// The criteria a provider must satisfy: explicit criteria, with the
    /// identifier folded in as `has_identifier` when not already present.
    pub fn provider_criteria(&self) -> Criteria {
        let mut criteria = self.criteria.clone();
        if let Some(identifier) = &self.identifier {
            if !criteria.contains_key("has_identifier") {
                criteria = criteria.has_identifier(identifier.clone());
            }
        }
        criteria
    }

    /// Would `candidate` satisfy this requirement?
    pub fn satisfied_by(&self, candidate: &dyn SatisfactionCandidate, graph: &Graph) -> bool {
        candidate.candidate_matches(&self.provider_criteria(), MatchScope::in_graph(graph))
    }
}

/// Object-safe adapter so `satisfied_by` can take any matchable candidate.
pub trait SatisfactionCandidate {
    fn candidate_matches(&self, criteria: &Criteria, scope: MatchScope<'_>) -> bool;
}

impl<T: Matchable> SatisfactionCandidate for T {
    fn candidate_matches(&self, criteria: &Criteria, scope: MatchScope<'_>) -> bool {
        self.matches(criteria, scope)
    }
}

impl Matchable for Requirement {
    fn entity(&self) -> &Entity {
        &self.base
    }

    fn kind(&self) -> ItemKind {
        ItemKind::Requirement
    }

    fn capability(&self, key: &str, expected: &Value, scope: MatchScope<'_>) -> Option<bool> {
        match key {
            "is_satisfied" => Some(expected.as_bool().map(|b| b == self.satisfied()).unwrap_or(false)),
            "is_unresolvable" => {
                Some(expected.as_bool().map(|b| b == self.is_unresolvable).unwrap_or(false))
            }
            _ => self.base.base_capability(key, expected).or_else(|| {
                scope.graph.and_then(|g| g.scope_capability(self.uid(), key, expected))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;
    use serde_json::json;

    #[test]
    fn test_noop_forbidden() {
        let err = Requirement::new(ProvisioningPolicy::NOOP).validate().unwrap_err();
        assert!(matches!(err, EngineError::InvalidPolicy(_)));
        let err = Requirement::new(ProvisioningPolicy::empty()).validate().unwrap_err();
        assert!(matches!(err, EngineError::InvalidPolicy(_)));
    }

    #[test]
    fn test_existing_needs_targeting() {
        assert!(Requirement::new(ProvisioningPolicy::EXISTING).validate().is_err());
        assert!(Requirement::new(ProvisioningPolicy::EXISTING)
            .with_identifier("hero")
            .validate()
            .is_ok());
        assert!(Requirement::new(ProvisioningPolicy::EXISTING)
            .with_criteria(Criteria::new().has_tags(["hero"]))
            .validate()
            .is_ok());
    }

    #[test]
    fn test_clone_needs_reference_and_template() {
        let reference = Uuid::new_v4();
        assert!(Requirement::new(ProvisioningPolicy::CLONE)
            .with_template(json!({"color": "blue"}))
            .validate()
            .is_err());
        assert!(Requirement::new(ProvisioningPolicy::CLONE)
            .with_reference(reference)
            .validate()
            .is_err());
        assert!(Requirement::new(ProvisioningPolicy::CLONE)
            .with_reference(reference)
            .with_template(json!({"color": "blue"}))
            .validate()
            .is_ok());
    }

    #[test]
    fn test_create_needs_template_source() {
        assert!(Requirement::new(ProvisioningPolicy::CREATE).validate().is_err());
        assert!(Requirement::new(ProvisioningPolicy::CREATE)
            .with_template_ref("templates.hero")
            .validate()
            .is_ok());
    }

    #[test]
    fn test_any_needs_some_targeting() {
        assert!(Requirement::new(ProvisioningPolicy::ANY).validate().is_err());
        assert!(Requirement::new(ProvisioningPolicy::ANY)
            .with_criteria(Criteria::new().has_tags(["hero"]))
            .validate()
            .is_ok());
    }

    #[test]
    fn test_provider_criteria_folds_identifier() {
        let req = Requirement::new(ProvisioningPolicy::EXISTING).with_identifier("hero");
        let criteria = req.provider_criteria();
        assert!(criteria.contains_key("has_identifier"));
    }

    #[test]
    fn test_satisfied_by() {
        let mut graph = Graph::new();
        let hero = graph.add_node(Node::new().labeled("hero").tagged(["brave"])).unwrap();
        let _bystander = graph.add_node(Node::new().labeled("bystander")).unwrap();

        let req = Requirement::new(ProvisioningPolicy::EXISTING)
            .with_criteria(Criteria::new().has_tags(["brave"]));
        assert!(req.satisfied_by(graph.get(hero).unwrap(), &graph));
        assert!(!req.satisfied_by(graph.get(_bystander).unwrap(), &graph));
    }

    #[test]
    fn test_soft_requirement_satisfied_without_provider() {
        let req = Requirement::new(ProvisioningPolicy::EXISTING)
            .with_identifier("anyone")
            .soft();
        assert!(req.satisfied());
        assert!(req.provider_id().is_none());
    }
}
