//! Built-in provisioner variants
//!
//! Provisioners emit offers against unresolved requirements; none of them
//! touch the graph until an offer is accepted. Each variant answers exactly
//! one policy family:
//!
//! | Provisioner | Policy | Cost |
//! |---|---|---|
//! | [`GraphProvisioner`] | EXISTING | DIRECT + structural proximity |
//! | [`UpdatingProvisioner`] | UPDATE | LIGHT_INDIRECT |
//! | [`CloningProvisioner`] | CLONE | HEAVY_INDIRECT |
//! | [`TemplateProvisioner`] | CREATE | CREATE |
//! | [`TokenProvisioner`] | CREATE_TOKEN | CREATE |
//! | [`AssetProvisioner`] | explicit `asset_ref` only | HEAVY_INDIRECT |
//! | [`CompanionProvisioner`] | affordance broadcasts | DIRECT |
//!
//! Structural proximity prefers candidates near the requirement's source:
//! same node 0, same parent scope 5, same root 10, otherwise 20. Template
//! creation and cloning carry a strong 999 penalty so an existing match
//! always wins when one exists.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::collab::{AssetStore, KindResolver, ScriptSource, TokenForge};
use crate::entity::{Entity, Matchable};
use crate::error::EngineError;
use crate::graph::{Graph, Node};
use crate::requirement::{ProvisioningPolicy, Requirement};
use crate::template::Template;

use super::offer::{AffordanceOffer, DependencyOffer, ProvisionCost};
use super::ProvisioningContext;

/// Emits offers that could satisfy frontier requirements.
pub trait Provisioner {
    fn uid(&self) -> Uuid;

    /// Layer tag recorded on emitted offers.
    fn layer(&self) -> &str {
        "global"
    }

    /// The node or subgraph that owns this provisioner, if scoped.
    fn scope_node_id(&self) -> Option<Uuid> {
        None
    }

    fn dependency_offers(
        &self,
        _requirement: &Requirement,
        _graph: &Graph,
        _ctx: &mut ProvisioningContext,
    ) -> Vec<DependencyOffer> {
        Vec::new()
    }

    fn affordance_offers(
        &self,
        _node: &Node,
        _graph: &Graph,
        _ctx: &mut ProvisioningContext,
    ) -> Vec<AffordanceOffer> {
        Vec::new()
    }
}

/// Relative structural distance of `candidate` from the requirement source.
fn structural_proximity(
    candidate: Uuid,
    graph: &Graph,
    ctx: &ProvisioningContext,
) -> (u32, &'static str) {
    let Some(source) = ctx.current_requirement_source_id else {
        return (20, "unknown");
    };
    if candidate == source {
        return (0, "same node");
    }
    let source_parent = graph.parent_of(source);
    if source_parent.is_some() && source_parent == graph.parent_of(candidate) {
        return (5, "same scope");
    }
    let source_root = graph.root_of(source);
    if source_root.is_some() && source_root == graph.root_of(candidate) {
        return (10, "same root");
    }
    (20, "distant")
}

/// Resolve a requirement's template: inline payload first, then symbolic
/// lookup through the script source (template_ref, falling back to the
/// identifier). `None` means this requirement has nothing to build from.
fn resolve_template(
    requirement: &Requirement,
    scripts: Option<&Arc<dyn ScriptSource>>,
    graph: &Graph,
    ctx: &ProvisioningContext,
) -> Option<Template> {
    if let Some(inline) = &requirement.template {
        match Template::from_value(inline.clone()) {
            Ok(template) => return Some(template),
            Err(e) => {
                debug!(requirement = %requirement.uid(), error = %e, "inline template rejected");
                return None;
            }
        }
    }
    let scripts = scripts?;
    let identifier = requirement
        .template_ref
        .as_deref()
        .or(requirement.identifier.as_deref())?;
    scripts.find_template(
        identifier,
        graph,
        ctx.current_requirement_source_id,
        &requirement.criteria,
    )
}

/// Template overlay carried on the requirement, as a plain object.
fn requirement_overlay(requirement: &Requirement) -> Map<String, Value> {
    match &requirement.template {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    }
}

/// Offers existing graph nodes for EXISTING-family requirements.
#[derive(Debug, Clone)]
pub struct GraphProvisioner {
    base: Entity,
    pub layer: String,
    pub scope_node_id: Option<Uuid>,
}

impl GraphProvisioner {
    pub fn new() -> Self {
        Self {
            base: Entity::new().labeled("graph-provisioner"),
            layer: "global".into(),
            scope_node_id: None,
        }
    }

    pub fn with_layer(mut self, layer: impl Into<String>) -> Self {
        self.layer = layer.into();
        self
    }

    pub fn scoped_to(mut self, node: Uuid) -> Self {
        self.scope_node_id = Some(node);
        self
    }
}

impl Default for GraphProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl Provisioner for GraphProvisioner {
    fn uid(&self) -> Uuid {
        self.base.uid()
    }

    fn layer(&self) -> &str {
        &self.layer
    }

    fn scope_node_id(&self) -> Option<Uuid> {
        self.scope_node_id
    }

    fn dependency_offers(
        &self,
        requirement: &Requirement,
        graph: &Graph,
        ctx: &mut ProvisioningContext,
    ) -> Vec<DependencyOffer> {
        if !requirement.policy().intersects(ProvisioningPolicy::EXISTING) {
            return Vec::new();
        }
        let criteria = requirement.provider_criteria();
        let mut seen: BTreeSet<Uuid> = BTreeSet::new();
        let mut offers = Vec::new();
        for node in graph.find_nodes(&criteria) {
            let provider = node.uid();
            if !seen.insert(provider) {
                continue;
            }
            let (proximity, detail) = structural_proximity(provider, graph, ctx);
            offers.push(
                DependencyOffer::new(
                    requirement.uid(),
                    ProvisioningPolicy::EXISTING,
                    ProvisionCost::Direct,
                    Arc::new(move |_graph, _ctx| Ok(provider)),
                )
                .with_provider(provider)
                .at_proximity(proximity, detail)
                .from_provisioner(self.uid(), &self.layer),
            );
        }
        offers
    }
}

/// Creates new nodes from requirement templates (CREATE).
pub struct TemplateProvisioner {
    base: Entity,
    scripts: Option<Arc<dyn ScriptSource>>,
    kinds: Option<Arc<dyn KindResolver>>,
    pub layer: String,
}

impl TemplateProvisioner {
    pub fn new() -> Self {
        Self {
            base: Entity::new().labeled("template-provisioner"),
            scripts: None,
            kinds: None,
            layer: "global".into(),
        }
    }

    pub fn with_scripts(mut self, scripts: Arc<dyn ScriptSource>) -> Self {
        self.scripts = Some(scripts);
        self
    }

    pub fn with_kinds(mut self, kinds: Arc<dyn KindResolver>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    pub fn with_layer(mut self, layer: impl Into<String>) -> Self {
        self.layer = layer.into();
        self
    }
}

impl Default for TemplateProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl Provisioner for TemplateProvisioner {
    fn uid(&self) -> Uuid {
        self.base.uid()
    }

    fn layer(&self) -> &str {
        &self.layer
    }

    fn dependency_offers(
        &self,
        requirement: &Requirement,
        graph: &Graph,
        ctx: &mut ProvisioningContext,
    ) -> Vec<DependencyOffer> {
        if !requirement.policy().intersects(ProvisioningPolicy::CREATE) {
            return Vec::new();
        }
        let Some(template) = resolve_template(requirement, self.scripts.as_ref(), graph, ctx) else {
            return Vec::new();
        };
        if let Some(source) = ctx.current_requirement_source_id {
            if !template.applies_at(graph, source) {
                return Vec::new();
            }
        }

        let template_ref = requirement
            .template_ref
            .clone()
            .or_else(|| template.label.clone());
        let content_id = template.content_id();
        let kinds = self.kinds.clone();
        let acceptor = Arc::new(move |graph: &mut Graph, _ctx: &mut ProvisioningContext| {
            let mut node = template.build_node();
            if let (Some(kinds), Some(symbolic)) = (&kinds, node.node_type.clone()) {
                node.node_type = kinds.resolve_kind(&symbolic).or(Some(symbolic));
            }
            graph.add_node(node)
        });

        vec![DependencyOffer::new(
            requirement.uid(),
            ProvisioningPolicy::CREATE,
            ProvisionCost::Create,
            acceptor,
        )
        .at_proximity(999, "new instance")
        .from_provisioner(self.uid(), &self.layer)
        .with_template_provenance(template_ref, content_id)]
    }
}

/// Updates existing matching nodes in place with template data (UPDATE).
pub struct UpdatingProvisioner {
    base: Entity,
    scripts: Option<Arc<dyn ScriptSource>>,
    pub layer: String,
}

impl UpdatingProvisioner {
    pub fn new() -> Self {
        Self {
            base: Entity::new().labeled("updating-provisioner"),
            scripts: None,
            layer: "global".into(),
        }
    }

    pub fn with_scripts(mut self, scripts: Arc<dyn ScriptSource>) -> Self {
        self.scripts = Some(scripts);
        self
    }
}

impl Default for UpdatingProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl Provisioner for UpdatingProvisioner {
    fn uid(&self) -> Uuid {
        self.base.uid()
    }

    fn layer(&self) -> &str {
        &self.layer
    }

    fn dependency_offers(
        &self,
        requirement: &Requirement,
        graph: &Graph,
        ctx: &mut ProvisioningContext,
    ) -> Vec<DependencyOffer> {
        if !requirement.policy().intersects(ProvisioningPolicy::UPDATE) {
            return Vec::new();
        }
        if requirement.identifier.is_none() && requirement.criteria.is_empty() {
            return Vec::new();
        }
        let Some(template) = resolve_template(requirement, self.scripts.as_ref(), graph, ctx) else {
            return Vec::new();
        };

        let criteria = requirement.provider_criteria();
        let mut seen: BTreeSet<Uuid> = BTreeSet::new();
        let mut offers = Vec::new();
        for node in graph.find_nodes(&criteria) {
            let target = node.uid();
            if !seen.insert(target) {
                continue;
            }
            let template = template.clone();
            offers.push(
                DependencyOffer::new(
                    requirement.uid(),
                    ProvisioningPolicy::UPDATE,
                    ProvisionCost::LightIndirect,
                    Arc::new(move |graph: &mut Graph, _ctx: &mut ProvisioningContext| {
                        let node = graph
                            .get_node_mut(target)
                            .ok_or_else(|| EngineError::NotFound(format!("node {target}")))?;
                        template.apply_to(node);
                        Ok(target)
                    }),
                )
                .with_provider(target)
                .at_proximity(999, "update")
                .from_provisioner(self.uid(), &self.layer),
            );
        }
        offers
    }
}

/// Clones a reference node and evolves the copy via template (CLONE).
pub struct CloningProvisioner {
    base: Entity,
    scripts: Option<Arc<dyn ScriptSource>>,
    pub layer: String,
}

impl CloningProvisioner {
    pub fn new() -> Self {
        Self {
            base: Entity::new().labeled("cloning-provisioner"),
            scripts: None,
            layer: "global".into(),
        }
    }

    pub fn with_scripts(mut self, scripts: Arc<dyn ScriptSource>) -> Self {
        self.scripts = Some(scripts);
        self
    }
}

impl Default for CloningProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl Provisioner for CloningProvisioner {
    fn uid(&self) -> Uuid {
        self.base.uid()
    }

    fn layer(&self) -> &str {
        &self.layer
    }

    fn dependency_offers(
        &self,
        requirement: &Requirement,
        graph: &Graph,
        ctx: &mut ProvisioningContext,
    ) -> Vec<DependencyOffer> {
        if !requirement.policy().intersects(ProvisioningPolicy::CLONE) {
            return Vec::new();
        }
        let Some(reference) = requirement.reference_id else {
            return Vec::new();
        };
        if graph.get_node(reference).is_none() {
            return Vec::new();
        }
        let Some(template) = resolve_template(requirement, self.scripts.as_ref(), graph, ctx) else {
            return Vec::new();
        };

        let content_id = template.content_id();
        let template_ref = requirement.template_ref.clone();
        let acceptor = Arc::new(move |graph: &mut Graph, _ctx: &mut ProvisioningContext| {
            let source = graph
                .get_node(reference)
                .ok_or_else(|| EngineError::NotFound(format!("reference node {reference}")))?;
            // fresh identity, copied substance
            let mut copy = Node::new();
            copy.entity_mut().label = source.entity().label.clone();
            copy.entity_mut().tags = source.entity().tags.clone();
            copy.entity_mut().attrs = source.entity().attrs.clone();
            copy.node_type = source.node_type.clone();
            template.apply_to(&mut copy);
            graph.add_node(copy)
        });

        vec![DependencyOffer::new(
            requirement.uid(),
            ProvisioningPolicy::CLONE,
            ProvisionCost::HeavyIndirect,
            acceptor,
        )
        .at_proximity(999, "clone")
        .from_provisioner(self.uid(), &self.layer)
        .with_template_provenance(template_ref, content_id)]
    }
}

/// Creates singleton-backed tokens through a token forge (CREATE_TOKEN).
pub struct TokenProvisioner {
    base: Entity,
    forge: Arc<dyn TokenForge>,
    pub layer: String,
}

impl TokenProvisioner {
    pub fn new(forge: Arc<dyn TokenForge>) -> Self {
        Self {
            base: Entity::new().labeled("token-provisioner"),
            forge,
            layer: "token".into(),
        }
    }
}

impl Provisioner for TokenProvisioner {
    fn uid(&self) -> Uuid {
        self.base.uid()
    }

    fn layer(&self) -> &str {
        &self.layer
    }

    fn dependency_offers(
        &self,
        requirement: &Requirement,
        _graph: &Graph,
        _ctx: &mut ProvisioningContext,
    ) -> Vec<DependencyOffer> {
        if !requirement.policy().intersects(ProvisioningPolicy::CREATE_TOKEN) {
            return Vec::new();
        }
        let (Some(token_type), Some(token_label)) =
            (requirement.token_type.clone(), requirement.token_label.clone())
        else {
            return Vec::new();
        };
        if !self.forge.has_type(&token_type) {
            return Vec::new();
        }
        if self.forge.resolve_base(&token_type, &token_label).is_none() {
            return Vec::new();
        }

        let overlay = requirement_overlay(requirement);
        let forge = Arc::clone(&self.forge);
        vec![DependencyOffer::new(
            requirement.uid(),
            ProvisioningPolicy::CREATE_TOKEN,
            ProvisionCost::Create,
            Arc::new(move |graph: &mut Graph, _ctx: &mut ProvisioningContext| {
                forge.materialize_token(&token_type, &token_label, &overlay, graph)
            }),
        )
        .at_proximity(999, "token")
        .from_provisioner(self.uid(), &self.layer)]
    }
}

/// Fulfills explicit `asset_ref` requests through an asset store.
///
/// Opt-in only: requirements without an asset ref are never answered, so
/// story-driven provisioning stays with the other variants.
pub struct AssetProvisioner {
    base: Entity,
    assets: Arc<dyn AssetStore>,
    pub layer: String,
}

impl AssetProvisioner {
    pub fn new(assets: Arc<dyn AssetStore>) -> Self {
        Self {
            base: Entity::new().labeled("asset-provisioner"),
            assets,
            layer: "asset".into(),
        }
    }
}

impl Provisioner for AssetProvisioner {
    fn uid(&self) -> Uuid {
        self.base.uid()
    }

    fn layer(&self) -> &str {
        &self.layer
    }

    fn dependency_offers(
        &self,
        requirement: &Requirement,
        _graph: &Graph,
        _ctx: &mut ProvisioningContext,
    ) -> Vec<DependencyOffer> {
        let Some(asset_ref) = requirement.asset_ref.clone() else {
            return Vec::new();
        };
        if !self.assets.has_asset(&asset_ref) {
            return Vec::new();
        }
        if !requirement.policy().intersects(
            ProvisioningPolicy::CREATE | ProvisioningPolicy::CLONE | ProvisioningPolicy::ANY,
        ) {
            return Vec::new();
        }

        let overlay = requirement_overlay(requirement);
        let assets = Arc::clone(&self.assets);
        vec![DependencyOffer::new(
            requirement.uid(),
            ProvisioningPolicy::CLONE,
            ProvisionCost::HeavyIndirect,
            Arc::new(move |graph: &mut Graph, _ctx: &mut ProvisioningContext| {
                assets.create_token(&asset_ref, graph, &overlay)
            }),
        )
        .at_proximity(0, "asset token")
        .from_provisioner(self.uid(), &self.layer)]
    }
}

/// One affordance a companion can broadcast.
#[derive(Debug, Clone)]
pub struct AffordanceSpec {
    /// Affordance label; also the dedup key per node.
    pub label: String,
    /// Restrict the broadcast to nodes sharing one of these tags.
    pub target_tags: BTreeSet<String>,
    /// Only broadcast while the companion carries all of these tags.
    pub requires_companion_tags: BTreeSet<String>,
}

impl AffordanceSpec {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            target_tags: BTreeSet::new(),
            requires_companion_tags: BTreeSet::new(),
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

    pub fn when_companion<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires_companion_tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Broadcasts a companion node's affordances onto frontier nodes.
///
/// Accepting an offer wires an affordance edge with the companion as its
/// (already bound) source.
#[derive(Debug, Clone)]
pub struct CompanionProvisioner {
    base: Entity,
    pub companion_id: Uuid,
    pub affordances: Vec<AffordanceSpec>,
    pub layer: String,
}

impl CompanionProvisioner {
    pub fn new(companion_id: Uuid) -> Self {
        Self {
            base: Entity::new().labeled("companion-provisioner"),
            companion_id,
            affordances: Vec::new(),
            layer: "companion".into(),
        }
    }

    pub fn offering(mut self, spec: AffordanceSpec) -> Self {
        self.affordances.push(spec);
        self
    }
}

impl Provisioner for CompanionProvisioner {
    fn uid(&self) -> Uuid {
        self.base.uid()
    }

    fn layer(&self) -> &str {
        &self.layer
    }

    fn affordance_offers(
        &self,
        _node: &Node,
        graph: &Graph,
        _ctx: &mut ProvisioningContext,
    ) -> Vec<AffordanceOffer> {
        let Some(companion) = graph.get_node(self.companion_id) else {
            return Vec::new();
        };
        let companion_tags = companion.entity().tags.clone();
        let companion_id = self.companion_id;

        self.affordances
            .iter()
            .filter(|spec| spec.requires_companion_tags.iter().all(|t| companion_tags.contains(t)))
            .map(|spec| {
                let label = spec.label.clone();
                let acceptor_label = label.clone();
                AffordanceOffer::new(
                    label,
                    Arc::new(move |graph: &mut Graph, _ctx: &mut ProvisioningContext, destination| {
                        let requirement = Requirement::new(ProvisioningPolicy::EXISTING)
                            .with_identifier(companion_id.to_string())
                            .labeled(acceptor_label.clone());
                        let (edge, req_uid) = graph.add_affordance(destination, requirement)?;
                        graph.bind_provider(req_uid, companion_id)?;
                        graph.set_label(edge, acceptor_label.clone())?;
                        Ok(edge)
                    }),
                )
                .targeting(spec.target_tags.iter().cloned())
                .from_provisioner(self.uid(), &self.layer)
            })
            .collect()
    }
}
