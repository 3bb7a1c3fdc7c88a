//! Provisioning: satisfying open edges at the frontier
//!
//! The planner satisfies a node's unresolved dependencies and inbound
//! affordances by asking every registered [`Provisioner`] for
//! [`DependencyOffer`]s and [`AffordanceOffer`]s, arbitrating them by
//! `(cost, proximity, emission index)`, and executing the winning offers as
//! a [`ProvisioningPlan`]. Nothing mutates the graph until a plan step
//! executes; offers are lazy descriptions carrying acceptance closures.
//!
//! ```text
//!   collect ──> dedup (EXISTING by provider) ──> select (per requirement)
//!      │                                              │
//!      └── affordance broadcasts ──────────────┐      │
//!                                              ▼      ▼
//!                                         ProvisioningPlan ── execute ──> BuildReceipts
//! ```
//!
//! See `planner` for the pipeline, `offer` for the offer/receipt records,
//! and `provisioner` for the built-in provisioner variants.

mod offer;
mod planner;
mod provisioner;

pub use offer::{
    AffordanceAcceptor, AffordanceOffer, BuildReceipt, DependencyAcceptor, DependencyOffer,
    PlanningReceipt, ProvisionCost,
};
pub use planner::{provision_node, PlannedOffer, PlannedWork, ProvisioningPlan, ProvisioningResult};
pub use provisioner::{
    AffordanceSpec, AssetProvisioner, CloningProvisioner, CompanionProvisioner, GraphProvisioner,
    Provisioner, TemplateProvisioner, TokenProvisioner, UpdatingProvisioner,
};

use rand::rngs::StdRng;
use rand::SeedableRng;
use uuid::Uuid;

/// Execution context for one provisioning pass.
///
/// Carries the step counter, the deterministic RNG, and the "current
/// requirement" fields the planner sets while collecting offers so
/// provisioners can compute proximity against the requirement's source.
#[derive(Debug)]
pub struct ProvisioningContext {
    pub step: u64,
    pub rng_seed: Option<u64>,
    rng: StdRng,
    pub current_requirement_id: Option<Uuid>,
    pub current_requirement_label: Option<String>,
    pub current_requirement_source_id: Option<Uuid>,
}

impl ProvisioningContext {
    /// Seeded from `rng_seed`, falling back to the step number, so identical
    /// passes draw identical random sequences.
    pub fn new(step: u64, rng_seed: Option<u64>) -> Self {
        Self {
            step,
            rng_seed,
            rng: StdRng::seed_from_u64(rng_seed.unwrap_or(step)),
            current_requirement_id: None,
            current_requirement_label: None,
            current_requirement_source_id: None,
        }
    }

    /// Deterministic RNG for provisioners and samplers.
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_rng_deterministic_for_seed() {
        let mut a = ProvisioningContext::new(3, Some(42));
        let mut b = ProvisioningContext::new(9, Some(42));
        let draw_a: u64 = a.rng().gen();
        let draw_b: u64 = b.rng().gen();
        assert_eq!(draw_a, draw_b);
    }

    #[test]
    fn test_rng_falls_back_to_step() {
        let mut a = ProvisioningContext::new(3, None);
        let mut b = ProvisioningContext::new(3, None);
        let draw_a: u64 = a.rng().gen();
        let draw_b: u64 = b.rng().gen();
        assert_eq!(draw_a, draw_b);
    }
}
