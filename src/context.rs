use std::sync::Arc;

use crate::inventory::Inventory;
use crate::plan_types::{Migration, Plan, ProviderRef};
use crate::store::ImportStore;

/// Default per-host (and per-datastore) concurrent transfer budget.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 2;

/// Per-plan context handed to the migration engine: the identity of
/// the plan and migration being executed plus the collaborator
/// interfaces. The plan object itself is passed into `run` so the
/// engine owns no back-reference to it.
pub struct Context {
    pub plan_name: String,
    pub plan_namespace: String,
    pub target_namespace: String,
    pub source: ProviderRef,
    pub warm: bool,
    pub migration: Migration,
    pub max_in_flight: usize,
    pub inventory: Arc<dyn Inventory>,
    pub store: Arc<dyn ImportStore>,
}

impl Context {
    pub fn new(
        plan: &Plan,
        migration: Migration,
        inventory: Arc<dyn Inventory>,
        store: Arc<dyn ImportStore>,
    ) -> Self {
        Context {
            plan_name: plan.metadata.name.clone().unwrap_or_default(),
            plan_namespace: plan.metadata.namespace.clone().unwrap_or_default(),
            target_namespace: plan.spec.target_namespace.clone(),
            source: plan.spec.provider.source.clone(),
            warm: plan.spec.warm,
            migration,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            inventory,
            store,
        }
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }
}
