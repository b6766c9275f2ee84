use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::plan_status::PlanStatus;

/// Reference to a VM in the source provider inventory.
/// The `id` is authoritative once resolved; the `name` is what the
/// user listed on the plan.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Ref {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

impl Ref {
    /// Identity match: by id when both sides have one, else by name.
    pub fn matches(&self, other: &Ref) -> bool {
        if !self.id.is_empty() && !other.id.is_empty() {
            return self.id == other.id;
        }
        !self.name.is_empty() && self.name == other.name
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.name)
    }
}

/// Reference to a cluster-scoped or namespaced object.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CoreRef {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub name: String,
}

/// Source provider type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    VSphere,
    OVirt,
}

/// Reference to a provider, carrying its type so the adapter can be
/// selected without fetching the provider object.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRef {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub name: String,
    #[serde(rename = "type")]
    pub r#type: ProviderType,
}

/// Source and destination providers.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderPair {
    pub source: ProviderRef,
    pub destination: CoreRef,
}

/// Network and storage map references.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MapRefs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<CoreRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<CoreRef>,
}

/// A hook bound to a lifecycle step of a VM.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HookBinding {
    /// Pipeline step the hook is bound to (PreHook or PostHook).
    pub step: String,
    pub hook: CoreRef,
}

/// A VM listed on the plan.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanVm {
    #[serde(flatten)]
    pub ref_: Ref,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<HookBinding>,
}

impl PlanVm {
    pub fn find_hook(&self, step: &str) -> Option<&HookBinding> {
        self.hooks.iter().find(|h| h.step == step)
    }
}

/// Migration plan: the declarative input listing VMs to migrate.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(group = "vmmigration.dev", version = "v1beta1", kind = "Plan")]
#[kube(namespaced, status = "PlanStatus", shortname = "plan")]
#[serde(rename_all = "camelCase")]
pub struct PlanSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Namespace the imported VMs land in.
    pub target_namespace: String,
    pub provider: ProviderPair,
    #[serde(default)]
    pub map: MapRefs,
    /// Warm migration: repeated pre-copies before a final cutover.
    #[serde(default)]
    pub warm: bool,
    pub vms: Vec<PlanVm>,
}

impl PlanSpec {
    pub fn find_vm(&self, ref_: &Ref) -> Option<&PlanVm> {
        self.vms.iter().find(|vm| vm.ref_.matches(ref_))
    }
}

/// User intent to execute a plan. Deleting or editing the cancel set
/// is observed on the next reconcile.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(group = "vmmigration.dev", version = "v1beta1", kind = "Migration")]
#[kube(namespaced, shortname = "vmig")]
#[serde(rename_all = "camelCase")]
pub struct MigrationSpec {
    pub plan: CoreRef,
    /// VMs to abort.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cancel: Vec<Ref>,
    /// Cutover timestamp for warm flows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cutover: Option<DateTime<Utc>>,
}

impl MigrationSpec {
    /// Whether the VM has been canceled by the user.
    pub fn canceled(&self, ref_: &Ref) -> bool {
        self.cancel.iter().any(|c| c.matches(ref_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_matches_by_id_then_name() {
        let a = Ref { id: "vm-1".into(), name: "web".into() };
        let b = Ref { id: "vm-1".into(), name: "renamed".into() };
        let c = Ref { id: String::new(), name: "web".into() };
        let d = Ref { id: "vm-2".into(), name: "web".into() };
        assert!(a.matches(&b));
        assert!(a.matches(&c));
        assert!(!a.matches(&d));
    }

    #[test]
    fn canceled_matches_unresolved_refs() {
        let spec = MigrationSpec {
            plan: CoreRef { namespace: "ns".into(), name: "plan".into() },
            cancel: vec![Ref { id: String::new(), name: "db".into() }],
            cutover: None,
        };
        assert!(spec.canceled(&Ref { id: "vm-7".into(), name: "db".into() }));
        assert!(!spec.canceled(&Ref { id: "vm-8".into(), name: "web".into() }));
    }
}
