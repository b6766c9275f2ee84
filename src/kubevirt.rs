//! Import reconciler: ensures and tracks the downstream import custom
//! resources for the plan's VMs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use kube::api::ObjectMeta;
use thiserror::Error;
use tracing::{info, warn};

use crate::adapter::Builder;
use crate::context::Context;
use crate::inventory::InventoryError;
use crate::plan_types::PlanVm;
use crate::store::{ImportStore, StoreError};
use crate::vmimport_types::{
    CrCondition, DataVolume, VirtualMachineImport, VirtualMachineImportSpec,
};

pub const LABEL_PLAN: &str = "plan";
pub const LABEL_VM: &str = "vmID";

/// An observed import resource joined with its data volumes.
#[derive(Debug, Clone)]
pub struct VmImport {
    pub resource: VirtualMachineImport,
    pub data_volumes: Vec<DataVolume>,
}

impl VmImport {
    pub fn conditions(&self) -> &[CrCondition] {
        self.resource
            .status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or(&[])
    }

    pub fn condition(&self, r#type: &str) -> Option<&CrCondition> {
        self.conditions().iter().find(|c| c.r#type == r#type)
    }

    pub fn percent_complete(&self) -> f64 {
        self.resource
            .status
            .as_ref()
            .map(|s| s.percent_complete())
            .unwrap_or(0.0)
    }

    pub fn warm(&self) -> bool {
        self.resource.spec.warm
    }
}

/// Observed imports keyed by VM identifier.
pub type ImportMap = HashMap<String, VmImport>;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("provider inventory not ready")]
    ProviderNotReady,
    #[error("{0}")]
    Inventory(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<InventoryError> for ImportError {
    fn from(err: InventoryError) -> Self {
        match err {
            InventoryError::ProviderNotReady => ImportError::ProviderNotReady,
            other => ImportError::Inventory(other.to_string()),
        }
    }
}

/// RFC-1123 label derived from free-form identifiers.
fn dns_label(name: &str) -> String {
    let mut label: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    label.truncate(63);
    label.trim_matches('-').to_string()
}

/// Destination-side reconciler for import resources.
pub struct KubeVirt {
    pub builder: Arc<dyn Builder>,
    pub store: Arc<dyn ImportStore>,
}

impl KubeVirt {
    pub fn new(ctx: &Context, builder: Arc<dyn Builder>) -> Self {
        KubeVirt { builder, store: Arc::clone(&ctx.store) }
    }

    /// Deterministic import name for a VM; stable across reconciles.
    pub fn import_name(ctx: &Context, vm: &PlanVm) -> String {
        dns_label(&format!("{}-{}", ctx.plan_name, vm.ref_.id))
    }

    pub async fn ensure_namespace(&self, ctx: &Context) -> Result<(), StoreError> {
        self.store.ensure_namespace(&ctx.target_namespace).await?;
        info!(namespace = %ctx.target_namespace, "namespace ensured");
        Ok(())
    }

    fn make_import(
        &self,
        ctx: &Context,
        vm: &PlanVm,
        data_volumes: Vec<crate::vmimport_types::DataVolumeSpec>,
    ) -> VirtualMachineImport {
        VirtualMachineImport {
            metadata: ObjectMeta {
                name: Some(Self::import_name(ctx, vm)),
                namespace: Some(ctx.target_namespace.clone()),
                labels: Some(BTreeMap::from([
                    (LABEL_PLAN.to_string(), ctx.plan_name.clone()),
                    (LABEL_VM.to_string(), vm.ref_.id.clone()),
                ])),
                ..ObjectMeta::default()
            },
            spec: VirtualMachineImportSpec {
                source: crate::vmimport_types::ImportSource {
                    id: vm.ref_.id.clone(),
                    name: vm.ref_.name.clone(),
                },
                target_vm_name: dns_label(&vm.ref_.name),
                warm: ctx.warm,
                finalize_date_time: ctx.migration.spec.cutover,
                data_volumes,
            },
            status: None,
        }
    }

    /// Create or update the import resource for the VM. Idempotent: a
    /// replay with unchanged inputs makes no write at all.
    pub async fn ensure_import(&self, ctx: &Context, vm: &PlanVm) -> Result<(), ImportError> {
        let data_volumes = self.builder.data_volumes(&vm.ref_).await?;
        let desired = self.make_import(ctx, vm, data_volumes);
        let name = Self::import_name(ctx, vm);
        match self.store.get_import(&ctx.target_namespace, &name).await? {
            None => {
                info!(import = %name, "import created");
                self.store.create_import(&desired).await?;
            }
            Some(current) => {
                if current.spec != desired.spec {
                    let mut updated = current;
                    updated.spec = desired.spec;
                    info!(import = %name, "import updated");
                    self.store.update_import(&updated).await?;
                }
            }
        }
        Ok(())
    }

    /// List the plan's import resources, keyed by VM identifier, with
    /// their data volumes resolved. Built once per reconcile.
    pub async fn import_map(&self, ctx: &Context) -> Result<ImportMap, StoreError> {
        let selector = format!("{}={}", LABEL_PLAN, ctx.plan_name);
        let mut map = ImportMap::new();
        for resource in self
            .store
            .list_imports(&ctx.target_namespace, &selector)
            .await?
        {
            let labels = resource.metadata.labels.clone().unwrap_or_default();
            let Some(vm_id) = labels.get(LABEL_VM) else {
                warn!(
                    import = %resource.metadata.name.as_deref().unwrap_or_default(),
                    "import without VM label ignored"
                );
                continue;
            };
            let mut data_volumes = Vec::new();
            if let Some(status) = &resource.status {
                for item in &status.data_volumes {
                    if let Some(dv) = self
                        .store
                        .data_volume(&ctx.target_namespace, &item.name)
                        .await?
                    {
                        data_volumes.push(dv);
                    }
                }
            }
            map.insert(vm_id.clone(), VmImport { resource, data_volumes });
        }
        Ok(map)
    }

    /// Remove the VM's import resource; absence is not an error.
    pub async fn delete_import(&self, ctx: &Context, vm: &PlanVm) -> Result<(), StoreError> {
        let name = Self::import_name(ctx, vm);
        self.store.delete_import(&ctx.target_namespace, &name).await?;
        info!(import = %name, "import deleted");
        Ok(())
    }
}
