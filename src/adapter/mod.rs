//! Provider adapters. The migration engine never branches on provider
//! type except through the capability set exposed here.

pub mod ovirt;
pub mod vsphere;

use std::sync::Arc;

use async_trait::async_trait;

use crate::inventory::{Inventory, InventoryError};
use crate::plan_status::Task;
use crate::plan_types::{ProviderRef, ProviderType, Ref};
use crate::vmimport_types::DataVolumeSpec;

/// Provider-specific construction of import specs and task shapes.
#[async_trait]
pub trait Builder: Send + Sync {
    /// One task per disk; `progress.total` is the disk size in MB.
    async fn tasks(&self, vm: &Ref) -> Result<Vec<Task>, InventoryError>;

    /// Disk specs for the import resource.
    async fn data_volumes(&self, vm: &Ref) -> Result<Vec<DataVolumeSpec>, InventoryError>;

    /// Canonical name matching an observed data volume to its task.
    /// Invertible across reconciles; independent of generated names.
    fn resolve_data_volume_identifier(&self, dv: &DataVolumeSpec) -> String;

    /// Whether imported disks need a post-transfer image conversion.
    fn requires_image_conversion(&self) -> bool;
}

/// Select the builder for the source provider.
pub fn new(provider: &ProviderRef, inventory: Arc<dyn Inventory>) -> Arc<dyn Builder> {
    match provider.r#type {
        ProviderType::VSphere => Arc::new(vsphere::VsphereBuilder::new(inventory)),
        ProviderType::OVirt => Arc::new(ovirt::OvirtBuilder::new(inventory)),
    }
}

pub(crate) const MIB: i64 = 1 << 20;

pub(crate) fn mb(bytes: i64) -> i64 {
    bytes / MIB
}
