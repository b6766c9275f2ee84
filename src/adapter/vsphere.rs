use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{mb, Builder};
use crate::inventory::{Inventory, InventoryError};
use crate::plan_status::{Progress, Task};
use crate::plan_types::Ref;
use crate::vmimport_types::{DataVolumePvc, DataVolumeSource, DataVolumeSpec, VddkSource};

/// vSphere builder. Disks are identified by their backing file and
/// transferred over VDDK; imported images need guest conversion.
pub struct VsphereBuilder {
    inventory: Arc<dyn Inventory>,
}

impl VsphereBuilder {
    pub fn new(inventory: Arc<dyn Inventory>) -> Self {
        VsphereBuilder { inventory }
    }
}

#[async_trait]
impl Builder for VsphereBuilder {
    async fn tasks(&self, vm: &Ref) -> Result<Vec<Task>, InventoryError> {
        let vm = self.inventory.vm(vm).await?;
        Ok(vm
            .disks
            .iter()
            .map(|disk| Task {
                name: disk.file.clone(),
                annotations: Some(BTreeMap::from([("unit".to_string(), "MB".to_string())])),
                progress: Progress { total: mb(disk.capacity), completed: 0 },
                ..Default::default()
            })
            .collect())
    }

    async fn data_volumes(&self, vm: &Ref) -> Result<Vec<DataVolumeSpec>, InventoryError> {
        let vm = self.inventory.vm(vm).await?;
        Ok(vm
            .disks
            .iter()
            .map(|disk| DataVolumeSpec {
                source: DataVolumeSource {
                    vddk: Some(VddkSource { backing_file: disk.file.clone() }),
                    imageio: None,
                },
                pvc: Some(DataVolumePvc { storage: format!("{}Mi", mb(disk.capacity)) }),
            })
            .collect())
    }

    fn resolve_data_volume_identifier(&self, dv: &DataVolumeSpec) -> String {
        dv.source
            .vddk
            .as_ref()
            .map(|vddk| vddk.backing_file.clone())
            .unwrap_or_default()
    }

    fn requires_image_conversion(&self) -> bool {
        true
    }
}
