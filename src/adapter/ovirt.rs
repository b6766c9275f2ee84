use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{mb, Builder};
use crate::inventory::{Inventory, InventoryError};
use crate::plan_status::{Progress, Task};
use crate::plan_types::Ref;
use crate::vmimport_types::{DataVolumePvc, DataVolumeSource, DataVolumeSpec, ImageioSource};

/// oVirt builder. Disks are identified by disk id and transferred over
/// imageio; no post-transfer conversion is needed.
pub struct OvirtBuilder {
    inventory: Arc<dyn Inventory>,
}

impl OvirtBuilder {
    pub fn new(inventory: Arc<dyn Inventory>) -> Self {
        OvirtBuilder { inventory }
    }
}

#[async_trait]
impl Builder for OvirtBuilder {
    async fn tasks(&self, vm: &Ref) -> Result<Vec<Task>, InventoryError> {
        let vm = self.inventory.vm(vm).await?;
        Ok(vm
            .disks
            .iter()
            .map(|disk| Task {
                name: disk.id.clone(),
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
                    vddk: None,
                    imageio: Some(ImageioSource { disk_id: disk.id.clone() }),
                },
                pvc: Some(DataVolumePvc { storage: format!("{}Mi", mb(disk.capacity)) }),
            })
            .collect())
    }

    fn resolve_data_volume_identifier(&self, dv: &DataVolumeSpec) -> String {
        dv.source
            .imageio
            .as_ref()
            .map(|imageio| imageio.disk_id.clone())
            .unwrap_or_default()
    }

    fn requires_image_conversion(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MIB;
    use crate::inventory::fake::FakeInventory;
    use crate::inventory::{InvDisk, VmInventory};

    #[tokio::test]
    async fn identifier_round_trips_on_disk_id() {
        let inventory = Arc::new(FakeInventory::with_vms(vec![VmInventory {
            id: "vm-2".into(),
            name: "db".into(),
            host: "ovirt-h1".into(),
            disks: vec![InvDisk {
                id: "disk-uuid-1".into(),
                datastore: "sd1".into(),
                capacity: 30 * MIB,
                ..Default::default()
            }],
        }]));
        let builder = OvirtBuilder::new(inventory);
        let vm = Ref { id: "vm-2".into(), name: "db".into() };
        let tasks = builder.tasks(&vm).await.unwrap();
        let dvs = builder.data_volumes(&vm).await.unwrap();
        assert_eq!(tasks[0].name, "disk-uuid-1");
        assert_eq!(tasks[0].progress.total, 30);
        assert_eq!(builder.resolve_data_volume_identifier(&dvs[0]), tasks[0].name);
        assert!(!builder.requires_image_conversion());
    }
}
