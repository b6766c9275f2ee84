//! Client surface of the external source-inventory service.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::plan_types::{ProviderRef, ProviderType, Ref};

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("VM [{0}] not found in inventory")]
    NotFound(String),
    #[error("provider inventory not ready")]
    ProviderNotReady,
    #[error("inventory request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Virtual disk as reported by the inventory.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvDisk {
    /// Backing file path (vSphere).
    #[serde(default)]
    pub file: String,
    /// Disk identifier (oVirt).
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub datastore: String,
    /// Capacity in bytes.
    pub capacity: i64,
}

/// VM as reported by the inventory.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmInventory {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub disks: Vec<InvDisk>,
}

impl VmInventory {
    /// Distinct datastores backing the VM's disks.
    pub fn datastores(&self) -> Vec<&str> {
        let mut list: Vec<&str> = self
            .disks
            .iter()
            .map(|d| d.datastore.as_str())
            .filter(|d| !d.is_empty())
            .collect();
        list.sort_unstable();
        list.dedup();
        list
    }
}

/// Source inventory, queried by reference.
#[async_trait]
pub trait Inventory: Send + Sync {
    async fn vm(&self, ref_: &Ref) -> Result<VmInventory, InventoryError>;
}

/// HTTP client for the inventory service.
pub struct InventoryClient {
    base: String,
    provider: ProviderRef,
    http: reqwest::Client,
}

impl InventoryClient {
    pub fn new(base: impl Into<String>, provider: ProviderRef) -> Self {
        InventoryClient {
            base: base.into(),
            provider,
            http: reqwest::Client::new(),
        }
    }

    fn vm_url(&self, ref_: &Ref) -> String {
        let kind = match self.provider.r#type {
            ProviderType::VSphere => "vsphere",
            ProviderType::OVirt => "ovirt",
        };
        let key = if ref_.id.is_empty() { &ref_.name } else { &ref_.id };
        format!(
            "{}/providers/{}/{}/{}/vms/{}",
            self.base, kind, self.provider.namespace, self.provider.name, key
        )
    }
}

#[async_trait]
impl Inventory for InventoryClient {
    async fn vm(&self, ref_: &Ref) -> Result<VmInventory, InventoryError> {
        let response = self.http.get(self.vm_url(ref_)).send().await?;
        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Err(InventoryError::NotFound(ref_.to_string())),
            reqwest::StatusCode::SERVICE_UNAVAILABLE | reqwest::StatusCode::CONFLICT => {
                Err(InventoryError::ProviderNotReady)
            }
            _ => Ok(response.error_for_status()?.json::<VmInventory>().await?),
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use super::*;

    /// In-memory inventory for tests. VMs are keyed by id and by name
    /// so unresolved refs can be looked up the way the service allows.
    #[derive(Default)]
    pub struct FakeInventory {
        state: Mutex<State>,
    }

    #[derive(Default)]
    struct State {
        vms: HashMap<String, VmInventory>,
        failing: HashSet<String>,
        not_ready: bool,
    }

    impl FakeInventory {
        pub fn with_vms(vms: Vec<VmInventory>) -> Self {
            let inventory = FakeInventory::default();
            for vm in vms {
                inventory.put(vm);
            }
            inventory
        }

        pub fn put(&self, vm: VmInventory) {
            self.state.lock().unwrap().vms.insert(vm.id.clone(), vm);
        }

        pub fn set_not_ready(&self, not_ready: bool) {
            self.state.lock().unwrap().not_ready = not_ready;
        }

        pub fn fail(&self, id: &str) {
            self.state.lock().unwrap().failing.insert(id.to_string());
        }
    }

    #[async_trait]
    impl Inventory for FakeInventory {
        async fn vm(&self, ref_: &Ref) -> Result<VmInventory, InventoryError> {
            let state = self.state.lock().unwrap();
            if state.not_ready {
                return Err(InventoryError::ProviderNotReady);
            }
            if state.failing.contains(&ref_.id) || state.failing.contains(&ref_.name) {
                return Err(InventoryError::NotFound(ref_.to_string()));
            }
            state
                .vms
                .values()
                .find(|vm| {
                    (!ref_.id.is_empty() && vm.id == ref_.id)
                        || (ref_.id.is_empty() && vm.name == ref_.name)
                })
                .cloned()
                .ok_or_else(|| InventoryError::NotFound(ref_.to_string()))
        }
    }
}
