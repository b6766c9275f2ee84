//! Admission control for concurrent VM transfers. Stateless across
//! reconciles: every decision is derived from the current VM statuses.

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::Context;
use crate::inventory::Inventory;
use crate::plan_status::{Phase, PlanStatus, VmStatus};
use crate::plan_types::{PlanSpec, Ref};

pub struct Scheduler {
    inventory: Arc<dyn Inventory>,
    max_in_flight: usize,
}

/// Whether the VM holds a transfer slot.
fn in_flight(vm: &VmStatus) -> bool {
    vm.marked_started()
        && matches!(
            vm.phase,
            Phase::PreHook | Phase::CreateImport | Phase::ImportCreated | Phase::PostHook
        )
}

/// Whether the VM is waiting for admission.
fn pending(vm: &VmStatus) -> bool {
    !vm.running()
        && !vm.marked_completed()
        && matches!(vm.phase, Phase::Started | Phase::CreateImport | Phase::ImportCreated)
}

impl Scheduler {
    pub fn new(ctx: &Context) -> Self {
        Scheduler {
            inventory: Arc::clone(&ctx.inventory),
            max_in_flight: ctx.max_in_flight,
        }
    }

    /// The next admissible VM, FIFO over the plan's VM order. A VM
    /// whose inventory lookup fails is passed over this cycle.
    pub async fn next(&self, spec: &PlanSpec, status: &PlanStatus) -> Option<Ref> {
        let mut hosts: HashMap<String, usize> = HashMap::new();
        let mut datastores: HashMap<String, usize> = HashMap::new();
        for vm in status.migration.vms.iter().filter(|vm| in_flight(vm)) {
            if let Ok(inv) = self.inventory.vm(&vm.vm.ref_).await {
                *hosts.entry(inv.host.clone()).or_default() += 1;
                for ds in inv.datastores() {
                    *datastores.entry(ds.to_string()).or_default() += 1;
                }
            }
        }

        // Statuses are kept in plan-spec order by begin().
        for vm in status.migration.vms.iter().filter(|vm| pending(vm)) {
            if spec.find_vm(&vm.vm.ref_).is_none() {
                continue;
            }
            let inv = match self.inventory.vm(&vm.vm.ref_).await {
                Ok(inv) => inv,
                Err(_) => continue,
            };
            let host_load = hosts.get(&inv.host).copied().unwrap_or(0);
            let datastore_load = inv
                .datastores()
                .iter()
                .map(|ds| datastores.get(*ds).copied().unwrap_or(0))
                .max()
                .unwrap_or(0);
            if host_load < self.max_in_flight && datastore_load < self.max_in_flight {
                return Some(vm.vm.ref_.clone());
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::fake::FakeInventory;
    use crate::inventory::{InvDisk, VmInventory};
    use crate::plan_status::VmStatus;
    use crate::plan_types::{PlanVm, ProviderType};

    fn vm_inventory(id: &str, host: &str, datastore: &str) -> VmInventory {
        VmInventory {
            id: id.into(),
            name: id.into(),
            host: host.into(),
            disks: vec![InvDisk {
                file: format!("[{}] {}/disk.vmdk", datastore, id),
                datastore: datastore.into(),
                capacity: 1 << 20,
                ..Default::default()
            }],
        }
    }

    fn vm_status(id: &str, phase: Phase, started: bool) -> VmStatus {
        let mut vm = VmStatus::new(PlanVm {
            ref_: Ref { id: id.into(), name: id.into() },
            hooks: vec![],
        });
        vm.phase = phase;
        if started {
            vm.mark_started();
        }
        vm
    }

    fn plan_spec(ids: &[&str]) -> PlanSpec {
        PlanSpec {
            description: String::new(),
            target_namespace: "target".into(),
            provider: crate::plan_types::ProviderPair {
                source: crate::plan_types::ProviderRef {
                    namespace: "ns".into(),
                    name: "vc".into(),
                    r#type: ProviderType::VSphere,
                },
                destination: crate::plan_types::CoreRef {
                    namespace: "ns".into(),
                    name: "host".into(),
                },
            },
            map: Default::default(),
            warm: false,
            vms: ids
                .iter()
                .map(|id| PlanVm {
                    ref_: Ref { id: (*id).into(), name: (*id).into() },
                    hooks: vec![],
                })
                .collect(),
        }
    }

    fn scheduler(inventory: FakeInventory, max_in_flight: usize) -> Scheduler {
        Scheduler { inventory: Arc::new(inventory), max_in_flight }
    }

    #[tokio::test]
    async fn admits_fifo_within_the_host_budget() {
        let inventory = FakeInventory::with_vms(vec![
            vm_inventory("vm-1", "h1", "ds1"),
            vm_inventory("vm-2", "h1", "ds2"),
            vm_inventory("vm-3", "h1", "ds3"),
            vm_inventory("vm-4", "h2", "ds4"),
        ]);
        let spec = plan_spec(&["vm-1", "vm-2", "vm-3", "vm-4"]);
        let mut status = PlanStatus::default();
        status.migration.vms = vec![
            vm_status("vm-1", Phase::ImportCreated, true),
            vm_status("vm-2", Phase::ImportCreated, true),
            vm_status("vm-3", Phase::Started, false),
            vm_status("vm-4", Phase::Started, false),
        ];

        // Two transfers already in flight on h1; the next h1 VM waits,
        // the h2 VM gets the slot.
        let next = scheduler(inventory, 2).next(&spec, &status).await;
        assert_eq!(next.unwrap().id, "vm-4");
    }

    #[tokio::test]
    async fn admits_in_plan_order_when_budget_allows() {
        let inventory = FakeInventory::with_vms(vec![
            vm_inventory("vm-1", "h1", "ds1"),
            vm_inventory("vm-2", "h2", "ds2"),
        ]);
        let spec = plan_spec(&["vm-1", "vm-2"]);
        let mut status = PlanStatus::default();
        status.migration.vms =
            vec![vm_status("vm-1", Phase::Started, false), vm_status("vm-2", Phase::Started, false)];

        let next = scheduler(inventory, 2).next(&spec, &status).await;
        assert_eq!(next.unwrap().id, "vm-1");
    }

    #[tokio::test]
    async fn skips_vms_with_failed_inventory_lookup() {
        let inventory = FakeInventory::with_vms(vec![
            vm_inventory("vm-1", "h1", "ds1"),
            vm_inventory("vm-2", "h2", "ds2"),
        ]);
        inventory.fail("vm-1");
        let spec = plan_spec(&["vm-1", "vm-2"]);
        let mut status = PlanStatus::default();
        status.migration.vms =
            vec![vm_status("vm-1", Phase::Started, false), vm_status("vm-2", Phase::Started, false)];

        let next = scheduler(inventory, 2).next(&spec, &status).await;
        assert_eq!(next.unwrap().id, "vm-2");
    }

    #[tokio::test]
    async fn counts_the_datastore_budget() {
        let inventory = FakeInventory::with_vms(vec![
            vm_inventory("vm-1", "h1", "ds1"),
            vm_inventory("vm-2", "h2", "ds1"),
            vm_inventory("vm-3", "h3", "ds1"),
        ]);
        let spec = plan_spec(&["vm-1", "vm-2", "vm-3"]);
        let mut status = PlanStatus::default();
        status.migration.vms = vec![
            vm_status("vm-1", Phase::ImportCreated, true),
            vm_status("vm-2", Phase::CreateImport, true),
            vm_status("vm-3", Phase::Started, false),
        ];

        // Hosts differ but the shared datastore is saturated.
        assert!(scheduler(inventory, 2).next(&spec, &status).await.is_none());
    }

    #[tokio::test]
    async fn completed_and_running_vms_are_not_admitted() {
        let inventory = FakeInventory::with_vms(vec![vm_inventory("vm-1", "h1", "ds1")]);
        let spec = plan_spec(&["vm-1"]);
        let mut status = PlanStatus::default();
        let mut done = vm_status("vm-1", Phase::Completed, true);
        done.mark_completed();
        status.migration.vms = vec![done];

        assert!(scheduler(inventory, 2).next(&spec, &status).await.is_none());
    }
}
