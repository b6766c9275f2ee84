//! Migrates virtual machines from an external hypervisor (vSphere,
//! oVirt) onto KubeVirt. A plan lists source VMs and mappings; the
//! per-plan engine drives each VM through a phased itinerary until its
//! disks are imported and converted.

pub mod adapter;
pub mod condition;
pub mod context;
pub mod hook;
pub mod inventory;
pub mod itinerary;
pub mod kubevirt;
pub mod migration;
pub mod plan_status;
pub mod plan_types;
pub mod scheduler;
pub mod store;
pub mod vmimport_types;
