//! Types of the downstream VM-import operator and CDI data volumes.
//! The condition names and reason strings here are the public contract
//! with the import operator and must not be altered.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::condition::ConditionStatus;

// Import condition types.
pub const PROCESSING: &str = "Processing";
pub const SUCCEEDED: &str = "Succeeded";

// Data volume condition types.
pub const BOUND: &str = "Bound";
pub const RUNNING: &str = "Running";
pub const READY: &str = "Ready";

// Processing condition reasons.
pub const PENDING: &str = "Pending";
pub const COPYING_STAGE: &str = "CopyingStage";
pub const COPYING_PAUSED: &str = "CopyingPaused";
pub const CONVERTING_GUEST: &str = "ConvertingGuest";

/// Condition as reported on downstream resources.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CrCondition {
    #[serde(rename = "type")]
    pub r#type: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub last_transition_time: Option<DateTime<Utc>>,
}

fn find_condition<'a>(conditions: &'a [CrCondition], r#type: &str) -> Option<&'a CrCondition> {
    conditions.iter().find(|c| c.r#type == r#type)
}

/// Source disk identity of a data volume. Exactly one variant is set,
/// matching the source provider.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vddk: Option<VddkSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imageio: Option<ImageioSource>,
}

/// VDDK transfer source: a vSphere disk backing file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VddkSource {
    pub backing_file: String,
}

/// ImageIO transfer source: an oVirt disk.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageioSource {
    pub disk_id: String,
}

/// Storage request for the target PVC.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumePvc {
    pub storage: String,
}

/// CDI data volume: performs one disk transfer.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(group = "cdi.kubevirt.io", version = "v1beta1", kind = "DataVolume")]
#[kube(namespaced, status = "DataVolumeStatus", shortname = "dv")]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSpec {
    pub source: DataVolumeSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc: Option<DataVolumePvc>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase: String,
    /// Transfer progress, e.g. "43.52%".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub progress: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<CrCondition>,
}

impl DataVolumeStatus {
    pub fn condition(&self, r#type: &str) -> Option<&CrCondition> {
        find_condition(&self.conditions, r#type)
    }

    pub fn has_condition(&self, r#type: &str) -> bool {
        self.condition(r#type).is_some()
    }

    /// Transfer completion in [0, 1].
    pub fn percent_complete(&self) -> f64 {
        self.progress
            .trim_end_matches('%')
            .parse::<f64>()
            .map(|p| p / 100.0)
            .unwrap_or(0.0)
    }
}

/// Identity of the source VM to import.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImportSource {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

/// Import custom resource: one per VM, owned by this controller and
/// executed by the import operator.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(group = "v2v.kubevirt.io", version = "v1beta1", kind = "VirtualMachineImport")]
#[kube(namespaced, status = "VirtualMachineImportStatus", shortname = "vmimport")]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineImportSpec {
    pub source: ImportSource,
    pub target_vm_name: String,
    #[serde(default)]
    pub warm: bool,
    /// Cutover timestamp; ends the pre-copy loop of a warm import.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalize_date_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_volumes: Vec<DataVolumeSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineImportStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<CrCondition>,
    /// Overall progress, e.g. "57".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub progress: String,
    /// Names of the data volumes created for this import.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_volumes: Vec<DataVolumeItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warm_import: Option<WarmImportStatus>,
}

impl VirtualMachineImportStatus {
    pub fn condition(&self, r#type: &str) -> Option<&CrCondition> {
        find_condition(&self.conditions, r#type)
    }

    /// Overall completion in [0, 1].
    pub fn percent_complete(&self) -> f64 {
        self.progress
            .trim_end_matches('%')
            .parse::<f64>()
            .map(|p| p / 100.0)
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeItem {
    pub name: String,
}

/// Warm import counters reported by the operator.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WarmImportStatus {
    #[serde(default)]
    pub successes: i32,
    #[serde(default)]
    pub failures: i32,
    #[serde(default)]
    pub consecutive_failures: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_stage_time: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_parsing() {
        let status = DataVolumeStatus { progress: "43.52%".into(), ..Default::default() };
        assert!((status.percent_complete() - 0.4352).abs() < 1e-9);

        let status = DataVolumeStatus { progress: String::new(), ..Default::default() };
        assert_eq!(status.percent_complete(), 0.0);

        let status = VirtualMachineImportStatus { progress: "57".into(), ..Default::default() };
        assert!((status.percent_complete() - 0.57).abs() < 1e-9);
    }
}
