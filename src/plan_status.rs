use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Deref, DerefMut};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::condition::{Condition, Conditions};
use crate::plan_types::{Migration, PlanVm, Ref};

/// Phase of a VM migration. Phases advance monotonically along the
/// itinerary; the only non-forward transitions jump to `Completed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum Phase {
    #[default]
    Started,
    PreHook,
    CreateImport,
    ImportCreated,
    PostHook,
    Completed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Started => "Started",
            Phase::PreHook => "PreHook",
            Phase::CreateImport => "CreateImport",
            Phase::ImportCreated => "ImportCreated",
            Phase::PostHook => "PostHook",
            Phase::Completed => "Completed",
        };
        f.write_str(name)
    }
}

/// Progress of a step or task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub total: i64,
    pub completed: i64,
}

/// Failure recorded on a step or VM: the phase it occurred in and the
/// accumulated reasons.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusError {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase: String,
    pub reasons: Vec<String>,
}

impl StatusError {
    fn add(&mut self, reason: String) {
        if !self.reasons.contains(&reason) {
            self.reasons.push(reason);
        }
    }
}

/// Leaf work item, typically one virtual disk.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub progress: Progress,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StatusError>,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
}

impl Task {
    /// Timestamp the first start transition; idempotent.
    pub fn mark_started(&mut self) {
        if self.started.is_none() {
            self.started = Some(Utc::now());
        }
    }

    /// Timestamp the first completion transition; idempotent.
    /// A completed task is implicitly started.
    pub fn mark_completed(&mut self) {
        self.mark_started();
        if self.completed.is_none() {
            self.completed = Some(Utc::now());
        }
    }

    pub fn marked_started(&self) -> bool {
        self.started.is_some()
    }

    pub fn marked_completed(&self) -> bool {
        self.completed.is_some()
    }

    /// Set completed progress, clamped to the total.
    pub fn set_completed(&mut self, completed: i64) {
        self.progress.completed = completed.clamp(0, self.progress.total);
    }

    pub fn add_error(&mut self, reason: impl Into<String>) {
        let phase = self.phase.clone();
        self.error
            .get_or_insert_with(|| StatusError { phase, ..Default::default() })
            .add(reason.into());
    }
}

/// One stage within a VM's pipeline. The embedded task carries the
/// step's own name, progress and error state.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    #[serde(flatten)]
    pub task: Task,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<Task>,
}

impl Deref for Step {
    type Target = Task;

    fn deref(&self) -> &Task {
        &self.task
    }
}

impl DerefMut for Step {
    fn deref_mut(&mut self) -> &mut Task {
        &mut self.task
    }
}

impl Step {
    pub fn find_task(&mut self, name: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.name == name)
    }

    /// Reflect aggregated progress up from the tasks. When every task
    /// has completed, so has the step.
    pub fn reflect_tasks(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        let mut completed = 0;
        let mut started = 0;
        let mut done = 0;
        let mut reasons = Vec::new();
        for task in &self.tasks {
            completed += task.progress.completed;
            if task.marked_started() {
                started += 1;
            }
            if task.marked_completed() {
                done += 1;
            }
            if let Some(error) = &task.error {
                reasons.extend(error.reasons.iter().cloned());
            }
        }
        self.task.progress.completed = completed.min(self.task.progress.total);
        if started > 0 {
            self.task.mark_started();
        }
        if done == self.tasks.len() {
            self.task.mark_completed();
        }
        for reason in reasons {
            self.task.add_error(reason);
        }
    }
}

/// Warm migration substate: pre-copy bookkeeping ahead of cutover.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Warm {
    pub successes: i32,
    pub failures: i32,
    pub consecutive_failures: i32,
    pub next_precopy_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub precopies: Vec<Precopy>,
}

/// One pre-copy interval. `end` is open while the copy stage runs.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Precopy {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// Per-VM execution state.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VmStatus {
    #[serde(flatten)]
    pub vm: PlanVm,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pipeline: Vec<Step>,
    #[serde(default, skip_serializing_if = "Conditions::is_empty")]
    pub conditions: Conditions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StatusError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warm: Option<Warm>,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    /// Bumped each time the pipeline is reflected.
    #[serde(default)]
    pub revision: i64,
}

impl VmStatus {
    pub fn new(vm: PlanVm) -> Self {
        VmStatus { vm, ..Default::default() }
    }

    pub fn mark_started(&mut self) {
        if self.started.is_none() {
            self.started = Some(Utc::now());
        }
    }

    pub fn mark_completed(&mut self) {
        if self.completed.is_none() {
            self.completed = Some(Utc::now());
        }
    }

    pub fn marked_started(&self) -> bool {
        self.started.is_some()
    }

    pub fn marked_completed(&self) -> bool {
        self.completed.is_some()
    }

    /// In flight: started but not yet finished.
    pub fn running(&self) -> bool {
        self.marked_started() && !self.marked_completed()
    }

    /// Clear execution state ahead of a pipeline rebuild.
    pub fn mark_reset(&mut self) {
        self.started = None;
        self.completed = None;
    }

    pub fn find_step(&mut self, name: &str) -> Option<&mut Step> {
        self.pipeline.iter_mut().find(|s| s.task.name == name)
    }

    pub fn add_error(&mut self, reason: impl Into<String>) {
        let phase = self.phase.to_string();
        self.error
            .get_or_insert_with(|| StatusError { phase, ..Default::default() })
            .add(reason.into());
    }

    pub fn has_condition(&self, r#type: &str) -> bool {
        self.conditions.has_condition(r#type)
    }

    pub fn has_any_condition(&self, types: &[&str]) -> bool {
        self.conditions.has_any_condition(types)
    }

    pub fn set_condition(&mut self, condition: Condition) {
        self.conditions.set(condition);
    }

    /// Reflect the aggregated phase up from the steps and surface step
    /// errors on the VM.
    pub fn reflect_pipeline(&mut self) {
        let mut started = 0;
        let mut completed = 0;
        let mut reasons = Vec::new();
        for step in &self.pipeline {
            if step.marked_started() {
                started += 1;
            }
            if step.marked_completed() {
                completed += 1;
            }
            if let Some(error) = &step.task.error {
                reasons.extend(error.reasons.iter().cloned());
            }
        }
        if started > 0 {
            self.mark_started();
        }
        if !self.pipeline.is_empty() && completed == self.pipeline.len() {
            self.mark_completed();
        }
        for reason in reasons {
            self.add_error(reason);
        }
        self.revision += 1;
    }
}

/// Identity of the migration a snapshot was taken for.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRef {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
}

impl SnapshotRef {
    pub fn new(migration: &Migration) -> Self {
        SnapshotRef {
            namespace: migration.metadata.namespace.clone().unwrap_or_default(),
            name: migration.metadata.name.clone().unwrap_or_default(),
            uid: migration.metadata.uid.clone().unwrap_or_default(),
        }
    }
}

/// Record of one execution attempt of the plan. The last entry in the
/// history is the active snapshot; older entries are immutable.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub migration: SnapshotRef,
    #[serde(default, skip_serializing_if = "Conditions::is_empty")]
    pub conditions: Conditions,
}

impl Snapshot {
    pub fn has_any_condition(&self, types: &[&str]) -> bool {
        self.conditions.has_any_condition(types)
    }

    pub fn set_condition(&mut self, condition: Condition) {
        self.conditions.set(condition);
    }
}

/// Execution status of the plan's migrations.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatus {
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vms: Vec<VmStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<Snapshot>,
}

impl MigrationStatus {
    pub fn mark_started(&mut self) {
        if self.started.is_none() {
            self.started = Some(Utc::now());
        }
    }

    pub fn mark_completed(&mut self) {
        if self.completed.is_none() {
            self.completed = Some(Utc::now());
        }
    }

    pub fn mark_reset(&mut self) {
        self.started = None;
        self.completed = None;
    }

    pub fn find_vm(&self, ref_: &Ref) -> Option<&VmStatus> {
        self.vms.iter().find(|vm| vm.vm.ref_.matches(ref_))
    }

    pub fn active_snapshot(&self) -> Option<&Snapshot> {
        self.history.last()
    }

    pub fn active_snapshot_mut(&mut self) -> Option<&mut Snapshot> {
        self.history.last_mut()
    }

    /// The active snapshot for the given migration, creating one when
    /// the migration is new. A superseded snapshot becomes history.
    pub fn ensure_snapshot(&mut self, migration: &Migration) -> &mut Snapshot {
        let key = SnapshotRef::new(migration);
        let fresh = self.history.last().map(|s| s.migration != key).unwrap_or(true);
        if fresh {
            self.history.push(Snapshot { migration: key, ..Default::default() });
        }
        self.history.last_mut().unwrap()
    }
}

/// Plan status: the migration record plus plan-level conditions.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanStatus {
    #[serde(default, skip_serializing_if = "Conditions::is_empty")]
    pub conditions: Conditions,
    #[serde(default)]
    pub migration: MigrationStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(name: &str, total: i64) -> Task {
        Task {
            name: name.to_string(),
            progress: Progress { total, completed: 0 },
            ..Default::default()
        }
    }

    #[test]
    fn mark_transitions_are_idempotent() {
        let mut t = task("disk-1", 10);
        t.mark_started();
        let first = t.started;
        t.mark_started();
        assert_eq!(t.started, first);

        t.mark_completed();
        let done = t.completed;
        t.mark_completed();
        assert_eq!(t.completed, done);
        assert!(t.marked_started());
    }

    #[test]
    fn set_completed_clamps_to_total() {
        let mut t = task("disk-1", 10);
        t.set_completed(25);
        assert_eq!(t.progress.completed, 10);
        t.set_completed(-1);
        assert_eq!(t.progress.completed, 0);
    }

    #[test]
    fn reflect_tasks_sums_progress_and_completes_the_step() {
        let mut step = Step {
            task: task("DiskTransfer", 20),
            tasks: vec![task("a", 10), task("b", 10)],
        };
        step.tasks[0].set_completed(10);
        step.tasks[0].mark_completed();
        step.tasks[1].set_completed(4);
        step.reflect_tasks();
        assert_eq!(step.task.progress.completed, 14);
        assert!(!step.marked_completed());

        step.tasks[1].set_completed(10);
        step.tasks[1].mark_completed();
        step.reflect_tasks();
        assert_eq!(step.task.progress.completed, 20);
        assert!(step.marked_completed());
    }

    #[test]
    fn reflect_tasks_surfaces_task_errors_once() {
        let mut step = Step { task: task("DiskTransfer", 10), tasks: vec![task("a", 10)] };
        step.tasks[0].add_error("pvc not bound");
        step.reflect_tasks();
        step.reflect_tasks();
        assert_eq!(step.task.error.as_ref().unwrap().reasons, vec!["pvc not bound"]);
    }

    #[test]
    fn reflect_pipeline_aggregates_and_bumps_revision() {
        let mut vm = VmStatus::default();
        vm.pipeline = vec![
            Step { task: task("DiskTransfer", 20), tasks: vec![] },
            Step { task: task("ImageConversion", 1), tasks: vec![] },
        ];
        vm.reflect_pipeline();
        assert!(!vm.marked_started());
        assert_eq!(vm.revision, 1);

        vm.pipeline[0].task.mark_completed();
        vm.reflect_pipeline();
        assert!(vm.marked_started());
        assert!(!vm.marked_completed());

        vm.pipeline[1].task.mark_completed();
        vm.pipeline[1].task.add_error("conversion failed");
        vm.reflect_pipeline();
        assert!(vm.marked_completed());
        assert_eq!(vm.error.as_ref().unwrap().reasons, vec!["conversion failed"]);
        assert_eq!(vm.revision, 3);
    }

    #[test]
    fn ensure_snapshot_supersedes_on_new_migration() {
        let mut status = MigrationStatus::default();
        let mut migration = Migration::new(
            "first",
            crate::plan_types::MigrationSpec {
                plan: crate::plan_types::CoreRef { namespace: "ns".into(), name: "plan".into() },
                cancel: vec![],
                cutover: None,
            },
        );
        migration.metadata.uid = Some("uid-1".into());
        status.ensure_snapshot(&migration);
        status.ensure_snapshot(&migration);
        assert_eq!(status.history.len(), 1);

        migration.metadata.uid = Some("uid-2".into());
        status.ensure_snapshot(&migration);
        assert_eq!(status.history.len(), 2);
        assert_eq!(status.active_snapshot().unwrap().migration.uid, "uid-2");
    }
}
