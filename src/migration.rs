//! Per-plan migration engine: drives each VM through the phased
//! itinerary, schedules transfers, and aggregates status.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::adapter::{self, Builder};
use crate::condition::{Category, Condition, ConditionStatus};
use crate::context::Context;
use crate::hook::HookRunner;
use crate::inventory::InventoryError;
use crate::itinerary::{self, Entry, Flag, Itinerary};
use crate::kubevirt::{ImportError, ImportMap, KubeVirt, VmImport};
use crate::plan_status::{
    Phase, PlanStatus, Precopy, Progress, Step, Task, VmStatus, Warm,
};
use crate::plan_types::{Plan, PlanSpec, PlanVm};
use crate::scheduler::Scheduler;
use crate::store::StoreError;
use crate::vmimport_types as vmimport;

/// Poll period while the plan is executing.
pub const POLL_REQUEUE: Duration = Duration::from_secs(3);

// Predicate flags.
pub const HAS_PRE_HOOK: Flag = 0x01;
pub const HAS_POST_HOOK: Flag = 0x02;

// Steps.
pub const DISK_TRANSFER: &str = "DiskTransfer";
pub const IMAGE_CONVERSION: &str = "ImageConversion";

// Condition types.
pub const EXECUTING: &str = "Executing";
pub const SUCCEEDED: &str = "Succeeded";
pub const FAILED: &str = "Failed";
pub const CANCELED: &str = "Canceled";
pub const PENDING: &str = "Pending";
pub const PAUSED: &str = "Paused";
pub const BLOCKED: &str = "Blocked";
pub const RUNNING: &str = "Running";
pub const COMPLETED: &str = "Completed";

// Condition reasons.
pub const USER_REQUESTED: &str = "UserRequested";

static ITINERARY: Itinerary<Phase> = Itinerary {
    pipeline: &[
        Entry { phase: Phase::Started, all: 0 },
        Entry { phase: Phase::PreHook, all: HAS_PRE_HOOK },
        Entry { phase: Phase::CreateImport, all: 0 },
        Entry { phase: Phase::ImportCreated, all: 0 },
        Entry { phase: Phase::PostHook, all: HAS_POST_HOOK },
        Entry { phase: Phase::Completed, all: 0 },
    ],
};

/// Gates the conditional itinerary phases on hook bindings.
pub struct Predicate<'a> {
    vm: &'a PlanVm,
}

impl itinerary::Predicate for Predicate<'_> {
    fn evaluate(&self, flag: Flag) -> bool {
        if self.vm.hooks.is_empty() {
            return false;
        }
        match flag {
            HAS_PRE_HOOK => self.vm.find_hook(&Phase::PreHook.to_string()).is_some(),
            HAS_POST_HOOK => self.vm.find_hook(&Phase::PostHook.to_string()).is_some(),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error("provider inventory not ready")]
    ProviderNotReady,
}

/// One plan's migration engine. Stateless across reconciles apart from
/// the collaborators; the import map cache lives for a single `run`.
pub struct Migration {
    ctx: Context,
    builder: Arc<dyn Builder>,
    kubevirt: KubeVirt,
    scheduler: Scheduler,
    import_map: Option<ImportMap>,
}

impl Migration {
    pub fn new(ctx: Context) -> Self {
        let builder = adapter::new(&ctx.source, Arc::clone(&ctx.inventory));
        let kubevirt = KubeVirt::new(&ctx, Arc::clone(&builder));
        let scheduler = Scheduler::new(&ctx);
        Migration { ctx, builder, kubevirt, scheduler, import_map: None }
    }

    /// One reconcile: begin, step the running VMs, admit one more,
    /// end. Returns the requeue delay; `None` when the plan has
    /// finalized.
    pub async fn run(&mut self, plan: &mut Plan) -> Result<Option<Duration>, EngineError> {
        self.import_map = None;
        let Plan { spec, status, .. } = plan;
        let status = status.get_or_insert_with(PlanStatus::default);

        self.begin(spec, status).await?;
        self.resolve_canceled_refs().await;

        for vm in &mut status.migration.vms {
            vm.conditions.begin_staging();
        }

        let running: Vec<usize> = status
            .migration
            .vms
            .iter()
            .enumerate()
            .filter(|(_, vm)| vm.running())
            .map(|(index, _)| index)
            .collect();
        for index in running {
            self.step(&mut status.migration.vms[index]).await?;
        }

        let next = self.scheduler.next(spec, status).await;
        if let Some(next) = next {
            let index = status
                .migration
                .vms
                .iter()
                .position(|vm| vm.vm.ref_.matches(&next));
            if let Some(index) = index {
                self.step(&mut status.migration.vms[index]).await?;
            }
        }

        for vm in &mut status.migration.vms {
            vm.conditions.end_staging();
        }

        self.cancel(status).await?;
        let completed = self.end(status).await?;
        Ok(if completed { None } else { Some(POLL_REQUEUE) })
    }

    /// Steps a VM through the migration itinerary and updates its
    /// status.
    async fn step(&mut self, vm: &mut VmStatus) -> Result<(), EngineError> {
        if self.ctx.migration.spec.canceled(&vm.vm.ref_) {
            vm.set_condition(Condition {
                r#type: CANCELED.to_string(),
                status: ConditionStatus::True,
                category: Category::Advisory,
                reason: USER_REQUESTED.to_string(),
                message: "The migration has been canceled.".to_string(),
                durable: true,
                ..Default::default()
            });
            vm.phase = Phase::Completed;
            info!(vm = %vm.vm.ref_, "migration canceled");
            return Ok(());
        }

        info!(vm = %vm.vm.ref_, phase = %vm.phase, "migration running");

        match vm.phase {
            Phase::Started => {
                vm.mark_started();
                self.advance(vm);
            }
            Phase::PreHook | Phase::PostHook => {
                HookRunner.run(vm);
                let name = vm.phase.to_string();
                let state = vm
                    .find_step(&name)
                    .map(|step| (step.marked_completed(), step.task.error.is_none()));
                match state {
                    Some((true, true)) => self.advance(vm),
                    Some(_) => {}
                    None => vm.phase = Phase::Completed,
                }
            }
            Phase::CreateImport => {
                let ensured = self.kubevirt.ensure_import(&self.ctx, &vm.vm).await;
                match ensured {
                    Ok(()) => self.advance(vm),
                    Err(ImportError::ProviderNotReady) => {
                        return Err(EngineError::ProviderNotReady)
                    }
                    Err(err) => vm.add_error(err.to_string()),
                }
            }
            Phase::ImportCreated => {
                // Re-ensured so a cutover edit on the migration is
                // honored mid-transfer.
                let ensured = self.kubevirt.ensure_import(&self.ctx, &vm.vm).await;
                match ensured {
                    Ok(()) => {
                        self.update_vm(vm).await?;
                        let conversion = vm
                            .find_step(IMAGE_CONVERSION)
                            .map(|step| (step.marked_completed(), step.task.error.is_none()));
                        match conversion {
                            Some((true, clean)) => {
                                if clean {
                                    self.advance(vm);
                                } else {
                                    vm.phase = Phase::Completed;
                                }
                            }
                            Some((false, _)) => {}
                            None => {
                                let transfer = vm
                                    .find_step(DISK_TRANSFER)
                                    .map(|step| (step.marked_completed(), step.task.error.is_none()));
                                if let Some((true, clean)) = transfer {
                                    if clean {
                                        self.advance(vm);
                                    } else {
                                        vm.phase = Phase::Completed;
                                    }
                                }
                            }
                        }
                    }
                    Err(ImportError::ProviderNotReady) => {
                        return Err(EngineError::ProviderNotReady)
                    }
                    Err(err) => vm.add_error(err.to_string()),
                }
            }
            Phase::Completed => {
                vm.mark_completed();
                info!(vm = %vm.vm.ref_, "migration completed");
            }
        }

        vm.reflect_pipeline();
        if vm.phase == Phase::Completed && vm.error.is_none() {
            vm.set_condition(Condition {
                r#type: SUCCEEDED.to_string(),
                status: ConditionStatus::True,
                category: Category::Advisory,
                message: "The VM migration has SUCCEEDED.".to_string(),
                durable: true,
                ..Default::default()
            });
        } else if vm.error.is_some() {
            vm.phase = Phase::Completed;
            vm.set_condition(Condition {
                r#type: FAILED.to_string(),
                status: ConditionStatus::True,
                category: Category::Advisory,
                message: "The VM migration has FAILED.".to_string(),
                durable: true,
                ..Default::default()
            });
        }
        Ok(())
    }

    /// Delete resources associated with VMs that have failed or been
    /// marked canceled, and close out their pipelines.
    pub async fn cancel(&self, status: &mut PlanStatus) -> Result<(), EngineError> {
        for vm in &mut status.migration.vms {
            if vm.has_any_condition(&[CANCELED, FAILED]) {
                self.kubevirt.delete_import(&self.ctx, &vm.vm).await?;
                vm.mark_completed();
                for step in &mut vm.pipeline {
                    if step.marked_started() {
                        step.task.mark_completed();
                    }
                }
            }
        }
        Ok(())
    }

    /// Best effort resolution of the cancel set so later membership
    /// checks match by id.
    async fn resolve_canceled_refs(&mut self) {
        let inventory = Arc::clone(&self.ctx.inventory);
        for ref_ in &mut self.ctx.migration.spec.cancel {
            if ref_.id.is_empty() {
                let resolved = inventory.vm(ref_).await;
                if let Ok(vm) = resolved {
                    ref_.id = vm.id;
                }
            }
        }
    }

    /// Next phase in the itinerary. A phase the itinerary does not
    /// recognize completes the VM and records the offending phase.
    fn advance(&self, vm: &mut VmStatus) {
        let current = vm.phase;
        let next = {
            let predicate = Predicate { vm: &vm.vm };
            ITINERARY
                .next(current, &predicate)
                .map(|entry| entry.map(|e| e.phase))
        };
        match next {
            Ok(Some(phase)) => vm.phase = phase,
            Ok(None) => vm.phase = Phase::Completed,
            Err(err) => {
                warn!(vm = %vm.vm.ref_, "next phase failed: {}", err);
                vm.add_error(format!("Phase [{}] unknown", current));
                vm.phase = Phase::Completed;
            }
        }
    }

    /// Begin the migration: stamp the snapshot and reconcile the VM
    /// set against the plan spec. A no-op while the active snapshot is
    /// executing or terminal.
    async fn begin(&mut self, spec: &PlanSpec, status: &mut PlanStatus) -> Result<(), EngineError> {
        {
            let snapshot = status.migration.ensure_snapshot(&self.ctx.migration);
            if snapshot.has_any_condition(&[EXECUTING, SUCCEEDED, FAILED, CANCELED]) {
                return Ok(());
            }
        }
        status.migration.mark_reset();
        status.migration.mark_started();
        if let Some(snapshot) = status.migration.active_snapshot_mut() {
            snapshot.set_condition(Condition {
                r#type: EXECUTING.to_string(),
                status: ConditionStatus::True,
                category: Category::Advisory,
                message: "The plan is EXECUTING.".to_string(),
                durable: true,
                ..Default::default()
            });
        }
        self.kubevirt.ensure_namespace(&self.ctx).await?;

        // Drop statuses no longer listed on the plan.
        status
            .migration
            .vms
            .retain(|vm| spec.find_vm(&vm.vm.ref_).is_some());

        // Add or update, in plan-spec order. Terminal successes are
        // preserved; everything else restarts with a fresh pipeline.
        let mut list = Vec::new();
        for vm in &spec.vms {
            let first = {
                let predicate = Predicate { vm };
                ITINERARY
                    .first(&predicate)
                    .map(|entry| entry.phase)
                    .unwrap_or(Phase::Started)
            };
            let mut current = match status.migration.find_vm(&vm.ref_) {
                Some(found) => found.clone(),
                None => VmStatus::new(vm.clone()),
            };
            current.vm = vm.clone();
            if current.phase != Phase::Completed || current.has_any_condition(&[CANCELED, FAILED]) {
                let pipeline = self.build_pipeline(vm).await?;
                current.conditions.delete(&[CANCELED, FAILED]);
                current.mark_reset();
                current.pipeline = pipeline;
                current.phase = first;
                current.error = None;
                current.warm = None;
                info!(vm = %vm.ref_, "pipeline reset");
            } else {
                info!(vm = %vm.ref_, "pipeline preserved");
            }
            list.push(current);
        }
        status.migration.vms = list;
        info!(plan = %self.ctx.plan_name, "migration started");
        Ok(())
    }

    /// Build the pipeline for a VM.
    async fn build_pipeline(&self, vm: &PlanVm) -> Result<Vec<Step>, EngineError> {
        let mut pipeline = Vec::new();
        let mut phase = {
            let predicate = Predicate { vm };
            ITINERARY.first(&predicate).map(|entry| entry.phase)
        };
        while let Some(current) = phase {
            match current {
                Phase::PreHook => pipeline.push(Step {
                    task: Task {
                        name: current.to_string(),
                        description: "Run pre-migration hook.".to_string(),
                        progress: Progress { total: 1, completed: 0 },
                        ..Default::default()
                    },
                    tasks: vec![],
                }),
                Phase::PostHook => pipeline.push(Step {
                    task: Task {
                        name: current.to_string(),
                        description: "Run post-migration hook.".to_string(),
                        progress: Progress { total: 1, completed: 0 },
                        ..Default::default()
                    },
                    tasks: vec![],
                }),
                Phase::CreateImport => {
                    let tasks = self.builder.tasks(&vm.ref_).await?;
                    let total = tasks.iter().map(|t| t.progress.total).sum();
                    pipeline.push(Step {
                        task: Task {
                            name: DISK_TRANSFER.to_string(),
                            description: "Transfer disks.".to_string(),
                            progress: Progress { total, completed: 0 },
                            annotations: Some(
                                [("unit".to_string(), "MB".to_string())].into_iter().collect(),
                            ),
                            ..Default::default()
                        },
                        tasks,
                    });
                    if self.builder.requires_image_conversion() {
                        pipeline.push(Step {
                            task: Task {
                                name: IMAGE_CONVERSION.to_string(),
                                description: "Convert image to kubevirt.".to_string(),
                                progress: Progress { total: 1, completed: 0 },
                                ..Default::default()
                            },
                            tasks: vec![],
                        });
                    }
                }
                _ => {}
            }
            phase = {
                let predicate = Predicate { vm };
                ITINERARY
                    .next(current, &predicate)
                    .ok()
                    .flatten()
                    .map(|entry| entry.phase)
            };
        }
        Ok(pipeline)
    }

    /// End the migration once every VM has completed; compute the
    /// aggregate outcome and stamp the snapshot.
    async fn end(&self, status: &mut PlanStatus) -> Result<bool, EngineError> {
        let mut failed = 0;
        let mut succeeded = 0;
        for vm in &status.migration.vms {
            if !vm.marked_completed() {
                return Ok(false);
            }
            if vm.has_condition(FAILED) {
                failed += 1;
            }
            if vm.has_condition(SUCCEEDED) {
                succeeded += 1;
            }
        }
        status.migration.mark_completed();
        if let Some(snapshot) = status.migration.active_snapshot_mut() {
            snapshot.conditions.delete(&[EXECUTING]);
            let (r#type, message) = if failed > 0 {
                info!(plan = %self.ctx.plan_name, "migration failed");
                (FAILED, "The plan execution has FAILED.")
            } else if succeeded > 0 {
                info!(plan = %self.ctx.plan_name, "migration succeeded");
                (SUCCEEDED, "The plan execution has SUCCEEDED.")
            } else {
                info!(plan = %self.ctx.plan_name, "migration canceled");
                (CANCELED, "The plan execution has been CANCELED.")
            };
            snapshot.set_condition(Condition {
                r#type: r#type.to_string(),
                status: ConditionStatus::True,
                category: Category::Advisory,
                message: message.to_string(),
                durable: true,
                ..Default::default()
            });
        }
        Ok(true)
    }

    /// Update VM migration status from its observed import.
    async fn update_vm(&mut self, vm: &mut VmStatus) -> Result<(), EngineError> {
        if self.import_map.is_none() {
            self.import_map = Some(self.kubevirt.import_map(&self.ctx).await?);
        }
        let found = self
            .import_map
            .as_ref()
            .and_then(|map| map.get(&vm.vm.ref_.id));
        let Some(imp) = found else {
            vm.add_error("Import CR not found.");
            return Ok(());
        };
        self.update_pipeline(vm, imp);
        if imp.warm() {
            update_warm_status(vm, imp);
        }
        Ok(())
    }

    /// Derive pipeline progress from the observed import resource.
    fn update_pipeline(&self, vm: &mut VmStatus, imp: &VmImport) {
        let mut vm_conditions = Vec::new();
        let mut vm_errors = Vec::new();
        for step in vm.pipeline.iter_mut() {
            if step.marked_completed() {
                continue;
            }
            match step.task.name.as_str() {
                DISK_TRANSFER => {
                    let mut blocked = 0;
                    let mut completed = 0;
                    let mut running = 0;
                    for dv in &imp.data_volumes {
                        let name = self.builder.resolve_data_volume_identifier(&dv.spec);
                        let Some(task) = step.find_task(&name) else {
                            continue;
                        };
                        let Some(dv_status) = dv.status.as_ref() else {
                            continue;
                        };
                        if let Some(cnd) = dv_status.condition(vmimport::BOUND) {
                            if cnd.status == ConditionStatus::False {
                                task.phase = BLOCKED.to_string();
                                task.reason = cnd.reason.clone();
                                blocked += 1;
                                continue;
                            }
                        }
                        let Some(cnd) = dv_status.condition(vmimport::RUNNING) else {
                            continue;
                        };
                        task.mark_started();
                        task.phase = RUNNING.to_string();
                        task.reason = cnd.reason.clone();
                        running += 1;
                        let pct = dv_status.percent_complete();
                        task.set_completed((pct * task.progress.total as f64).round() as i64);
                        if dv_status.has_condition(vmimport::READY) {
                            let total = task.progress.total;
                            task.set_completed(total);
                            task.phase = COMPLETED.to_string();
                            task.mark_completed();
                            completed += 1;
                        }
                    }
                    if !step.tasks.is_empty() && completed == step.tasks.len() {
                        step.task.phase = COMPLETED.to_string();
                    } else if blocked > 0 {
                        step.task.phase = BLOCKED.to_string();
                    } else if running > 0 {
                        step.task.phase = RUNNING.to_string();
                    }
                }
                IMAGE_CONVERSION => {
                    if let Some(cnd) = imp.condition(vmimport::PROCESSING) {
                        match cnd.reason.as_str() {
                            vmimport::PENDING => vm_conditions.push(Condition {
                                r#type: PENDING.to_string(),
                                status: ConditionStatus::True,
                                category: Category::Advisory,
                                message: "The VM migration is PENDING.".to_string(),
                                ..Default::default()
                            }),
                            vmimport::COPYING_PAUSED => vm_conditions.push(Condition {
                                r#type: PAUSED.to_string(),
                                status: ConditionStatus::True,
                                category: Category::Advisory,
                                message: "The VM migration is PAUSED.".to_string(),
                                ..Default::default()
                            }),
                            vmimport::CONVERTING_GUEST => {
                                if cnd.status == ConditionStatus::True {
                                    step.task.mark_started();
                                }
                            }
                            _ => {}
                        }
                        // Surface the active sub-stage while running.
                        if step.marked_started() {
                            step.task.phase = cnd.reason.clone();
                        }
                    }
                    let total = step.task.progress.total;
                    let pct = imp.percent_complete();
                    step.task.set_completed((pct * total as f64).round() as i64);
                    if let Some(cnd) = imp.condition(vmimport::SUCCEEDED) {
                        step.task.mark_completed();
                        step.task.set_completed(total);
                        if cnd.status != ConditionStatus::True {
                            step.task.add_error(cnd.message.clone());
                            step.task.phase = cnd.reason.clone();
                        } else {
                            step.task.phase = COMPLETED.to_string();
                        }
                    }
                }
                _ => {}
            }
            step.reflect_tasks();
            if let Some(error) = &step.task.error {
                vm_errors.extend(error.reasons.iter().cloned());
            }
        }
        for condition in vm_conditions {
            vm.set_condition(condition);
        }
        for reason in vm_errors {
            vm.add_error(reason);
        }
    }
}

/// Maintain warm-import substate: counters from the operator and the
/// pre-copy intervals derived from Processing transitions.
fn update_warm_status(vm: &mut VmStatus, imp: &VmImport) {
    let warm = vm.warm.get_or_insert_with(Warm::default);
    if let Some(status) = imp.resource.status.as_ref().and_then(|s| s.warm_import.as_ref()) {
        warm.successes = status.successes;
        warm.failures = status.failures;
        warm.consecutive_failures = status.consecutive_failures;
        warm.next_precopy_at = status.next_stage_time;
    }
    let Some(cnd) = imp.condition(vmimport::PROCESSING) else {
        return;
    };
    let Some(transition) = cnd.last_transition_time else {
        return;
    };
    match cnd.reason.as_str() {
        vmimport::COPYING_STAGE => {
            let closed = warm.precopies.last().map(|p| p.end.is_some()).unwrap_or(true);
            if closed {
                warm.precopies.push(Precopy { start: Some(transition), end: None });
            }
        }
        vmimport::COPYING_PAUSED => {
            if let Some(last) = warm.precopies.last_mut() {
                if last.end.is_none() {
                    last.end = Some(transition);
                }
            }
        }
        _ => {}
    }
}
