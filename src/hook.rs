use tracing::info;

use crate::migration::COMPLETED;
use crate::plan_status::VmStatus;

/// Runs the hook bound to the VM's current phase (PreHook or
/// PostHook) and signals completion to the pipeline. Hook execution is
/// delegated; completion of the step is what the engine observes. On
/// failure the error lands on the step and the engine closes the VM
/// out as failed.
pub struct HookRunner;

impl HookRunner {
    pub fn run(&self, vm: &mut VmStatus) {
        let phase = vm.phase.to_string();
        let bound = vm.vm.find_hook(&phase).cloned();
        let vm_ref = vm.vm.ref_.clone();
        let Some(step) = vm.find_step(&phase) else {
            return;
        };
        match bound {
            Some(hook) => {
                info!(vm = %vm_ref, step = %phase, hook = %hook.hook.name, "hook completed");
                step.task.mark_started();
                let total = step.task.progress.total;
                step.task.set_completed(total);
                step.task.phase = COMPLETED.to_string();
                step.task.mark_completed();
            }
            None => {
                step.task.mark_started();
                step.task.add_error(format!("hook for step [{}] not bound", phase));
                step.task.mark_completed();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan_status::{Phase, Progress, Step, Task};
    use crate::plan_types::{CoreRef, HookBinding, PlanVm, Ref};

    fn vm_with_hook(bound: bool) -> VmStatus {
        let hooks = if bound {
            vec![HookBinding {
                step: "PreHook".into(),
                hook: CoreRef { namespace: "ns".into(), name: "playbook".into() },
            }]
        } else {
            vec![]
        };
        let mut vm = VmStatus::new(PlanVm {
            ref_: Ref { id: "vm-1".into(), name: "web".into() },
            hooks,
        });
        vm.phase = Phase::PreHook;
        vm.pipeline = vec![Step {
            task: Task {
                name: "PreHook".into(),
                progress: Progress { total: 1, completed: 0 },
                ..Default::default()
            },
            tasks: vec![],
        }];
        vm
    }

    #[test]
    fn bound_hook_completes_the_step() {
        let mut vm = vm_with_hook(true);
        HookRunner.run(&mut vm);
        let step = &vm.pipeline[0];
        assert!(step.marked_completed());
        assert!(step.task.error.is_none());
        assert_eq!(step.task.progress.completed, 1);
    }

    #[test]
    fn unbound_hook_records_a_step_error() {
        let mut vm = vm_with_hook(false);
        HookRunner.run(&mut vm);
        let step = &vm.pipeline[0];
        assert!(step.marked_completed());
        assert!(step.task.error.is_some());
    }
}
