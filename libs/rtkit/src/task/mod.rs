//! The task manager.
//!
//! Executes a commit plan: one task per affected module, run strictly one
//! at a time in dependency order, with process shutdowns reordered to the
//! end of the plan (they are irreversible).

pub(crate) mod exec;
mod task;
pub mod validation;

use std::collections::BTreeMap;
use std::sync::Arc;

use rtkit_bus::{CallBus, RetryPolicy};

use crate::config::{ConfigId, ConfigTree};
use crate::error::Error;
use crate::supervisor::ProcessSupervisor;
use crate::template::ModuleBinding;

pub use task::{StepCallback, StepOutcome, Task, TaskState};

use exec::ExecCx;
use task::ActionStep;

/// Runs tasks against the supervisor and the bus.
pub struct TaskManager {
    bus: Arc<dyn CallBus>,
    supervisor: Arc<ProcessSupervisor>,
    /// False when the manager runs in a debug mode that must never touch
    /// external systems, regardless of the per-run setting.
    global_do_exec: bool,
    do_exec: bool,
    is_verification: bool,
    retry: RetryPolicy,
    tasks: BTreeMap<String, Task>,
    /// Execution order of configure tasks.
    order: Vec<String>,
    /// Shutdown tasks, already in shutdown order.
    shutdown_order: Vec<String>,
}

impl TaskManager {
    #[must_use]
    pub fn new(
        bus: Arc<dyn CallBus>,
        supervisor: Arc<ProcessSupervisor>,
        global_do_exec: bool,
    ) -> Self {
        TaskManager {
            bus,
            supervisor,
            global_do_exec,
            do_exec: false,
            is_verification: false,
            retry: RetryPolicy::default(),
            tasks: BTreeMap::new(),
            order: Vec::new(),
            shutdown_order: Vec::new(),
        }
    }

    pub fn set_retry_policy(&mut self, retry: RetryPolicy) {
        self.retry = retry;
    }

    /// Sets the mode of the next run: pass 1 is `(false, true)`, pass 2 is
    /// `(true, false)`.
    pub fn set_run_mode(&mut self, do_exec: bool, is_verification: bool) {
        self.do_exec = do_exec && self.global_do_exec;
        self.is_verification = is_verification;
    }

    #[must_use]
    pub fn do_exec(&self) -> bool {
        self.do_exec
    }

    #[must_use]
    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    /// Drops every queued task without running it.
    pub fn reset(&mut self) {
        self.tasks.clear();
        self.order.clear();
        self.shutdown_order.clear();
    }

    /// The planned execution order: configure tasks first, shutdowns last.
    #[must_use]
    pub fn planned_order(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .order
            .iter()
            .filter(|name| !self.shutdown_order.contains(*name))
            .cloned()
            .collect();
        out.extend(self.shutdown_order.iter().cloned());
        out
    }

    #[must_use]
    pub fn task(&self, module: &str) -> Option<&Task> {
        self.tasks.get(module)
    }

    /// Adds the task for a changed module, declaring and scheduling a
    /// process start when the module is not yet running.
    ///
    /// # Errors
    /// [`Error::Process`] when the module cannot be declared.
    pub fn add_module(&mut self, binding: &ModuleBinding) -> Result<(), Error> {
        let name = binding.name.clone();
        if !self.tasks.contains_key(&name) {
            self.tasks.insert(name.clone(), Task::new(&name, binding.clone()));
            self.order.push(name.clone());
        }

        if self.supervisor.is_running(&name) {
            return Ok(());
        }
        if self.supervisor.status(&name) == crate::supervisor::ModuleStatus::NoExist {
            self.supervisor.declare(&name, &binding.executable)?;
        }
        if let Some(task) = self.tasks.get_mut(&name) {
            task.mark_start_module();
        }
        Ok(())
    }

    /// Queues one configure step on a module's task.
    ///
    /// # Errors
    /// [`Error::Process`] when no task exists for the module.
    pub fn add_action_step(
        &mut self,
        module: &str,
        action: crate::action::Action,
        node: ConfigId,
        callback: StepCallback,
    ) -> Result<(), Error> {
        let task = self.tasks.get_mut(module).ok_or_else(|| Error::Process {
            module: module.to_owned(),
            message: "no task for module".to_owned(),
        })?;
        task.push_step(ActionStep::new(action, node, callback));
        Ok(())
    }

    /// Schedules a module for shutdown. Shutdown tasks run after every
    /// configure task, in the reverse of the order they were scheduled.
    pub fn shutdown_module(&mut self, binding: &ModuleBinding) {
        let name = binding.name.clone();
        if !self.tasks.contains_key(&name) {
            self.tasks.insert(name.clone(), Task::new(&name, binding.clone()));
            self.order.push(name.clone());
        }
        if let Some(task) = self.tasks.get_mut(&name) {
            task.mark_stop_module();
        }
        self.shutdown_order.insert(0, name);
    }

    /// Runs every queued task, one at a time, in plan order.
    ///
    /// On the first failure, no further task starts; every queued step of
    /// the failed and the not-yet-run tasks completes with a cancellation
    /// outcome, and the run surfaces a single error naming the module.
    ///
    /// # Errors
    /// [`Error::Commit`] carrying the failed module and the first fatal
    /// error's text.
    pub async fn run(&mut self, tree: &mut ConfigTree) -> Result<(), Error> {
        let order = self.planned_order();
        tracing::debug!(?order, do_exec = self.do_exec, "running tasks");

        // Restarting a wounded module mid-commit would fight the plan.
        self.supervisor.suppress_restarts(true);
        let result = self.run_ordered(&order, tree).await;
        self.supervisor.suppress_restarts(false);
        result
    }

    async fn run_ordered(
        &mut self,
        order: &[String],
        tree: &mut ConfigTree,
    ) -> Result<(), Error> {
        for (position, name) in order.iter().enumerate() {
            let Some(mut task) = self.tasks.remove(name) else {
                continue;
            };
            let mut cx = ExecCx {
                tree: &mut *tree,
                bus: Arc::clone(&self.bus),
                supervisor: Arc::clone(&self.supervisor),
                do_exec: self.do_exec,
                is_verification: self.is_verification,
                retry: self.retry,
            };
            match task.run(&mut cx).await {
                Ok(()) => {}
                Err(failure) => {
                    tracing::error!(
                        module = %name,
                        fatal = failure.fatal,
                        "task failed: {}",
                        failure.message
                    );
                    if failure.fatal && self.do_exec && !self.is_verification {
                        // The process is fatally wounded; kill it outright.
                        self.supervisor.kill(name).await;
                        self.supervisor.mark_failed(name);
                    }
                    // Cancellation accounting: every queued step still
                    // completes, exactly once.
                    task.unschedule_remaining();
                    for later in &order[position + 1..] {
                        if let Some(queued) = self.tasks.get_mut(later) {
                            queued.unschedule_remaining();
                        }
                    }
                    self.reset();
                    return Err(Error::Commit {
                        module: name.clone(),
                        message: failure.message,
                    });
                }
            }
        }
        if !self.is_verification {
            tracing::info!("no more tasks to run");
        }
        self.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::template::TemplateTree;
    use parking_lot::Mutex;
    use rtkit_bus::testing::ScriptedBus;
    use rtkit_bus::{BusError, SignatureDb};
    use tokio_util::sync::CancellationToken;

    const TEMPLATES: &str = r#"
test {
    %modinfo {
        provides: test;
        path: "/nonexistent/routekit-test";
        status_method: xrl "test/common/get_status -> status:u32&reason:txt";
    };
    value: u32 {
        %set: xrl "test/test/set_value?value:u32=$(value)";
    }
}
"#;

    fn fixture() -> (Arc<TemplateTree>, ConfigTree) {
        let template = Arc::new(
            TemplateTree::from_str(TEMPLATES, "test.tp", &SignatureDb::permissive()).unwrap(),
        );
        let mut tree = ConfigTree::new(Arc::clone(&template));
        tree.set("test.value", Some("42"), crate::config::ConfigOperator::Assign, 0)
            .unwrap();
        (template, tree)
    }

    fn manager(bus: Arc<ScriptedBus>) -> TaskManager {
        let supervisor = ProcessSupervisor::new(false, CancellationToken::new());
        TaskManager::new(bus, supervisor, true)
    }

    fn set_action(template: &TemplateTree) -> Action {
        let node = template.find("test.value").unwrap();
        template.node(node).actions_for(crate::action::ActionKind::Set)[0].clone()
    }

    #[tokio::test(start_paused = true)]
    async fn failed_process_start_cancels_queued_steps() {
        let (template, mut tree) = fixture();
        let bus = Arc::new(ScriptedBus::new());
        let mut mgr = manager(Arc::clone(&bus));
        mgr.set_run_mode(true, false);
        mgr.add_module(template.module("test").unwrap()).unwrap();

        let node = tree.find("test.value").unwrap();
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&outcomes);
        mgr.add_action_step(
            "test",
            set_action(&template),
            node,
            Box::new(move |outcome| sink.lock().push(outcome)),
        )
        .unwrap();

        // The spawn fails (nonexistent binary), so the task must fail
        // before any remote call is made.
        let err = mgr.run(&mut tree).await.unwrap_err();
        assert!(matches!(err, Error::Commit { ref module, .. } if module == "test"));
        assert_eq!(bus.call_count(), 0);
        // The queued step was cancelled exactly once.
        assert_eq!(outcomes.lock().as_slice(), &[StepOutcome::Cancelled]);
    }

    #[tokio::test(start_paused = true)]
    async fn verification_run_touches_nothing() {
        let (template, mut tree) = fixture();
        let bus = Arc::new(ScriptedBus::new());
        let mut mgr = manager(Arc::clone(&bus));
        mgr.set_run_mode(false, true);
        mgr.add_module(template.module("test").unwrap()).unwrap();

        let node = tree.find("test.value").unwrap();
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&outcomes);
        mgr.add_action_step(
            "test",
            set_action(&template),
            node,
            Box::new(move |outcome| sink.lock().push(outcome)),
        )
        .unwrap();

        mgr.run(&mut tree).await.unwrap();
        assert_eq!(bus.call_count(), 0);
        assert_eq!(outcomes.lock().as_slice(), &[StepOutcome::Success]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_retry_ten_times_then_fail() {
        let (template, mut tree) = fixture();
        let bus = Arc::new(ScriptedBus::always_failing(BusError::ReplyTimedOut {
            request: "test/test/set_value".to_owned(),
        }));
        let supervisor = ProcessSupervisor::new(false, CancellationToken::new());
        let mut mgr = TaskManager::new(
            Arc::clone(&bus) as Arc<dyn CallBus>,
            supervisor,
            true,
        );
        mgr.set_run_mode(true, false);

        // Pretend the module is already running so no process start and no
        // startup probes are scheduled.
        mgr.supervisor()
            .declare("test", "/nonexistent/routekit-test")
            .unwrap();
        mgr.supervisor().start("test", false, false).unwrap();
        mgr.add_module(template.module("test").unwrap()).unwrap();

        let node = tree.find("test.value").unwrap();
        mgr.add_action_step(
            "test",
            set_action(&template),
            node,
            Box::new(|_| {}),
        )
        .unwrap();

        let started = tokio::time::Instant::now();
        let err = mgr.run(&mut tree).await.unwrap_err();
        assert!(matches!(err, Error::Commit { .. }));
        // Exactly ten sends, nine one-second gaps.
        assert_eq!(bus.call_count(), 10);
        assert!(started.elapsed() >= std::time::Duration::from_secs(9));
    }
}
