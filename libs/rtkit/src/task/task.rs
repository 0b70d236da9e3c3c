//! The per-module task state machine.
//!
//! One task per module in a commit plan: optionally start the module's
//! process, validate it through its lifecycle probes, run the queued
//! configure steps strictly in order, and optionally shut the module down.

use std::collections::VecDeque;

use rtkit_bus::BusError;

use crate::action::Action;
use crate::config::ConfigId;
use crate::task::exec::{
    DUMMY_RESPONSE_DELAY, ExecCx, expand_program, expand_remote,
};
use crate::task::validation::{Phase, validate};
use crate::template::ModuleBinding;

/// How a queued step ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Success,
    Failed(String),
    /// The step never ran; its task was aborted.
    Cancelled,
}

/// Completion callback of a queued step; fired exactly once.
pub type StepCallback = Box<dyn FnOnce(StepOutcome) + Send>;

/// One queued configure step.
pub(crate) struct ActionStep {
    pub action: Action,
    /// The configuration node the action was declared against.
    pub node: ConfigId,
    callback: Option<StepCallback>,
}

impl ActionStep {
    pub(crate) fn new(action: Action, node: ConfigId, callback: StepCallback) -> Self {
        ActionStep {
            action,
            node,
            callback: Some(callback),
        }
    }

    fn complete(&mut self, outcome: StepOutcome) {
        if let Some(callback) = self.callback.take() {
            callback(outcome);
        }
    }

    /// Cancels a never-run step. The callback still fires so callers keep
    /// a consistent accounting of issued vs completed actions.
    pub(crate) fn unschedule(&mut self) {
        self.complete(StepOutcome::Cancelled);
    }
}

/// A task failure: `fatal` marks the module itself as beyond recovery.
#[derive(Debug, Clone)]
pub(crate) struct TaskFailure {
    pub fatal: bool,
    pub message: String,
}

/// Observable position of a task in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    StartingProcess,
    ValidatingStartup,
    RunningStartupAction,
    ValidatingConfigReady,
    RunningConfigSteps,
    ValidatingReady,
    Stopping,
    ValidatingShutdown,
    Done,
    Failed,
}

/// One execution of the per-module state machine.
pub struct Task {
    module: String,
    binding: ModuleBinding,
    start_module: bool,
    stop_module: bool,
    steps: VecDeque<ActionStep>,
    steps_ran: bool,
    state: TaskState,
}

impl Task {
    pub(crate) fn new(module: &str, binding: ModuleBinding) -> Self {
        Task {
            module: module.to_owned(),
            binding,
            start_module: false,
            stop_module: false,
            steps: VecDeque::new(),
            steps_ran: false,
            state: TaskState::Idle,
        }
    }

    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    #[must_use]
    pub fn state(&self) -> TaskState {
        self.state
    }

    #[must_use]
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn will_start_module(&self) -> bool {
        self.start_module
    }

    #[must_use]
    pub fn will_stop_module(&self) -> bool {
        self.stop_module
    }

    pub(crate) fn mark_start_module(&mut self) {
        self.start_module = true;
    }

    pub(crate) fn mark_stop_module(&mut self) {
        self.stop_module = true;
    }

    pub(crate) fn push_step(&mut self, step: ActionStep) {
        self.steps.push_back(step);
    }

    /// Cancels every queued-but-unrun step.
    pub(crate) fn unschedule_remaining(&mut self) {
        while let Some(mut step) = self.steps.pop_front() {
            step.unschedule();
        }
    }

    /// Drives the state machine to completion.
    pub(crate) async fn run(&mut self, cx: &mut ExecCx<'_>) -> Result<(), TaskFailure> {
        let result = self.run_inner(cx).await;
        self.state = if result.is_ok() {
            TaskState::Done
        } else {
            TaskState::Failed
        };
        result
    }

    async fn run_inner(&mut self, cx: &mut ExecCx<'_>) -> Result<(), TaskFailure> {
        let status_method = self.binding.status_method.clone();

        if self.start_module {
            self.state = TaskState::StartingProcess;
            if let Err(e) = cx
                .supervisor
                .start(&self.module, cx.do_exec, cx.is_verification)
            {
                return Err(TaskFailure {
                    fatal: false,
                    message: format!("cannot start process {}: {e}", self.module),
                });
            }

            self.state = TaskState::ValidatingStartup;
            if !validate(cx, &self.module, Phase::Startup, status_method.as_ref()).await {
                return Err(TaskFailure {
                    fatal: true,
                    message: format!("cannot validate start of process {}", self.module),
                });
            }
            if cx.do_exec && !cx.is_verification {
                cx.supervisor.mark_running(&self.module);
            }

            if let Some(startup) = self.binding.startup_method.clone() {
                self.state = TaskState::RunningStartupAction;
                if !self.run_method(cx, &startup).await {
                    return Err(TaskFailure {
                        fatal: true,
                        message: format!("cannot run startup method of {}", self.module),
                    });
                }
            }

            if status_method.is_some() {
                self.state = TaskState::ValidatingConfigReady;
                if !validate(cx, &self.module, Phase::ConfigReady, status_method.as_ref())
                    .await
                {
                    return Err(TaskFailure {
                        fatal: true,
                        message: format!(
                            "cannot validate config readiness of process {}",
                            self.module
                        ),
                    });
                }
            }
        }

        if self.stop_module {
            // Configure steps are pointless on a module about to go away,
            // but they must still be unscheduled for the accounting.
            self.unschedule_remaining();
        } else {
            self.state = TaskState::RunningConfigSteps;
            while let Some(mut step) = self.steps.pop_front() {
                let outcome = self.run_step(cx, &mut step).await;
                match outcome {
                    Ok(()) => {
                        step.complete(StepOutcome::Success);
                        self.steps_ran = true;
                    }
                    Err(failure) => {
                        step.complete(StepOutcome::Failed(failure.message.clone()));
                        return Err(failure);
                    }
                }
            }

            if self.steps_ran && status_method.is_some() {
                self.state = TaskState::ValidatingReady;
                if !validate(cx, &self.module, Phase::Ready, status_method.as_ref()).await {
                    return Err(TaskFailure {
                        fatal: true,
                        message: format!(
                            "reconfiguration caused process {} to fail",
                            self.module
                        ),
                    });
                }
            }
        }

        if self.stop_module {
            self.state = TaskState::Stopping;
            if !cx.is_verification {
                tracing::info!(module = %self.module, "shutting down module");
            }
            let mut asked_politely = false;
            if let Some(shutdown) = self.binding.shutdown_method.clone() {
                asked_politely = self.run_method(cx, &shutdown).await;
                if !asked_politely {
                    tracing::warn!(module = %self.module, "cannot subtly stop process");
                    self.kill(cx).await;
                }
            }
            if status_method.is_some() {
                self.state = TaskState::ValidatingShutdown;
                let confirmed =
                    validate(cx, &self.module, Phase::Shutdown, status_method.as_ref()).await;
                if confirmed {
                    // Cleanup kill after a short grace; usually a no-op.
                    tokio::time::sleep(DUMMY_RESPONSE_DELAY).await;
                } else {
                    tracing::warn!(module = %self.module, "cannot validate stop of process");
                }
                self.kill(cx).await;
            } else if !asked_politely && self.binding.shutdown_method.is_none() {
                self.kill(cx).await;
            }
        }

        Ok(())
    }

    async fn kill(&self, cx: &ExecCx<'_>) {
        if cx.do_exec && !cx.is_verification {
            cx.supervisor.kill(&self.module).await;
        }
    }

    /// Runs a startup or shutdown method: a single attempt, no resend.
    async fn run_method(&self, cx: &mut ExecCx<'_>, method: &Action) -> bool {
        if !cx.do_exec {
            tokio::time::sleep(DUMMY_RESPONSE_DELAY).await;
            return true;
        }
        let ctx = cx
            .tree
            .find_config_module(&self.module)
            .unwrap_or_else(|| cx.tree.root());
        match method {
            Action::Remote(remote) => {
                let request = match expand_remote(cx, ctx, remote) {
                    Ok(request) => request,
                    Err(e) => {
                        tracing::error!(module = %self.module, error = %e, "cannot expand method");
                        return false;
                    }
                };
                match cx.bus.call(&request).await {
                    Ok(_) => true,
                    Err(e) => {
                        tracing::error!(module = %self.module, error = %e, "method call failed");
                        false
                    }
                }
            }
            Action::Program(program) => {
                let invocation = match expand_program(cx, ctx, program) {
                    Ok(invocation) => invocation,
                    Err(e) => {
                        tracing::error!(module = %self.module, error = %e, "cannot expand method");
                        return false;
                    }
                };
                match tokio::process::Command::new(&invocation.executable)
                    .args(&invocation.args)
                    .output()
                    .await
                {
                    Ok(output) => output.status.success(),
                    Err(e) => {
                        tracing::error!(module = %self.module, error = %e, "method program failed");
                        false
                    }
                }
            }
        }
    }

    /// Runs one configure step to completion, including the resend budget
    /// for transient bus errors.
    async fn run_step(
        &self,
        cx: &mut ExecCx<'_>,
        step: &mut ActionStep,
    ) -> Result<(), TaskFailure> {
        match &step.action {
            Action::Remote(remote) => {
                let remote = remote.clone();
                let request = expand_remote(cx, step.node, &remote).map_err(|e| TaskFailure {
                    fatal: false,
                    message: format!(
                        "failed to expand {}: {e}",
                        remote.request_template().raw()
                    ),
                })?;
                if !cx.do_exec {
                    tokio::time::sleep(DUMMY_RESPONSE_DELAY).await;
                    return Ok(());
                }
                tracing::debug!(request = %request, "executing remote call");

                let mut sends_left = cx.retry.resend_limit;
                loop {
                    sends_left -= 1;
                    match cx.bus.call(&request).await {
                        Ok(reply) => {
                            match remote.return_spec().collect_writebacks(&reply) {
                                Ok(vars) => cx.tree.write_action_vars(step.node, vars),
                                Err(missing) => {
                                    tracing::error!(
                                        request = %request,
                                        missing,
                                        "reply is missing a declared atom"
                                    );
                                }
                            }
                            return Ok(());
                        }
                        Err(e) if e.is_transient() && sends_left > 0 => {
                            tracing::debug!(request = %request, error = %e, "resending");
                            tokio::time::sleep(cx.retry.resend_interval).await;
                        }
                        Err(e) => {
                            return Err(TaskFailure {
                                fatal: step_error_is_fatal(&e),
                                message: e.to_string(),
                            });
                        }
                    }
                }
            }
            Action::Program(program) => {
                let program = program.clone();
                let invocation =
                    expand_program(cx, step.node, &program).map_err(|e| TaskFailure {
                        fatal: false,
                        message: format!(
                            "failed to expand {}: {e}",
                            program.command_template().raw()
                        ),
                    })?;
                if !cx.do_exec {
                    tokio::time::sleep(DUMMY_RESPONSE_DELAY).await;
                    return Ok(());
                }
                tracing::debug!(program = %invocation.executable, "executing program");

                let output = tokio::process::Command::new(&invocation.executable)
                    .args(&invocation.args)
                    .output()
                    .await
                    .map_err(|e| TaskFailure {
                        fatal: false,
                        message: format!("cannot execute {}: {e}", invocation.executable),
                    })?;
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                let mut vars = Vec::new();
                if let Some(var) = program.stdout_var() {
                    vars.push((var.to_owned(), stdout));
                }
                if let Some(var) = program.stderr_var() {
                    vars.push((var.to_owned(), stderr.clone()));
                }
                cx.tree.write_action_vars(step.node, vars);
                if output.status.success() {
                    Ok(())
                } else {
                    Err(TaskFailure {
                        fatal: false,
                        message: format!(
                            "{} exited with {}: {stderr}",
                            invocation.executable, output.status
                        ),
                    })
                }
            }
        }
    }
}

/// Transient errors that exhausted the resend budget and hard transport
/// failures wound the target fatally; command-level errors do not.
fn step_error_is_fatal(error: &BusError) -> bool {
    match error {
        BusError::NoFinder
        | BusError::SendFailed { .. }
        | BusError::ResolveFailed { .. }
        | BusError::ReplyTimedOut { .. }
        | BusError::SendFailedTransient { .. } => true,
        BusError::NoSuchMethod { .. }
        | BusError::BadArgs { .. }
        | BusError::CommandFailed { .. }
        | BusError::Internal { .. } => false,
    }
}
