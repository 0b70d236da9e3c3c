//! Execution context shared by tasks and probes during one run.

use std::sync::Arc;
use std::time::Duration;

use rtkit_bus::{CallBus, CallRequest, RetryPolicy};

use crate::action::{ProgramAction, ProgramInvocation, RemoteAction};
use crate::config::{ConfigId, ConfigTree};
use crate::error::Error;
use crate::supervisor::ProcessSupervisor;

/// Delay used when synthesizing responses in no-execute mode, so the
/// no-execute path exercises the same asynchronous machinery.
pub(crate) const DUMMY_RESPONSE_DELAY: Duration = Duration::from_millis(1000);

/// Everything a task needs while running.
pub(crate) struct ExecCx<'t> {
    pub tree: &'t mut ConfigTree,
    pub bus: Arc<dyn CallBus>,
    pub supervisor: Arc<ProcessSupervisor>,
    /// Whether remote calls and process starts actually happen.
    pub do_exec: bool,
    /// Whether this is the verification pass of a commit.
    pub is_verification: bool,
    pub retry: RetryPolicy,
}

/// Expands a remote action against a configuration-node context.
pub(crate) fn expand_remote(
    cx: &ExecCx<'_>,
    ctx: ConfigId,
    remote: &RemoteAction,
) -> Result<CallRequest, Error> {
    let tree = &*cx.tree;
    remote.expand(
        |name| tree.expand_variable(ctx, name),
        |expr| tree.expand_expression(ctx, expr),
    )
}

/// Expands a program action against a configuration-node context.
pub(crate) fn expand_program(
    cx: &ExecCx<'_>,
    ctx: ConfigId,
    program: &ProgramAction,
) -> Result<ProgramInvocation, Error> {
    let tree = &*cx.tree;
    program.expand(
        |name| tree.expand_variable(ctx, name),
        |expr| tree.expand_expression(ctx, expr),
    )
}
