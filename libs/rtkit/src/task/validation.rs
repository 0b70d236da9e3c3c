//! Lifecycle validation probes.
//!
//! A task validates a module at fixed points of its state machine by
//! calling the module's declared status method and judging the reported
//! status against a per-phase acceptance table. Modules without a status
//! method are given a fixed delay instead.

use std::time::Duration;

use rtkit_bus::BusError;

use crate::action::Action;
use crate::task::exec::{DUMMY_RESPONSE_DELAY, ExecCx, expand_remote};

/// Status a probe can report, as carried in the `status` reply atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    Null,
    Startup,
    NotReady,
    Ready,
    Shutdown,
    Failed,
    Done,
}

impl ProbeStatus {
    #[must_use]
    pub fn from_wire(value: u32) -> Option<Self> {
        Some(match value {
            0 => ProbeStatus::Null,
            1 => ProbeStatus::Startup,
            2 => ProbeStatus::NotReady,
            3 => ProbeStatus::Ready,
            4 => ProbeStatus::Shutdown,
            5 => ProbeStatus::Failed,
            6 => ProbeStatus::Done,
            _ => return None,
        })
    }
}

/// The lifecycle points a probe can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// After process start: is the process alive at all?
    Startup,
    /// Before configuration: is the process ready to take config?
    ConfigReady,
    /// After configuration: did the module come up ready?
    Ready,
    /// After the shutdown method: is the process going away?
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Accept,
    Retry,
    Reject,
}

/// The acceptance table. `Null` is accepted during shutdown only (process
/// gone); every other phase rejects it as an invalid response.
fn disposition(phase: Phase, status: ProbeStatus) -> Disposition {
    use Disposition::{Accept, Reject, Retry};
    match phase {
        Phase::Startup => match status {
            ProbeStatus::Startup | ProbeStatus::NotReady | ProbeStatus::Ready => Accept,
            ProbeStatus::Null
            | ProbeStatus::Failed
            | ProbeStatus::Shutdown
            | ProbeStatus::Done => Reject,
        },
        Phase::ConfigReady => match status {
            ProbeStatus::NotReady | ProbeStatus::Ready => Accept,
            ProbeStatus::Startup => Retry,
            ProbeStatus::Null
            | ProbeStatus::Failed
            | ProbeStatus::Shutdown
            | ProbeStatus::Done => Reject,
        },
        Phase::Ready => match status {
            ProbeStatus::Ready => Accept,
            ProbeStatus::Startup | ProbeStatus::NotReady => Retry,
            ProbeStatus::Null
            | ProbeStatus::Failed
            | ProbeStatus::Shutdown
            | ProbeStatus::Done => Reject,
        },
        Phase::Shutdown => match status {
            ProbeStatus::Done | ProbeStatus::Null => Accept,
            ProbeStatus::Shutdown => Retry,
            ProbeStatus::Startup
            | ProbeStatus::NotReady
            | ProbeStatus::Ready
            | ProbeStatus::Failed => Reject,
        },
    }
}

/// Probe retry cap.
const MAX_STATUS_RETRIES: u32 = 30;

/// Delay between probe retries.
const RETRY_INTERVAL: Duration = Duration::from_millis(1000);

/// Delay standing in for a probe on modules without a status method.
const DELAY_VALIDATION: Duration = Duration::from_millis(2000);

/// Validates `module` for `phase`.
///
/// `method` is the module's status method; `None` degrades to a fixed
/// delay. Returns whether the module passed.
pub(crate) async fn validate(
    cx: &mut ExecCx<'_>,
    module: &str,
    phase: Phase,
    method: Option<&Action>,
) -> bool {
    let Some(method) = method else {
        tokio::time::sleep(DELAY_VALIDATION).await;
        return true;
    };

    if !cx.do_exec {
        // Exercise the same machinery with a synthesized READY reply.
        tokio::time::sleep(DUMMY_RESPONSE_DELAY).await;
        return disposition(phase, ProbeStatus::Ready) != Disposition::Reject;
    }

    match method {
        Action::Remote(remote) => {
            validate_remote(cx, module, phase, remote).await
        }
        Action::Program(program) => validate_program(cx, module, program).await,
    }
}

async fn validate_remote(
    cx: &mut ExecCx<'_>,
    module: &str,
    phase: Phase,
    remote: &crate::action::RemoteAction,
) -> bool {
    let mut retries = 0u32;
    loop {
        let request = {
            let ctx = cx
                .tree
                .find_config_module(module)
                .unwrap_or_else(|| cx.tree.root());
            match expand_remote(cx, ctx, remote) {
                Ok(request) => request,
                Err(e) => {
                    tracing::error!(module, error = %e, "cannot expand status method");
                    return false;
                }
            }
        };
        match cx.bus.call(&request).await {
            Ok(reply) => {
                let status = reply
                    .get_u32("status")
                    .and_then(ProbeStatus::from_wire);
                let reason = reply.get_text("reason").unwrap_or("");
                let Some(status) = status else {
                    tracing::error!(module, "bad reply to status probe");
                    return false;
                };
                match disposition(phase, status) {
                    Disposition::Accept => return true,
                    Disposition::Reject => {
                        tracing::warn!(module, status = ?status, reason, "probe rejected");
                        return false;
                    }
                    Disposition::Retry => {}
                }
            }
            Err(e) => match classify_probe_error(phase, &e) {
                Disposition::Accept => {
                    tracing::warn!(module, error = %e, "probe inconclusive, accepting");
                    return true;
                }
                Disposition::Reject => {
                    tracing::error!(module, error = %e, "probe failed");
                    return false;
                }
                Disposition::Retry => {}
            },
        }
        retries += 1;
        if retries > MAX_STATUS_RETRIES {
            tracing::error!(module, retries, "probe retries exhausted");
            return false;
        }
        tokio::time::sleep(RETRY_INTERVAL).await;
    }
}

/// How a bus error during a probe is treated, per phase.
fn classify_probe_error(phase: Phase, error: &BusError) -> Disposition {
    use Disposition::{Accept, Reject, Retry};
    match phase {
        Phase::Shutdown => match error {
            // The process appears to be gone, which is what we wanted.
            BusError::ResolveFailed { .. }
            | BusError::ReplyTimedOut { .. }
            | BusError::SendFailed { .. }
            | BusError::SendFailedTransient { .. } => Accept,
            BusError::NoSuchMethod { .. }
            | BusError::BadArgs { .. }
            | BusError::CommandFailed { .. }
            | BusError::Internal { .. }
            | BusError::NoFinder => Reject,
        },
        Phase::Startup | Phase::ConfigReady | Phase::Ready => match error {
            // Startup conditions; give the problem a chance to resolve.
            BusError::ResolveFailed { .. }
            | BusError::ReplyTimedOut { .. }
            | BusError::SendFailed { .. }
            | BusError::SendFailedTransient { .. } => Retry,
            // The target does not speak the common interface; carry on.
            BusError::NoSuchMethod { .. }
            | BusError::BadArgs { .. }
            | BusError::CommandFailed { .. }
            | BusError::Internal { .. } => Accept,
            BusError::NoFinder => Reject,
        },
    }
}

async fn validate_program(
    cx: &mut ExecCx<'_>,
    module: &str,
    program: &crate::action::ProgramAction,
) -> bool {
    let ctx = cx
        .tree
        .find_config_module(module)
        .unwrap_or_else(|| cx.tree.root());
    let tree = &*cx.tree;
    let invocation = match program.expand(
        |name| tree.expand_variable(ctx, name),
        |expr| tree.expand_expression(ctx, expr),
    ) {
        Ok(invocation) => invocation,
        Err(e) => {
            tracing::error!(module, error = %e, "cannot expand status program");
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
            tracing::error!(module, error = %e, "status program failed to run");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acceptance_table_matches_lifecycle() {
        use Disposition::{Accept, Reject, Retry};
        // ValidatingReady requires READY.
        assert_eq!(disposition(Phase::Ready, ProbeStatus::Ready), Accept);
        assert_eq!(disposition(Phase::Ready, ProbeStatus::NotReady), Retry);
        assert_eq!(disposition(Phase::Ready, ProbeStatus::Failed), Reject);
        // Shutdown accepts DONE, retries SHUTDOWN.
        assert_eq!(disposition(Phase::Shutdown, ProbeStatus::Done), Accept);
        assert_eq!(disposition(Phase::Shutdown, ProbeStatus::Shutdown), Retry);
        assert_eq!(disposition(Phase::Shutdown, ProbeStatus::Ready), Reject);
        // NULL is accepted during shutdown only.
        assert_eq!(disposition(Phase::Shutdown, ProbeStatus::Null), Accept);
        for phase in [Phase::Startup, Phase::ConfigReady, Phase::Ready] {
            assert_eq!(disposition(phase, ProbeStatus::Null), Reject);
        }
    }

    #[test]
    fn wire_statuses_decode() {
        assert_eq!(ProbeStatus::from_wire(3), Some(ProbeStatus::Ready));
        assert_eq!(ProbeStatus::from_wire(6), Some(ProbeStatus::Done));
        assert_eq!(ProbeStatus::from_wire(7), None);
    }

    #[test]
    fn shutdown_treats_silence_as_gone() {
        let err = BusError::ReplyTimedOut {
            request: "x".to_owned(),
        };
        assert_eq!(classify_probe_error(Phase::Shutdown, &err), Disposition::Accept);
        assert_eq!(classify_probe_error(Phase::Ready, &err), Disposition::Retry);
    }
}
