//! Child-process lifecycle supervisor.
//!
//! Starts, observes and terminates the external daemons the manager
//! drives. Several module names may share one executable; the process is
//! spawned once and reference-counted. Termination is graceful first
//! (SIGTERM on Unix), forced after a grace period.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Grace period before force-killing a process.
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// How often the reaper polls for unexpected exits.
const REAP_INTERVAL: Duration = Duration::from_millis(200);

/// Bounded restart attempts per process when restart is enabled.
const MAX_RESTARTS: u32 = 3;

/// Lifecycle states of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStatus {
    /// Declared nowhere.
    NoExist,
    /// Declared but never started.
    NotStarted,
    /// Process spawned, not yet validated ready.
    Startup,
    Running,
    Failed,
    Stopped,
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModuleStatus::NoExist => "no-exist",
            ModuleStatus::NotStarted => "not-started",
            ModuleStatus::Startup => "startup",
            ModuleStatus::Running => "running",
            ModuleStatus::Failed => "failed",
            ModuleStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

type StatusObserver = dyn Fn(&str, ModuleStatus) + Send + Sync;

struct ModuleRecord {
    /// Command line: executable path plus optional arguments.
    command: String,
    status: ModuleStatus,
}

struct ProcessEntry {
    child: Option<Child>,
    pid: Option<u32>,
    /// Module names served by this process.
    modules: Vec<String>,
    restarts: u32,
}

#[derive(Default)]
struct State {
    modules: BTreeMap<String, ModuleRecord>,
    processes: HashMap<String, ProcessEntry>,
    start_order: Vec<String>,
}

/// The supervisor. One instance per manager core.
pub struct ProcessSupervisor {
    state: Mutex<State>,
    observers: Mutex<Vec<Box<StatusObserver>>>,
    cancel: CancellationToken,
    restart_enabled: bool,
    restarts_suppressed: AtomicBool,
}

impl ProcessSupervisor {
    /// Creates the supervisor and spawns its exit reaper.
    #[must_use]
    pub fn new(restart_enabled: bool, cancel: CancellationToken) -> Arc<Self> {
        let supervisor = Arc::new(ProcessSupervisor {
            state: Mutex::new(State::default()),
            observers: Mutex::new(Vec::new()),
            cancel: cancel.clone(),
            restart_enabled,
            restarts_suppressed: AtomicBool::new(false),
        });
        let reaper = Arc::clone(&supervisor);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = reaper.cancel.cancelled() => break,
                    () = tokio::time::sleep(REAP_INTERVAL) => reaper.reap_exited(),
                }
            }
        });
        supervisor
    }

    /// Registers a status-change observer, fired on every transition.
    pub fn on_status_change(&self, observer: Box<StatusObserver>) {
        self.observers.lock().push(observer);
    }

    /// Restart-on-failure is disabled for the duration of any commit.
    pub fn suppress_restarts(&self, suppressed: bool) {
        self.restarts_suppressed.store(suppressed, Ordering::SeqCst);
    }

    fn set_status(&self, name: &str, status: ModuleStatus) {
        let changed = {
            let mut state = self.state.lock();
            match state.modules.get_mut(name) {
                Some(record) if record.status != status => {
                    tracing::debug!(
                        module = name,
                        from = %record.status,
                        to = %status,
                        "module status"
                    );
                    record.status = status;
                    true
                }
                _ => false,
            }
        };
        if changed {
            for observer in self.observers.lock().iter() {
                observer(name, status);
            }
        }
    }

    /// Declares a module by name and command line. Duplicate names are an
    /// error.
    ///
    /// # Errors
    /// [`Error::Process`] for a duplicate declaration.
    pub fn declare(&self, name: &str, command: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.modules.contains_key(name) {
            return Err(Error::Process {
                module: name.to_owned(),
                message: "module already declared".to_owned(),
            });
        }
        state.modules.insert(
            name.to_owned(),
            ModuleRecord {
                command: command.to_owned(),
                status: ModuleStatus::NotStarted,
            },
        );
        state.start_order.push(name.to_owned());
        Ok(())
    }

    /// The declared status of a module.
    #[must_use]
    pub fn status(&self, name: &str) -> ModuleStatus {
        self.state
            .lock()
            .modules
            .get(name)
            .map_or(ModuleStatus::NoExist, |r| r.status)
    }

    /// Whether the module's process is up (startup or running).
    #[must_use]
    pub fn is_running(&self, name: &str) -> bool {
        matches!(
            self.status(name),
            ModuleStatus::Startup | ModuleStatus::Running
        )
    }

    /// Starts the module's process unless it is already up.
    ///
    /// During verification (`is_verification`) nothing is touched; with
    /// `do_exec == false` the status moves to startup without a spawn.
    ///
    /// # Errors
    /// [`Error::Process`] when the module is undeclared or the spawn
    /// fails.
    pub fn start(&self, name: &str, do_exec: bool, is_verification: bool) -> Result<(), Error> {
        if is_verification {
            let declared = self.state.lock().modules.contains_key(name);
            return declared.then_some(()).ok_or_else(|| Error::Process {
                module: name.to_owned(),
                message: "module not declared".to_owned(),
            });
        }

        let command = {
            let state = self.state.lock();
            let record = state.modules.get(name).ok_or_else(|| Error::Process {
                module: name.to_owned(),
                message: "module not declared".to_owned(),
            })?;
            if matches!(record.status, ModuleStatus::Startup | ModuleStatus::Running) {
                return Ok(());
            }
            record.command.clone()
        };

        if !do_exec {
            self.set_status(name, ModuleStatus::Startup);
            return Ok(());
        }

        // Share an already-running process with the same command line.
        {
            let mut state = self.state.lock();
            if let Some(entry) = state.processes.get_mut(&command) {
                if !entry.modules.iter().any(|m| m == name) {
                    entry.modules.push(name.to_owned());
                }
                drop(state);
                self.set_status(name, ModuleStatus::Startup);
                return Ok(());
            }
        }

        let mut child = spawn_command(&command).map_err(|message| {
            self.set_status(name, ModuleStatus::Failed);
            Error::Process {
                module: name.to_owned(),
                message,
            }
        })?;
        let pid = child.id();
        forward_output(name, &mut child);
        {
            let mut state = self.state.lock();
            state.processes.insert(
                command,
                ProcessEntry {
                    child: Some(child),
                    pid,
                    modules: vec![name.to_owned()],
                    restarts: 0,
                },
            );
        }
        tracing::info!(module = name, pid = ?pid, "spawned module process");
        self.set_status(name, ModuleStatus::Startup);
        Ok(())
    }

    /// Marks a module running; called once its startup validation passed.
    pub fn mark_running(&self, name: &str) {
        if self.status(name) == ModuleStatus::Startup {
            self.set_status(name, ModuleStatus::Running);
        }
    }

    /// Marks a module failed (fatally wounded).
    pub fn mark_failed(&self, name: &str) {
        self.set_status(name, ModuleStatus::Failed);
    }

    /// Terminates a module's process: gracefully, then with prejudice
    /// after the grace period. The process is only taken down when no
    /// other running module shares it.
    pub async fn kill(&self, name: &str) {
        let to_stop = {
            let mut state = self.state.lock();
            let Some(record) = state.modules.get(name) else {
                return;
            };
            let command = record.command.clone();
            match state.processes.get_mut(&command) {
                None => None,
                Some(entry) => {
                    entry.modules.retain(|m| m != name);
                    if entry.modules.is_empty() {
                        state
                            .processes
                            .remove(&command)
                            .and_then(|mut entry| entry.child.take().map(|c| (c, entry.pid)))
                    } else {
                        None
                    }
                }
            }
        };

        if let Some((mut child, pid)) = to_stop {
            stop_child_with_grace(name, &mut child, pid).await;
        }
        self.set_status(name, ModuleStatus::Stopped);
    }

    /// Kills every process in reverse start order.
    pub async fn shutdown(&self) {
        let order: Vec<String> = {
            let state = self.state.lock();
            state.start_order.iter().rev().cloned().collect()
        };
        for name in order {
            if self.is_running(&name) {
                self.kill(&name).await;
            }
        }
        tracing::info!("supervisor shutdown complete");
    }

    /// Whether every process is gone and no module is left running.
    #[must_use]
    pub fn is_shutdown_completed(&self) -> bool {
        let state = self.state.lock();
        state.processes.is_empty()
            && state
                .modules
                .values()
                .all(|r| !matches!(r.status, ModuleStatus::Startup | ModuleStatus::Running))
    }

    /// Polls every process for an unexpected exit; restarts within the
    /// bounded budget when enabled, otherwise marks the modules failed.
    fn reap_exited(self: &Arc<Self>) {
        let mut transitions: Vec<(String, ModuleStatus)> = Vec::new();
        {
            let mut state = self.state.lock();
            let mut exited: Vec<String> = Vec::new();
            for (command, entry) in &mut state.processes {
                let done = match entry.child.as_mut() {
                    Some(child) => child.try_wait().ok().flatten().is_some(),
                    None => true,
                };
                if done {
                    exited.push(command.clone());
                }
            }
            for command in exited {
                let Some(mut entry) = state.processes.remove(&command) else {
                    continue;
                };
                let restartable = self.restart_enabled
                    && !self.restarts_suppressed.load(Ordering::SeqCst)
                    && entry.restarts < MAX_RESTARTS;
                if restartable {
                    tracing::warn!(
                        command = %command,
                        attempt = entry.restarts + 1,
                        "process exited unexpectedly, restarting"
                    );
                    match spawn_command(&command) {
                        Ok(mut child) => {
                            if let Some(module) = entry.modules.first() {
                                forward_output(module, &mut child);
                            }
                            entry.pid = child.id();
                            entry.child = Some(child);
                            entry.restarts += 1;
                            for module in &entry.modules {
                                transitions.push((module.clone(), ModuleStatus::Startup));
                            }
                            state.processes.insert(command, entry);
                            continue;
                        }
                        Err(message) => {
                            tracing::error!(command = %command, error = %message, "restart failed");
                        }
                    }
                } else {
                    tracing::error!(command = %command, "process exited unexpectedly");
                }
                for module in &entry.modules {
                    transitions.push((module.clone(), ModuleStatus::Failed));
                }
            }
        }
        for (module, status) in transitions {
            self.set_status(&module, status);
        }
    }
}

/// Splits a command line and spawns it with piped output.
fn spawn_command(command: &str) -> Result<Child, String> {
    let words =
        shlex::split(command).ok_or_else(|| format!("cannot split command line '{command}'"))?;
    let (executable, args) = words
        .split_first()
        .ok_or_else(|| "empty command line".to_owned())?;
    let mut cmd = Command::new(executable);
    cmd.args(args);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.spawn()
        .map_err(|e| format!("failed to spawn {executable}: {e}"))
}

/// Forwards the child's stdout and stderr into the log.
fn forward_output(name: &str, child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        let module = name.to_owned();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(module = %module, stream = "stdout", "{line}");
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let module = name.to_owned();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(module = %module, stream = "stderr", "{line}");
            }
        });
    }
}

/// Sends SIGTERM (Unix), waits out the grace period, then force-kills.
async fn stop_child_with_grace(name: &str, child: &mut Child, pid: Option<u32>) {
    let sent = send_terminate_signal(pid);
    tracing::debug!(module = name, pid = ?pid, graceful = sent, "stopping module process");

    match tokio::time::timeout(STOP_GRACE_PERIOD, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!(module = name, status = %status, "process exited");
        }
        Ok(Err(e)) => {
            tracing::warn!(module = name, error = %e, "failed to wait for process");
        }
        Err(_) => {
            tracing::debug!(module = name, "grace period expired, force killing");
            if let Err(e) = child.kill().await {
                tracing::warn!(module = name, error = %e, "failed to force kill");
            }
        }
    }
}

#[cfg(unix)]
fn send_terminate_signal(pid: Option<u32>) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return false;
    };
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    kill(Pid::from_raw(pid), Signal::SIGTERM).is_ok()
}

#[cfg(not(unix))]
fn send_terminate_signal(_pid: Option<u32>) -> bool {
    false
}
