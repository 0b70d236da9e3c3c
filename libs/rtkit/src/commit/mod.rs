//! The commit engine.
//!
//! Turns the configuration tree's provisional state into an ordered,
//! dependency-respecting plan of tasks, and drives the plan through the
//! task manager twice: pass 1 verifies (expansion, ordering, validation —
//! no side effects), pass 2 executes. On success the provisional state is
//! promoted; on failure it is discarded and a single error naming the
//! module is surfaced.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::action::ActionKind;
use crate::config::{ConfigId, ConfigTree};
use crate::error::Error;
use crate::task::{StepOutcome, TaskManager};
use crate::template::TemplateTree;

/// Orders a set of modules so that every module appears after the modules
/// it depends on, pulling in transitively-required modules. The order is
/// stable across runs for identical inputs. Modules without a `%modinfo`
/// binding sort last.
///
/// # Errors
/// [`Error::DependencyCycle`] naming the modules left unsatisfiable.
pub fn order_modules(
    template: &TemplateTree,
    modules: &BTreeSet<String>,
) -> Result<Vec<String>, Error> {
    // Pull in everything the requested modules transitively depend on.
    let mut known = BTreeSet::new();
    let mut no_info = Vec::new();
    let mut queue: VecDeque<String> = modules.iter().cloned().collect();
    while let Some(name) = queue.pop_front() {
        match template.module(&name) {
            None => {
                if !no_info.contains(&name) {
                    tracing::debug!(module = %name, "no module information");
                    no_info.push(name);
                }
            }
            Some(binding) => {
                if known.insert(name) {
                    for dep in &binding.depends {
                        queue.push_back(dep.clone());
                    }
                }
            }
        }
    }

    // Kahn's algorithm over the expanded set; lexicographic tie-breaking
    // keeps the result deterministic.
    let mut remaining: BTreeMap<String, BTreeSet<String>> = known
        .iter()
        .map(|name| {
            let deps: BTreeSet<String> = template
                .module(name)
                .map(|b| {
                    b.depends
                        .iter()
                        .filter(|d| known.contains(*d))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            (name.clone(), deps)
        })
        .collect();

    let mut ordered = Vec::with_capacity(known.len() + no_info.len());
    while !remaining.is_empty() {
        let ready: Vec<String> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        if ready.is_empty() {
            return Err(Error::DependencyCycle {
                modules: remaining.keys().cloned().collect(),
            });
        }
        for name in ready {
            remaining.remove(&name);
            for deps in remaining.values_mut() {
                deps.remove(&name);
            }
            ordered.push(name);
        }
    }
    ordered.extend(no_info);
    Ok(ordered)
}

/// Drives commits against a task manager.
pub struct CommitEngine {
    task_manager: TaskManager,
    commit_in_progress: bool,
}

impl CommitEngine {
    #[must_use]
    pub fn new(task_manager: TaskManager) -> Self {
        CommitEngine {
            task_manager,
            commit_in_progress: false,
        }
    }

    #[must_use]
    pub fn commit_in_progress(&self) -> bool {
        self.commit_in_progress
    }

    #[must_use]
    pub fn task_manager(&self) -> &TaskManager {
        &self.task_manager
    }

    pub fn task_manager_mut(&mut self) -> &mut TaskManager {
        &mut self.task_manager
    }

    /// Runs the full two-pass commit. On success the tree's provisional
    /// state is promoted; on failure it is discarded.
    ///
    /// # Errors
    /// [`Error::CommitInProgress`] when re-entered;
    /// [`Error::DependencyCycle`] from ordering; [`Error::Commit`] carrying
    /// the failed module and the first fatal error.
    pub async fn commit(&mut self, tree: &mut ConfigTree) -> Result<(), Error> {
        if self.commit_in_progress {
            return Err(Error::CommitInProgress);
        }
        self.commit_in_progress = true;
        let result = self.commit_passes(tree).await;
        self.commit_in_progress = false;
        match result {
            Ok(()) => {
                tree.finalize_commit();
                Ok(())
            }
            Err(e) => {
                tree.discard_provisional();
                Err(e)
            }
        }
    }

    async fn commit_passes(&mut self, tree: &mut ConfigTree) -> Result<(), Error> {
        let changed = tree.find_changed_modules();
        tracing::info!(modules = ?changed, "changed modules");

        // Pass 1: check for errors without touching anything. Inactive
        // modules are not shut down here; this pass only verifies.
        self.task_manager.reset();
        self.task_manager.set_run_mode(false, true);
        self.schedule(tree, false)?;
        self.task_manager.run(tree).await.map_err(|e| {
            tracing::error!(error = %e, "commit pass 1 failed");
            e
        })?;

        // Pass 2: implement the changes.
        self.task_manager.reset();
        self.task_manager.set_run_mode(true, false);
        self.schedule(tree, true)?;
        self.task_manager.run(tree).await.map_err(|e| {
            tracing::error!(error = %e, "commit pass 2 failed");
            e
        })
    }

    /// Runs pass 1 only: expansion, ordering and validation, with
    /// execution disabled. The tree's provisional state is untouched.
    ///
    /// # Errors
    /// Same failure modes as [`CommitEngine::commit`], without side
    /// effects.
    pub async fn verify(&mut self, tree: &mut ConfigTree) -> Result<(), Error> {
        if self.commit_in_progress {
            return Err(Error::CommitInProgress);
        }
        self.commit_in_progress = true;
        self.task_manager.reset();
        self.task_manager.set_run_mode(false, true);
        let result = match self.schedule(tree, false) {
            Ok(()) => self.task_manager.run(tree).await,
            Err(e) => {
                self.task_manager.reset();
                Err(e)
            }
        };
        self.commit_in_progress = false;
        result
    }

    /// Builds the plan for the tree's current provisional state into the
    /// task manager without running it. Used to inspect a plan.
    ///
    /// # Errors
    /// Ordering and scheduling failures, as for a real commit.
    pub fn prepare(&mut self, tree: &ConfigTree, with_shutdowns: bool) -> Result<(), Error> {
        self.task_manager.reset();
        self.schedule(tree, with_shutdowns)
    }

    fn schedule(&mut self, tree: &ConfigTree, with_shutdowns: bool) -> Result<(), Error> {
        let changed = tree.find_changed_modules();
        let ordered = order_modules(tree.template(), &changed)?;

        for name in &ordered {
            if let Some(binding) = tree.template().module(name) {
                self.task_manager.add_module(binding)?;
            }
        }
        for name in &ordered {
            if tree.template().module(name).is_some() {
                self.queue_module_steps(tree, name)?;
            }
        }

        if with_shutdowns {
            let active = tree.find_active_modules();
            let previously_active = tree.find_previously_active_modules();
            let inactive: BTreeSet<String> =
                previously_active.difference(&active).cloned().collect();
            // Scheduled in dependency order; the task manager runs
            // shutdowns in the reverse of that.
            for name in order_modules(tree.template(), &inactive)? {
                if let Some(binding) = tree.template().module(&name) {
                    self.task_manager.shutdown_module(binding);
                }
            }
        }
        Ok(())
    }

    /// Queues the configure steps for one module's task: transaction
    /// start, deletions (children first), creations and updates (parents
    /// first), activations (children first), transaction end.
    fn queue_module_steps(&mut self, tree: &ConfigTree, module: &str) -> Result<(), Error> {
        let preorder: Vec<ConfigId> = tree
            .walk_preorder()
            .into_iter()
            .filter(|&id| {
                id != tree.root()
                    && tree
                        .template()
                        .node(tree.node(id).template)
                        .owning_module
                        .as_deref()
                        == Some(module)
            })
            .collect();

        let any_change = preorder
            .iter()
            .any(|&id| tree.node(id).is_provisional());
        if !any_change {
            return Ok(());
        }

        let module_ctx = tree
            .find_config_module(module)
            .unwrap_or_else(|| tree.root());
        let binding = tree
            .template()
            .module(module)
            .cloned()
            .unwrap_or_default();

        if let Some(start) = &binding.start_commit {
            self.queue_step(tree, module, module_ctx, start.clone())?;
        }

        // Deletions, deepest node first.
        for &id in preorder.iter().rev() {
            let node = tree.node(id);
            if node.deleted && !node.is_new() {
                for action in self
                    .actions_for(tree, id, ActionKind::Delete)
                {
                    self.queue_step(tree, module, id, action)?;
                }
            }
        }

        // Creations and updates, parents first.
        for &id in &preorder {
            let node = tree.node(id);
            if node.deleted || node.committed {
                continue;
            }
            if node.is_new() {
                for action in self.actions_for(tree, id, ActionKind::Create) {
                    self.queue_step(tree, module, id, action)?;
                }
                if node.value.is_some() {
                    for action in self.actions_for(tree, id, ActionKind::Set) {
                        self.queue_step(tree, module, id, action)?;
                    }
                }
            } else {
                let updates = self.actions_for(tree, id, ActionKind::Update);
                if updates.is_empty() {
                    for action in self.actions_for(tree, id, ActionKind::Set) {
                        self.queue_step(tree, module, id, action)?;
                    }
                } else {
                    for action in updates {
                        self.queue_step(tree, module, id, action)?;
                    }
                }
            }
        }

        // Activations for every subtree that changed, children first.
        for &id in preorder.iter().rev() {
            let node = tree.node(id);
            if node.deleted {
                continue;
            }
            let subtree_changed = node.is_provisional()
                || self
                    .subtree_ids(tree, id)
                    .iter()
                    .any(|&d| tree.node(d).is_provisional());
            if subtree_changed {
                for action in self.actions_for(tree, id, ActionKind::Activate) {
                    self.queue_step(tree, module, id, action)?;
                }
            }
        }

        if let Some(end) = &binding.end_commit {
            self.queue_step(tree, module, module_ctx, end.clone())?;
        }
        Ok(())
    }

    fn subtree_ids(&self, tree: &ConfigTree, id: ConfigId) -> Vec<ConfigId> {
        let mut out = Vec::new();
        let mut stack: Vec<ConfigId> = tree.children(id).to_vec();
        while let Some(n) = stack.pop() {
            out.push(n);
            stack.extend_from_slice(tree.children(n));
        }
        out
    }

    fn actions_for(
        &self,
        tree: &ConfigTree,
        id: ConfigId,
        kind: ActionKind,
    ) -> Vec<crate::action::Action> {
        tree.template()
            .node(tree.node(id).template)
            .actions_for(kind)
            .to_vec()
    }

    fn queue_step(
        &mut self,
        tree: &ConfigTree,
        module: &str,
        node: ConfigId,
        action: crate::action::Action,
    ) -> Result<(), Error> {
        let path = tree.node(node).path.clone();
        let module_name = module.to_owned();
        self.task_manager.add_action_step(
            module,
            action,
            node,
            Box::new(move |outcome| match outcome {
                StepOutcome::Success => {}
                StepOutcome::Failed(message) => {
                    tracing::error!(module = %module_name, path = %path, "step failed: {message}");
                }
                StepOutcome::Cancelled => {
                    tracing::debug!(module = %module_name, path = %path, "step cancelled");
                }
            }),
        )
    }
}
