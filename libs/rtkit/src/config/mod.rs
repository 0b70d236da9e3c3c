//! The configuration tree.
//!
//! A mutable instance of the schema tree. Nodes are created by the parser
//! or by user edits, mutated only while provisional, promoted to committed
//! by a successful commit and restored from their committed snapshots when
//! provisional edits are discarded.

mod diff;
mod node;
pub mod op;
mod parse;

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::template::{TemplateId, TemplateTree};

pub use node::{ConfigId, ConfigNode, NodeLock};
pub use op::ConfigOperator;

/// First line of every saved configuration file. `save` refuses to
/// overwrite a file that does not carry it.
pub const CONFIG_FILE_MARKER: &str = "/* Router configuration, RouteKit v1 */";

type ExprEvaluator = dyn Fn(&str) -> Option<String> + Send + Sync;

/// The configuration tree.
#[derive(Clone)]
pub struct ConfigTree {
    template: Arc<TemplateTree>,
    nodes: Vec<ConfigNode>,
    next_node_id: u64,
    expr_evaluator: Option<Arc<ExprEvaluator>>,
}

// Manual Debug: the expression evaluator is an opaque closure.
impl fmt::Debug for ConfigTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigTree")
            .field("nodes", &self.nodes.len())
            .field("next_node_id", &self.next_node_id)
            .finish_non_exhaustive()
    }
}

impl ConfigTree {
    /// An empty tree over `template`.
    #[must_use]
    pub fn new(template: Arc<TemplateTree>) -> Self {
        let root = ConfigNode::new(
            String::new(),
            template.root(),
            None,
            String::new(),
            0,
            0,
        );
        let mut tree = ConfigTree {
            template,
            nodes: vec![root],
            next_node_id: 1,
            expr_evaluator: None,
        };
        let root_id = tree.root();
        tree.nodes[root_id.0].committed = true;
        tree.nodes[root_id.0].existed_committed = true;
        tree
    }

    #[must_use]
    pub fn template(&self) -> &Arc<TemplateTree> {
        &self.template
    }

    #[must_use]
    pub fn root(&self) -> ConfigId {
        ConfigId(0)
    }

    #[must_use]
    pub fn node(&self, id: ConfigId) -> &ConfigNode {
        &self.nodes[id.0]
    }

    #[must_use]
    pub fn children(&self, id: ConfigId) -> &[ConfigId] {
        &self.nodes[id.0].children
    }

    /// Installs the host-supplied evaluator for back-tick expressions.
    pub fn set_expr_evaluator(&mut self, evaluator: Arc<ExprEvaluator>) {
        self.expr_evaluator = Some(evaluator);
    }

    /// All attached nodes in preorder, root first.
    #[must_use]
    pub fn walk_preorder(&self) -> Vec<ConfigId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            out.push(id);
            for &child in self.nodes[id.0].children.iter().rev() {
                stack.push(child);
            }
        }
        out
    }

    /// Resolves a concrete dotted path.
    #[must_use]
    pub fn find(&self, path: &str) -> Option<ConfigId> {
        let mut id = self.root();
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            id = self
                .children(id)
                .iter()
                .copied()
                .find(|&c| self.nodes[c.0].segment == segment)?;
        }
        Some(id)
    }

    /// The value at a path.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&str> {
        self.find(path)
            .and_then(|id| self.nodes[id.0].value.as_deref())
    }

    fn child_by_segment(&self, parent: ConfigId, segment: &str) -> Option<ConfigId> {
        self.children(parent)
            .iter()
            .copied()
            .find(|&c| self.nodes[c.0].segment == segment)
    }

    fn check_lock(&self, id: ConfigId, user: u32) -> Result<(), Error> {
        if let Some(lock) = &self.nodes[id.0].lock {
            if lock.holder != user && lock.expires > Instant::now() {
                return Err(Error::NodeLocked {
                    path: self.nodes[id.0].path.clone(),
                    holder: lock.holder,
                });
            }
        }
        Ok(())
    }

    /// Finds or creates the child of `parent` with a concrete segment,
    /// validating it against the schema. Created nodes are provisional.
    pub(crate) fn ensure_child(
        &mut self,
        parent: ConfigId,
        segment: &str,
        user: u32,
    ) -> Result<ConfigId, Error> {
        if let Some(child) = self.child_by_segment(parent, segment) {
            return Ok(child);
        }
        let parent_path = self.nodes[parent.0].path.clone();
        let path = if parent_path.is_empty() {
            segment.to_owned()
        } else {
            format!("{parent_path}.{segment}")
        };
        let tmpl = self
            .template
            .match_child(self.nodes[parent.0].template, segment)
            .ok_or_else(|| {
                Error::schema(&path, format!("schema admits no child '{segment}'"))
            })?;
        // A placeholder key must be well-formed for its declared type.
        let tmpl_node = self.template.node(tmpl);
        if tmpl_node.is_placeholder() {
            tmpl_node
                .value_type
                .check(segment)
                .map_err(|m| Error::schema(&path, format!("bad key: {m}")))?;
        }
        let node_id = self.next_node_id;
        self.next_node_id += 1;
        let new = ConfigId(self.nodes.len());
        self.nodes.push(ConfigNode::new(
            segment.to_owned(),
            tmpl,
            Some(parent),
            path,
            node_id,
            user,
        ));
        self.nodes[parent.0].children.push(new);
        Ok(new)
    }

    /// Creates the node at `path` if needed, validating every created
    /// segment against the schema, and returns it.
    fn ensure_path(&mut self, path: &str, user: u32) -> Result<ConfigId, Error> {
        let mut id = self.root();
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            id = self.ensure_child(id, segment, user)?;
        }
        Ok(id)
    }

    /// Validates and applies a value assignment on an existing node.
    pub(crate) fn apply_value(
        &mut self,
        id: ConfigId,
        value: &str,
        operator: ConfigOperator,
        user: u32,
    ) -> Result<(), Error> {
        let tmpl_node = self.template.node(self.nodes[id.0].template);
        let path = self.nodes[id.0].path.clone();
        if !tmpl_node.has_value() {
            return Err(Error::schema(&path, "node does not take a value"));
        }
        if !tmpl_node.admits_operator(operator) {
            return Err(Error::schema(
                &path,
                format!("operator '{operator}' is not admitted"),
            ));
        }
        tmpl_node.check_value(value)?;
        let node = &mut self.nodes[id.0];
        node.value = Some(value.to_owned());
        node.operator = operator;
        node.committed = false;
        node.deleted = false;
        node.modifier = user;
        Ok(())
    }

    /// Creates or updates the node at `path`.
    ///
    /// # Errors
    /// [`Error::SchemaViolation`] when the path, the operator or the value
    /// is not admitted; [`Error::NodeLocked`] when another user holds the
    /// node. The tree is unchanged on error.
    pub fn set(
        &mut self,
        path: &str,
        value: Option<&str>,
        operator: ConfigOperator,
        user: u32,
    ) -> Result<ConfigId, Error> {
        // Validate before mutating so a rejected set leaves no trace.
        if let Some(existing) = self.find(path) {
            self.check_lock(existing, user)?;
        }
        let tmpl = self.template_for_path(path)?;
        let tmpl_node = self.template.node(tmpl);
        if let Some(value) = value {
            if !tmpl_node.has_value() {
                return Err(Error::schema(path, "node does not take a value"));
            }
            if !tmpl_node.admits_operator(operator) {
                return Err(Error::schema(
                    path,
                    format!("operator '{operator}' is not admitted"),
                ));
            }
            tmpl_node.check_value(value)?;
        }

        let id = self.ensure_path(path, user)?;
        let node = &mut self.nodes[id.0];
        if let Some(value) = value {
            node.value = Some(value.to_owned());
            node.operator = operator;
        }
        node.deleted = false;
        node.committed = false;
        node.modifier = user;
        // A set inside a provisionally-deleted subtree revives the chain.
        let mut up = node.parent;
        while let Some(p) = up {
            if self.nodes[p.0].deleted {
                self.nodes[p.0].deleted = false;
                self.nodes[p.0].committed = false;
            }
            up = self.nodes[p.0].parent;
        }
        Ok(id)
    }

    /// Resolves the schema node a path would instantiate.
    fn template_for_path(&self, path: &str) -> Result<TemplateId, Error> {
        let mut id = self.template.root();
        let mut walked = String::new();
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            if !walked.is_empty() {
                walked.push('.');
            }
            walked.push_str(segment);
            id = self.template.match_child(id, segment).ok_or_else(|| {
                Error::schema(&walked, format!("schema admits no child '{segment}'"))
            })?;
        }
        Ok(id)
    }

    /// Marks the subtree at `path` provisionally deleted.
    ///
    /// # Errors
    /// [`Error::SchemaViolation`] when the path does not exist;
    /// [`Error::NodeLocked`] when another user holds a node in the subtree.
    pub fn delete(&mut self, path: &str, user: u32) -> Result<(), Error> {
        let id = self
            .find(path)
            .ok_or_else(|| Error::schema(path, "no such node"))?;
        if id == self.root() {
            return Err(Error::schema(path, "cannot delete the root"));
        }
        let mut stack = vec![id];
        let mut subtree = Vec::new();
        while let Some(n) = stack.pop() {
            self.check_lock(n, user)?;
            subtree.push(n);
            stack.extend_from_slice(&self.nodes[n.0].children);
        }
        for n in subtree {
            let node = &mut self.nodes[n.0];
            node.deleted = true;
            node.committed = false;
            node.modifier = user;
        }
        Ok(())
    }

    /// Marks the entire configuration for deletion.
    pub fn delete_entire_config(&mut self, user: u32) {
        for &child in &self.nodes[self.root().0].children.clone() {
            let path = self.nodes[child.0].path.clone();
            // Children of the root always exist; delete cannot fail here
            // unless a lock is held, which we deliberately ignore for the
            // whole-config wipe.
            let _ = self.delete(&path, user);
        }
    }

    /// Synthesizes committed default nodes for every schema child with a
    /// `default_value` missing under an existing, non-deleted container.
    pub fn add_default_children(&mut self) {
        let mut queue = self.walk_preorder();
        while let Some(id) = queue.pop() {
            if self.nodes[id.0].deleted {
                continue;
            }
            let tmpl = self.nodes[id.0].template;
            for &tc in self.template.children(tmpl) {
                let tmpl_child = self.template.node(tc);
                let Some(default) = tmpl_child.default_value.clone() else {
                    continue;
                };
                let crate::template::Segment::Literal(name) = &tmpl_child.segment else {
                    continue;
                };
                if self.child_by_segment(id, name).is_some() {
                    continue;
                }
                let name = name.clone();
                let path = if self.nodes[id.0].path.is_empty() {
                    name.clone()
                } else {
                    format!("{}.{name}", self.nodes[id.0].path)
                };
                let node_id = self.next_node_id;
                self.next_node_id += 1;
                let new = ConfigId(self.nodes.len());
                let mut node =
                    ConfigNode::new(name, tc, Some(id), path, node_id, 0);
                node.value = Some(default.clone());
                node.operator = ConfigOperator::Assign;
                node.committed = true;
                node.existed_committed = true;
                node.committed_value = Some(default);
                node.committed_operator = ConfigOperator::Assign;
                self.nodes.push(node);
                self.nodes[id.0].children.push(new);
                queue.push(new);
            }
        }
    }

    /// Takes an exclusive hold on a node.
    ///
    /// # Errors
    /// [`Error::NodeLocked`] naming the holder when someone else already
    /// holds an unexpired lock.
    pub fn lock_node(&mut self, path: &str, user: u32, timeout: Duration) -> Result<(), Error> {
        let id = self
            .find(path)
            .ok_or_else(|| Error::schema(path, "no such node"))?;
        if let Some(lock) = &self.nodes[id.0].lock {
            if lock.holder != user && lock.expires > Instant::now() {
                return Err(Error::NodeLocked {
                    path: path.to_owned(),
                    holder: lock.holder,
                });
            }
        }
        self.nodes[id.0].lock = Some(NodeLock {
            holder: user,
            expires: Instant::now() + timeout,
        });
        Ok(())
    }

    /// Releases a hold taken with [`ConfigTree::lock_node`].
    ///
    /// # Errors
    /// [`Error::NodeLocked`] when a different user holds the lock.
    pub fn unlock_node(&mut self, path: &str, user: u32) -> Result<(), Error> {
        let id = self
            .find(path)
            .ok_or_else(|| Error::schema(path, "no such node"))?;
        match &self.nodes[id.0].lock {
            Some(lock) if lock.holder != user && lock.expires > Instant::now() => {
                Err(Error::NodeLocked {
                    path: path.to_owned(),
                    holder: lock.holder,
                })
            }
            _ => {
                self.nodes[id.0].lock = None;
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Variable expansion

    /// The textual rendering of a node: its value, or its key for a
    /// placeholder instance.
    fn node_text(&self, id: ConfigId) -> Option<String> {
        let node = &self.nodes[id.0];
        if node.value.is_some() {
            return node.value.clone();
        }
        self.template
            .node(node.template)
            .is_placeholder()
            .then(|| node.segment.clone())
    }

    /// Resolves a `$(…)` reference against a node context.
    ///
    /// Resolution order: the node's own text for `@`, values written back
    /// by executed actions, a child or sibling by name, a declared
    /// `%variable` (nearest enclosing instance first), then an absolute
    /// dotted path.
    #[must_use]
    pub fn expand_variable(&self, ctx: ConfigId, name: &str) -> Option<String> {
        if name == "@" {
            return self
                .node_text(ctx)
                .or_else(|| Some(self.nodes[ctx.0].segment.clone()));
        }
        if let Some(v) = self.nodes[ctx.0].action_vars.get(name) {
            return Some(v.clone());
        }
        if !name.contains('.') {
            if let Some(child) = self.child_by_segment(ctx, name) {
                return self.node_text(child);
            }
            if let Some(parent) = self.nodes[ctx.0].parent {
                if let Some(sibling) = self.child_by_segment(parent, name) {
                    return self.node_text(sibling);
                }
            }
        }
        if let Some(target) = self.template.find_by_variable(name) {
            if let Some(id) = self.find_instance_of(ctx, target) {
                return self.node_text(id);
            }
        }
        if name.contains('.') {
            if let Some(id) = self.find(name) {
                return self.node_text(id);
            }
        }
        None
    }

    /// Evaluates a back-tick expression through the host-supplied
    /// evaluator.
    #[must_use]
    pub fn expand_expression(&self, _ctx: ConfigId, expr: &str) -> Option<String> {
        self.expr_evaluator.as_ref().and_then(|eval| eval(expr))
    }

    /// Finds the configuration instance of a schema node, searching the
    /// nearest enclosing scope of `ctx` first. Provisionally-deleted nodes
    /// still resolve; delete actions expand against them.
    fn find_instance_of(&self, ctx: ConfigId, target: TemplateId) -> Option<ConfigId> {
        let mut scope = Some(ctx);
        while let Some(base) = scope {
            let mut stack = vec![base];
            while let Some(id) = stack.pop() {
                if self.nodes[id.0].template == target {
                    return Some(id);
                }
                stack.extend_from_slice(&self.nodes[id.0].children);
            }
            scope = self.nodes[base.0].parent;
        }
        None
    }

    /// Stores values produced by an executed action on the node.
    pub fn write_action_vars(
        &mut self,
        ctx: ConfigId,
        vars: impl IntoIterator<Item = (String, String)>,
    ) {
        self.nodes[ctx.0].action_vars.extend(vars);
    }

    // ------------------------------------------------------------------
    // Module bookkeeping

    /// The topmost non-deleted node owned by `module`.
    #[must_use]
    pub fn find_config_module(&self, module: &str) -> Option<ConfigId> {
        self.walk_preorder().into_iter().find(|&id| {
            !self.nodes[id.0].deleted
                && self
                    .template
                    .node(self.nodes[id.0].template)
                    .owning_module
                    .as_deref()
                    == Some(module)
        })
    }

    /// Modules owning any node with a provisional change.
    #[must_use]
    pub fn find_changed_modules(&self) -> BTreeSet<String> {
        self.collect_modules(|node| node.is_provisional())
    }

    /// Modules owning any non-deleted node.
    #[must_use]
    pub fn find_active_modules(&self) -> BTreeSet<String> {
        self.collect_modules(|node| !node.deleted)
    }

    /// Modules owning any node present in the committed state.
    #[must_use]
    pub fn find_previously_active_modules(&self) -> BTreeSet<String> {
        self.collect_modules(|node| node.existed_committed)
    }

    fn collect_modules(&self, mut include: impl FnMut(&ConfigNode) -> bool) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for id in self.walk_preorder() {
            if id == self.root() {
                continue;
            }
            let node = &self.nodes[id.0];
            if include(node) {
                if let Some(module) =
                    &self.template.node(node.template).owning_module
                {
                    out.insert(module.clone());
                }
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Commit bookkeeping

    /// Whether any node carries a provisional change.
    #[must_use]
    pub fn has_provisional_changes(&self) -> bool {
        self.walk_preorder()
            .into_iter()
            .any(|id| id != self.root() && self.nodes[id.0].is_provisional())
    }

    /// Restores the last committed state: provisional nodes vanish,
    /// surviving nodes revert to their committed snapshots.
    pub fn discard_provisional(&mut self) {
        for id in self.walk_preorder() {
            if id == self.root() {
                continue;
            }
            if self.nodes[id.0].is_new() {
                self.detach(id);
            } else {
                let node = &mut self.nodes[id.0];
                node.value.clone_from(&node.committed_value);
                node.operator = node.committed_operator;
                node.deleted = false;
                node.committed = true;
            }
        }
    }

    /// Promotes provisional state after a successful commit: deleted
    /// subtrees are removed, everything else becomes the new committed
    /// snapshot.
    pub fn finalize_commit(&mut self) {
        for id in self.walk_preorder() {
            if id == self.root() {
                continue;
            }
            if self.nodes[id.0].deleted {
                self.detach(id);
            } else {
                let node = &mut self.nodes[id.0];
                node.committed = true;
                node.committed_value.clone_from(&node.value);
                node.committed_operator = node.operator;
                node.existed_committed = true;
            }
        }
    }

    /// Unlinks a subtree from the tree. Ids stay valid but the nodes are
    /// unreachable from every walk.
    fn detach(&mut self, id: ConfigId) {
        if let Some(parent) = self.nodes[id.0].parent {
            self.nodes[parent.0].children.retain(|&c| c != id);
        }
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            self.nodes[n.0].detached = true;
            stack.extend_from_slice(&self.nodes[n.0].children);
        }
    }

    // ------------------------------------------------------------------
    // Text form

    /// Parses configuration text into this tree, replacing its contents.
    /// On error the tree is left untouched.
    ///
    /// # Errors
    /// A parse error pinpointing `source_hint` and line, or a schema
    /// violation from node validation.
    pub fn parse(&mut self, text: &str, source_hint: &str, user: u32) -> Result<(), Error> {
        let mut candidate = ConfigTree::new(Arc::clone(&self.template));
        parse::parse_into(&mut candidate, text, source_hint, user)?;
        candidate.expr_evaluator.clone_from(&self.expr_evaluator);
        *self = candidate;
        Ok(())
    }

    /// Renders the tree in the on-disk grammar, marker line first.
    #[must_use]
    pub fn serialize(&self) -> String {
        let mut out = String::from(CONFIG_FILE_MARKER);
        out.push('\n');
        for &child in self.children(self.root()) {
            self.serialize_node(child, 0, &mut out);
        }
        out
    }

    fn serialize_node(&self, id: ConfigId, depth: usize, out: &mut String) {
        let node = &self.nodes[id.0];
        if node.deleted {
            return;
        }
        let indent = "    ".repeat(depth);
        let tmpl = self.template.node(node.template);

        // Tag nodes render combined with each instance key.
        let is_tag = self
            .template
            .children(node.template)
            .iter()
            .any(|&c| self.template.node(c).is_placeholder())
            && !tmpl.has_value();
        if is_tag {
            for &instance in &node.children {
                let key = &self.nodes[instance.0].segment;
                if self.nodes[instance.0].deleted {
                    continue;
                }
                out.push_str(&format!("{indent}{} \"{key}\" {{\n", node.segment));
                for &child in &self.nodes[instance.0].children {
                    self.serialize_node(child, depth + 1, out);
                }
                out.push_str(&format!("{indent}}}\n"));
            }
            return;
        }

        match &node.value {
            Some(value) => {
                let rendered = if needs_quoting(value) {
                    format!("\"{value}\"")
                } else {
                    value.clone()
                };
                out.push_str(&format!(
                    "{indent}{} {} {rendered};\n",
                    node.segment, node.operator
                ));
            }
            None => {
                out.push_str(&format!("{indent}{} {{\n", node.segment));
                for &child in &node.children {
                    self.serialize_node(child, depth + 1, out);
                }
                out.push_str(&format!("{indent}}}\n"));
            }
        }
    }

    /// Saves the committed tree to `filename` via a temporary file and
    /// rename. Refuses to overwrite an existing file that does not start
    /// with the configuration marker.
    ///
    /// # Errors
    /// I/O failures, or refusal to clobber a foreign file.
    pub fn save(&self, filename: &Path) -> Result<(), Error> {
        if filename.exists() {
            let head = std::fs::read_to_string(filename)?;
            if !head.starts_with(CONFIG_FILE_MARKER) {
                return Err(Error::Io(std::io::Error::other(format!(
                    "refusing to overwrite {}: not a saved configuration",
                    filename.display()
                ))));
            }
        }
        let tmp = filename.with_extension("tmp");
        if let Err(e) = std::fs::write(&tmp, self.serialize()) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        if let Err(e) = std::fs::rename(&tmp, filename) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    /// Loads a saved configuration and applies it to this tree as a
    /// provisional change set, returning the `(deltas, deletions)` trees.
    ///
    /// # Errors
    /// I/O failures, a missing marker line, or parse errors.
    pub fn load(
        &mut self,
        filename: &Path,
        user: u32,
    ) -> Result<(ConfigTree, ConfigTree), Error> {
        let text = std::fs::read_to_string(filename)?;
        if !text.starts_with(CONFIG_FILE_MARKER) {
            return Err(Error::parse(
                &filename.display().to_string(),
                1,
                "not a saved configuration (missing marker line)",
            ));
        }
        let mut incoming = ConfigTree::new(Arc::clone(&self.template));
        parse::parse_into(&mut incoming, &text, &filename.display().to_string(), user)?;

        let (deltas, deletions) = incoming.diff(self);
        self.apply_deltas(&deltas, user)?;
        self.apply_deletions(&deletions, user)?;
        Ok((deltas, deletions))
    }

    /// Structural equality on the visible configuration: segments, values
    /// and operators, ignoring commit bookkeeping and deleted nodes.
    #[must_use]
    pub fn semantic_eq(&self, other: &ConfigTree) -> bool {
        self.subtree_eq(self.root(), other, other.root())
    }

    fn subtree_eq(&self, a: ConfigId, other: &ConfigTree, b: ConfigId) -> bool {
        let na = &self.nodes[a.0];
        let nb = &other.nodes[b.0];
        if na.segment != nb.segment || na.value != nb.value || na.operator != nb.operator {
            return false;
        }
        let live_a: Vec<_> = na
            .children
            .iter()
            .filter(|&&c| !self.nodes[c.0].deleted)
            .collect();
        let live_b: Vec<_> = nb
            .children
            .iter()
            .filter(|&&c| !other.nodes[c.0].deleted)
            .collect();
        live_a.len() == live_b.len()
            && live_a
                .iter()
                .zip(&live_b)
                .all(|(&&ca, &&cb)| self.subtree_eq(ca, other, cb))
    }
}

fn needs_quoting(value: &str) -> bool {
    value.is_empty()
        || !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/'))
}
