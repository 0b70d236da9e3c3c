//! Configuration tree nodes.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::config::op::ConfigOperator;
use crate::template::TemplateId;

/// Index of a node in the configuration arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConfigId(pub(crate) usize);

/// An exclusive hold on a node, with expiry.
#[derive(Debug, Clone, Copy)]
pub struct NodeLock {
    pub holder: u32,
    pub expires: Instant,
}

/// A node of the configuration tree.
///
/// `committed` is false while the node carries a provisional change;
/// `deleted` keeps removed subtrees in the tree until a successful commit
/// so the diff and the delete actions can see them.
#[derive(Debug, Clone)]
pub struct ConfigNode {
    /// Concrete path segment; for placeholder schema nodes this is the
    /// user-supplied key.
    pub segment: String,
    /// The schema node this instantiates.
    pub template: TemplateId,
    pub value: Option<String>,
    pub operator: ConfigOperator,
    pub committed: bool,
    pub deleted: bool,
    /// Identity of the last user to change the node.
    pub modifier: u32,
    /// Stable, monotonic per tree.
    pub node_id: u64,
    /// Dotted concrete path from the root.
    pub path: String,

    /// Committed snapshot, for discarding provisional edits.
    pub(crate) committed_value: Option<String>,
    pub(crate) committed_operator: ConfigOperator,
    /// Whether the node existed in the last committed state.
    pub(crate) existed_committed: bool,
    /// Values written back by executed actions, addressable as `$(name)`.
    pub(crate) action_vars: BTreeMap<String, String>,
    pub(crate) lock: Option<NodeLock>,
    /// Unlinked from its parent; skipped by every walk.
    pub(crate) detached: bool,

    pub(crate) parent: Option<ConfigId>,
    pub(crate) children: Vec<ConfigId>,
}

impl ConfigNode {
    pub(crate) fn new(
        segment: String,
        template: TemplateId,
        parent: Option<ConfigId>,
        path: String,
        node_id: u64,
        modifier: u32,
    ) -> Self {
        ConfigNode {
            segment,
            template,
            value: None,
            operator: ConfigOperator::None,
            committed: false,
            deleted: false,
            modifier,
            node_id,
            path,
            committed_value: None,
            committed_operator: ConfigOperator::None,
            existed_committed: false,
            action_vars: BTreeMap::new(),
            lock: None,
            detached: false,
            parent,
            children: Vec::new(),
        }
    }

    /// Whether the node carries an uncommitted change (including a
    /// provisional deletion).
    #[must_use]
    pub fn is_provisional(&self) -> bool {
        !self.committed || self.deleted
    }

    /// Whether the node is new since the last commit.
    #[must_use]
    pub fn is_new(&self) -> bool {
        !self.existed_committed
    }
}
