//! Diffing between configuration trees, and replay of diff results.

use crate::config::{ConfigId, ConfigTree};
use crate::error::Error;

impl ConfigTree {
    /// Compares this tree (the candidate) against `other` (the baseline)
    /// and produces two trees: `deltas` holds every node present or
    /// modified relative to the baseline, `deletions` holds the roots of
    /// every subtree the baseline has but the candidate lacks.
    #[must_use]
    pub fn diff(&self, other: &ConfigTree) -> (ConfigTree, ConfigTree) {
        let mut deltas = ConfigTree::new(std::sync::Arc::clone(&self.template));
        let delta_root = deltas.root();
        build_delta(self, self.root(), other, Some(other.root()), &mut deltas, delta_root);

        let mut deletions = ConfigTree::new(std::sync::Arc::clone(&self.template));
        let deletion_root = deletions.root();
        build_deletions(self, Some(self.root()), other, other.root(), &mut deletions, deletion_root);

        (deltas, deletions)
    }

    /// Replays a delta tree onto this tree as provisional edits.
    ///
    /// # Errors
    /// Schema violations when the delta does not fit this tree's schema.
    pub fn apply_deltas(&mut self, deltas: &ConfigTree, user: u32) -> Result<(), Error> {
        self.apply_delta_children(deltas, deltas.root(), self.root(), user)
    }

    fn apply_delta_children(
        &mut self,
        deltas: &ConfigTree,
        from: ConfigId,
        onto: ConfigId,
        user: u32,
    ) -> Result<(), Error> {
        for &child in deltas.children(from) {
            let dnode = deltas.node(child);
            let id = self.ensure_child(onto, &dnode.segment.clone(), user)?;
            if let Some(value) = dnode.value.clone() {
                self.apply_value(id, &value, dnode.operator, user)?;
            } else {
                self.nodes[id.0].committed = false;
                self.nodes[id.0].deleted = false;
            }
            self.apply_delta_children(deltas, child, id, user)?;
        }
        Ok(())
    }

    /// Replays a deletion tree onto this tree: every listed root is marked
    /// provisionally deleted.
    ///
    /// # Errors
    /// [`Error::NodeLocked`] when a lock blocks one of the deletions.
    pub fn apply_deletions(&mut self, deletions: &ConfigTree, user: u32) -> Result<(), Error> {
        self.apply_deletion_children(deletions, deletions.root(), self.root(), user)
    }

    fn apply_deletion_children(
        &mut self,
        deletions: &ConfigTree,
        from: ConfigId,
        onto: ConfigId,
        user: u32,
    ) -> Result<(), Error> {
        for &child in deletions.children(from) {
            let dnode = deletions.node(child);
            let Some(id) = self.child_by_segment(onto, &dnode.segment) else {
                continue;
            };
            if deletions.children(child).is_empty() {
                // A childless entry is a deletion root; carriers always
                // have children below them.
                let path = self.nodes[id.0].path.clone();
                self.delete(&path, user)?;
            } else {
                self.apply_deletion_children(deletions, child, id, user)?;
            }
        }
        Ok(())
    }
}

fn live_child_by_segment(
    tree: &ConfigTree,
    parent: ConfigId,
    segment: &str,
) -> Option<ConfigId> {
    tree.children(parent)
        .iter()
        .copied()
        .find(|&c| tree.node(c).segment == segment && !tree.node(c).deleted)
}

/// Whether the subtree at `a` differs from its counterpart in `old`.
fn subtree_changed(
    new: &ConfigTree,
    a: ConfigId,
    old: &ConfigTree,
    b: Option<ConfigId>,
) -> bool {
    let na = new.node(a);
    let Some(b) = b else {
        return true;
    };
    let nb = old.node(b);
    if na.value != nb.value || na.operator != nb.operator {
        return true;
    }
    new.children(a)
        .iter()
        .filter(|&&c| !new.node(c).deleted)
        .any(|&c| {
            let cb = live_child_by_segment(old, b, &new.node(c).segment);
            subtree_changed(new, c, old, cb)
        })
}

fn build_delta(
    new: &ConfigTree,
    a: ConfigId,
    old: &ConfigTree,
    b: Option<ConfigId>,
    out: &mut ConfigTree,
    out_parent: ConfigId,
) {
    for &ca in new.children(a) {
        let child = new.node(ca);
        if child.deleted {
            continue;
        }
        let cb = b.and_then(|b| live_child_by_segment(old, b, &child.segment));
        if !subtree_changed(new, ca, old, cb) {
            continue;
        }
        // The schema already admitted this node in `new`.
        let Ok(copied) = out.ensure_child(out_parent, &child.segment.clone(), child.modifier)
        else {
            continue;
        };
        let node_changed = match cb {
            None => true,
            Some(cb) => {
                old.node(cb).value != child.value || old.node(cb).operator != child.operator
            }
        };
        if node_changed {
            out.nodes[copied.0].value.clone_from(&child.value);
            out.nodes[copied.0].operator = child.operator;
        }
        build_delta(new, ca, old, cb, out, copied);
    }
}

fn build_deletions(
    new: &ConfigTree,
    a: Option<ConfigId>,
    old: &ConfigTree,
    b: ConfigId,
    out: &mut ConfigTree,
    out_parent: ConfigId,
) {
    for &cb in old.children(b) {
        let child = old.node(cb);
        if child.deleted {
            continue;
        }
        let ca = a.and_then(|a| live_child_by_segment(new, a, &child.segment));
        match ca {
            Some(ca) => {
                // Present in both: descend looking for vanished subtrees,
                // materialising the carrier chain lazily.
                let Ok(carrier) =
                    out.ensure_child(out_parent, &child.segment.clone(), child.modifier)
                else {
                    continue;
                };
                build_deletions(new, Some(ca), old, cb, out, carrier);
                if out.children(carrier).is_empty() {
                    out.detach(carrier);
                }
            }
            None => {
                // Missing in the candidate: record the subtree root.
                if let Ok(copied) =
                    out.ensure_child(out_parent, &child.segment.clone(), child.modifier)
                {
                    out.nodes[copied.0].value.clone_from(&child.value);
                    out.nodes[copied.0].operator = child.operator;
                }
            }
        }
    }
}
