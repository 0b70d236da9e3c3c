//! The schema tree (template tree).
//!
//! Parsed once from a directory of template files. Nodes are stored in an
//! arena and addressed by [`TemplateId`]; configuration nodes hold ids, not
//! pointers, so the configuration tree stays cheaply copyable for diffing.

mod node;
mod parse;

use std::collections::BTreeMap;
use std::path::Path;

use rtkit_bus::SignatureDb;

use crate::error::Error;
use crate::value::ValueType;

pub use node::{
    AllowedRange, AllowedValue, ModuleBinding, Segment, TemplateId, TemplateNode,
};

/// The schema tree.
#[derive(Debug, Clone)]
pub struct TemplateTree {
    nodes: Vec<TemplateNode>,
    variables: BTreeMap<String, TemplateId>,
    modules: BTreeMap<String, TemplateId>,
}

impl TemplateTree {
    fn empty() -> Self {
        let root = TemplateNode::new(Segment::Literal(String::new()), None, String::new());
        TemplateTree {
            nodes: vec![root],
            variables: BTreeMap::new(),
            modules: BTreeMap::new(),
        }
    }

    /// Loads every `*.tp` file in `dir`, resolves cross-file references and
    /// validates the result.
    ///
    /// # Errors
    /// Returns a parse error pinpointing file and line, or a schema
    /// violation from the validation pass.
    pub fn load(dir: &Path, sigdb: &SignatureDb) -> Result<Self, Error> {
        let mut entries: Vec<_> = std::fs::read_dir(dir)?
            .collect::<Result<_, _>>()?;
        entries.sort_by_key(std::fs::DirEntry::file_name);

        let mut tree = TemplateTree::empty();
        let mut seen_any = false;
        for entry in entries {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "tp") {
                seen_any = true;
                let text = std::fs::read_to_string(&path)?;
                parse::parse_file(&mut tree, &text, &path.display().to_string())?;
            }
        }
        if !seen_any {
            return Err(Error::parse(
                &dir.display().to_string(),
                0,
                "no template files found",
            ));
        }
        tree.finish(sigdb)?;
        Ok(tree)
    }

    /// Builds a tree from a single in-memory template text.
    ///
    /// # Errors
    /// Same failure modes as [`TemplateTree::load`].
    pub fn from_str(text: &str, source_hint: &str, sigdb: &SignatureDb) -> Result<Self, Error> {
        let mut tree = TemplateTree::empty();
        parse::parse_file(&mut tree, text, source_hint)?;
        tree.finish(sigdb)?;
        Ok(tree)
    }

    #[must_use]
    pub fn root(&self) -> TemplateId {
        TemplateId(0)
    }

    #[must_use]
    pub fn node(&self, id: TemplateId) -> &TemplateNode {
        &self.nodes[id.0]
    }

    pub(crate) fn node_mut(&mut self, id: TemplateId) -> &mut TemplateNode {
        &mut self.nodes[id.0]
    }

    #[must_use]
    pub fn children(&self, id: TemplateId) -> &[TemplateId] {
        &self.nodes[id.0].children
    }

    #[must_use]
    pub fn parent(&self, id: TemplateId) -> Option<TemplateId> {
        self.nodes[id.0].parent
    }

    /// Finds or creates the child of `parent` with the given segment.
    /// Re-opened blocks merge into the existing node.
    pub(crate) fn ensure_child(&mut self, parent: TemplateId, segment: Segment) -> TemplateId {
        if let Some(&existing) = self.nodes[parent.0]
            .children
            .iter()
            .find(|&&c| self.nodes[c.0].segment == segment)
        {
            return existing;
        }
        let path = if self.nodes[parent.0].path.is_empty() {
            segment.to_string()
        } else {
            format!("{}.{segment}", self.nodes[parent.0].path)
        };
        let id = TemplateId(self.nodes.len());
        self.nodes.push(TemplateNode::new(segment, Some(parent), path));
        self.nodes[parent.0].children.push(id);
        id
    }

    /// Matches a concrete path segment against the children of `parent`:
    /// literal children by name, the placeholder child otherwise.
    #[must_use]
    pub fn match_child(&self, parent: TemplateId, segment: &str) -> Option<TemplateId> {
        let children = &self.nodes[parent.0].children;
        children
            .iter()
            .copied()
            .find(|&c| matches!(&self.nodes[c.0].segment, Segment::Literal(name) if name == segment))
            .or_else(|| {
                children
                    .iter()
                    .copied()
                    .find(|&c| self.nodes[c.0].is_placeholder())
            })
    }

    /// Resolves a dotted schema path. A `@` segment selects a placeholder
    /// child; crossing a placeholder without the selector fails.
    #[must_use]
    pub fn find(&self, path: &str) -> Option<TemplateId> {
        let mut id = self.root();
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            id = self.children(id).iter().copied().find(|&c| {
                match &self.nodes[c.0].segment {
                    Segment::Literal(name) => name == segment,
                    Segment::Placeholder => segment == "@",
                }
            })?;
        }
        Some(id)
    }

    /// Resolves a `%variable` name to the node that owns it.
    #[must_use]
    pub fn find_by_variable(&self, name: &str) -> Option<TemplateId> {
        self.variables.get(name).copied()
    }

    /// The module bound to `name`, if declared.
    #[must_use]
    pub fn module(&self, name: &str) -> Option<&ModuleBinding> {
        self.modules
            .get(name)
            .and_then(|&id| self.nodes[id.0].module.as_ref())
    }

    /// The node carrying the `%modinfo` for `name`.
    #[must_use]
    pub fn module_node(&self, name: &str) -> Option<TemplateId> {
        self.modules.get(name).copied()
    }

    /// All declared modules.
    pub fn modules(&self) -> impl Iterator<Item = &ModuleBinding> {
        self.modules
            .values()
            .filter_map(|&id| self.nodes[id.0].module.as_ref())
    }

    /// Post-parse pass: inherit owning modules, index variables and
    /// modules, and validate the tree.
    fn finish(&mut self, sigdb: &SignatureDb) -> Result<(), Error> {
        // Inherit owning modules top-down.
        let mut stack = vec![(self.root(), None::<String>)];
        while let Some((id, inherited)) = stack.pop() {
            let owning = self.nodes[id.0]
                .module
                .as_ref()
                .map(|m| m.name.clone())
                .or(inherited);
            self.nodes[id.0].owning_module.clone_from(&owning);
            for &child in &self.nodes[id.0].children.clone() {
                stack.push((child, owning.clone()));
            }
        }

        // Index modules and variables; duplicates are load errors.
        for idx in 0..self.nodes.len() {
            let id = TemplateId(idx);
            if let Some(binding) = &self.nodes[idx].module {
                if self.modules.insert(binding.name.clone(), id).is_some() {
                    return Err(Error::schema(
                        &self.nodes[idx].path,
                        format!("module '{}' is declared more than once", binding.name),
                    ));
                }
            }
            if let Some(var) = &self.nodes[idx].variable {
                if self.variables.insert(var.clone(), id).is_some() {
                    return Err(Error::schema(
                        &self.nodes[idx].path,
                        format!("variable '{var}' is declared more than once"),
                    ));
                }
            }
        }

        self.validate(sigdb)
    }

    fn validate(&self, sigdb: &SignatureDb) -> Result<(), Error> {
        for (idx, node) in self.nodes.iter().enumerate() {
            let id = TemplateId(idx);

            // At most one placeholder child, and placeholders carry a type.
            let placeholders: Vec<_> = node
                .children
                .iter()
                .filter(|&&c| self.nodes[c.0].is_placeholder())
                .collect();
            if placeholders.len() > 1 {
                return Err(Error::schema(
                    &node.path,
                    "more than one placeholder child",
                ));
            }
            if node.is_placeholder() && node.value_type == ValueType::Void {
                return Err(Error::schema(&node.path, "placeholder without a type"));
            }

            // Defaults must satisfy the node's own constraints.
            if let Some(default) = &node.default_value {
                node.check_value(default).map_err(|e| {
                    Error::schema(&node.path, format!("default value rejected: {e}"))
                })?;
            }

            // Ranges only make sense on integer leaves.
            if !node.allowed_ranges.is_empty() && !node.value_type.is_integer() {
                return Err(Error::schema(
                    &node.path,
                    "%allow-range on a non-integer node",
                ));
            }

            // Every action must refer only to resolvable variables and
            // carry a known call signature.
            let module_actions = node.module.iter().flat_map(|m| {
                [
                    &m.start_commit,
                    &m.end_commit,
                    &m.status_method,
                    &m.startup_method,
                    &m.shutdown_method,
                ]
                .into_iter()
                .flatten()
            });
            for action in node.actions.values().flatten().chain(module_actions) {
                for var in action.referred_variables() {
                    if !self.variable_is_resolvable(id, var) {
                        return Err(Error::schema(
                            &node.path,
                            format!("action {action} refers to undefined variable '{var}'"),
                        ));
                    }
                }
                action.check_signature(sigdb)?;
            }

            // Module dependencies must name declared modules.
            if let Some(binding) = &node.module {
                for dep in &binding.depends {
                    if !self.modules.contains_key(dep) {
                        return Err(Error::schema(
                            &node.path,
                            format!(
                                "module '{}' depends on undeclared module '{dep}'",
                                binding.name
                            ),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Load-time check that a `$(…)` reference can resolve somewhere:
    /// the node's own key, a declared `%variable`, an absolute schema path,
    /// or a name relative to the node or its parent.
    fn variable_is_resolvable(&self, context: TemplateId, name: &str) -> bool {
        if name == "@" {
            return true;
        }
        if self.variables.contains_key(name) {
            return true;
        }
        if name.contains('.') && self.find(name).is_some() {
            return true;
        }
        // Relative: a child of the node, or a sibling.
        let relative = |base: TemplateId| {
            self.children(base).iter().any(|&c| {
                matches!(&self.nodes[c.0].segment, Segment::Literal(n) if n == name)
            })
        };
        if relative(context) {
            return true;
        }
        self.parent(context).is_some_and(relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionKind;
    use crate::config::op::ConfigOperator;

    const SAMPLE: &str = r#"
/* interface management */
interfaces {
    %modinfo {
        provides: interfaces;
        path: "sbin/routekit-ifmgr";
        default_targetname: ifmgr;
        status_method: xrl "ifmgr/common/get_status -> status:u32&reason:txt";
    };
    interface @: txt {
        %create: xrl "ifmgr/ifmgr/create_interface?ifname:txt=$(@)";
        %delete: xrl "ifmgr/ifmgr/delete_interface?ifname:txt=$(@)";
        enabled: bool = false {
            %set: xrl "ifmgr/ifmgr/set_enabled?ifname:txt=$(@)&enabled:bool=$(enabled)";
        }
        mtu: u32 = 1500 {
            %allow-range { 68..65535 : "standard MTUs" };
            %allow-operator { =, := };
        }
        media: txt {
            %allow { "ethernet" : "wired", "loopback" };
        }
    }
}
"#;

    fn sample_tree() -> TemplateTree {
        TemplateTree::from_str(SAMPLE, "sample.tp", &SignatureDb::permissive()).unwrap()
    }

    #[test]
    fn paths_and_lookup() {
        let tree = sample_tree();
        let mtu = tree.find("interfaces.interface.@.mtu").unwrap();
        assert_eq!(tree.node(mtu).path, "interfaces.interface.@.mtu");
        assert_eq!(tree.node(mtu).value_type, ValueType::U32);
        assert_eq!(tree.node(mtu).default_value.as_deref(), Some("1500"));
        assert!(tree.find("interfaces.interface.eth0.mtu").is_none());
    }

    #[test]
    fn match_child_falls_back_to_placeholder() {
        let tree = sample_tree();
        let interface = tree.find("interfaces.interface").unwrap();
        let eth0 = tree.match_child(tree.find("interfaces").unwrap(), "interface");
        assert_eq!(eth0, Some(interface));
        // Any key under "interface" hits the placeholder.
        let under = tree.match_child(interface, "eth0");
        assert_eq!(under, tree.find("interfaces.interface.@"));
    }

    #[test]
    fn modinfo_is_indexed() {
        let tree = sample_tree();
        let binding = tree.module("interfaces").unwrap();
        assert_eq!(binding.executable, "sbin/routekit-ifmgr");
        assert_eq!(binding.default_target.as_deref(), Some("ifmgr"));
        assert!(binding.status_method.is_some());
        assert_eq!(tree.modules().count(), 1);
    }

    #[test]
    fn owning_module_is_inherited() {
        let tree = sample_tree();
        let mtu = tree.find("interfaces.interface.@.mtu").unwrap();
        assert_eq!(tree.node(mtu).owning_module.as_deref(), Some("interfaces"));
    }

    #[test]
    fn constraints_are_parsed() {
        let tree = sample_tree();
        let mtu = tree.node(tree.find("interfaces.interface.@.mtu").unwrap());
        assert_eq!(mtu.allowed_ranges.len(), 1);
        assert_eq!(mtu.allowed_ranges[0].low, 68);
        assert!(mtu.admits_operator(ConfigOperator::AssignDefault));
        assert!(!mtu.admits_operator(ConfigOperator::Add));

        let media = tree.node(tree.find("interfaces.interface.@.media").unwrap());
        assert_eq!(media.allowed_values.len(), 2);
        assert!(media.check_value("ethernet").is_ok());
        assert!(media.check_value("token-ring").is_err());

        let enabled = tree.node(tree.find("interfaces.interface.@.enabled").unwrap());
        // No %allow-operator clause: '=' only.
        assert!(enabled.admits_operator(ConfigOperator::Assign));
        assert!(!enabled.admits_operator(ConfigOperator::Ne));
        assert_eq!(enabled.actions_for(ActionKind::Set).len(), 1);
    }

    #[test]
    fn allow_set_and_range_admit_their_union() {
        let text = r#"
x {
    distance: u32 {
        %allow { 255 : "unreachable" };
        %allow-range { 1..32 };
    }
}
"#;
        let tree = TemplateTree::from_str(text, "t.tp", &SignatureDb::permissive()).unwrap();
        let node = tree.node(tree.find("x.distance").unwrap());
        assert!(node.check_value("16").is_ok());
        assert!(node.check_value("255").is_ok());
        assert!(node.check_value("200").is_err());
    }

    #[test]
    fn default_outside_range_is_rejected() {
        let text = "x { y: u32 = 9 { %allow-range { 10..20 }; } }";
        let err = TemplateTree::from_str(text, "t.tp", &SignatureDb::permissive()).unwrap_err();
        assert!(err.to_string().contains("default value rejected"), "{err}");
    }

    #[test]
    fn duplicate_module_is_rejected() {
        let text = r#"
a { %modinfo { provides: m; path: "bin/a"; }; }
b { %modinfo { provides: m; path: "bin/b"; }; }
"#;
        let err = TemplateTree::from_str(text, "t.tp", &SignatureDb::permissive()).unwrap_err();
        assert!(err.to_string().contains("declared more than once"), "{err}");
    }

    #[test]
    fn undefined_variable_in_action_is_rejected() {
        let text = r#"
a {
    b: u32 {
        %set: xrl "t/i/m?x:u32=$(nosuch)";
    }
}
"#;
        let err = TemplateTree::from_str(text, "t.tp", &SignatureDb::permissive()).unwrap_err();
        assert!(err.to_string().contains("undefined variable"), "{err}");
    }

    #[test]
    fn unknown_signature_is_rejected_with_strict_db() {
        let mut db = SignatureDb::default();
        db.add_listing("t/i/known?x:u32", "sigs").unwrap();
        let good = r#"a { b: u32 { %set: xrl "t/i/known?x:u32=$(b)"; } }"#;
        assert!(TemplateTree::from_str(good, "t.tp", &db).is_ok());
        let bad = r#"a { b: u32 { %set: xrl "t/i/unknown?x:u32=$(b)"; } }"#;
        assert!(TemplateTree::from_str(bad, "t.tp", &db).is_err());
    }

    #[test]
    fn syntax_error_pinpoints_file_and_line() {
        let text = "a {\n  b: nosuchtype;\n}\n";
        let err = TemplateTree::from_str(text, "bad.tp", &SignatureDb::permissive()).unwrap_err();
        assert_eq!(err.to_string(), "bad.tp:2: unknown type 'nosuchtype'");
    }

    #[test]
    fn blocks_merge_across_files() {
        let mut tree = TemplateTree::empty();
        super::parse::parse_file(&mut tree, "protocols { static { } }", "a.tp").unwrap();
        super::parse::parse_file(
            &mut tree,
            "protocols { rip { metric: u32 = 1; } }",
            "b.tp",
        )
        .unwrap();
        tree.finish(&SignatureDb::permissive()).unwrap();
        assert!(tree.find("protocols.static").is_some());
        assert!(tree.find("protocols.rip.metric").is_some());
        assert_eq!(tree.children(tree.find("protocols").unwrap()).len(), 2);
    }
}
