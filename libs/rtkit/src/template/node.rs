//! Schema tree nodes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::action::{Action, ActionKind};
use crate::config::op::ConfigOperator;
use crate::error::Error;
use crate::value::ValueType;

/// Index of a node in the schema arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TemplateId(pub(crate) usize);

/// A path segment in the schema: a literal name, or the `@` placeholder
/// admitting any number of keys of the declared type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Placeholder,
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Literal(name) => f.write_str(name),
            Segment::Placeholder => f.write_str("@"),
        }
    }
}

/// One admissible value with its help text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedValue {
    pub value: String,
    pub help: String,
}

/// One admissible inclusive integer range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedRange {
    pub low: i64,
    pub high: i64,
    pub help: String,
}

/// The module a subtree is bound to via `%modinfo`.
#[derive(Debug, Clone, Default)]
pub struct ModuleBinding {
    pub name: String,
    pub executable: String,
    pub default_target: Option<String>,
    pub depends: Vec<String>,
    pub start_commit: Option<Action>,
    pub end_commit: Option<Action>,
    pub status_method: Option<Action>,
    pub startup_method: Option<Action>,
    pub shutdown_method: Option<Action>,
}

/// A node of the schema tree.
#[derive(Debug, Clone)]
pub struct TemplateNode {
    pub segment: Segment,
    pub value_type: ValueType,
    pub default_value: Option<String>,
    pub help: Option<String>,
    pub allowed_values: Vec<AllowedValue>,
    pub allowed_ranges: Vec<AllowedRange>,
    pub allowed_operators: BTreeSet<ConfigOperator>,
    pub actions: BTreeMap<ActionKind, Vec<Action>>,
    /// Set on the node that carries a `%modinfo` clause.
    pub module: Option<ModuleBinding>,
    /// The module owning this subtree, inherited top-down.
    pub owning_module: Option<String>,
    /// A name other nodes may use to refer to this node's value.
    pub variable: Option<String>,
    /// Dotted path from the root, placeholders rendered as `@`.
    pub path: String,

    pub(crate) parent: Option<TemplateId>,
    pub(crate) children: Vec<TemplateId>,
}

impl TemplateNode {
    pub(crate) fn new(segment: Segment, parent: Option<TemplateId>, path: String) -> Self {
        TemplateNode {
            segment,
            value_type: ValueType::Void,
            default_value: None,
            help: None,
            allowed_values: Vec::new(),
            allowed_ranges: Vec::new(),
            allowed_operators: BTreeSet::new(),
            actions: BTreeMap::new(),
            module: None,
            owning_module: None,
            variable: None,
            path,
            parent,
            children: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        matches!(self.segment, Segment::Placeholder)
    }

    /// Whether the node carries a value of its own.
    #[must_use]
    pub fn has_value(&self) -> bool {
        self.value_type != ValueType::Void
    }

    /// Whether `op` is admitted on this node. Absent an
    /// `%allow-operator` clause, settable leaves admit `=` only.
    #[must_use]
    pub fn admits_operator(&self, op: ConfigOperator) -> bool {
        if self.allowed_operators.is_empty() {
            op == ConfigOperator::Assign || (op == ConfigOperator::None && !self.has_value())
        } else {
            self.allowed_operators.contains(&op)
        }
    }

    /// Validates a candidate value against the node's type and its
    /// `%allow` / `%allow-range` constraints. When both kinds of
    /// constraints are present their union is admitted.
    ///
    /// # Errors
    /// Returns [`Error::SchemaViolation`] with the node path.
    pub fn check_value(&self, value: &str) -> Result<(), Error> {
        self.value_type
            .check(value)
            .map_err(|message| Error::schema(&self.path, message))?;

        if self.allowed_values.is_empty() && self.allowed_ranges.is_empty() {
            return Ok(());
        }
        if self.allowed_values.iter().any(|a| a.value == value) {
            return Ok(());
        }
        if let Some(n) = self.value_type.as_integer(value) {
            if self
                .allowed_ranges
                .iter()
                .any(|r| n >= r.low && n <= r.high)
            {
                return Ok(());
            }
        }
        Err(Error::schema(
            &self.path,
            format!("value '{value}' is not admitted"),
        ))
    }

    /// Actions bound to `kind`, in declaration order.
    #[must_use]
    pub fn actions_for(&self, kind: ActionKind) -> &[Action] {
        self.actions.get(&kind).map_or(&[], Vec::as_slice)
    }
}
