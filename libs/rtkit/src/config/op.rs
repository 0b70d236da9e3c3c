//! Configuration operators.

use std::fmt;

/// The operator attached to a configuration assignment.
///
/// Operators are carried with the node and passed through to actions; the
/// manager itself only enforces which operators a schema node admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConfigOperator {
    /// No operator (containers and bare nodes).
    None,
    /// `=`
    Assign,
    /// `:=`
    AssignDefault,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `+=`
    Add,
    /// `-=`
    Sub,
    /// `*=`
    Mul,
    /// `/=`
    Div,
}

impl ConfigOperator {
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            ConfigOperator::None => "",
            ConfigOperator::Assign => "=",
            ConfigOperator::AssignDefault => ":=",
            ConfigOperator::Ne => "!=",
            ConfigOperator::Lt => "<",
            ConfigOperator::Le => "<=",
            ConfigOperator::Gt => ">",
            ConfigOperator::Ge => ">=",
            ConfigOperator::Add => "+=",
            ConfigOperator::Sub => "-=",
            ConfigOperator::Mul => "*=",
            ConfigOperator::Div => "/=",
        }
    }

    #[must_use]
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        Some(match symbol {
            "=" => ConfigOperator::Assign,
            ":=" => ConfigOperator::AssignDefault,
            "!=" => ConfigOperator::Ne,
            "<" => ConfigOperator::Lt,
            "<=" => ConfigOperator::Le,
            ">" => ConfigOperator::Gt,
            ">=" => ConfigOperator::Ge,
            "+=" => ConfigOperator::Add,
            "-=" => ConfigOperator::Sub,
            "*=" => ConfigOperator::Mul,
            "/=" => ConfigOperator::Div,
            _ => return None,
        })
    }
}

impl fmt::Display for ConfigOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}
