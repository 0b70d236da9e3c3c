//! Templated strings with variable and expression substitution.
//!
//! Action declarations embed `$(…)` variable references and back-tick
//! expressions in otherwise literal text. A template is parsed once into a
//! segment sequence and substituted at execution time against a
//! configuration-node context.

use std::fmt;

use crate::error::Error;

/// One parsed piece of a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    /// `$(name)` — a schema variable or a dotted configuration path;
    /// `$(@)` refers to the context node's own key.
    VarRef(String),
    /// `` `text` `` — evaluated by a host-supplied expression evaluator.
    Expr(String),
}

/// A parsed template string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    raw: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Parses `text` into segments.
    ///
    /// # Errors
    /// Returns a parse error on an unterminated `$(` or back-tick.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = text.chars().peekable();

        let unterminated = |what: &str| Error::Parse {
            source_hint: text.to_owned(),
            line: 1,
            message: format!("unterminated {what}"),
        };

        while let Some(c) = chars.next() {
            match c {
                '$' if chars.peek() == Some(&'(') => {
                    chars.next();
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    let mut name = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == ')' {
                            closed = true;
                            break;
                        }
                        name.push(c);
                    }
                    if !closed {
                        return Err(unterminated("variable reference"));
                    }
                    segments.push(Segment::VarRef(name));
                }
                '`' => {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    let mut expr = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '`' {
                            closed = true;
                            break;
                        }
                        expr.push(c);
                    }
                    if !closed {
                        return Err(unterminated("back-tick expression"));
                    }
                    segments.push(Segment::Expr(expr));
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(Template {
            raw: text.to_owned(),
            segments,
        })
    }

    /// The variable names this template refers to.
    pub fn referred_variables(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::VarRef(name) => Some(name.as_str()),
            _ => None,
        })
    }

    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Substitutes every segment.
    ///
    /// `resolve_var` maps a variable name to its string form;
    /// `resolve_expr` evaluates a back-tick expression.
    ///
    /// # Errors
    /// Returns [`Error::UnresolvedVariable`] for the first segment either
    /// resolver declines.
    pub fn expand(
        &self,
        mut resolve_var: impl FnMut(&str) -> Option<String>,
        mut resolve_expr: impl FnMut(&str) -> Option<String>,
    ) -> Result<String, Error> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::VarRef(name) => {
                    let value =
                        resolve_var(name).ok_or_else(|| Error::UnresolvedVariable {
                            name: name.clone(),
                        })?;
                    out.push_str(&value);
                }
                Segment::Expr(expr) => {
                    let value =
                        resolve_expr(expr).ok_or_else(|| Error::UnresolvedVariable {
                            name: format!("`{expr}`"),
                        })?;
                    out.push_str(&value);
                }
            }
        }
        Ok(out)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
