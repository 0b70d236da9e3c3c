//! Parser for template (schema) files.

use crate::action::{Action, ActionKind};
use crate::config::op::ConfigOperator;
use crate::error::Error;
use crate::lex::{Cursor, TokenKind, tokenize};
use crate::template::node::{
    AllowedRange, AllowedValue, ModuleBinding, Segment, TemplateId,
};
use crate::template::TemplateTree;
use crate::value::ValueType;

/// Parses one template file into the tree, merging blocks that re-open
/// paths declared in other files.
pub(crate) fn parse_file(
    tree: &mut TemplateTree,
    text: &str,
    source_hint: &str,
) -> Result<(), Error> {
    let tokens = tokenize(text, source_hint)?;
    let mut cur = Cursor::new(&tokens, source_hint);
    let root = tree.root();
    while !cur.at_end() {
        parse_node(tree, &mut cur, root)?;
    }
    Ok(())
}

fn parse_segment(cur: &mut Cursor<'_>) -> Result<Segment, Error> {
    match cur.next().map(|t| &t.kind) {
        Some(TokenKind::Word(w)) => Ok(Segment::Literal(w.clone())),
        Some(TokenKind::At) => Ok(Segment::Placeholder),
        Some(other) => Err(cur.error(format!("expected node name, found {other:?}"))),
        None => Err(cur.error("expected node name, found end of input")),
    }
}

fn parse_node(
    tree: &mut TemplateTree,
    cur: &mut Cursor<'_>,
    parent: TemplateId,
) -> Result<(), Error> {
    let segment = parse_segment(cur)?;
    let mut id = tree.ensure_child(parent, segment);

    // Tag form: `name @: type { … }` declares `name` with a placeholder
    // child in one line; the body belongs to the placeholder.
    if cur.eat(&TokenKind::At) {
        id = tree.ensure_child(id, Segment::Placeholder);
    }

    if cur.eat(&TokenKind::Colon) {
        let keyword = cur.expect_word("type keyword")?;
        let ty = ValueType::from_keyword(&keyword)
            .ok_or_else(|| cur.error(format!("unknown type '{keyword}'")))?;
        let node = tree.node_mut(id);
        if node.value_type != ValueType::Void && node.value_type != ty {
            return Err(cur.error(format!(
                "node '{}' re-declared as {ty} (was {})",
                node.path, node.value_type
            )));
        }
        node.value_type = ty;

        if cur.eat(&TokenKind::Op("=".to_owned())) {
            let default = cur.expect_value("default value")?;
            tree.node_mut(id).default_value = Some(default);
        }
    }

    if cur.eat(&TokenKind::LBrace) {
        loop {
            match cur.peek() {
                Some(TokenKind::RBrace) => {
                    cur.next();
                    break;
                }
                Some(TokenKind::Clause(_)) => parse_clause(tree, cur, id)?,
                Some(TokenKind::Word(_) | TokenKind::At) => parse_node(tree, cur, id)?,
                Some(other) => {
                    return Err(cur.error(format!("unexpected {other:?} in block")));
                }
                None => return Err(cur.error("unterminated block")),
            }
        }
        cur.eat(&TokenKind::Semi);
    } else {
        cur.expect(&TokenKind::Semi, "';'")?;
    }
    Ok(())
}

fn parse_clause(
    tree: &mut TemplateTree,
    cur: &mut Cursor<'_>,
    id: TemplateId,
) -> Result<(), Error> {
    let line = cur.line();
    let clause = match cur.next().map(|t| &t.kind) {
        Some(TokenKind::Clause(c)) => c.clone(),
        _ => return Err(cur.error("expected clause")),
    };

    if let Some(kind) = ActionKind::from_clause(&clause) {
        return parse_action_clause(tree, cur, id, kind);
    }

    match clause.as_str() {
        "%help" => {
            cur.expect(&TokenKind::Colon, "':'")?;
            let text = cur.expect_str("help text")?;
            cur.expect(&TokenKind::Semi, "';'")?;
            tree.node_mut(id).help = Some(text);
        }
        "%variable" => {
            cur.expect(&TokenKind::Colon, "':'")?;
            let name = cur.expect_word("variable name")?;
            cur.expect(&TokenKind::Semi, "';'")?;
            tree.node_mut(id).variable = Some(name);
        }
        "%allow" => parse_allow(tree, cur, id)?,
        "%allow-range" => parse_allow_range(tree, cur, id)?,
        "%allow-operator" => parse_allow_operator(tree, cur, id)?,
        "%modinfo" => parse_modinfo(tree, cur, id, line)?,
        other => {
            return Err(cur.error(format!("unknown clause '{other}'")));
        }
    }
    Ok(())
}

fn parse_action_body(cur: &mut Cursor<'_>) -> Result<Action, Error> {
    let line = cur.line();
    let kind = cur.expect_word("action kind ('xrl' or 'program')")?;
    let body = cur.expect_str("action body")?;
    Action::parse(&kind, &body).map_err(|e| {
        // Re-anchor the error at the clause position in the file.
        let message = match e {
            Error::Parse { message, .. } => message,
            other => other.to_string(),
        };
        cur.error_at(line, message)
    })
}

fn parse_action_clause(
    tree: &mut TemplateTree,
    cur: &mut Cursor<'_>,
    id: TemplateId,
    kind: ActionKind,
) -> Result<(), Error> {
    cur.expect(&TokenKind::Colon, "':'")?;
    loop {
        let action = parse_action_body(cur)?;
        tree.node_mut(id).actions.entry(kind).or_default().push(action);
        if !cur.eat(&TokenKind::Comma) {
            break;
        }
    }
    cur.expect(&TokenKind::Semi, "';'")
}

fn parse_allow(
    tree: &mut TemplateTree,
    cur: &mut Cursor<'_>,
    id: TemplateId,
) -> Result<(), Error> {
    cur.expect(&TokenKind::LBrace, "'{'")?;
    loop {
        if cur.eat(&TokenKind::RBrace) {
            break;
        }
        let value = cur.expect_value("allowed value")?;
        let help = if cur.eat(&TokenKind::Colon) {
            cur.expect_str("help text")?
        } else {
            String::new()
        };
        tree.node_mut(id).allowed_values.push(AllowedValue { value, help });
        if !cur.eat(&TokenKind::Comma) {
            cur.expect(&TokenKind::RBrace, "'}'")?;
            break;
        }
    }
    cur.eat(&TokenKind::Semi);
    Ok(())
}

fn parse_allow_range(
    tree: &mut TemplateTree,
    cur: &mut Cursor<'_>,
    id: TemplateId,
) -> Result<(), Error> {
    cur.expect(&TokenKind::LBrace, "'{'")?;
    loop {
        if cur.eat(&TokenKind::RBrace) {
            break;
        }
        let word = cur.expect_word("range 'low..high'")?;
        let (low, high) = word
            .split_once("..")
            .and_then(|(l, h)| Some((l.parse::<i64>().ok()?, h.parse::<i64>().ok()?)))
            .ok_or_else(|| cur.error(format!("bad range '{word}', expected 'low..high'")))?;
        if low > high {
            return Err(cur.error(format!("empty range '{word}'")));
        }
        let help = if cur.eat(&TokenKind::Colon) {
            cur.expect_str("help text")?
        } else {
            String::new()
        };
        tree.node_mut(id).allowed_ranges.push(AllowedRange { low, high, help });
        if !cur.eat(&TokenKind::Comma) {
            cur.expect(&TokenKind::RBrace, "'}'")?;
            break;
        }
    }
    cur.eat(&TokenKind::Semi);
    Ok(())
}

fn parse_allow_operator(
    tree: &mut TemplateTree,
    cur: &mut Cursor<'_>,
    id: TemplateId,
) -> Result<(), Error> {
    cur.expect(&TokenKind::LBrace, "'{'")?;
    loop {
        if cur.eat(&TokenKind::RBrace) {
            break;
        }
        let op = match cur.next().map(|t| &t.kind) {
            Some(TokenKind::Op(symbol)) => ConfigOperator::from_symbol(symbol)
                .ok_or_else(|| cur.error(format!("unknown operator '{symbol}'")))?,
            Some(other) => {
                return Err(cur.error(format!("expected operator, found {other:?}")));
            }
            None => return Err(cur.error("unterminated %allow-operator")),
        };
        tree.node_mut(id).allowed_operators.insert(op);
        if !cur.eat(&TokenKind::Comma) {
            cur.expect(&TokenKind::RBrace, "'}'")?;
            break;
        }
    }
    cur.eat(&TokenKind::Semi);
    Ok(())
}

fn parse_modinfo(
    tree: &mut TemplateTree,
    cur: &mut Cursor<'_>,
    id: TemplateId,
    clause_line: u32,
) -> Result<(), Error> {
    if tree.node_mut(id).module.is_some() {
        return Err(cur.error("duplicate %modinfo on this node"));
    }
    cur.expect(&TokenKind::LBrace, "'{'")?;

    let mut binding = ModuleBinding::default();
    loop {
        if cur.eat(&TokenKind::RBrace) {
            break;
        }
        let key = cur.expect_word("modinfo entry")?;
        cur.expect(&TokenKind::Colon, "':'")?;
        match key.as_str() {
            "provides" => binding.name = cur.expect_value("module name")?,
            "depends" => binding.depends.push(cur.expect_value("module name")?),
            "path" => binding.executable = cur.expect_value("executable path")?,
            "default_targetname" => {
                binding.default_target = Some(cur.expect_value("target name")?);
            }
            "start_commit" => binding.start_commit = Some(parse_action_body(cur)?),
            "end_commit" => binding.end_commit = Some(parse_action_body(cur)?),
            "status_method" => binding.status_method = Some(parse_action_body(cur)?),
            "startup_method" => binding.startup_method = Some(parse_action_body(cur)?),
            "shutdown_method" => binding.shutdown_method = Some(parse_action_body(cur)?),
            other => {
                return Err(cur.error(format!("unknown %modinfo entry '{other}'")));
            }
        }
        cur.expect(&TokenKind::Semi, "';'")?;
    }
    cur.eat(&TokenKind::Semi);

    if binding.name.is_empty() {
        return Err(cur.error_at(clause_line, "%modinfo requires a 'provides' entry"));
    }
    if binding.executable.is_empty() {
        return Err(cur.error_at(
            clause_line,
            format!("%modinfo for '{}' requires a 'path' entry", binding.name),
        ));
    }
    tree.node_mut(id).module = Some(binding);
    Ok(())
}
