//! Parser for the on-disk configuration grammar.
//!
//! Top-level named blocks contain further blocks or assignments
//! `name <op> value;`. A block may combine a tag with a placeholder key:
//! `interface "eth0" { … }`. Values outside the word charset (spaces,
//! colons) are quoted.

use crate::config::op::ConfigOperator;
use crate::config::{ConfigId, ConfigTree};
use crate::error::Error;
use crate::lex::{Cursor, TokenKind, tokenize};

pub(crate) fn parse_into(
    tree: &mut ConfigTree,
    text: &str,
    source_hint: &str,
    user: u32,
) -> Result<(), Error> {
    let tokens = tokenize(text, source_hint)?;
    let mut cur = Cursor::new(&tokens, source_hint);
    let root = tree.root();
    while !cur.at_end() {
        parse_item(tree, &mut cur, root, user)?;
    }
    Ok(())
}

fn parse_item(
    tree: &mut ConfigTree,
    cur: &mut Cursor<'_>,
    parent: ConfigId,
    user: u32,
) -> Result<(), Error> {
    let line = cur.line();
    let name = cur.expect_word("node name")?;

    match cur.peek() {
        // Tag with a placeholder key: `interface "eth0" { … }` or
        // `interface eth0 { … }`.
        Some(TokenKind::Str(_) | TokenKind::Word(_)) => {
            let key = cur.expect_value("key")?;
            let tag = tree
                .ensure_child(parent, &name, user)
                .map_err(|e| reanchor(cur, line, e))?;
            let instance = tree
                .ensure_child(tag, &key, user)
                .map_err(|e| reanchor(cur, line, e))?;
            parse_block(tree, cur, instance, user)
        }
        Some(TokenKind::LBrace) => {
            let id = tree
                .ensure_child(parent, &name, user)
                .map_err(|e| reanchor(cur, line, e))?;
            parse_block(tree, cur, id, user)
        }
        Some(TokenKind::Op(symbol)) => {
            let operator = ConfigOperator::from_symbol(symbol)
                .ok_or_else(|| cur.error(format!("unknown operator '{symbol}'")))?;
            cur.next();
            let value = cur.expect_value("value")?;
            cur.expect(&TokenKind::Semi, "';'")?;
            let id = tree
                .ensure_child(parent, &name, user)
                .map_err(|e| reanchor(cur, line, e))?;
            tree.apply_value(id, &value, operator, user)
                .map_err(|e| reanchor(cur, line, e))
        }
        Some(other) => Err(cur.error(format!("unexpected {other:?} after '{name}'"))),
        None => Err(cur.error("unexpected end of input")),
    }
}

fn parse_block(
    tree: &mut ConfigTree,
    cur: &mut Cursor<'_>,
    parent: ConfigId,
    user: u32,
) -> Result<(), Error> {
    cur.expect(&TokenKind::LBrace, "'{'")?;
    loop {
        match cur.peek() {
            Some(TokenKind::RBrace) => {
                cur.next();
                break;
            }
            Some(TokenKind::Word(_)) => parse_item(tree, cur, parent, user)?,
            Some(other) => {
                return Err(cur.error(format!("unexpected {other:?} in block")));
            }
            None => return Err(cur.error("unterminated block")),
        }
    }
    cur.eat(&TokenKind::Semi);
    Ok(())
}

/// Schema violations raised while applying parsed nodes are reported as
/// parse errors at the offending line.
fn reanchor(cur: &Cursor<'_>, line: u32, e: Error) -> Error {
    match e {
        Error::SchemaViolation { path, message } => {
            cur.error_at(line, format!("{path}: {message}"))
        }
        other => other,
    }
}
