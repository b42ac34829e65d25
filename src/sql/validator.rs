/// Read-only statement validation.
///
/// Works on the token stream rather than a full parse so that dialect
/// extensions of the document stores (`SELECT VALUE`, `c.nested.path`)
/// still pass, while any mutating keyword is caught at every nesting depth.
use std::collections::BTreeSet;

use sqlparser::dialect::GenericDialect;
use sqlparser::tokenizer::{Token, Tokenizer};

use super::binder::replace_placeholders;
use crate::error::{Error, Result};

const FORBIDDEN_DML: &[&str] = &["DELETE", "INSERT", "MERGE", "REPLACE", "UPDATE", "UPSERT"];
const FORBIDDEN_DDL: &[&str] = &[
    "ALTER", "CREATE", "DROP", "GRANT", "RENAME", "REVOKE", "TRUNCATE",
];

fn tokenize(statement: &str) -> Result<Vec<Token>> {
    let dialect = GenericDialect {};
    let sql = replace_placeholders(statement, "?");
    Tokenizer::new(&dialect, &sql)
        .tokenize()
        .map_err(|e| Error::validation(format!("invalid statement: {e}")))
}

/// Unquoted keyword text of a token, uppercased.
fn keyword(token: &Token) -> Option<String> {
    match token {
        Token::Word(w) if w.quote_style.is_none() => Some(w.value.to_uppercase()),
        _ => None,
    }
}

fn is_blank(token: &Token) -> bool {
    matches!(token, Token::Whitespace(_) | Token::EOF)
}

/// Whether the word at `i` is a name: a function call or a qualified path
/// segment such as `REPLACE(` or `c.update`.
fn is_name(tokens: &[Token], i: usize) -> bool {
    let qualified = (i > 0 && matches!(tokens[i - 1], Token::Period))
        || matches!(tokens.get(i + 1), Some(Token::Period));
    let called = tokens[i + 1..]
        .iter()
        .find(|t| !is_blank(t))
        .is_some_and(|t| matches!(t, Token::LParen));
    qualified || called
}

/// Accept exactly one SELECT statement with no mutating keywords anywhere.
pub fn validate_statement(statement: &str) -> Result<()> {
    let tokens = tokenize(statement)?;

    let invalid: BTreeSet<String> = tokens
        .iter()
        .enumerate()
        .filter(|(i, _)| !is_name(&tokens, *i))
        .filter_map(|(_, token)| keyword(token))
        .filter(|kw| FORBIDDEN_DML.contains(&kw.as_str()) || FORBIDDEN_DDL.contains(&kw.as_str()))
        .collect();
    if !invalid.is_empty() {
        return Err(Error::validation(format!(
            "only SELECT is allowed: {}",
            invalid.into_iter().collect::<Vec<_>>().join(", ")
        )));
    }

    let statements: Vec<&[Token]> = tokens
        .split(|t| matches!(t, Token::SemiColon))
        .filter(|part| !part.iter().all(is_blank))
        .collect();
    match statements.as_slice() {
        [] => Err(Error::validation("empty statement")),
        [single] => {
            let root = single.iter().find(|t| !is_blank(t)).and_then(keyword);
            match root.as_deref() {
                Some("SELECT") => Ok(()),
                _ => Err(Error::validation("only SELECT is allowed")),
            }
        }
        _ => Err(Error::validation("only a single statement is allowed")),
    }
}
