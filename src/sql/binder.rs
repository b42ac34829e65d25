/// Named-parameter binding shared by every backend.
///
/// Statements use `@name` placeholders. A backend picks how values are
/// passed on: by name (Cosmos) or by position with a replacement token
/// (DynamoDB PartiQL uses `?`). Only the conversion callback and the style
/// differ between backends.
use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::value::{Conditions, Parameters, Value};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@[a-zA-Z0-9_.\-]+").expect("valid placeholder pattern"));

static FIELD_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_\-]+$").expect("valid field name pattern"));

/// How bound values are handed to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindStyle<'a> {
    /// Keep `@name` in the statement; one value per distinct placeholder.
    Named,
    /// Replace each occurrence with the token; one value per occurrence.
    Positional(&'a str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoundStatement<P> {
    pub statement: String,
    pub params: Vec<P>,
}

/// Every placeholder occurrence, in textual order.
pub fn placeholders(statement: &str) -> Vec<&str> {
    PLACEHOLDER
        .find_iter(statement)
        .map(|m| m.as_str())
        .collect()
}

/// Replace placeholders with `token` without checking bindings.
pub(crate) fn replace_placeholders(statement: &str, token: &str) -> String {
    PLACEHOLDER
        .replace_all(statement, regex::NoExpand(token))
        .into_owned()
}

/// Placeholders without values and values without placeholders.
fn unmatched(found: &[&str], parameters: &Parameters) -> Vec<String> {
    let found_set: BTreeSet<&str> = found.iter().copied().collect();
    let mut missing: BTreeSet<String> = found_set
        .iter()
        .filter(|name| !parameters.contains_key(**name))
        .map(|name| name.to_string())
        .collect();
    missing.extend(
        parameters
            .keys()
            .filter(|name| !found_set.contains(name.as_str()))
            .cloned(),
    );
    missing.into_iter().collect()
}

/// Check that placeholders and parameters match one to one.
pub fn check_parameters(statement: &str, parameters: &Parameters) -> Result<()> {
    let missing = unmatched(&placeholders(statement), parameters);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "missing parameters: {}",
            missing.join(", ")
        )))
    }
}

/// Bind `parameters` into `statement`, converting each value with `convert`.
pub fn bind_parameters<P, F>(
    statement: &str,
    parameters: &Parameters,
    mut convert: F,
    style: BindStyle<'_>,
) -> Result<BoundStatement<P>>
where
    F: FnMut(&str, &Value) -> Result<P>,
{
    check_parameters(statement, parameters)?;
    let found = placeholders(statement);

    match style {
        BindStyle::Named => {
            let mut seen = BTreeSet::new();
            let mut params = Vec::new();
            for name in found {
                if seen.insert(name) {
                    params.push(convert(name, &parameters[name])?);
                }
            }
            Ok(BoundStatement {
                statement: statement.to_string(),
                params,
            })
        }
        BindStyle::Positional(token) => {
            let params = found
                .into_iter()
                .map(|name| convert(name, &parameters[name]))
                .collect::<Result<Vec<_>>>()?;
            Ok(BoundStatement {
                statement: replace_placeholders(statement, token),
                params,
            })
        }
    }
}

/// Reject key or filter names that could not be used as attribute names.
pub fn validate_field_names(key: &Conditions, filters: &Conditions) -> Result<()> {
    let invalid: BTreeSet<&str> = key
        .keys()
        .chain(filters.keys())
        .map(String::as_str)
        .filter(|name| !FIELD_NAME.is_match(name))
        .collect();
    if invalid.is_empty() {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "invalid key or filter keys: {}",
            invalid.into_iter().collect::<Vec<_>>().join(", ")
        )))
    }
}
