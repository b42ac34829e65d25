//! Opaque pagination cursors.
//!
//! A cursor wraps whatever resume state the backend hands back (a DynamoDB
//! `LastEvaluatedKey`, a Cosmos continuation token, a memory offset)
//! together with a fingerprint of the query that produced it. The caller
//! only ever sees a base64url string.
use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::value::{item_to_json, Conditions, Parameters};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cursor(String);

#[derive(Serialize, Deserialize)]
struct Envelope {
    fp: u32,
    state: serde_json::Value,
}

impl Cursor {
    pub fn encode(fingerprint: u32, state: serde_json::Value) -> Result<Self> {
        let bytes = serde_json::to_vec(&Envelope {
            fp: fingerprint,
            state,
        })
        .map_err(|e| Error::plugin(format!("cursor encoding failed: {e}")))?;
        Ok(Cursor(URL_SAFE_NO_PAD.encode(bytes)))
    }

    /// Decode `raw` and check it was issued for the same query.
    pub fn decode(raw: &str, fingerprint: u32) -> Result<serde_json::Value> {
        let bytes = URL_SAFE_NO_PAD
            .decode(raw.trim())
            .map_err(|_| Error::validation("invalid cursor"))?;
        let envelope: Envelope =
            serde_json::from_slice(&bytes).map_err(|_| Error::validation("invalid cursor"))?;
        if envelope.fp != fingerprint {
            return Err(Error::validation("cursor does not match query"));
        }
        Ok(envelope.state)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Cursor {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Fingerprint of a structured query. The page size is not part of it.
pub fn fingerprint_conditions(table: &str, key: &Conditions, filters: &Conditions) -> u32 {
    let shape = serde_json::json!({
        "table": table,
        "key": item_to_json(key),
        "filters": item_to_json(filters),
    });
    crc32fast::hash(shape.to_string().as_bytes())
}

/// Fingerprint of a parameterized statement.
pub fn fingerprint_statement(table: &str, statement: &str, parameters: &Parameters) -> u32 {
    let shape = serde_json::json!({
        "table": table,
        "statement": statement.trim(),
        "parameters": item_to_json(parameters),
    });
    crc32fast::hash(shape.to_string().as_bytes())
}
