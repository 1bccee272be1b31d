//! Cross-entity population.
//!
//! Population replaces stored ids by the data of the entities they point at.
//! Keys are collected across every document of a read, resolved in one call
//! per field, and written back in place. Ids without a match stay as they
//! are.

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::adapter::id_key;
use crate::error::{ConfigurationError, EntityResult};
use crate::field::{PopulateArgs, PopulateRule, PopulateSource};
use crate::tenant::OperationContext;

/// A lookup call made on behalf of a populate rule.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LookupRequest {
    /// Distinct ids to resolve.
    pub ids: Vec<Value>,
    /// Field selection on the target.
    pub fields: Option<Vec<String>>,
    /// Nested populate list on the target.
    pub populate: Option<Vec<String>>,
    /// Extra parameters declared on the rule.
    pub params: Map<String, Value>,
}

/// Carries id lookups to other services.
///
/// The response maps the string form of each found id to its entity; ids
/// missing from the response were not found.
#[async_trait]
pub trait LookupTransport: Send + Sync + fmt::Debug {
    /// Resolves `request.ids` through `action`.
    async fn lookup(
        &self,
        action: &str,
        request: LookupRequest,
        ctx: &OperationContext,
    ) -> EntityResult<Map<String, Value>>;
}

/// Distinct non-null keys across `entities`, flattening id arrays.
pub(crate) fn collect_keys<'a>(
    entities: impl IntoIterator<Item = &'a Map<String, Value>>,
    key_field: &str,
) -> Vec<Value> {
    let mut seen = HashSet::new();
    let mut keys = Vec::new();
    let mut push = |value: &Value| {
        if !value.is_null() && seen.insert(id_key(value)) {
            keys.push(value.clone());
        }
    };
    for entity in entities {
        match entity.get(key_field) {
            Some(Value::Array(items)) => items.iter().for_each(&mut push),
            Some(value) => push(value),
            None => {}
        }
    }
    keys
}

/// Resolves `keys` for the field through the rule's resolver or lookup.
pub(crate) async fn resolve(
    field: &str,
    rule: &PopulateRule,
    keys: Vec<Value>,
    transport: Option<&dyn LookupTransport>,
    ctx: &OperationContext,
) -> EntityResult<Map<String, Value>> {
    if keys.is_empty() {
        return Ok(Map::new());
    }
    let nested = ctx.nested();
    let depth = nested.populate_depth();
    let requested = keys.len();

    let resolved = match &rule.source {
        PopulateSource::Resolver(hook) => {
            hook.call(PopulateArgs {
                field: field.to_string(),
                keys,
                fields: rule.fields.clone(),
                populate: rule.populate.clone(),
                ctx: nested,
            })
            .await?
        }
        PopulateSource::Lookup(lookup) => {
            let transport = transport.ok_or_else(|| ConfigurationError::InvalidPopulate {
                field: field.to_string(),
                message: format!("no lookup transport for action '{}'", lookup.action),
            })?;
            let request = LookupRequest {
                ids: keys,
                fields: rule.fields.clone(),
                populate: rule.populate.clone(),
                params: lookup.params.clone(),
            };
            transport.lookup(&lookup.action, request, &nested).await?
        }
    };

    debug!(
        field = %field,
        requested,
        resolved = resolved.len(),
        depth,
        "Populated field"
    );
    Ok(resolved)
}

/// Writes resolved values onto `target` in each entity, reading keys from
/// `key_field` of the matching source entity.
pub(crate) fn apply(
    sources: &[Map<String, Value>],
    targets: &mut [Map<String, Value>],
    key_field: &str,
    target: &str,
    resolved: &Map<String, Value>,
) {
    let lookup = |key: &Value| -> Value {
        if key.is_null() {
            return Value::Null;
        }
        resolved.get(&id_key(key)).cloned().unwrap_or_else(|| key.clone())
    };

    for (source, out) in sources.iter().zip(targets.iter_mut()) {
        let value = match source.get(key_field) {
            Some(Value::Array(items)) => Value::Array(items.iter().map(&lookup).collect()),
            Some(key) => lookup(key),
            None => continue,
        };
        out.insert(target.to_string(), value);
    }
}
