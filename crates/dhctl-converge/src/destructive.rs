//! Identifier of a set of destructive changes
//!
//! The id is sent back by the operator to approve exactly the destructive
//! changes they reviewed. It only depends on what is deleted or recreated,
//! never on map ordering, so two checks of the same cluster agree.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use dhctl_common::Result;
use dhctl_infra::ValueChange;

use crate::check::Statistics;

/// Deleted resources are identified by type and name only
fn deleted_identity(value: &Value) -> Option<Value> {
    let map = value.as_object()?;
    Some(json!({
        "type": map.get("type").cloned().unwrap_or(Value::Null),
        "name": map.get("name").cloned().unwrap_or(Value::Null),
    }))
}

fn current(change: &ValueChange) -> Value {
    change.current_value.clone().unwrap_or(Value::Null)
}

fn next(change: &ValueChange) -> Option<Value> {
    change.next_value.clone().filter(|v| !v.is_null())
}

/// Flat map of every destructive change of `stats`
fn destructive_changes(stats: &Statistics) -> BTreeMap<String, Value> {
    let mut changes = BTreeMap::new();

    for node in &stats.nodes {
        let Some(destructive) = &node.destructive_changes else {
            continue;
        };
        for (i, change) in destructive.resources_deleted.iter().enumerate() {
            let value = current(change);
            changes.insert(
                format!("node:{}:resource_deleted:{i}:current", node.name),
                deleted_identity(&value).unwrap_or(value),
            );
        }
        for (i, change) in destructive.resources_recreated.iter().enumerate() {
            if let Some(value) = next(change) {
                changes.insert(format!("node:{}:resource_recreated:{i}:next", node.name), value);
            }
        }
    }

    if let Some(cluster) = &stats.cluster.destructive_changes {
        if !cluster.output_broken_reason.is_empty() {
            changes.insert(
                "cluster:output_broken_reason".to_string(),
                Value::String(cluster.output_broken_reason.clone()),
            );
        }
        if let Some(value) = cluster.output_zones_changed.as_ref().and_then(next) {
            changes.insert("cluster:output_zones_changed:next".to_string(), value);
        }
        for (i, change) in cluster.plan.resources_deleted.iter().enumerate() {
            let value = current(change);
            match deleted_identity(&value) {
                Some(identity) => {
                    changes.insert(format!("cluster:resource_deleted:{i}:current"), identity)
                }
                // historical key of the approval format
                None => changes.insert(format!("node:resource_deleted:{i}:current"), value),
            };
        }
        for (i, change) in cluster.plan.resources_recreated.iter().enumerate() {
            if let Some(value) = next(change) {
                changes.insert(format!("cluster:resource_recreated:{i}:next"), value);
            }
        }
    }

    changes
}

/// JSON with object keys sorted at every level
fn write_canonical(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (n, (key, value)) in sorted.into_iter().enumerate() {
                if n > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(value, out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (n, item) in items.iter().enumerate() {
                if n > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}

fn canonical_changes(stats: &Statistics) -> Result<Option<String>> {
    let changes = destructive_changes(stats);
    if changes.is_empty() {
        return Ok(None);
    }
    let mut out = String::new();
    write_canonical(&Value::Object(changes.into_iter().collect()), &mut out)?;
    Ok(Some(out))
}

/// Hex SHA-256 of the destructive changes; empty when there are none
pub fn destructive_change_id(stats: &Statistics) -> Result<String> {
    Ok(match canonical_changes(stats)? {
        Some(canonical) => hex::encode(Sha256::digest(canonical.as_bytes())),
        None => String::new(),
    })
}
