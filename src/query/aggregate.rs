//! Aggregation pipeline: `$match`, `$group`, `$sort`,
//! `$limit`, `$skip`, `$project` consumed in sequence. Each stage is a
//! [`Document`] with exactly one field naming the stage.
//!
//! `$group`'s keys are arbitrary [`Value`]s, which don't implement `Hash`
//! (nested documents/arrays make that awkward to do losslessly), so
//! grouping is a linear scan against already-seen keys rather than a hash
//! table. Pipelines are expected to run over query results already
//! narrowed by `$match`/indexes, not full collection scans, so this is
//! not expected to dominate.

use crate::document::value::{Document, Value};
use crate::error::{NexaError, Result};
use crate::query::filter;
use crate::query::sort::{parse_sort_spec, sort_documents};

pub fn run_pipeline(mut docs: Vec<Document>, stages: &[Document]) -> Result<Vec<Document>> {
    for stage in stages {
        let (name, params) = stage
            .iter()
            .next()
            .ok_or_else(|| NexaError::InvalidQuery("empty pipeline stage".to_string()))?;
        docs = match name {
            "$match" => {
                let f = params
                    .as_document()
                    .ok_or_else(|| NexaError::InvalidQuery("$match requires a filter document".to_string()))?;
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    if filter::matches(&doc, f)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            "$sort" => {
                let spec = params
                    .as_document()
                    .ok_or_else(|| NexaError::InvalidQuery("$sort requires a spec document".to_string()))?;
                let keys = parse_sort_spec(spec);
                sort_documents(&mut docs, &keys);
                docs
            }
            "$limit" => {
                let n = params
                    .as_i64()
                    .ok_or_else(|| NexaError::InvalidQuery("$limit requires an integer".to_string()))?;
                docs.truncate(n.max(0) as usize);
                docs
            }
            "$skip" => {
                let n = params
                    .as_i64()
                    .ok_or_else(|| NexaError::InvalidQuery("$skip requires an integer".to_string()))?;
                let n = (n.max(0) as usize).min(docs.len());
                docs.split_off(n)
            }
            "$group" => group_stage(docs, params)?,
            "$project" => project_stage(docs, params)?,
            other => return Err(NexaError::InvalidQuery(format!("unknown pipeline stage: {other}"))),
        };
    }
    Ok(docs)
}

/// Resolves `"$field"` references against a document; anything else
/// (including dotted paths without the leading `$`, and literals) is
/// taken verbatim.
fn resolve_expr(doc: &Document, expr: &Value) -> Value {
    match expr {
        Value::String(s) if s.starts_with('$') => doc.get_path(&s[1..]).cloned().unwrap_or(Value::Null),
        other => other.clone(),
    }
}

fn group_stage(docs: Vec<Document>, params: &Value) -> Result<Vec<Document>> {
    let spec = params
        .as_document()
        .ok_or_else(|| NexaError::InvalidQuery("$group requires a spec document".to_string()))?;
    let id_expr = spec
        .get("_id")
        .ok_or_else(|| NexaError::InvalidQuery("$group requires an _id key expression".to_string()))?;

    let acc_specs: Vec<(String, String, Value)> = spec
        .iter()
        .filter(|(field, _)| *field != "_id")
        .map(|(field, acc)| {
            let acc_doc = acc
                .as_document()
                .ok_or_else(|| NexaError::InvalidQuery(format!("{field}: accumulator must be a document")))?;
            let (op, expr) = acc_doc
                .iter()
                .next()
                .ok_or_else(|| NexaError::InvalidQuery(format!("{field}: empty accumulator")))?;
            Ok((field.to_string(), op.to_string(), expr.clone()))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut groups: Vec<(Value, Vec<Document>)> = Vec::new();
    for doc in docs {
        let key = resolve_expr(&doc, id_expr);
        match groups.iter_mut().find(|(k, _)| k.type_order_cmp(&key) == std::cmp::Ordering::Equal) {
            Some(group) => group.1.push(doc),
            None => groups.push((key, vec![doc])),
        }
    }

    let mut results = Vec::with_capacity(groups.len());
    for (key, members) in groups {
        let mut out = Document::new();
        out.set("_id", key);
        for (field, op, expr) in &acc_specs {
            let values: Vec<Value> = members.iter().map(|d| resolve_expr(d, expr)).collect();
            out.set(field.clone(), apply_accumulator(op, &values)?);
        }
        results.push(out);
    }
    Ok(results)
}

fn apply_accumulator(op: &str, values: &[Value]) -> Result<Value> {
    match op {
        "$count" => Ok(Value::Int(values.len() as i64)),
        "$sum" => {
            let nums: Vec<f64> = values.iter().filter_map(Value::as_f64).collect();
            let sum: f64 = nums.iter().sum();
            let all_int = values.iter().all(|v| matches!(v, Value::Int(_)));
            Ok(if all_int && sum.fract() == 0.0 {
                Value::Int(sum as i64)
            } else {
                Value::Float(sum)
            })
        }
        "$avg" => {
            let nums: Vec<f64> = values.iter().filter_map(Value::as_f64).collect();
            if nums.is_empty() {
                Ok(Value::Null)
            } else {
                Ok(Value::Float(nums.iter().sum::<f64>() / nums.len() as f64))
            }
        }
        "$min" => Ok(values
            .iter()
            .min_by(|a, b| a.type_order_cmp(b))
            .cloned()
            .unwrap_or(Value::Null)),
        "$max" => Ok(values
            .iter()
            .max_by(|a, b| a.type_order_cmp(b))
            .cloned()
            .unwrap_or(Value::Null)),
        other => Err(NexaError::InvalidQuery(format!("unknown accumulator: {other}"))),
    }
}

fn truthy(v: &Value) -> bool {
    matches!(v, Value::Bool(true)) || matches!(v.as_i64(), Some(n) if n != 0)
}

/// `_id` is included unless explicitly excluded. If any non-`_id` field is
/// included, the stage is inclusion-mode (only named fields survive);
/// otherwise it's exclusion-mode (named fields are dropped).
fn project_stage(docs: Vec<Document>, params: &Value) -> Result<Vec<Document>> {
    let spec = params
        .as_document()
        .ok_or_else(|| NexaError::InvalidQuery("$project requires a spec document".to_string()))?;

    let id_included = spec.get("_id").map(truthy).unwrap_or(true);
    let non_id: Vec<(&str, &Value)> = spec.iter().filter(|(k, _)| *k != "_id").collect();
    let inclusion_mode = non_id.iter().any(|(_, v)| truthy(v));

    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        let mut projected = Document::new();
        if inclusion_mode {
            if id_included {
                if let Some(id) = doc.get("_id") {
                    projected.set("_id", id.clone());
                }
            }
            for (field, include) in &non_id {
                if truthy(include) {
                    if let Some(v) = doc.get_path(field) {
                        projected.set(field.to_string(), v.clone());
                    }
                }
            }
        } else {
            let excluded: Vec<&str> = non_id.iter().map(|(k, _)| *k).collect();
            for (field, value) in doc.iter() {
                if field == "_id" && !id_included {
                    continue;
                }
                if excluded.contains(&field) {
                    continue;
                }
                projected.set(field.to_string(), value.clone());
            }
        }
        out.push(projected);
    }
    Ok(out)
}
