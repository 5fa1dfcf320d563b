//! Filter predicate evaluation.
//!
//! A filter is itself a [`Document`]: each top-level field is either an
//! operator predicate (`{field: {$op: operand, ...}}`, implicit AND
//! across operators) or a plain equality (`{field: value}`), with
//! `$and`/`$or` as logical combinators taking arrays of sub-filters.
//! Sibling top-level keys are implicitly ANDed.

use std::cmp::Ordering;

use regex::Regex;

use crate::document::value::{Document, Value};
use crate::error::{NexaError, Result};

pub fn matches(doc: &Document, filter: &Document) -> Result<bool> {
    for (key, operand) in filter.iter() {
        let ok = match key {
            "$and" => {
                let subfilters = as_subfilters(operand)?;
                let mut all = true;
                for sub in &subfilters {
                    if !matches(doc, sub)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let subfilters = as_subfilters(operand)?;
                let mut any = subfilters.is_empty();
                for sub in &subfilters {
                    if matches(doc, sub)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            field => match_field(doc, field, operand)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn as_subfilters(operand: &Value) -> Result<Vec<Document>> {
    let items = operand
        .as_array()
        .ok_or_else(|| NexaError::InvalidQuery("$and/$or requires an array of filters".to_string()))?;
    items
        .iter()
        .map(|v| {
            v.as_document()
                .cloned()
                .ok_or_else(|| NexaError::InvalidQuery("$and/$or elements must be filter documents".to_string()))
        })
        .collect()
}

fn is_operator_document(doc: &Document) -> bool {
    !doc.is_empty() && doc.iter().all(|(k, _)| k.starts_with('$'))
}

fn match_field(doc: &Document, field: &str, operand: &Value) -> Result<bool> {
    let actual = doc.get_path(field);
    if let Value::Document(opdoc) = operand {
        if is_operator_document(opdoc) {
            for (op, val) in opdoc.iter() {
                if !apply_operator(actual, op, val)? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }
    }
    Ok(equals(actual, operand))
}

/// Equality under the total type order; a missing field never
/// satisfies equality, including against an explicit `null` operand.
fn equals(actual: Option<&Value>, operand: &Value) -> bool {
    actual
        .map(|v| v.type_order_cmp(operand) == Ordering::Equal)
        .unwrap_or(false)
}

fn apply_operator(actual: Option<&Value>, op: &str, operand: &Value) -> Result<bool> {
    let result = match op {
        "$eq" => equals(actual, operand),
        "$ne" => !equals(actual, operand),
        "$gt" => actual
            .map(|v| v.type_order_cmp(operand) == Ordering::Greater)
            .unwrap_or(false),
        "$gte" => actual
            .map(|v| matches!(v.type_order_cmp(operand), Ordering::Greater | Ordering::Equal))
            .unwrap_or(false),
        "$lt" => actual
            .map(|v| v.type_order_cmp(operand) == Ordering::Less)
            .unwrap_or(false),
        "$lte" => actual
            .map(|v| matches!(v.type_order_cmp(operand), Ordering::Less | Ordering::Equal))
            .unwrap_or(false),
        "$in" => {
            let candidates = operand
                .as_array()
                .ok_or_else(|| NexaError::InvalidQuery("$in requires an array".to_string()))?;
            actual
                .map(|v| candidates.iter().any(|c| c.type_order_cmp(v) == Ordering::Equal))
                .unwrap_or(false)
        }
        "$nin" => {
            let candidates = operand
                .as_array()
                .ok_or_else(|| NexaError::InvalidQuery("$nin requires an array".to_string()))?;
            !actual
                .map(|v| candidates.iter().any(|c| c.type_order_cmp(v) == Ordering::Equal))
                .unwrap_or(false)
        }
        "$regex" => {
            let pattern = operand
                .as_str()
                .ok_or_else(|| NexaError::InvalidQuery("$regex requires a string pattern".to_string()))?;
            let re = Regex::new(pattern).map_err(|e| NexaError::InvalidQuery(format!("invalid regex: {e}")))?;
            actual.and_then(Value::as_str).map(|s| re.is_match(s)).unwrap_or(false)
        }
        "$exists" => {
            let want = match operand {
                Value::Bool(b) => *b,
                _ => return Err(NexaError::InvalidQuery("$exists requires a boolean".to_string())),
            };
            actual.is_some() == want
        }
        other => return Err(NexaError::InvalidQuery(format!("unknown operator: {other}"))),
    };
    Ok(result)
}

/// True if every top-level key of `filter` is an equality (or `$and` of
/// equalities) on `field`, letting a caller decide whether an index probe
/// alone can answer it instead of falling back to a residual scan.
pub fn equality_value_for<'a>(filter: &'a Document, field: &str) -> Option<&'a Value> {
    for (key, operand) in filter.iter() {
        if key != field {
            continue;
        }
        if let Value::Document(opdoc) = operand {
            if is_operator_document(opdoc) {
                return opdoc.get("$eq");
            }
        }
        return Some(operand);
    }
    None
}

/// If `field`'s top-level predicate is an operator document built only
/// from `$gte`/`$lt` (the half-open bounds a sorted-key range probe can
/// answer directly), returns `(min, max)`. Any other operator present
/// (`$gt`, `$lte`, `$ne`, ...) means the index alone can't safely narrow
/// the candidate set to this shape, so the caller should fall back to a
/// residual scan instead.
pub fn range_bounds_for<'a>(filter: &'a Document, field: &str) -> Option<(Option<&'a Value>, Option<&'a Value>)> {
    for (key, operand) in filter.iter() {
        if key != field {
            continue;
        }
        let Value::Document(opdoc) = operand else {
            return None;
        };
        if !is_operator_document(opdoc) {
            return None;
        }
        if !opdoc.iter().all(|(op, _)| op == "$gte" || op == "$lt") {
            return None;
        }
        let min = opdoc.get("$gte");
        let max = opdoc.get("$lt");
        if min.is_none() && max.is_none() {
            return None;
        }
        return Some((min, max));
    }
    None
}
