//! Ordering for `find` results and the `$sort` aggregation stage (spec
//! §4.9). Sort is a stable ordered list of `(field, direction)` with ties
//! broken by `_id` so results are deterministic even when the sort key
//! doesn't uniquely identify a document.

use std::cmp::Ordering;

use crate::document::value::{Document, Value};

#[derive(Clone, Debug)]
pub struct SortKey {
    pub field: String,
    pub descending: bool,
}

/// Parses a `$sort`-stage document (`{field: 1 | -1, ...}`) into ordered
/// keys, preserving the field order the caller wrote them in.
pub fn parse_sort_spec(spec: &Document) -> Vec<SortKey> {
    spec.iter()
        .map(|(field, dir)| SortKey {
            field: field.to_string(),
            descending: matches!(dir.as_i64(), Some(d) if d < 0),
        })
        .collect()
}

/// Missing sort keys sort before present ones regardless of direction, so
/// that reversing a sort doesn't also flip which end the gaps cluster at.
fn compare_optional(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.type_order_cmp(y),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

pub fn sort_documents(docs: &mut [Document], keys: &[SortKey]) {
    docs.sort_by(|a, b| {
        for key in keys {
            let av = a.get_path(&key.field);
            let bv = b.get_path(&key.field);
            let mut cmp = compare_optional(av, bv);
            if key.descending {
                cmp = cmp.reverse();
            }
            if cmp != Ordering::Equal {
                return cmp;
            }
        }
        a.get("_id").and_then(Value::as_str).cmp(&b.get("_id").and_then(Value::as_str))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, age: i64) -> Document {
        let mut d = Document::new();
        d.set("_id", Value::String(id.to_string()));
        d.set("age", Value::Int(age));
        d
    }

    #[test]
    fn sorts_ascending_by_default() {
        let mut docs = vec![doc("a", 30), doc("b", 10), doc("c", 20)];
        sort_documents(&mut docs, &[SortKey { field: "age".to_string(), descending: false }]);
        let ages: Vec<i64> = docs.iter().map(|d| d.get("age").unwrap().as_i64().unwrap()).collect();
        assert_eq!(ages, vec![10, 20, 30]);
    }

    #[test]
    fn descending_reverses_order() {
        let mut docs = vec![doc("a", 30), doc("b", 10), doc("c", 20)];
        sort_documents(&mut docs, &[SortKey { field: "age".to_string(), descending: true }]);
        let ages: Vec<i64> = docs.iter().map(|d| d.get("age").unwrap().as_i64().unwrap()).collect();
        assert_eq!(ages, vec![30, 20, 10]);
    }

    #[test]
    fn ties_break_by_id() {
        let mut docs = vec![doc("b", 10), doc("a", 10)];
        sort_documents(&mut docs, &[SortKey { field: "age".to_string(), descending: false }]);
        let ids: Vec<&str> = docs.iter().map(|d| d.get("_id").unwrap().as_str().unwrap()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn parses_sort_spec_preserving_field_order() {
        let mut spec = Document::new();
        spec.set("age", Value::Int(-1));
        spec.set("name", Value::Int(1));
        let keys = parse_sort_spec(&spec);
        assert_eq!(keys[0].field, "age");
        assert!(keys[0].descending);
        assert_eq!(keys[1].field, "name");
        assert!(!keys[1].descending);
    }
}
