//! Response payloads. Every successful response carries its
//! result as a single `Document` — the same flexible value model used for
//! stored documents — keyed by the frame header's message type
//! (`Success`/`NotFound`/`Duplicate`/`Pong`) rather than by a tag in the
//! payload itself; `Error` responses carry an [`ErrorBody`] instead.

use crate::document::database::DatabaseStats;
use crate::document::value::{Document, Value};
use crate::auth::user::UserSummary;

pub fn ids_result(ids: Vec<String>) -> Document {
    let mut doc = Document::new();
    doc.set("ids", Value::Array(ids.into_iter().map(Value::String).collect()));
    doc
}

pub fn id_result(id: String) -> Document {
    let mut doc = Document::new();
    doc.set("_id", Value::String(id));
    doc
}

pub fn documents_result(docs: Vec<Document>) -> Document {
    let mut doc = Document::new();
    doc.set("results", Value::Array(docs.into_iter().map(Value::Document).collect()));
    doc
}

pub fn count_result(count: usize) -> Document {
    let mut doc = Document::new();
    doc.set("count", Value::Int(count as i64));
    doc
}

pub fn strings_result(field: &str, values: Vec<String>) -> Document {
    let mut doc = Document::new();
    doc.set(field, Value::Array(values.into_iter().map(Value::String).collect()));
    doc
}

pub fn vector_matches_result(matches: Vec<(String, f32)>) -> Document {
    let mut doc = Document::new();
    let results = matches
        .into_iter()
        .map(|(doc_id, score)| {
            let mut m = Document::new();
            m.set("_id", Value::String(doc_id));
            m.set("score", Value::Float(score as f64));
            Value::Document(m)
        })
        .collect();
    doc.set("results", Value::Array(results));
    doc
}

pub fn database_stats_result(stats: DatabaseStats) -> Document {
    let mut doc = Document::new();
    doc.set("name", Value::String(stats.name));
    doc.set(
        "collections",
        Value::Array(stats.collections.into_iter().map(Value::String).collect()),
    );
    doc.set("document_count", Value::Int(stats.document_count as i64));
    doc
}

pub fn user_summary_result(summary: UserSummary) -> Document {
    let mut doc = Document::new();
    doc.set("username", Value::String(summary.username));
    doc.set("role", Value::String(format!("{:?}", summary.role).to_lowercase()));
    let mut perms = Document::new();
    for (db, perm) in summary.database_permissions {
        perms.set(db, Value::String(format!("{perm:?}").to_lowercase()));
    }
    doc.set("database_permissions", Value::Document(perms));
    doc.set("created_at", Value::String(summary.created_at));
    doc.set(
        "last_login",
        summary.last_login.map(Value::String).unwrap_or(Value::Null),
    );
    doc
}

pub fn created_user_result(summary: UserSummary, api_key: String) -> Document {
    let mut doc = user_summary_result(summary);
    doc.set("api_key", Value::String(api_key));
    doc
}

pub fn empty() -> Document {
    Document::new()
}
