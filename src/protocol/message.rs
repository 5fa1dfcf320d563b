//! Request/response payload shapes carried inside a frame.
//! Which struct a payload decodes into is determined by the frame
//! header's message type, not by a tag inside the payload itself.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::auth::user::{Permission, Role};
use crate::document::value::Document;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConnectRequest {
    pub username: Option<String>,
    pub password: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRequest {
    pub database: String,
    pub collection: String,
    pub document: Document,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadRequest {
    pub database: String,
    pub collection: String,
    pub doc_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub database: String,
    pub collection: String,
    pub doc_id: String,
    pub patch: Document,
    /// Full replacement rather than a shallow merge.
    #[serde(default)]
    pub replace: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub database: String,
    pub collection: String,
    pub doc_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub database: String,
    pub collection: String,
    #[serde(default)]
    pub filter: Document,
    pub sort: Option<Document>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
    /// Present to run `count` instead of `find` without a separate
    /// message type.
    #[serde(default)]
    pub count_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateRequest {
    pub database: String,
    pub collection: String,
    pub pipeline: Vec<Document>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorSearchRequest {
    pub database: String,
    pub collection: String,
    pub vector: Vec<f32>,
    pub k: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchWriteRequest {
    pub database: String,
    pub collection: String,
    pub documents: Vec<Document>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PingRequest {}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DisconnectRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDatabaseRequest {
    pub database: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropDatabaseRequest {
    pub database: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ListDatabasesRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseStatsRequest {
    pub database: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
    pub role: Role,
    #[serde(default)]
    pub database_permissions: HashMap<String, Permission>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateUserRequest {
    pub username: String,
    pub role: Option<Role>,
    pub database_permissions: Option<HashMap<String, Permission>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteUserRequest {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ListUsersRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateIndexRequest {
    pub database: String,
    pub collection: String,
    pub field: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildVectorIndexRequest {
    pub database: String,
    pub collection: String,
    pub dimension: usize,
}

/// Every successful response carries its result as a `Document` — the
/// same flexible value model used for stored documents, so the wire
/// format doesn't need a dedicated struct per request kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}
