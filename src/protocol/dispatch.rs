//! Routes one decoded frame to the right catalog/credential-store call,
//! enforcing the permission each operation requires: `read`
//! for lookups/queries/exports, `write` for insert/update/delete/batch/
//! import, `admin` for create/drop database and HNSW rebuild. User
//! management and the database listing are global-admin operations since
//! they have no single database to scope a per-database grant against.

use crate::auth::user::{Permission, Role, UserSummary};
use crate::auth::CredentialStore;
use crate::document::database::Catalog;
use crate::document::value::Document;
use crate::error::{NexaError, Result};
use crate::protocol::codec::{decode_payload, encode_payload};
use crate::protocol::frame::MessageType;
use crate::protocol::message::*;
use crate::protocol::response;
use crate::protocol::session::Session;

pub struct Dispatcher {
    catalog: std::sync::Arc<Catalog>,
    credentials: std::sync::Arc<CredentialStore>,
}

impl Dispatcher {
    pub fn new(catalog: std::sync::Arc<Catalog>, credentials: std::sync::Arc<CredentialStore>) -> Self {
        Self { catalog, credentials }
    }

    /// Handles one request, never propagating an `Err` out: everything is
    /// turned into a response frame, with the message type carrying the
    /// outcome (`Success`/`NotFound`/`Duplicate`/`Error`).
    pub fn handle(&self, session: &mut Session, message_type: MessageType, payload: &[u8]) -> (MessageType, Vec<u8>) {
        session.touch();
        match self.handle_inner(session, message_type, payload) {
            Ok(response) => response,
            Err(e) => {
                let body = ErrorBody {
                    code: e.code().as_str().to_string(),
                    message: e.to_string(),
                };
                let bytes = encode_payload(&body).unwrap_or_default();
                let response_type = match e {
                    NexaError::NotFound => MessageType::NotFound,
                    NexaError::Duplicate(_) => MessageType::Duplicate,
                    _ => MessageType::Error,
                };
                (response_type, bytes)
            }
        }
    }

    fn require_database_permission(&self, session: &Session, database: &str, required: Permission) -> Result<()> {
        let user = session
            .user
            .as_ref()
            .ok_or_else(|| NexaError::Unauthorized("no authenticated session".to_string()))?;
        if user.authorized_for(database, required) {
            Ok(())
        } else {
            Err(NexaError::Unauthorized(database.to_string()))
        }
    }

    fn require_global_admin(&self, session: &Session) -> Result<()> {
        match session.user.as_ref() {
            Some(user) if user.role == Role::Admin => Ok(()),
            Some(_) => Err(NexaError::Unauthorized("requires the admin role".to_string())),
            None => Err(NexaError::Unauthorized("no authenticated session".to_string())),
        }
    }

    fn handle_inner(&self, session: &mut Session, message_type: MessageType, payload: &[u8]) -> Result<(MessageType, Vec<u8>)> {
        if message_type == MessageType::Connect {
            return self.handle_connect(session, payload);
        }
        if !session.is_authenticated() {
            return Err(NexaError::Unauthorized("connect before issuing requests".to_string()));
        }
        match message_type {
            MessageType::Ping => ok(MessageType::Pong, &response::empty()),
            MessageType::Disconnect => {
                session.close();
                ok(MessageType::Success, &response::empty())
            }
            MessageType::Create => self.handle_create(session, payload),
            MessageType::Read => self.handle_read(session, payload),
            MessageType::Update => self.handle_update(session, payload),
            MessageType::Delete => self.handle_delete(session, payload),
            MessageType::Query => self.handle_query(session, payload),
            MessageType::Aggregate => self.handle_aggregate(session, payload),
            MessageType::VectorSearch => self.handle_vector_search(session, payload),
            MessageType::BatchWrite => self.handle_batch_write(session, payload),
            MessageType::CreateDatabase => self.handle_create_database(session, payload),
            MessageType::DropDatabase => self.handle_drop_database(session, payload),
            MessageType::ListDatabases => self.handle_list_databases(session),
            MessageType::DatabaseStats => self.handle_database_stats(session, payload),
            MessageType::CreateUser => self.handle_create_user(session, payload),
            MessageType::UpdateUser => self.handle_update_user(session, payload),
            MessageType::DeleteUser => self.handle_delete_user(session, payload),
            MessageType::ListUsers => self.handle_list_users(session),
            MessageType::CreateIndex => self.handle_create_index(session, payload),
            MessageType::BuildVectorIndex => self.handle_build_vector_index(session, payload),
            MessageType::QueryToon | MessageType::ExportToon | MessageType::ImportToon => {
                Err(NexaError::InvalidMessage("TOON codec is out of scope for this engine".to_string()))
            }
            other => Err(NexaError::InvalidMessage(format!("{other:?} is not a client request"))),
        }
    }

    fn handle_connect(&self, session: &mut Session, payload: &[u8]) -> Result<(MessageType, Vec<u8>)> {
        let req: ConnectRequest = decode_payload(payload)?;
        let user = if let Some(api_key) = req.api_key {
            self.credentials.authenticate_api_key(&api_key)?
        } else {
            let username = req
                .username
                .ok_or_else(|| NexaError::InvalidMessage("connect requires username/password or api_key".to_string()))?;
            let password = req
                .password
                .ok_or_else(|| NexaError::InvalidMessage("connect requires username/password or api_key".to_string()))?;
            self.credentials.authenticate_password(&username, &password)?
        };
        let summary = UserSummary::from(&user);
        session.authenticate(user);
        ok(MessageType::Success, &response::user_summary_result(summary))
    }

    fn handle_create(&self, session: &Session, payload: &[u8]) -> Result<(MessageType, Vec<u8>)> {
        let req: CreateRequest = decode_payload(payload)?;
        self.require_database_permission(session, &req.database, Permission::Write)?;
        let id = self
            .catalog
            .database(&req.database)?
            .collection(&req.collection)?
            .insert(req.document)?;
        ok(MessageType::Success, &response::id_result(id))
    }

    fn handle_read(&self, session: &Session, payload: &[u8]) -> Result<(MessageType, Vec<u8>)> {
        let req: ReadRequest = decode_payload(payload)?;
        self.require_database_permission(session, &req.database, Permission::Read)?;
        let doc = self
            .catalog
            .database(&req.database)?
            .collection(&req.collection)?
            .get(&req.doc_id)?;
        ok(MessageType::Success, &doc)
    }

    fn handle_update(&self, session: &Session, payload: &[u8]) -> Result<(MessageType, Vec<u8>)> {
        let req: UpdateRequest = decode_payload(payload)?;
        self.require_database_permission(session, &req.database, Permission::Write)?;
        let collection = self.catalog.database(&req.database)?.collection(&req.collection)?;
        if req.replace {
            collection.replace(&req.doc_id, req.patch)?;
        } else {
            collection.update(&req.doc_id, &req.patch)?;
        }
        ok(MessageType::Success, &response::empty())
    }

    fn handle_delete(&self, session: &Session, payload: &[u8]) -> Result<(MessageType, Vec<u8>)> {
        let req: DeleteRequest = decode_payload(payload)?;
        self.require_database_permission(session, &req.database, Permission::Write)?;
        self.catalog
            .database(&req.database)?
            .collection(&req.collection)?
            .delete(&req.doc_id)?;
        ok(MessageType::Success, &response::empty())
    }

    fn handle_query(&self, session: &Session, payload: &[u8]) -> Result<(MessageType, Vec<u8>)> {
        let req: QueryRequest = decode_payload(payload)?;
        self.require_database_permission(session, &req.database, Permission::Read)?;
        let collection = self.catalog.database(&req.database)?.collection(&req.collection)?;
        if req.count_only {
            let count = collection.count(&req.filter)?;
            return ok(MessageType::Success, &response::count_result(count));
        }
        let docs = collection.find(&req.filter, req.sort.as_ref(), req.skip, req.limit)?;
        ok(MessageType::Success, &response::documents_result(docs))
    }

    fn handle_aggregate(&self, session: &Session, payload: &[u8]) -> Result<(MessageType, Vec<u8>)> {
        let req: AggregateRequest = decode_payload(payload)?;
        self.require_database_permission(session, &req.database, Permission::Read)?;
        let docs = self
            .catalog
            .database(&req.database)?
            .collection(&req.collection)?
            .aggregate(&req.pipeline)?;
        ok(MessageType::Success, &response::documents_result(docs))
    }

    fn handle_vector_search(&self, session: &Session, payload: &[u8]) -> Result<(MessageType, Vec<u8>)> {
        let req: VectorSearchRequest = decode_payload(payload)?;
        self.require_database_permission(session, &req.database, Permission::Read)?;
        let matches = self
            .catalog
            .database(&req.database)?
            .collection(&req.collection)?
            .search_vector(&req.vector, req.k)?;
        ok(MessageType::Success, &response::vector_matches_result(matches))
    }

    fn handle_batch_write(&self, session: &Session, payload: &[u8]) -> Result<(MessageType, Vec<u8>)> {
        let req: BatchWriteRequest = decode_payload(payload)?;
        self.require_database_permission(session, &req.database, Permission::Write)?;
        let ids = self
            .catalog
            .database(&req.database)?
            .collection(&req.collection)?
            .batch_write(req.documents)?;
        ok(MessageType::Success, &response::ids_result(ids))
    }

    fn handle_create_database(&self, session: &Session, payload: &[u8]) -> Result<(MessageType, Vec<u8>)> {
        let req: CreateDatabaseRequest = decode_payload(payload)?;
        self.require_database_permission(session, &req.database, Permission::Admin)?;
        self.catalog.create_database(&req.database)?;
        ok(MessageType::Success, &response::empty())
    }

    fn handle_drop_database(&self, session: &Session, payload: &[u8]) -> Result<(MessageType, Vec<u8>)> {
        let req: DropDatabaseRequest = decode_payload(payload)?;
        self.require_database_permission(session, &req.database, Permission::Admin)?;
        self.catalog.drop_database(&req.database)?;
        ok(MessageType::Success, &response::empty())
    }

    fn handle_list_databases(&self, session: &Session) -> Result<(MessageType, Vec<u8>)> {
        self.require_global_admin(session)?;
        let names = self.catalog.list_databases()?;
        ok(MessageType::Success, &response::strings_result("databases", names))
    }

    fn handle_database_stats(&self, session: &Session, payload: &[u8]) -> Result<(MessageType, Vec<u8>)> {
        let req: DatabaseStatsRequest = decode_payload(payload)?;
        self.require_database_permission(session, &req.database, Permission::Read)?;
        let stats = self.catalog.database(&req.database)?.stats()?;
        ok(MessageType::Success, &response::database_stats_result(stats))
    }

    fn handle_create_user(&self, session: &Session, payload: &[u8]) -> Result<(MessageType, Vec<u8>)> {
        self.require_global_admin(session)?;
        let req: CreateUserRequest = decode_payload(payload)?;
        let user = self
            .credentials
            .create_user(&req.username, &req.password, req.role, req.database_permissions)?;
        let api_key = user.api_key.clone();
        ok(
            MessageType::Success,
            &response::created_user_result(UserSummary::from(&user), api_key),
        )
    }

    fn handle_update_user(&self, session: &Session, payload: &[u8]) -> Result<(MessageType, Vec<u8>)> {
        self.require_global_admin(session)?;
        let req: UpdateUserRequest = decode_payload(payload)?;
        let user = self.credentials.update_user(&req.username, req.role, req.database_permissions)?;
        ok(MessageType::Success, &response::user_summary_result(UserSummary::from(&user)))
    }

    fn handle_delete_user(&self, session: &Session, payload: &[u8]) -> Result<(MessageType, Vec<u8>)> {
        self.require_global_admin(session)?;
        let req: DeleteUserRequest = decode_payload(payload)?;
        self.credentials.delete_user(&req.username)?;
        ok(MessageType::Success, &response::empty())
    }

    fn handle_list_users(&self, session: &Session) -> Result<(MessageType, Vec<u8>)> {
        self.require_global_admin(session)?;
        let names = self.credentials.list_users()?;
        ok(MessageType::Success, &response::strings_result("users", names))
    }

    fn handle_create_index(&self, session: &Session, payload: &[u8]) -> Result<(MessageType, Vec<u8>)> {
        let req: CreateIndexRequest = decode_payload(payload)?;
        self.require_database_permission(session, &req.database, Permission::Write)?;
        self.catalog
            .database(&req.database)?
            .collection(&req.collection)?
            .create_index(&req.field)?;
        ok(MessageType::Success, &response::empty())
    }

    fn handle_build_vector_index(&self, session: &Session, payload: &[u8]) -> Result<(MessageType, Vec<u8>)> {
        let req: BuildVectorIndexRequest = decode_payload(payload)?;
        self.require_database_permission(session, &req.database, Permission::Admin)?;
        self.catalog
            .database(&req.database)?
            .collection(&req.collection)?
            .create_vector_index(req.dimension)?;
        ok(MessageType::Success, &response::empty())
    }
}

fn ok<T: serde::Serialize>(message_type: MessageType, body: &T) -> Result<(MessageType, Vec<u8>)> {
    Ok((message_type, encode_payload(body)?))
}
