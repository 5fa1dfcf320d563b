//! Persists users through the same storage engine as data, under the
//! `meta:user:` and `meta:apikey:` prefixes, so credentials
//! survive restart identically to documents.

use std::sync::Arc;

use chrono::Utc;
use tracing::warn;

use crate::auth::credentials::{generate_api_key, generate_salt, hash_password, verify_api_key, verify_password};
use crate::auth::user::{Permission, Role, User};
use crate::config::SecurityConfig;
use crate::document::keys::{meta_apikey_key, meta_user_key, meta_user_prefix};
use crate::error::{NexaError, Result};
use crate::storage::engine::StorageEngine;
use crate::storage::wal::{Durability, WalRecord};

pub const ROOT_USERNAME: &str = "root";

pub struct CredentialStore {
    engine: Arc<StorageEngine>,
    pbkdf2_iterations: u32,
}

fn is_valid_username(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl CredentialStore {
    /// Opens the store, bootstrapping `root` on a fresh engine. If
    /// `security.root_password_initial` is unset, a random password is
    /// generated and logged once so the operator can retrieve it; root
    /// bootstrap never silently picks a fixed default.
    pub fn open(engine: Arc<StorageEngine>, security: &SecurityConfig) -> Result<Self> {
        let store = Self {
            engine,
            pbkdf2_iterations: security.pbkdf2_iterations,
        };
        if store.get_user(ROOT_USERNAME).is_err() {
            let password = security
                .root_password_initial
                .clone()
                .unwrap_or_else(generate_api_key);
            if security.root_password_initial.is_none() {
                warn!(password = %password, "bootstrapped root with a generated password; record it now");
            }
            store.create_user_internal(ROOT_USERNAME, &password, Role::Admin, Default::default())?;
        }
        Ok(store)
    }

    fn create_user_internal(
        &self,
        username: &str,
        password: &str,
        role: Role,
        database_permissions: std::collections::HashMap<String, Permission>,
    ) -> Result<User> {
        let salt = generate_salt();
        let password_hash = hash_password(password, &salt, self.pbkdf2_iterations);
        let api_key = generate_api_key();
        let user = User {
            username: username.to_string(),
            password_hash,
            password_salt: salt,
            pbkdf2_iterations: self.pbkdf2_iterations,
            api_key,
            role,
            database_permissions,
            created_at: Utc::now().to_rfc3339(),
            last_login: None,
        };
        self.persist(&user, true)?;
        Ok(user)
    }

    fn persist(&self, user: &User, is_new: bool) -> Result<()> {
        let bytes = rmp_serde::to_vec_named(user).map_err(|e| NexaError::Internal(e.to_string()))?;
        let mut ops = vec![WalRecord::put(meta_user_key(&user.username), bytes)];
        if is_new {
            ops.push(WalRecord::put(
                meta_apikey_key(&user.api_key),
                user.username.clone().into_bytes(),
            ));
        }
        self.engine.batch(ops, Durability::Sync)
    }

    pub fn create_user(
        &self,
        username: &str,
        password: &str,
        role: Role,
        database_permissions: std::collections::HashMap<String, Permission>,
    ) -> Result<User> {
        if !is_valid_username(username) {
            return Err(NexaError::InvalidMessage(format!("invalid username: {username}")));
        }
        if self.get_user(username).is_ok() {
            return Err(NexaError::Duplicate(username.to_string()));
        }
        self.create_user_internal(username, password, role, database_permissions)
    }

    pub fn get_user(&self, username: &str) -> Result<User> {
        let bytes = self.engine.get(&meta_user_key(username))?.ok_or(NexaError::NotFound)?;
        rmp_serde::from_slice(&bytes).map_err(|e| NexaError::Internal(e.to_string()))
    }

    pub fn list_users(&self) -> Result<Vec<String>> {
        let prefix = meta_user_prefix();
        let entries = self.engine.scan_prefix(&prefix)?;
        Ok(entries
            .into_iter()
            .map(|(key, _)| String::from_utf8_lossy(&key[prefix.len()..]).to_string())
            .collect())
    }

    /// Updates role and/or per-database permissions; password and API
    /// key are changed only through their own dedicated operations.
    pub fn update_user(
        &self,
        username: &str,
        role: Option<Role>,
        database_permissions: Option<std::collections::HashMap<String, Permission>>,
    ) -> Result<User> {
        let mut user = self.get_user(username)?;
        if let Some(role) = role {
            user.role = role;
        }
        if let Some(perms) = database_permissions {
            user.database_permissions = perms;
        }
        self.persist(&user, false)?;
        Ok(user)
    }

    pub fn change_password(&self, username: &str, new_password: &str) -> Result<()> {
        let mut user = self.get_user(username)?;
        let salt = generate_salt();
        user.password_salt = salt.clone();
        user.password_hash = hash_password(new_password, &salt, self.pbkdf2_iterations);
        self.persist(&user, false)
    }

    pub fn delete_user(&self, username: &str) -> Result<()> {
        if username == ROOT_USERNAME {
            return Err(NexaError::PermissionDenied("root cannot be deleted".to_string()));
        }
        let user = self.get_user(username)?;
        let ops = vec![
            WalRecord::delete(meta_user_key(username)),
            WalRecord::delete(meta_apikey_key(&user.api_key)),
        ];
        self.engine.batch(ops, Durability::Sync)
    }

    pub fn authenticate_password(&self, username: &str, password: &str) -> Result<User> {
        let mut user = self.get_user(username)?;
        if !verify_password(password, &user.password_salt, user.pbkdf2_iterations, &user.password_hash) {
            return Err(NexaError::Unauthorized(username.to_string()));
        }
        user.last_login = Some(Utc::now().to_rfc3339());
        self.persist(&user, false)?;
        Ok(user)
    }

    pub fn authenticate_api_key(&self, api_key: &str) -> Result<User> {
        let username_bytes = self
            .engine
            .get(&meta_apikey_key(api_key))?
            .ok_or_else(|| NexaError::Unauthorized("unknown api key".to_string()))?;
        let username = String::from_utf8_lossy(&username_bytes).to_string();
        let mut user = self.get_user(&username)?;
        if !verify_api_key(api_key, &user.api_key) {
            return Err(NexaError::Unauthorized(username));
        }
        user.last_login = Some(Utc::now().to_rfc3339());
        self.persist(&user, false)?;
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use tempfile::tempdir;

    fn store(dir: &std::path::Path) -> CredentialStore {
        let engine = StorageEngine::open(StorageConfig {
            data_dir: dir.to_path_buf(),
            ..StorageConfig::default()
        })
        .unwrap();
        CredentialStore::open(
            engine,
            &SecurityConfig {
                root_password_initial: Some("bootstrap-pw".to_string()),
                pbkdf2_iterations: 1000,
            },
        )
        .unwrap()
    }

    #[test]
    fn root_exists_after_open_and_authenticates() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let user = store.authenticate_password("root", "bootstrap-pw").unwrap();
        assert_eq!(user.role, Role::Admin);
    }

    #[test]
    fn root_cannot_be_deleted() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.delete_user("root").is_err());
    }

    #[test]
    fn create_and_authenticate_by_api_key() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let user = store
            .create_user("alice", "pw", Role::Write, Default::default())
            .unwrap();
        let authed = store.authenticate_api_key(&user.api_key).unwrap();
        assert_eq!(authed.username, "alice");
    }

    #[test]
    fn wrong_password_is_rejected() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.create_user("bob", "correct", Role::Read, Default::default()).unwrap();
        assert!(store.authenticate_password("bob", "wrong").is_err());
    }

    #[test]
    fn duplicate_username_is_rejected() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.create_user("bob", "pw", Role::Read, Default::default()).unwrap();
        assert!(store.create_user("bob", "pw2", Role::Read, Default::default()).is_err());
    }
}
