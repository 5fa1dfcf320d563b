//! User record and role/permission model.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Write,
    Read,
    Guest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Admin,
}

impl Permission {
    /// Whether holding `self` satisfies a requirement of `required`
    ///.
    pub fn satisfies(&self, required: Permission) -> bool {
        *self >= required
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub password_hash: Vec<u8>,
    pub password_salt: Vec<u8>,
    pub pbkdf2_iterations: u32,
    pub api_key: String,
    pub role: Role,
    pub database_permissions: HashMap<String, Permission>,
    pub created_at: String,
    pub last_login: Option<String>,
}

impl User {
    /// Spec §4.11: "admin role bypasses; otherwise the requested
    /// operation's required permission... must be present for that
    /// database." Only the global `admin` role bypasses — `write`/
    /// `read`/`guest` fall through to the per-database permission map.
    pub fn authorized_for(&self, database: &str, required: Permission) -> bool {
        if self.role == Role::Admin {
            return true;
        }
        self.database_permissions
            .get(database)
            .is_some_and(|granted| granted.satisfies(required))
    }
}

/// A redacted view of [`User`] safe to put on the wire: no password hash,
/// salt, or API key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSummary {
    pub username: String,
    pub role: Role,
    pub database_permissions: HashMap<String, Permission>,
    pub created_at: String,
    pub last_login: Option<String>,
}

impl From<&User> for UserSummary {
    fn from(u: &User) -> Self {
        Self {
            username: u.username.clone(),
            role: u.role,
            database_permissions: u.database_permissions.clone(),
            created_at: u.created_at.clone(),
            last_login: u.last_login.clone(),
        }
    }
}
