//! Identity and authorization types shared across the crate.
//!
//! - [`User`]: the identity record held by an authenticated session
//! - [`Role`]: named bundle of permissions inherited by a user
//! - [`Permission`]: a `(resource, action)` pair, compared by exact value
//! - [`UserUpdate`]: partial profile fields merged by `SessionManager::update_user`
//!
//! Resource and action identifiers are opaque strings. The dashboard's known
//! pairs are catalogued in [`crate::auth::permissions::catalog`].

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

pub type UserId = Uuid;

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}

/// A grant to perform `action` on `resource`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Permission {
    pub resource: String,
    pub action: String,
}

impl Permission {
    pub fn new(resource: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            action: action.into(),
        }
    }

    pub fn matches(&self, resource: &str, action: &str) -> bool {
        self.resource == resource && self.action == action
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource, self.action)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub permissions: HashSet<Permission>,
}

impl Role {
    pub fn new(name: impl Into<String>, permissions: impl IntoIterator<Item = Permission>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            permissions: permissions.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Inactive,
    Suspended,
    #[serde(other)]
    Unknown,
}

impl UserStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, UserStatus::Active)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub role: Role,
    /// Permissions granted directly to the user, on top of the role's
    #[serde(default)]
    pub permissions: HashSet<Permission>,
    #[serde(default)]
    pub mfa_enabled: bool,
    pub status: UserStatus,
}

impl User {
    /// Merge the fields present in `update` into this record.
    pub fn apply(&mut self, update: UserUpdate) {
        if let Some(username) = update.username {
            self.username = username;
        }
        if let Some(email) = update.email {
            self.email = email;
        }
        if let Some(role) = update.role {
            self.role = role;
        }
        if let Some(permissions) = update.permissions {
            self.permissions = permissions;
        }
        if let Some(mfa_enabled) = update.mfa_enabled {
            self.mfa_enabled = mfa_enabled;
        }
        if let Some(status) = update.status {
            self.status = status;
        }
    }
}

/// Partial profile update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserUpdate {
    pub username: Option<String>,
    pub email: Option<String>,
    pub role: Option<Role>,
    pub permissions: Option<HashSet<Permission>>,
    pub mfa_enabled: Option<bool>,
    pub status: Option<UserStatus>,
}
