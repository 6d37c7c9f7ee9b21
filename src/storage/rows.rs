//! Row shapes of the user-management tables the harness reads back.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::StorageKey;

/// Table names.
pub mod tables {
    pub const USERS: &str = "users";
    pub const STUDENTS: &str = "students";
    pub const PARENTS: &str = "parents";
    pub const STUDENT_PARENTS: &str = "student_parents";
    pub const STAFF: &str = "staff";
    pub const USER_GROUPS: &str = "user_groups";
    pub const GRANTED_ROLES: &str = "granted_roles";
    pub const USER_GROUP_MEMBERS: &str = "user_group_members";
    pub const USER_ACCESS_PATHS: &str = "user_access_paths";
    pub const TAGGED_USERS: &str = "tagged_users";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRow {
    pub user_id: String,
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub phone_number: String,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub birthday: Option<NaiveDate>,
    /// `student`, `parent` or `staff`.
    pub user_role: String,
    pub resource_path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserRow {
    pub fn key(&self) -> StorageKey {
        StorageKey::new(&self.resource_path, tables::USERS, &self.user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentRow {
    pub student_id: String,
    pub school_id: i32,
    pub current_grade: i32,
    pub enrollment_status: String,
    #[serde(default)]
    pub student_external_id: String,
    #[serde(default)]
    pub student_note: String,
    pub resource_path: String,
}

impl StudentRow {
    pub fn key(&self) -> StorageKey {
        StorageKey::new(&self.resource_path, tables::STUDENTS, &self.student_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRow {
    pub parent_id: String,
    pub school_id: i32,
    pub resource_path: String,
}

impl ParentRow {
    pub fn key(&self) -> StorageKey {
        StorageKey::new(&self.resource_path, tables::PARENTS, &self.parent_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentParentRow {
    pub student_id: String,
    pub parent_id: String,
    pub relationship: String,
}

impl StudentParentRow {
    pub fn key(&self, tenant_id: &str) -> StorageKey {
        StorageKey::new(
            tenant_id,
            tables::STUDENT_PARENTS,
            format!("{}:{}", self.student_id, self.parent_id),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffRow {
    pub staff_id: String,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub remarks: String,
    pub resource_path: String,
}

impl StaffRow {
    pub fn key(&self) -> StorageKey {
        StorageKey::new(&self.resource_path, tables::STAFF, &self.staff_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserGroupRow {
    pub user_group_id: String,
    pub name: String,
    /// System groups are created by the service, not by a request.
    #[serde(default)]
    pub is_system: bool,
    pub resource_path: String,
}

impl UserGroupRow {
    pub fn key(&self) -> StorageKey {
        StorageKey::new(&self.resource_path, tables::USER_GROUPS, &self.user_group_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantedRoleRow {
    pub granted_role_id: String,
    pub user_group_id: String,
    pub role_name: String,
    #[serde(default)]
    pub location_ids: Vec<String>,
}

impl GrantedRoleRow {
    pub fn key(&self, tenant_id: &str) -> StorageKey {
        StorageKey::new(tenant_id, tables::GRANTED_ROLES, &self.granted_role_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserGroupMemberRow {
    pub user_id: String,
    pub user_group_id: String,
}

impl UserGroupMemberRow {
    pub fn new(user_id: impl Into<String>, user_group_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_group_id: user_group_id.into(),
        }
    }

    pub fn key(&self, tenant_id: &str) -> StorageKey {
        StorageKey::new(
            tenant_id,
            tables::USER_GROUP_MEMBERS,
            format!("{}:{}", self.user_id, self.user_group_id),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccessPathRow {
    pub user_id: String,
    pub location_id: String,
}

impl UserAccessPathRow {
    pub fn new(user_id: impl Into<String>, location_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            location_id: location_id.into(),
        }
    }

    pub fn key(&self, tenant_id: &str) -> StorageKey {
        StorageKey::new(
            tenant_id,
            tables::USER_ACCESS_PATHS,
            format!("{}:{}", self.user_id, self.location_id),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedUserRow {
    pub user_id: String,
    pub tag_id: String,
}

impl TaggedUserRow {
    pub fn new(user_id: impl Into<String>, tag_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            tag_id: tag_id.into(),
        }
    }

    pub fn key(&self, tenant_id: &str) -> StorageKey {
        StorageKey::new(
            tenant_id,
            tables::TAGGED_USERS,
            format!("{}:{}", self.user_id, self.tag_id),
        )
    }
}
