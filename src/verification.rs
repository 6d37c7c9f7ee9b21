//! Read-back checks of what the user-management service persisted.
//!
//! Each check loads the rows a workflow should have written and compares them
//! with the request that drove it. The first differing field is reported as
//! [`HarnessError::VerificationMismatch`]; a missing row as
//! [`HarnessError::RowNotFound`]. The store is expected to provide
//! read-your-writes, so nothing here polls.

use std::collections::BTreeSet;
use std::fmt::Display;
use std::sync::Arc;

use log::debug;
use serde::de::DeserializeOwned;

use crate::api::{
    CreateParentsRequest, CreateParentsResponse, CreateStaffRequest, CreateStaffResponse,
    CreateStudentRequest, CreateStudentResponse, ImportParentRow, ImportParentsRequest,
    ImportParentsResponse, RoleWithLocations, StaffProfile, UpdateParentsRequest,
    UpdateStaffRequest, UpdateStudentRequest,
};
use crate::api::in_memory::{ROLE_PARENT, ROLE_STUDENT};
use crate::correlation::MatchedEvent;
use crate::error::{HarnessError, HarnessResult};
use crate::events::UserEvent;
use crate::storage::rows::{
    GrantedRoleRow, ParentRow, StaffRow, StudentParentRow, StudentRow, TaggedUserRow,
    UserAccessPathRow, UserGroupMemberRow, UserGroupRow, UserRow, tables,
};
use crate::storage::{StorageKey, StorageProvider, find_rows, get_row};

/// Fail with a mismatch on `entity.field` unless `expected == actual`.
fn check<T>(entity: &str, field: &str, expected: T, actual: T) -> HarnessResult<()>
where
    T: PartialEq + Display,
{
    if expected == actual {
        Ok(())
    } else {
        Err(HarnessError::mismatch(
            entity,
            field,
            expected.to_string(),
            actual.to_string(),
        ))
    }
}

/// Compare two id lists ignoring order and duplicates.
fn check_set(entity: &str, field: &str, expected: &[String], actual: &[String]) -> HarnessResult<()> {
    let expected: BTreeSet<&str> = expected.iter().map(String::as_str).collect();
    let actual: BTreeSet<&str> = actual.iter().map(String::as_str).collect();
    if expected == actual {
        return Ok(());
    }
    let render = |set: &BTreeSet<&str>| set.iter().copied().collect::<Vec<_>>().join(",");
    Err(HarnessError::mismatch(
        entity,
        field,
        render(&expected),
        render(&actual),
    ))
}

fn render_option<T: Display>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_default()
}

/// Store-backed verification queries.
pub struct Verifier<S> {
    storage: Arc<S>,
}

impl<S> Clone for Verifier<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
        }
    }
}

impl<S: StorageProvider> Verifier<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    async fn require<T>(&self, org: &str, table: &str, id: &str) -> HarnessResult<T>
    where
        T: DeserializeOwned,
    {
        get_row(self.storage.as_ref(), StorageKey::new(org, table, id))
            .await?
            .ok_or_else(|| HarnessError::row_not_found(table, id))
    }

    async fn find<T>(&self, org: &str, table: &str, attribute: &str, value: &str) -> HarnessResult<Vec<T>>
    where
        T: DeserializeOwned,
    {
        find_rows(
            self.storage.as_ref(),
            StorageKey::prefix(org, table),
            attribute,
            value,
        )
        .await
    }

    /// Location ids of a user's access paths.
    pub async fn access_paths(&self, org: &str, user_id: &str) -> HarnessResult<Vec<String>> {
        let rows: Vec<UserAccessPathRow> = self
            .find(org, tables::USER_ACCESS_PATHS, "user_id", user_id)
            .await?;
        Ok(rows.into_iter().map(|r| r.location_id).collect())
    }

    async fn tags(&self, org: &str, user_id: &str) -> HarnessResult<Vec<String>> {
        let rows: Vec<TaggedUserRow> = self
            .find(org, tables::TAGGED_USERS, "user_id", user_id)
            .await?;
        Ok(rows.into_iter().map(|r| r.tag_id).collect())
    }

    async fn memberships(&self, org: &str, user_id: &str) -> HarnessResult<Vec<String>> {
        let rows: Vec<UserGroupMemberRow> = self
            .find(org, tables::USER_GROUP_MEMBERS, "user_id", user_id)
            .await?;
        Ok(rows.into_iter().map(|r| r.user_group_id).collect())
    }

    /// The user belongs to a system group granted `role`.
    async fn verify_system_role(&self, org: &str, user_id: &str, role: &str) -> HarnessResult<()> {
        for group_id in self.memberships(org, user_id).await? {
            let group: UserGroupRow = self.require(org, tables::USER_GROUPS, &group_id).await?;
            if !group.is_system {
                continue;
            }
            let roles: Vec<GrantedRoleRow> = self
                .find(org, tables::GRANTED_ROLES, "user_group_id", &group_id)
                .await?;
            if roles.iter().any(|r| r.role_name == role) {
                return Ok(());
            }
        }
        Err(HarnessError::mismatch(
            format!("user {}", user_id),
            "granted_role",
            role,
            "none",
        ))
    }

    pub async fn verify_student_created(
        &self,
        org: &str,
        request: &CreateStudentRequest,
        response: &CreateStudentResponse,
    ) -> HarnessResult<()> {
        let profile = &request.student_profile;
        let id = response.student_id.as_str();
        let user: UserRow = self.require(org, tables::USERS, id).await?;

        check("users", "name", profile.full_name(), user.name)?;
        check("users", "email", profile.email.as_str(), user.email.as_str())?;
        check("users", "first_name", profile.first_name.as_str(), user.first_name.as_str())?;
        check("users", "last_name", profile.last_name.as_str(), user.last_name.as_str())?;
        check("users", "country", profile.country_code.as_str(), user.country.as_str())?;
        check(
            "users",
            "phone_number",
            profile.phone_number.as_str(),
            user.phone_number.as_str(),
        )?;
        check(
            "users",
            "gender",
            render_option(&profile.gender.as_column()),
            render_option(&user.gender),
        )?;
        check(
            "users",
            "birthday",
            render_option(&profile.birthday),
            render_option(&user.birthday),
        )?;
        check("users", "user_role", "student", user.user_role.as_str())?;
        check("users", "resource_path", org, user.resource_path.as_str())?;

        let student: StudentRow = self.require(org, tables::STUDENTS, id).await?;
        check("students", "school_id", request.school_id, student.school_id)?;
        check("students", "current_grade", profile.grade, student.current_grade)?;
        check(
            "students",
            "enrollment_status",
            profile.enrollment_status.to_string(),
            student.enrollment_status,
        )?;
        check(
            "students",
            "student_external_id",
            profile.student_external_id.as_str(),
            student.student_external_id.as_str(),
        )?;
        check(
            "students",
            "student_note",
            profile.student_note.as_str(),
            student.student_note.as_str(),
        )?;

        let paths = self.access_paths(org, id).await?;
        check_set("user_access_paths", "location_id", &profile.location_ids, &paths)?;
        let tags = self.tags(org, id).await?;
        check_set("tagged_users", "tag_id", &profile.tag_ids, &tags)?;
        self.verify_system_role(org, id, ROLE_STUDENT).await?;

        debug!("Verified student {} in '{}'", id, org);
        Ok(())
    }

    pub async fn verify_student_updated(
        &self,
        org: &str,
        request: &UpdateStudentRequest,
    ) -> HarnessResult<()> {
        let profile = &request.student_profile;
        let id = profile.student_id.as_str();
        let user: UserRow = self.require(org, tables::USERS, id).await?;

        check("users", "name", profile.full_name(), user.name)?;
        check("users", "email", profile.email.as_str(), user.email.as_str())?;
        check(
            "users",
            "gender",
            render_option(&profile.gender.as_column()),
            render_option(&user.gender),
        )?;
        check(
            "users",
            "birthday",
            render_option(&profile.birthday),
            render_option(&user.birthday),
        )?;

        let student: StudentRow = self.require(org, tables::STUDENTS, id).await?;
        check("students", "current_grade", profile.grade, student.current_grade)?;
        check(
            "students",
            "enrollment_status",
            profile.enrollment_status.to_string(),
            student.enrollment_status,
        )?;
        check(
            "students",
            "student_external_id",
            profile.student_external_id.as_str(),
            student.student_external_id.as_str(),
        )?;
        check(
            "students",
            "student_note",
            profile.student_note.as_str(),
            student.student_note.as_str(),
        )?;

        let paths = self.access_paths(org, id).await?;
        check_set("user_access_paths", "location_id", &profile.location_ids, &paths)?;
        let tags = self.tags(org, id).await?;
        check_set("tagged_users", "tag_id", &profile.tag_ids, &tags)
    }

    /// Parents exist, are linked to the student with the requested
    /// relationship and inherit the student's locations.
    pub async fn verify_parents_created(
        &self,
        org: &str,
        request: &CreateParentsRequest,
        response: &CreateParentsResponse,
    ) -> HarnessResult<()> {
        check(
            "parents",
            "count",
            request.parent_profiles.len(),
            response.parents.len(),
        )?;
        let student_paths = self.access_paths(org, &request.student_id).await?;

        for (profile, created) in request.parent_profiles.iter().zip(&response.parents) {
            let id = created.parent_id.as_str();
            let user: UserRow = self.require(org, tables::USERS, id).await?;
            check("users", "name", profile.full_name(), user.name)?;
            check("users", "email", profile.email.as_str(), user.email.as_str())?;
            check("users", "user_role", "parent", user.user_role.as_str())?;

            let parent: ParentRow = self.require(org, tables::PARENTS, id).await?;
            check("parents", "school_id", request.school_id, parent.school_id)?;

            let link_id = format!("{}:{}", request.student_id, id);
            let link: StudentParentRow = self
                .require(org, tables::STUDENT_PARENTS, &link_id)
                .await?;
            check(
                "student_parents",
                "relationship",
                profile.relationship.to_string(),
                link.relationship,
            )?;

            let paths = self.access_paths(org, id).await?;
            check_set("user_access_paths", "location_id", &student_paths, &paths)?;
            let tags = self.tags(org, id).await?;
            check_set("tagged_users", "tag_id", &profile.tag_ids, &tags)?;
            self.verify_system_role(org, id, ROLE_PARENT).await?;
        }
        Ok(())
    }

    pub async fn verify_parents_updated(
        &self,
        org: &str,
        request: &UpdateParentsRequest,
    ) -> HarnessResult<()> {
        for profile in &request.parent_profiles {
            let id = profile.parent_id.as_str();
            let user: UserRow = self.require(org, tables::USERS, id).await?;
            check("users", "name", profile.name.as_str(), user.name.as_str())?;
            check("users", "email", profile.email.as_str(), user.email.as_str())?;

            let link_id = format!("{}:{}", request.student_id, id);
            let link: StudentParentRow = self
                .require(org, tables::STUDENT_PARENTS, &link_id)
                .await?;
            check(
                "student_parents",
                "relationship",
                profile.relationship.to_string(),
                link.relationship,
            )?;
            let tags = self.tags(org, id).await?;
            check_set("tagged_users", "tag_id", &profile.tag_ids, &tags)?;
        }
        Ok(())
    }

    pub async fn verify_staff_created(
        &self,
        org: &str,
        request: &CreateStaffRequest,
        response: &CreateStaffResponse,
    ) -> HarnessResult<()> {
        self.verify_staff(org, &response.staff_id, &request.staff)
            .await
    }

    pub async fn verify_staff_updated(
        &self,
        org: &str,
        request: &UpdateStaffRequest,
    ) -> HarnessResult<()> {
        self.verify_staff(org, &request.staff_id, &request.staff)
            .await
    }

    async fn verify_staff(
        &self,
        org: &str,
        id: &str,
        staff: &StaffProfile,
    ) -> HarnessResult<()> {
        let user: UserRow = self.require(org, tables::USERS, id).await?;
        check("users", "name", staff.name.as_str(), user.name.as_str())?;
        check("users", "email", staff.email.as_str(), user.email.as_str())?;
        check("users", "user_role", "staff", user.user_role.as_str())?;
        check(
            "users",
            "gender",
            render_option(&staff.gender.as_column()),
            render_option(&user.gender),
        )?;

        let row: StaffRow = self.require(org, tables::STAFF, id).await?;
        check(
            "staff",
            "start_date",
            render_option(&staff.start_date),
            render_option(&row.start_date),
        )?;
        check(
            "staff",
            "end_date",
            render_option(&staff.end_date),
            render_option(&row.end_date),
        )?;
        check("staff", "remarks", staff.remarks.as_str(), row.remarks.as_str())?;

        let groups = self.memberships(org, id).await?;
        check_set(
            "user_group_members",
            "user_group_id",
            &staff.user_group_ids,
            &groups,
        )?;
        let paths = self.access_paths(org, id).await?;
        check_set("user_access_paths", "location_id", &staff.location_ids, &paths)?;
        let tags = self.tags(org, id).await?;
        check_set("tagged_users", "tag_id", &staff.tag_ids, &tags)
    }

    /// The group carries `name` and exactly the granted roles in `roles`.
    pub async fn verify_user_group(
        &self,
        org: &str,
        user_group_id: &str,
        name: &str,
        roles: &[RoleWithLocations],
    ) -> HarnessResult<()> {
        let group: UserGroupRow = self
            .require(org, tables::USER_GROUPS, user_group_id)
            .await?;
        check("user_groups", "name", name, group.name.as_str())?;

        let granted: Vec<GrantedRoleRow> = self
            .find(org, tables::GRANTED_ROLES, "user_group_id", user_group_id)
            .await?;
        let expected: Vec<String> = roles.iter().map(|r| r.role_name.clone()).collect();
        let actual: Vec<String> = granted.iter().map(|r| r.role_name.clone()).collect();
        check_set("granted_roles", "role_name", &expected, &actual)?;

        for role in roles {
            if let Some(row) = granted.iter().find(|g| g.role_name == role.role_name) {
                check_set(
                    "granted_roles",
                    &format!("{}.location_ids", role.role_name),
                    &role.location_ids,
                    &row.location_ids,
                )?;
            }
        }
        Ok(())
    }

    /// Each imported row produced a parent linked to every listed student.
    pub async fn verify_parents_imported(
        &self,
        org: &str,
        request: &ImportParentsRequest,
        response: &ImportParentsResponse,
    ) -> HarnessResult<()> {
        if let Some(error) = response.errors.first() {
            return Err(HarnessError::mismatch(
                "import",
                format!("row {}", error.row_number),
                "no error",
                error.error.as_str(),
            ));
        }
        let rows: Vec<ImportParentRow> = serde_json::from_slice(&request.payload)?;
        check("parents", "count", rows.len(), response.parent_ids.len())?;

        for (row, parent_id) in rows.iter().zip(&response.parent_ids) {
            let user: UserRow = self.require(org, tables::USERS, parent_id).await?;
            check("users", "name", row.name.as_str(), user.name.as_str())?;
            check("users", "email", row.email.as_str(), user.email.as_str())?;
            check("users", "user_role", "parent", user.user_role.as_str())?;

            for student_id in &row.student_ids {
                let link_id = format!("{}:{}", student_id, parent_id);
                let link: StudentParentRow = self
                    .require(org, tables::STUDENT_PARENTS, &link_id)
                    .await?;
                check(
                    "student_parents",
                    "relationship",
                    row.relationship.to_string(),
                    link.relationship,
                )?;
            }
        }
        Ok(())
    }

    pub async fn user(&self, org: &str, user_id: &str) -> HarnessResult<UserRow> {
        self.require(org, tables::USERS, user_id).await
    }

    /// The matched event agrees with the store: the user exists under the
    /// event's resource path, and a student event's location ids equal the
    /// student's access paths.
    pub async fn verify_event_matches_store(&self, matched: &MatchedEvent) -> HarnessResult<()> {
        let org = matched.resource_path.as_str();
        match &matched.event {
            UserEvent::CreateStudent(event) | UserEvent::UpdateStudent(event) => {
                let user: UserRow = self.require(org, tables::USERS, &event.student_id).await?;
                check("users", "name", event.student_name.as_str(), user.name.as_str())?;
                let paths = self.access_paths(org, &event.student_id).await?;
                check_set("user_access_paths", "location_id", &event.location_ids, &paths)
            }
            UserEvent::CreateParent(event) | UserEvent::UpdateParent(event) => {
                let user: UserRow = self.require(org, tables::USERS, &event.parent_id).await?;
                check("users", "name", event.parent_name.as_str(), user.name.as_str())?;
                let link_id = format!("{}:{}", event.student_id, event.parent_id);
                self.require::<StudentParentRow>(org, tables::STUDENT_PARENTS, &link_id)
                    .await?;
                Ok(())
            }
        }
    }
}
