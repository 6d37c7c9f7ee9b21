//! In-process user-management service.
//!
//! [`InMemoryUserService`] persists rows to any [`StorageProvider`] and
//! publishes [`UserEvent`]s on any [`MessageBus`], the same side effects the
//! real service has. It validates only what scenarios assert on: required
//! fields, references to existing rows, unique emails per organization.
//!
//! Students and parents are also registered with the identity provider when
//! one is bound, so scenarios can sign in as the users they created.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::types::*;
use super::{CallContext, RpcResult, RpcStatus, StatusCode, UserManagementApi};
use crate::bus::MessageBus;
use crate::error::HarnessError;
use crate::events::{ParentEvent, StudentEvent, UserEvent, encode_message};
use crate::identity::{
    IdentityError, IdentityProvider, InMemoryIdentityProvider, InMemoryTokenExchanger,
    SubjectIdentity,
};
use crate::storage::rows::{
    GrantedRoleRow, ParentRow, StaffRow, StudentParentRow, StudentRow, TaggedUserRow,
    UserAccessPathRow, UserGroupMemberRow, UserGroupRow, UserRow, tables,
};
use crate::storage::{StorageError, StorageKey, StorageProvider, find_rows, get_row, put_row};

/// Role granted to the system group every student joins.
pub const ROLE_STUDENT: &str = "Student";
/// Role granted to the system group every parent joins.
pub const ROLE_PARENT: &str = "Parent";

const MIN_PASSWORD_LENGTH: usize = 6;

const ROLE_USER_STUDENT: &str = "student";
const ROLE_USER_PARENT: &str = "parent";
const ROLE_USER_STAFF: &str = "staff";

#[derive(Debug, Default)]
struct Catalog {
    locations: HashSet<String>,
    tags: HashSet<String>,
    roles: HashSet<String>,
}

struct IdentityBinding {
    provider: Arc<InMemoryIdentityProvider>,
    tenant_id: String,
}

/// Parent fields shared by create and import.
struct NewParent {
    name: String,
    first_name: String,
    last_name: String,
    email: String,
    phone_number: String,
    country: String,
    relationship: FamilyRelationship,
    tag_ids: Vec<String>,
    password: Option<String>,
}

/// In-memory implementation of [`UserManagementApi`].
pub struct InMemoryUserService<B, S> {
    bus: Arc<B>,
    storage: Arc<S>,
    catalog: Catalog,
    identity: Option<IdentityBinding>,
    tokens: Option<Arc<InMemoryTokenExchanger>>,
    publish_events: AtomicBool,
}

impl<B, S> InMemoryUserService<B, S>
where
    B: MessageBus,
    S: StorageProvider,
{
    /// A service with the default roles and no locations or tags.
    pub fn new(bus: Arc<B>, storage: Arc<S>) -> Self {
        let roles = ["Teacher", "School Admin", "HQ Staff", ROLE_STUDENT, ROLE_PARENT]
            .into_iter()
            .map(String::from)
            .collect();
        Self {
            bus,
            storage,
            catalog: Catalog {
                roles,
                ..Catalog::default()
            },
            identity: None,
            tokens: None,
            publish_events: AtomicBool::new(true),
        }
    }

    pub fn with_locations<I, T>(mut self, locations: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.catalog.locations.extend(locations.into_iter().map(Into::into));
        self
    }

    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.catalog.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_roles<I, T>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.catalog.roles.extend(roles.into_iter().map(Into::into));
        self
    }

    /// Register created students and parents in `tenant_id` of `provider`,
    /// and route password reissues to it.
    pub fn with_identity_provider(
        mut self,
        provider: Arc<InMemoryIdentityProvider>,
        tenant_id: impl Into<String>,
    ) -> Self {
        self.identity = Some(IdentityBinding {
            provider,
            tenant_id: tenant_id.into(),
        });
        self
    }

    /// Accept only tokens issued by `exchanger`. Without it any non-empty
    /// token is accepted.
    pub fn with_token_validator(mut self, exchanger: Arc<InMemoryTokenExchanger>) -> Self {
        self.tokens = Some(exchanger);
        self
    }

    /// Turn event publishing off to reproduce a lost event.
    pub fn set_publish_events(&self, enabled: bool) {
        self.publish_events.store(enabled, Ordering::SeqCst);
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    async fn authorize(&self, ctx: &CallContext) -> RpcResult<String> {
        let token = match ctx.token.as_deref() {
            Some(token) if !token.is_empty() => token,
            _ => return Err(RpcStatus::unauthenticated("missing token")),
        };
        if ctx.organization_id.is_empty() {
            return Err(RpcStatus::new(
                StatusCode::PermissionDenied,
                "missing resource path",
            ));
        }

        match &self.tokens {
            Some(exchanger) => exchanger
                .validate(token)
                .await
                .map(|claims| claims.user_id)
                .ok_or_else(|| RpcStatus::unauthenticated("invalid token")),
            None => Ok(String::new()),
        }
    }

    async fn store<T>(&self, key: StorageKey, row: &T) -> RpcResult<()>
    where
        T: Serialize + Sync,
    {
        put_row(self.storage.as_ref(), key, row)
            .await
            .map_err(storage_failure)
    }

    async fn load<T>(&self, key: StorageKey) -> RpcResult<Option<T>>
    where
        T: DeserializeOwned,
    {
        get_row(self.storage.as_ref(), key)
            .await
            .map_err(storage_failure)
    }

    async fn find<T>(&self, org: &str, table: &str, attribute: &str, value: &str) -> RpcResult<Vec<T>>
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
        .map_err(storage_failure)
    }

    async fn remove(&self, key: StorageKey) -> RpcResult<()> {
        self.storage
            .delete(key)
            .await
            .map_err(|e| storage_failure(HarnessError::storage(e)))?;
        Ok(())
    }

    async fn load_user(&self, org: &str, user_id: &str, role: &str) -> RpcResult<UserRow> {
        let user: Option<UserRow> = self
            .load(StorageKey::new(org, tables::USERS, user_id))
            .await?;
        match user {
            Some(user) if user.user_role == role => Ok(user),
            _ => Err(RpcStatus::not_found(format!("{} {} not found", role, user_id))),
        }
    }

    async fn ensure_email_available(
        &self,
        org: &str,
        email: &str,
        owner: Option<&str>,
    ) -> RpcResult<()> {
        let users: Vec<UserRow> = self.find(org, tables::USERS, "email", email).await?;
        if users.iter().any(|u| Some(u.user_id.as_str()) != owner) {
            return Err(RpcStatus::already_exists(format!(
                "email {} already exists",
                email
            )));
        }
        Ok(())
    }

    fn validate_locations(&self, location_ids: &[String], required: bool) -> RpcResult<()> {
        if required && location_ids.is_empty() {
            return Err(RpcStatus::invalid_argument("location_ids cannot be empty"));
        }
        match location_ids
            .iter()
            .find(|id| !self.catalog.locations.contains(*id))
        {
            Some(id) => Err(RpcStatus::invalid_argument(format!(
                "location {} does not exist",
                id
            ))),
            None => Ok(()),
        }
    }

    fn validate_tags(&self, tag_ids: &[String]) -> RpcResult<()> {
        match tag_ids.iter().find(|id| !self.catalog.tags.contains(*id)) {
            Some(id) => Err(RpcStatus::invalid_argument(format!(
                "tag {} does not exist",
                id
            ))),
            None => Ok(()),
        }
    }

    fn validate_roles(&self, roles: &[RoleWithLocations]) -> RpcResult<()> {
        for role in roles {
            if !self.catalog.roles.contains(&role.role_name) {
                return Err(RpcStatus::invalid_argument(format!(
                    "role {} does not exist",
                    role.role_name
                )));
            }
            self.validate_locations(&role.location_ids, false)?;
        }
        Ok(())
    }

    async fn replace_access_paths(
        &self,
        org: &str,
        user_id: &str,
        location_ids: &[String],
    ) -> RpcResult<()> {
        let existing: Vec<UserAccessPathRow> = self
            .find(org, tables::USER_ACCESS_PATHS, "user_id", user_id)
            .await?;
        for row in existing {
            self.remove(row.key(org)).await?;
        }
        for location_id in location_ids {
            let row = UserAccessPathRow::new(user_id, location_id);
            self.store(row.key(org), &row).await?;
        }
        Ok(())
    }

    async fn replace_tags(&self, org: &str, user_id: &str, tag_ids: &[String]) -> RpcResult<()> {
        let existing: Vec<TaggedUserRow> = self
            .find(org, tables::TAGGED_USERS, "user_id", user_id)
            .await?;
        for row in existing {
            self.remove(row.key(org)).await?;
        }
        for tag_id in tag_ids {
            let row = TaggedUserRow::new(user_id, tag_id);
            self.store(row.key(org), &row).await?;
        }
        Ok(())
    }

    async fn replace_memberships(
        &self,
        org: &str,
        user_id: &str,
        user_group_ids: &[String],
    ) -> RpcResult<()> {
        let existing: Vec<UserGroupMemberRow> = self
            .find(org, tables::USER_GROUP_MEMBERS, "user_id", user_id)
            .await?;
        for row in existing {
            self.remove(row.key(org)).await?;
        }
        for group_id in user_group_ids {
            let row = UserGroupMemberRow::new(user_id, group_id);
            self.store(row.key(org), &row).await?;
        }
        Ok(())
    }

    async fn replace_granted_roles(
        &self,
        org: &str,
        user_group_id: &str,
        roles: &[RoleWithLocations],
    ) -> RpcResult<()> {
        let existing: Vec<GrantedRoleRow> = self
            .find(org, tables::GRANTED_ROLES, "user_group_id", user_group_id)
            .await?;
        for row in existing {
            self.remove(row.key(org)).await?;
        }
        for role in roles {
            let row = GrantedRoleRow {
                granted_role_id: Uuid::new_v4().to_string(),
                user_group_id: user_group_id.to_string(),
                role_name: role.role_name.clone(),
                location_ids: role.location_ids.clone(),
            };
            self.store(row.key(org), &row).await?;
        }
        Ok(())
    }

    async fn validate_user_groups(&self, org: &str, user_group_ids: &[String]) -> RpcResult<()> {
        for group_id in user_group_ids {
            let group: Option<UserGroupRow> = self
                .load(StorageKey::new(org, tables::USER_GROUPS, group_id))
                .await?;
            if group.is_none() {
                return Err(RpcStatus::invalid_argument(format!(
                    "user group {} does not exist",
                    group_id
                )));
            }
        }
        Ok(())
    }

    /// The system group granted `role`, created on first use.
    async fn system_group(&self, org: &str, role: &str) -> RpcResult<String> {
        let group_id = format!("system-{}", role.to_lowercase().replace(' ', "-"));
        let key = StorageKey::new(org, tables::USER_GROUPS, &group_id);
        let existing: Option<UserGroupRow> = self.load(key.clone()).await?;
        if existing.is_none() {
            let group = UserGroupRow {
                user_group_id: group_id.clone(),
                name: role.to_string(),
                is_system: true,
                resource_path: org.to_string(),
            };
            self.store(key, &group).await?;
            let roles = [RoleWithLocations {
                role_name: role.to_string(),
                location_ids: Vec::new(),
            }];
            self.replace_granted_roles(org, &group_id, &roles).await?;
            debug!("Created system user group '{}' in '{}'", group_id, org);
        }
        Ok(group_id)
    }

    async fn register_identity(
        &self,
        user_id: &str,
        email: &str,
        name: &str,
        password: &str,
    ) -> RpcResult<()> {
        let Some(binding) = &self.identity else {
            return Ok(());
        };
        let identity = SubjectIdentity {
            user_id: user_id.to_string(),
            email: email.to_string(),
            password: password.to_string(),
            display_name: name.to_string(),
        };
        binding
            .provider
            .provision_user(&binding.tenant_id, &identity)
            .await
            .map_err(|e| match e {
                IdentityError::UserAlreadyExists { .. } => RpcStatus::already_exists(e.to_string()),
                other => RpcStatus::internal(other.to_string()),
            })?;
        Ok(())
    }

    async fn publish(&self, ctx: &CallContext, caller_id: &str, event: UserEvent) -> RpcResult<()> {
        if !self.publish_events.load(Ordering::SeqCst) {
            warn!(
                "Event publishing disabled, dropping {} for student '{}'",
                event.kind(),
                event.student_name()
            );
            return Ok(());
        }

        let data = encode_message(&event, &ctx.organization_id, caller_id)
            .map_err(|e| RpcStatus::internal(format!("encode event: {}", e)))?;
        let ack = self
            .bus
            .publish(event.subject(), data)
            .await
            .map_err(|e| RpcStatus::internal(format!("publish event: {}", e)))?;
        debug!(
            "Published {} as message {} on '{}'",
            event.kind(),
            ack.sequence,
            ack.subject
        );
        Ok(())
    }

    async fn insert_parent(
        &self,
        ctx: &CallContext,
        caller_id: &str,
        school_id: i32,
        students: &[UserRow],
        parent: NewParent,
    ) -> RpcResult<CreatedParent> {
        let org = ctx.organization_id.as_str();
        let parent_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let name = combine_name(&parent.first_name, &parent.last_name, &parent.name);

        let user = UserRow {
            user_id: parent_id.clone(),
            email: parent.email.clone(),
            name: name.clone(),
            first_name: parent.first_name,
            last_name: parent.last_name,
            country: parent.country,
            phone_number: parent.phone_number,
            gender: None,
            birthday: None,
            user_role: ROLE_USER_PARENT.to_string(),
            resource_path: org.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.store(user.key(), &user).await?;

        let row = ParentRow {
            parent_id: parent_id.clone(),
            school_id,
            resource_path: org.to_string(),
        };
        self.store(row.key(), &row).await?;

        // A parent sees every location of every linked student
        let mut location_ids: Vec<String> = Vec::new();
        for student in students {
            let link = StudentParentRow {
                student_id: student.user_id.clone(),
                parent_id: parent_id.clone(),
                relationship: parent.relationship.to_string(),
            };
            self.store(link.key(org), &link).await?;

            let paths: Vec<UserAccessPathRow> = self
                .find(org, tables::USER_ACCESS_PATHS, "user_id", &student.user_id)
                .await?;
            for path in paths {
                if !location_ids.contains(&path.location_id) {
                    location_ids.push(path.location_id);
                }
            }
        }
        self.replace_access_paths(org, &parent_id, &location_ids)
            .await?;
        self.replace_tags(org, &parent_id, &parent.tag_ids).await?;

        let group_id = self.system_group(org, ROLE_PARENT).await?;
        let member = UserGroupMemberRow::new(&parent_id, group_id);
        self.store(member.key(org), &member).await?;

        if let Some(password) = &parent.password {
            self.register_identity(&parent_id, &parent.email, &name, password)
                .await?;
        }

        for student in students {
            let event = UserEvent::CreateParent(ParentEvent {
                student_id: student.user_id.clone(),
                student_name: student.name.clone(),
                parent_id: parent_id.clone(),
                parent_name: name.clone(),
            });
            self.publish(ctx, caller_id, event).await?;
        }

        Ok(CreatedParent {
            parent_id,
            email: parent.email,
            name,
        })
    }
}

fn storage_failure(error: HarnessError) -> RpcStatus {
    let temporary = match &error {
        HarnessError::Storage(source) => source
            .downcast_ref::<StorageError>()
            .is_some_and(StorageError::is_temporary),
        _ => false,
    };
    if temporary {
        RpcStatus::new(StatusCode::Unavailable, error.to_string())
    } else {
        RpcStatus::internal(error.to_string())
    }
}

fn require(value: &str, message: &str) -> RpcResult<()> {
    if value.trim().is_empty() {
        Err(RpcStatus::invalid_argument(message))
    } else {
        Ok(())
    }
}

fn require_password(password: &str) -> RpcResult<()> {
    if password.len() < MIN_PASSWORD_LENGTH {
        return Err(RpcStatus::invalid_argument(format!(
            "password length should be at least {}",
            MIN_PASSWORD_LENGTH
        )));
    }
    Ok(())
}

fn require_distinct_emails<'a>(emails: impl Iterator<Item = &'a str>) -> RpcResult<()> {
    let mut seen = HashSet::new();
    for email in emails {
        if !seen.insert(email) {
            return Err(RpcStatus::invalid_argument(format!(
                "email {} is duplicated in request",
                email
            )));
        }
    }
    Ok(())
}

impl<B, S> UserManagementApi for InMemoryUserService<B, S>
where
    B: MessageBus,
    S: StorageProvider,
{
    async fn create_student(
        &self,
        ctx: &CallContext,
        request: CreateStudentRequest,
    ) -> RpcResult<CreateStudentResponse> {
        let caller_id = self.authorize(ctx).await?;
        let org = ctx.organization_id.as_str();
        let profile = request.student_profile;
        let name = profile.full_name();

        require(&profile.email, "student email cannot be empty")?;
        require(&name, "student name cannot be empty")?;
        require(&profile.country_code, "student country code cannot be empty")?;
        require_password(&profile.password)?;
        if profile.enrollment_status == EnrollmentStatus::None {
            return Err(RpcStatus::invalid_argument(
                "student enrollment status cannot be empty",
            ));
        }
        if profile.grade < 0 {
            return Err(RpcStatus::invalid_argument("student grade cannot be negative"));
        }
        self.validate_locations(&profile.location_ids, true)?;
        self.validate_tags(&profile.tag_ids)?;
        self.ensure_email_available(org, &profile.email, None).await?;

        let student_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let user = UserRow {
            user_id: student_id.clone(),
            email: profile.email.clone(),
            name: name.clone(),
            first_name: profile.first_name.clone(),
            last_name: profile.last_name.clone(),
            country: profile.country_code.clone(),
            phone_number: profile.phone_number.clone(),
            gender: profile.gender.as_column(),
            birthday: profile.birthday,
            user_role: ROLE_USER_STUDENT.to_string(),
            resource_path: org.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.store(user.key(), &user).await?;

        let student = StudentRow {
            student_id: student_id.clone(),
            school_id: request.school_id,
            current_grade: profile.grade,
            enrollment_status: profile.enrollment_status.to_string(),
            student_external_id: profile.student_external_id.clone(),
            student_note: profile.student_note.clone(),
            resource_path: org.to_string(),
        };
        self.store(student.key(), &student).await?;

        self.replace_access_paths(org, &student_id, &profile.location_ids)
            .await?;
        self.replace_tags(org, &student_id, &profile.tag_ids).await?;

        let group_id = self.system_group(org, ROLE_STUDENT).await?;
        let member = UserGroupMemberRow::new(&student_id, group_id);
        self.store(member.key(org), &member).await?;

        self.register_identity(&student_id, &profile.email, &name, &profile.password)
            .await?;

        let event = UserEvent::CreateStudent(StudentEvent {
            student_id: student_id.clone(),
            student_name: name.clone(),
            student_first_name: profile.first_name.clone(),
            student_last_name: profile.last_name.clone(),
            location_ids: profile.location_ids.clone(),
            tag_ids: profile.tag_ids.clone(),
        });
        self.publish(ctx, &caller_id, event).await?;

        info!("Created student '{}' ({}) in '{}'", name, student_id, org);
        Ok(CreateStudentResponse {
            student_id,
            name,
            email: profile.email,
            location_ids: profile.location_ids,
        })
    }

    async fn update_student(
        &self,
        ctx: &CallContext,
        request: UpdateStudentRequest,
    ) -> RpcResult<UpdateStudentResponse> {
        let caller_id = self.authorize(ctx).await?;
        let org = ctx.organization_id.as_str();
        let profile = request.student_profile;
        let name = profile.full_name();

        require(&profile.student_id, "student id cannot be empty")?;
        require(&profile.email, "student email cannot be empty")?;
        require(&name, "student name cannot be empty")?;
        if profile.enrollment_status == EnrollmentStatus::None {
            return Err(RpcStatus::invalid_argument(
                "student enrollment status cannot be empty",
            ));
        }
        self.validate_locations(&profile.location_ids, true)?;
        self.validate_tags(&profile.tag_ids)?;

        let mut user = self
            .load_user(org, &profile.student_id, ROLE_USER_STUDENT)
            .await?;
        self.ensure_email_available(org, &profile.email, Some(&profile.student_id))
            .await?;

        user.name = name.clone();
        user.first_name = profile.first_name.clone();
        user.last_name = profile.last_name.clone();
        user.email = profile.email.clone();
        user.gender = profile.gender.as_column();
        user.birthday = profile.birthday;
        user.updated_at = Utc::now();
        self.store(user.key(), &user).await?;

        let student = StudentRow {
            student_id: profile.student_id.clone(),
            school_id: request.school_id,
            current_grade: profile.grade,
            enrollment_status: profile.enrollment_status.to_string(),
            student_external_id: profile.student_external_id.clone(),
            student_note: profile.student_note.clone(),
            resource_path: org.to_string(),
        };
        self.store(student.key(), &student).await?;

        self.replace_access_paths(org, &profile.student_id, &profile.location_ids)
            .await?;
        self.replace_tags(org, &profile.student_id, &profile.tag_ids)
            .await?;

        let event = UserEvent::UpdateStudent(StudentEvent {
            student_id: profile.student_id.clone(),
            student_name: name.clone(),
            student_first_name: profile.first_name.clone(),
            student_last_name: profile.last_name.clone(),
            location_ids: profile.location_ids.clone(),
            tag_ids: profile.tag_ids.clone(),
        });
        self.publish(ctx, &caller_id, event).await?;

        info!("Updated student {} in '{}'", profile.student_id, org);
        Ok(UpdateStudentResponse {
            student_id: profile.student_id,
            name,
        })
    }

    async fn create_parents(
        &self,
        ctx: &CallContext,
        request: CreateParentsRequest,
    ) -> RpcResult<CreateParentsResponse> {
        let caller_id = self.authorize(ctx).await?;
        let org = ctx.organization_id.as_str();

        require(&request.student_id, "student id cannot be empty")?;
        if request.parent_profiles.is_empty() {
            return Err(RpcStatus::invalid_argument("parent profiles cannot be empty"));
        }
        for profile in &request.parent_profiles {
            require(&profile.email, "parent email cannot be empty")?;
            require(&profile.full_name(), "parent name cannot be empty")?;
            require(&profile.country_code, "parent country code cannot be empty")?;
            require_password(&profile.password)?;
            if profile.relationship == FamilyRelationship::None {
                return Err(RpcStatus::invalid_argument(
                    "parent relationship cannot be empty",
                ));
            }
            self.validate_tags(&profile.tag_ids)?;
        }
        require_distinct_emails(request.parent_profiles.iter().map(|p| p.email.as_str()))?;

        let student = self
            .load_user(org, &request.student_id, ROLE_USER_STUDENT)
            .await?;
        for profile in &request.parent_profiles {
            self.ensure_email_available(org, &profile.email, None).await?;
        }

        let students = [student];
        let mut parents = Vec::with_capacity(request.parent_profiles.len());
        for profile in request.parent_profiles {
            let parent = NewParent {
                name: profile.name,
                first_name: profile.first_name,
                last_name: profile.last_name,
                email: profile.email,
                phone_number: profile.phone_number,
                country: profile.country_code,
                relationship: profile.relationship,
                tag_ids: profile.tag_ids,
                password: Some(profile.password),
            };
            parents.push(
                self.insert_parent(ctx, &caller_id, request.school_id, &students, parent)
                    .await?,
            );
        }

        info!(
            "Created {} parent(s) for student {} in '{}'",
            parents.len(),
            request.student_id,
            org
        );
        Ok(CreateParentsResponse {
            student_id: request.student_id,
            parents,
        })
    }

    async fn update_parents(
        &self,
        ctx: &CallContext,
        request: UpdateParentsRequest,
    ) -> RpcResult<UpdateParentsResponse> {
        let caller_id = self.authorize(ctx).await?;
        let org = ctx.organization_id.as_str();

        require(&request.student_id, "student id cannot be empty")?;
        if request.parent_profiles.is_empty() {
            return Err(RpcStatus::invalid_argument("parent profiles cannot be empty"));
        }
        for profile in &request.parent_profiles {
            require(&profile.parent_id, "parent id cannot be empty")?;
            require(&profile.email, "parent email cannot be empty")?;
            require(&profile.name, "parent name cannot be empty")?;
            if profile.relationship == FamilyRelationship::None {
                return Err(RpcStatus::invalid_argument(
                    "parent relationship cannot be empty",
                ));
            }
            self.validate_tags(&profile.tag_ids)?;
        }
        require_distinct_emails(request.parent_profiles.iter().map(|p| p.email.as_str()))?;

        let student = self
            .load_user(org, &request.student_id, ROLE_USER_STUDENT)
            .await?;

        let mut parent_ids = Vec::with_capacity(request.parent_profiles.len());
        for profile in request.parent_profiles {
            let mut parent = self
                .load_user(org, &profile.parent_id, ROLE_USER_PARENT)
                .await?;
            self.ensure_email_available(org, &profile.email, Some(&profile.parent_id))
                .await?;

            parent.name = profile.name.clone();
            parent.email = profile.email.clone();
            parent.updated_at = Utc::now();
            self.store(parent.key(), &parent).await?;

            let link = StudentParentRow {
                student_id: request.student_id.clone(),
                parent_id: profile.parent_id.clone(),
                relationship: profile.relationship.to_string(),
            };
            self.store(link.key(org), &link).await?;
            self.replace_tags(org, &profile.parent_id, &profile.tag_ids)
                .await?;

            let event = UserEvent::UpdateParent(ParentEvent {
                student_id: request.student_id.clone(),
                student_name: student.name.clone(),
                parent_id: profile.parent_id.clone(),
                parent_name: profile.name,
            });
            self.publish(ctx, &caller_id, event).await?;
            parent_ids.push(profile.parent_id);
        }

        Ok(UpdateParentsResponse {
            student_id: request.student_id,
            parent_ids,
        })
    }

    async fn create_staff(
        &self,
        ctx: &CallContext,
        request: CreateStaffRequest,
    ) -> RpcResult<CreateStaffResponse> {
        self.authorize(ctx).await?;
        let org = ctx.organization_id.as_str();
        let staff = request.staff;

        require(&staff.name, "staff name cannot be empty")?;
        require(&staff.email, "staff email cannot be empty")?;
        require(&staff.country, "staff country cannot be empty")?;
        if let (Some(start), Some(end)) = (staff.start_date, staff.end_date) {
            if start > end {
                return Err(RpcStatus::invalid_argument(
                    "staff start date must be before end date",
                ));
            }
        }
        self.validate_locations(&staff.location_ids, false)?;
        self.validate_tags(&staff.tag_ids)?;
        self.validate_user_groups(org, &staff.user_group_ids).await?;
        self.ensure_email_available(org, &staff.email, None).await?;

        let staff_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let user = UserRow {
            user_id: staff_id.clone(),
            email: staff.email.clone(),
            name: staff.name.clone(),
            first_name: String::new(),
            last_name: String::new(),
            country: staff.country.clone(),
            phone_number: staff.phone_number.clone(),
            gender: staff.gender.as_column(),
            birthday: staff.birthday,
            user_role: ROLE_USER_STAFF.to_string(),
            resource_path: org.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.store(user.key(), &user).await?;

        let row = StaffRow {
            staff_id: staff_id.clone(),
            start_date: staff.start_date,
            end_date: staff.end_date,
            remarks: staff.remarks.clone(),
            resource_path: org.to_string(),
        };
        self.store(row.key(), &row).await?;

        self.replace_memberships(org, &staff_id, &staff.user_group_ids)
            .await?;
        self.replace_access_paths(org, &staff_id, &staff.location_ids)
            .await?;
        self.replace_tags(org, &staff_id, &staff.tag_ids).await?;

        info!("Created staff '{}' ({}) in '{}'", staff.name, staff_id, org);
        Ok(CreateStaffResponse {
            staff_id,
            email: staff.email,
            user_group_ids: staff.user_group_ids,
        })
    }

    async fn update_staff(
        &self,
        ctx: &CallContext,
        request: UpdateStaffRequest,
    ) -> RpcResult<UpdateStaffResponse> {
        self.authorize(ctx).await?;
        let org = ctx.organization_id.as_str();
        let staff = request.staff;

        require(&request.staff_id, "staff id cannot be empty")?;
        require(&staff.name, "staff name cannot be empty")?;
        require(&staff.email, "staff email cannot be empty")?;
        self.validate_locations(&staff.location_ids, false)?;
        self.validate_tags(&staff.tag_ids)?;
        self.validate_user_groups(org, &staff.user_group_ids).await?;

        let mut user = self
            .load_user(org, &request.staff_id, ROLE_USER_STAFF)
            .await?;
        self.ensure_email_available(org, &staff.email, Some(&request.staff_id))
            .await?;

        user.name = staff.name.clone();
        user.email = staff.email.clone();
        user.phone_number = staff.phone_number.clone();
        user.gender = staff.gender.as_column();
        user.birthday = staff.birthday;
        user.updated_at = Utc::now();
        self.store(user.key(), &user).await?;

        let row = StaffRow {
            staff_id: request.staff_id.clone(),
            start_date: staff.start_date,
            end_date: staff.end_date,
            remarks: staff.remarks.clone(),
            resource_path: org.to_string(),
        };
        self.store(row.key(), &row).await?;

        self.replace_memberships(org, &request.staff_id, &staff.user_group_ids)
            .await?;
        self.replace_access_paths(org, &request.staff_id, &staff.location_ids)
            .await?;
        self.replace_tags(org, &request.staff_id, &staff.tag_ids)
            .await?;

        Ok(UpdateStaffResponse {
            staff_id: request.staff_id,
        })
    }

    async fn create_user_group(
        &self,
        ctx: &CallContext,
        request: CreateUserGroupRequest,
    ) -> RpcResult<CreateUserGroupResponse> {
        self.authorize(ctx).await?;
        let org = ctx.organization_id.as_str();

        require(&request.user_group_name, "user group name cannot be empty")?;
        self.validate_roles(&request.role_with_locations)?;

        let group = UserGroupRow {
            user_group_id: Uuid::new_v4().to_string(),
            name: request.user_group_name,
            is_system: false,
            resource_path: org.to_string(),
        };
        self.store(group.key(), &group).await?;
        self.replace_granted_roles(org, &group.user_group_id, &request.role_with_locations)
            .await?;

        info!(
            "Created user group '{}' ({}) in '{}'",
            group.name, group.user_group_id, org
        );
        Ok(CreateUserGroupResponse {
            user_group_id: group.user_group_id,
        })
    }

    async fn update_user_group(
        &self,
        ctx: &CallContext,
        request: UpdateUserGroupRequest,
    ) -> RpcResult<UpdateUserGroupResponse> {
        self.authorize(ctx).await?;
        let org = ctx.organization_id.as_str();

        require(&request.user_group_id, "user group id cannot be empty")?;
        require(&request.user_group_name, "user group name cannot be empty")?;
        self.validate_roles(&request.role_with_locations)?;

        let mut group: UserGroupRow = self
            .load(StorageKey::new(org, tables::USER_GROUPS, &request.user_group_id))
            .await?
            .ok_or_else(|| {
                RpcStatus::not_found(format!("user group {} not found", request.user_group_id))
            })?;
        if group.is_system {
            return Err(RpcStatus::new(
                StatusCode::PermissionDenied,
                "system user groups cannot be modified",
            ));
        }

        group.name = request.user_group_name;
        self.store(group.key(), &group).await?;
        self.replace_granted_roles(org, &group.user_group_id, &request.role_with_locations)
            .await?;

        Ok(UpdateUserGroupResponse {
            user_group_id: group.user_group_id,
        })
    }

    async fn reissue_user_password(
        &self,
        ctx: &CallContext,
        request: ReissueUserPasswordRequest,
    ) -> RpcResult<ReissueUserPasswordResponse> {
        self.authorize(ctx).await?;
        let org = ctx.organization_id.as_str();

        require(&request.user_id, "user id cannot be empty")?;
        require_password(&request.new_password)?;

        let user: Option<UserRow> = self
            .load(StorageKey::new(org, tables::USERS, &request.user_id))
            .await?;
        if user.is_none() {
            return Err(RpcStatus::not_found(format!(
                "user {} not found",
                request.user_id
            )));
        }

        let binding = self.identity.as_ref().ok_or_else(|| {
            RpcStatus::new(
                StatusCode::FailedPrecondition,
                "no identity provider configured",
            )
        })?;
        binding
            .provider
            .reset_password(&binding.tenant_id, &request.user_id, &request.new_password)
            .await
            .map_err(|e| match e {
                IdentityError::UserNotFound { .. } => RpcStatus::not_found(e.to_string()),
                other => RpcStatus::internal(other.to_string()),
            })?;

        Ok(ReissueUserPasswordResponse { successful: true })
    }

    async fn import_parents_and_assign_to_student(
        &self,
        ctx: &CallContext,
        request: ImportParentsRequest,
    ) -> RpcResult<ImportParentsResponse> {
        let caller_id = self.authorize(ctx).await?;
        let org = ctx.organization_id.as_str();

        let rows: Vec<ImportParentRow> = serde_json::from_slice(&request.payload)
            .map_err(|e| RpcStatus::invalid_argument(format!("invalid payload: {}", e)))?;
        if rows.is_empty() {
            return Err(RpcStatus::invalid_argument("no data in payload"));
        }

        // Validate every row first; nothing is written if any row is rejected
        let mut errors = Vec::new();
        let mut seen_emails = HashSet::new();
        let mut resolved = Vec::with_capacity(rows.len());
        for (index, row) in rows.iter().enumerate() {
            let row_number = index + 1;
            let mut reject = |error: String| {
                errors.push(ImportError { row_number, error });
            };

            if row.email.trim().is_empty() {
                reject("email cannot be empty".to_string());
                continue;
            }
            if row.name.trim().is_empty() {
                reject("name cannot be empty".to_string());
                continue;
            }
            if !seen_emails.insert(row.email.clone()) {
                reject(format!("email {} is duplicated in payload", row.email));
                continue;
            }
            if let Err(status) = self.ensure_email_available(org, &row.email, None).await {
                reject(status.message);
                continue;
            }

            let mut students = Vec::with_capacity(row.student_ids.len());
            let mut missing = None;
            for student_id in &row.student_ids {
                match self.load_user(org, student_id, ROLE_USER_STUDENT).await {
                    Ok(student) => students.push(student),
                    Err(_) => {
                        missing = Some(student_id.clone());
                        break;
                    }
                }
            }
            match missing {
                Some(student_id) => reject(format!("student {} does not exist", student_id)),
                None => resolved.push((row.clone(), students)),
            }
        }

        if !errors.is_empty() {
            warn!("Parent import rejected with {} row error(s)", errors.len());
            return Ok(ImportParentsResponse {
                parent_ids: Vec::new(),
                errors,
            });
        }

        let mut parent_ids = Vec::with_capacity(resolved.len());
        for (row, students) in resolved {
            let parent = NewParent {
                name: row.name,
                first_name: String::new(),
                last_name: String::new(),
                email: row.email,
                phone_number: row.phone_number,
                country: String::new(),
                relationship: row.relationship,
                tag_ids: Vec::new(),
                password: None,
            };
            let created = self
                .insert_parent(ctx, &caller_id, 0, &students, parent)
                .await?;
            parent_ids.push(created.parent_id);
        }

        info!("Imported {} parent(s) into '{}'", parent_ids.len(), org);
        Ok(ImportParentsResponse {
            parent_ids,
            errors: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{InMemoryBus, SubscribeOptions};
    use crate::events::SUBJECT_USER_CREATED;
    use crate::storage::InMemoryStorage;

    type Service = InMemoryUserService<InMemoryBus, InMemoryStorage>;

    fn service() -> (Service, Arc<InMemoryBus>) {
        let bus = Arc::new(InMemoryBus::new());
        let service = InMemoryUserService::new(Arc::clone(&bus), Arc::new(InMemoryStorage::new()))
            .with_locations(["loc-1", "loc-2"])
            .with_tags(["tag-1"]);
        (service, bus)
    }

    fn ctx() -> CallContext {
        CallContext::new("token", "org-1")
    }

    fn student_request(email: &str) -> CreateStudentRequest {
        CreateStudentRequest {
            school_id: 1,
            student_profile: StudentProfile {
                email: email.to_string(),
                password: "password-1".to_string(),
                name: "user-42".to_string(),
                country_code: "COUNTRY_VN".to_string(),
                enrollment_status: EnrollmentStatus::Enrolled,
                grade: 5,
                location_ids: vec!["loc-1".to_string()],
                ..StudentProfile::default()
            },
        }
    }

    #[tokio::test]
    async fn test_create_student_writes_rows_and_publishes() {
        let (service, bus) = service();
        let response = service
            .create_student(&ctx(), student_request("a@example.com"))
            .await
            .unwrap();

        let user: UserRow = get_row(
            service.storage().as_ref(),
            StorageKey::new("org-1", tables::USERS, &response.student_id),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(user.name, "user-42");
        assert_eq!(user.resource_path, "org-1");

        let messages = bus.messages(SUBJECT_USER_CREATED);
        assert_eq!(messages.len(), 1);
        let (envelope, event) = crate::events::decode_message(&messages[0].data).unwrap();
        assert_eq!(envelope.resource_path, "org-1");
        assert_eq!(event.student_id(), response.student_id);
    }

    #[tokio::test]
    async fn test_storage_outage_is_unavailable() {
        let bus = Arc::new(InMemoryBus::new());
        let storage = Arc::new(InMemoryStorage::new());
        let service = InMemoryUserService::new(Arc::clone(&bus), Arc::clone(&storage))
            .with_locations(["loc-1"]);
        storage.set_available(false);

        let status = service
            .create_student(&ctx(), student_request("a@example.com"))
            .await
            .unwrap_err();
        assert_eq!(status.code, StatusCode::Unavailable);
        assert!(bus.messages(SUBJECT_USER_CREATED).is_empty());
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthenticated() {
        let (service, _) = service();
        let result = service
            .create_student(&CallContext::anonymous("org-1"), student_request("a@example.com"))
            .await;
        assert_eq!(result.unwrap_err().code, StatusCode::Unauthenticated);
    }

    #[tokio::test]
    async fn test_student_validation() {
        let (service, _) = service();

        let mut request = student_request("a@example.com");
        request.student_profile.name.clear();
        let status = service.create_student(&ctx(), request).await.unwrap_err();
        assert_eq!(status.code, StatusCode::InvalidArgument);

        let mut request = student_request("a@example.com");
        request.student_profile.location_ids = vec!["loc-9".to_string()];
        let status = service.create_student(&ctx(), request).await.unwrap_err();
        assert_eq!(status.code, StatusCode::InvalidArgument);
        assert!(status.message.contains("loc-9"));

        service
            .create_student(&ctx(), student_request("a@example.com"))
            .await
            .unwrap();
        let status = service
            .create_student(&ctx(), student_request("a@example.com"))
            .await
            .unwrap_err();
        assert_eq!(status.code, StatusCode::AlreadyExists);
    }

    #[tokio::test]
    async fn test_same_email_allowed_in_other_organization() {
        let (service, _) = service();
        service
            .create_student(&ctx(), student_request("a@example.com"))
            .await
            .unwrap();
        service
            .create_student(&CallContext::new("token", "org-2"), student_request("a@example.com"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_disabled_publishing_still_writes_rows() {
        let (service, bus) = service();
        service.set_publish_events(false);

        service
            .create_student(&ctx(), student_request("a@example.com"))
            .await
            .unwrap();
        assert!(bus.messages(SUBJECT_USER_CREATED).is_empty());
    }

    #[tokio::test]
    async fn test_parents_inherit_student_locations() {
        let (service, _) = service();
        let student = service
            .create_student(&ctx(), student_request("s@example.com"))
            .await
            .unwrap();

        let request = CreateParentsRequest {
            school_id: 1,
            student_id: student.student_id.clone(),
            parent_profiles: vec![ParentProfile {
                name: "parent-1".to_string(),
                email: "p@example.com".to_string(),
                password: "password-1".to_string(),
                country_code: "COUNTRY_VN".to_string(),
                relationship: FamilyRelationship::Father,
                ..ParentProfile::default()
            }],
        };
        let response = service.create_parents(&ctx(), request).await.unwrap();
        let parent_id = &response.parents[0].parent_id;

        let paths: Vec<UserAccessPathRow> = find_rows(
            service.storage().as_ref(),
            StorageKey::prefix("org-1", tables::USER_ACCESS_PATHS),
            "user_id",
            parent_id,
        )
        .await
        .unwrap();
        assert_eq!(paths, vec![UserAccessPathRow::new(parent_id.as_str(), "loc-1")]);
    }

    #[tokio::test]
    async fn test_create_parents_for_unknown_student() {
        let (service, _) = service();
        let request = CreateParentsRequest {
            school_id: 1,
            student_id: "missing".to_string(),
            parent_profiles: vec![ParentProfile {
                name: "parent-1".to_string(),
                email: "p@example.com".to_string(),
                password: "password-1".to_string(),
                country_code: "COUNTRY_VN".to_string(),
                relationship: FamilyRelationship::Mother,
                ..ParentProfile::default()
            }],
        };
        let status = service.create_parents(&ctx(), request).await.unwrap_err();
        assert_eq!(status.code, StatusCode::NotFound);
    }

    #[tokio::test]
    async fn test_import_is_all_or_nothing() {
        let (service, bus) = service();
        let student = service
            .create_student(&ctx(), student_request("s@example.com"))
            .await
            .unwrap();

        let rows = vec![
            ImportParentRow {
                email: "p1@example.com".to_string(),
                name: "parent-1".to_string(),
                phone_number: String::new(),
                student_ids: vec![student.student_id.clone()],
                relationship: FamilyRelationship::Father,
            },
            ImportParentRow {
                email: "p2@example.com".to_string(),
                name: "parent-2".to_string(),
                phone_number: String::new(),
                student_ids: vec!["missing".to_string()],
                relationship: FamilyRelationship::Mother,
            },
        ];
        let request = ImportParentsRequest::from_rows(&rows).unwrap();
        let response = service
            .import_parents_and_assign_to_student(&ctx(), request)
            .await
            .unwrap();

        assert!(response.parent_ids.is_empty());
        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.errors[0].row_number, 2);
        // Only the student creation event
        assert_eq!(bus.messages(SUBJECT_USER_CREATED).len(), 1);
    }

    #[tokio::test]
    async fn test_user_group_with_unknown_role() {
        let (service, _) = service();
        let request = CreateUserGroupRequest {
            user_group_name: "group".to_string(),
            role_with_locations: vec![RoleWithLocations {
                role_name: "Wizard".to_string(),
                location_ids: vec![],
            }],
        };
        let status = service.create_user_group(&ctx(), request).await.unwrap_err();
        assert_eq!(status.code, StatusCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_reissue_password_requires_identity_provider() {
        let (service, _) = service();
        let student = service
            .create_student(&ctx(), student_request("s@example.com"))
            .await
            .unwrap();
        let status = service
            .reissue_user_password(
                &ctx(),
                ReissueUserPasswordRequest {
                    user_id: student.student_id,
                    new_password: "new-password".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(status.code, StatusCode::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_published_event_reaches_subscriber() {
        let (service, bus) = service();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handler: crate::bus::MessageHandler = Arc::new(move |m| {
            let _ = tx.send(m.sequence);
            crate::bus::HandlerOutcome::Ack
        });
        let _sub = bus
            .subscribe(SUBJECT_USER_CREATED, SubscribeOptions::new(), handler)
            .await
            .unwrap();

        service
            .create_student(&ctx(), student_request("s@example.com"))
            .await
            .unwrap();
        assert!(rx.recv().await.is_some());
    }
}
