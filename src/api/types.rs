//! Request and response messages of the user-management API.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Gender {
    #[default]
    None,
    Male,
    Female,
}

impl Gender {
    /// Stored column value; `None` for an unset gender.
    pub fn as_column(self) -> Option<String> {
        match self {
            Gender::None => None,
            Gender::Male => Some("MALE".to_string()),
            Gender::Female => Some("FEMALE".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EnrollmentStatus {
    #[default]
    None,
    Potential,
    Enrolled,
    Withdrawn,
    Graduated,
    Temporary,
}

impl fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EnrollmentStatus::None => "STUDENT_ENROLLMENT_STATUS_NONE",
            EnrollmentStatus::Potential => "STUDENT_ENROLLMENT_STATUS_POTENTIAL",
            EnrollmentStatus::Enrolled => "STUDENT_ENROLLMENT_STATUS_ENROLLED",
            EnrollmentStatus::Withdrawn => "STUDENT_ENROLLMENT_STATUS_WITHDRAWN",
            EnrollmentStatus::Graduated => "STUDENT_ENROLLMENT_STATUS_GRADUATED",
            EnrollmentStatus::Temporary => "STUDENT_ENROLLMENT_STATUS_TEMPORARY",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FamilyRelationship {
    #[default]
    None,
    Father,
    Mother,
    Grandparent,
    Other,
}

impl fmt::Display for FamilyRelationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FamilyRelationship::None => "FAMILY_RELATIONSHIP_NONE",
            FamilyRelationship::Father => "FAMILY_RELATIONSHIP_FATHER",
            FamilyRelationship::Mother => "FAMILY_RELATIONSHIP_MOTHER",
            FamilyRelationship::Grandparent => "FAMILY_RELATIONSHIP_GRANDPARENT",
            FamilyRelationship::Other => "FAMILY_RELATIONSHIP_OTHER",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StudentProfile {
    pub email: String,
    pub password: String,
    pub name: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub country_code: String,
    pub enrollment_status: EnrollmentStatus,
    #[serde(default)]
    pub phone_number: String,
    #[serde(default)]
    pub student_external_id: String,
    #[serde(default)]
    pub student_note: String,
    pub grade: i32,
    #[serde(default)]
    pub birthday: Option<NaiveDate>,
    #[serde(default)]
    pub gender: Gender,
    pub location_ids: Vec<String>,
    #[serde(default)]
    pub tag_ids: Vec<String>,
}

impl StudentProfile {
    /// Name as stored: first and last name joined when given, else `name`.
    pub fn full_name(&self) -> String {
        combine_name(&self.first_name, &self.last_name, &self.name)
    }
}

pub(crate) fn combine_name(first_name: &str, last_name: &str, name: &str) -> String {
    if first_name.is_empty() && last_name.is_empty() {
        name.to_string()
    } else {
        format!("{} {}", last_name, first_name).trim().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateStudentRequest {
    pub school_id: i32,
    pub student_profile: StudentProfile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateStudentResponse {
    pub student_id: String,
    pub name: String,
    pub email: String,
    pub location_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UpdateStudentProfile {
    pub student_id: String,
    pub name: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub email: String,
    pub grade: i32,
    pub enrollment_status: EnrollmentStatus,
    #[serde(default)]
    pub student_external_id: String,
    #[serde(default)]
    pub student_note: String,
    #[serde(default)]
    pub birthday: Option<NaiveDate>,
    #[serde(default)]
    pub gender: Gender,
    pub location_ids: Vec<String>,
    #[serde(default)]
    pub tag_ids: Vec<String>,
}

impl UpdateStudentProfile {
    pub fn full_name(&self) -> String {
        combine_name(&self.first_name, &self.last_name, &self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStudentRequest {
    pub school_id: i32,
    pub student_profile: UpdateStudentProfile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStudentResponse {
    pub student_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParentProfile {
    pub name: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub phone_number: String,
    pub country_code: String,
    pub relationship: FamilyRelationship,
    #[serde(default)]
    pub tag_ids: Vec<String>,
}

impl ParentProfile {
    pub fn full_name(&self) -> String {
        combine_name(&self.first_name, &self.last_name, &self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateParentsRequest {
    pub school_id: i32,
    pub student_id: String,
    pub parent_profiles: Vec<ParentProfile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedParent {
    pub parent_id: String,
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateParentsResponse {
    pub student_id: String,
    pub parents: Vec<CreatedParent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UpdateParentProfile {
    pub parent_id: String,
    pub name: String,
    pub email: String,
    pub relationship: FamilyRelationship,
    #[serde(default)]
    pub tag_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateParentsRequest {
    pub student_id: String,
    pub parent_profiles: Vec<UpdateParentProfile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateParentsResponse {
    pub student_id: String,
    pub parent_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StaffProfile {
    pub name: String,
    pub email: String,
    pub country: String,
    #[serde(default)]
    pub phone_number: String,
    #[serde(default)]
    pub gender: Gender,
    #[serde(default)]
    pub birthday: Option<NaiveDate>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub remarks: String,
    #[serde(default)]
    pub user_group_ids: Vec<String>,
    #[serde(default)]
    pub location_ids: Vec<String>,
    #[serde(default)]
    pub tag_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateStaffRequest {
    pub staff: StaffProfile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateStaffResponse {
    pub staff_id: String,
    pub email: String,
    pub user_group_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStaffRequest {
    pub staff_id: String,
    pub staff: StaffProfile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStaffResponse {
    pub staff_id: String,
}

/// A role granted to a user group at a set of locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleWithLocations {
    pub role_name: String,
    pub location_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateUserGroupRequest {
    pub user_group_name: String,
    pub role_with_locations: Vec<RoleWithLocations>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateUserGroupResponse {
    pub user_group_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateUserGroupRequest {
    pub user_group_id: String,
    pub user_group_name: String,
    pub role_with_locations: Vec<RoleWithLocations>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateUserGroupResponse {
    pub user_group_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReissueUserPasswordRequest {
    pub user_id: String,
    pub new_password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReissueUserPasswordResponse {
    pub successful: bool,
}

/// One row of a parent import. The real service parses CSV; here the payload
/// is a JSON array of these rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportParentRow {
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub phone_number: String,
    #[serde(default)]
    pub student_ids: Vec<String>,
    #[serde(default)]
    pub relationship: FamilyRelationship,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportParentsRequest {
    pub payload: Vec<u8>,
}

impl ImportParentsRequest {
    pub fn from_rows(rows: &[ImportParentRow]) -> Result<Self, serde_json::Error> {
        Ok(Self {
            payload: serde_json::to_vec(rows)?,
        })
    }
}

/// A rejected import row, 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportError {
    pub row_number: usize,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportParentsResponse {
    pub parent_ids: Vec<String>,
    pub errors: Vec<ImportError>,
}

/// The request a scenario sent, tagged by workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "workflow", content = "request", rename_all = "snake_case")]
pub enum WorkflowRequest {
    CreateStudent(CreateStudentRequest),
    UpdateStudent(UpdateStudentRequest),
    CreateParents(CreateParentsRequest),
    UpdateParents(UpdateParentsRequest),
    CreateStaff(CreateStaffRequest),
    UpdateStaff(UpdateStaffRequest),
    CreateUserGroup(CreateUserGroupRequest),
    UpdateUserGroup(UpdateUserGroupRequest),
    ReissueUserPassword(ReissueUserPasswordRequest),
    ImportParents(ImportParentsRequest),
}

impl WorkflowRequest {
    /// RPC method name, used in error messages.
    pub fn method(&self) -> &'static str {
        match self {
            WorkflowRequest::CreateStudent(_) => "CreateStudent",
            WorkflowRequest::UpdateStudent(_) => "UpdateStudent",
            WorkflowRequest::CreateParents(_) => "CreateParentsAndAssignToStudent",
            WorkflowRequest::UpdateParents(_) => "UpdateParentsAndFamilyRelationship",
            WorkflowRequest::CreateStaff(_) => "CreateStaff",
            WorkflowRequest::UpdateStaff(_) => "UpdateStaff",
            WorkflowRequest::CreateUserGroup(_) => "CreateUserGroup",
            WorkflowRequest::UpdateUserGroup(_) => "UpdateUserGroup",
            WorkflowRequest::ReissueUserPassword(_) => "ReissueUserPassword",
            WorkflowRequest::ImportParents(_) => "ImportParentsAndAssignToStudent",
        }
    }
}

/// The response a scenario received, tagged by workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "workflow", content = "response", rename_all = "snake_case")]
pub enum WorkflowResponse {
    CreateStudent(CreateStudentResponse),
    UpdateStudent(UpdateStudentResponse),
    CreateParents(CreateParentsResponse),
    UpdateParents(UpdateParentsResponse),
    CreateStaff(CreateStaffResponse),
    UpdateStaff(UpdateStaffResponse),
    CreateUserGroup(CreateUserGroupResponse),
    UpdateUserGroup(UpdateUserGroupResponse),
    ReissueUserPassword(ReissueUserPasswordResponse),
    ImportParents(ImportParentsResponse),
}
