//! Default request builders.
//!
//! Every builder draws a fresh id, so requests from concurrent scenarios
//! never collide on names or emails.

use chrono::{Duration, NaiveDate, Utc};
use uuid::Uuid;

use crate::api::{
    CreateParentsRequest, CreateStaffRequest, CreateStudentRequest, CreateUserGroupRequest,
    EnrollmentStatus, FamilyRelationship, Gender, ImportParentRow, ParentProfile,
    ReissueUserPasswordRequest, RoleWithLocations, StaffProfile, StudentProfile,
    UpdateParentProfile, UpdateParentsRequest, UpdateStaffRequest, UpdateStudentProfile,
    UpdateStudentRequest, UpdateUserGroupRequest,
};

/// Reference data default requests point at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderDefaults {
    pub school_id: i32,
    pub country_code: String,
    pub location_ids: Vec<String>,
    pub tag_ids: Vec<String>,
    /// Role granted by default user groups.
    pub role: String,
}

impl Default for BuilderDefaults {
    fn default() -> Self {
        Self {
            school_id: 1,
            country_code: "COUNTRY_VN".to_string(),
            location_ids: Vec::new(),
            tag_ids: Vec::new(),
            role: "Teacher".to_string(),
        }
    }
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn years_ago(years: i64) -> NaiveDate {
    Utc::now().date_naive() - Duration::days(365 * years)
}

/// A student called `user-{id}`.
pub fn student_request(defaults: &BuilderDefaults) -> CreateStudentRequest {
    student_request_named(defaults, &format!("user-{}", new_id()))
}

pub fn student_request_named(defaults: &BuilderDefaults, name: &str) -> CreateStudentRequest {
    let id = new_id();
    CreateStudentRequest {
        school_id: defaults.school_id,
        student_profile: StudentProfile {
            email: format!("{}@example.com", id),
            password: format!("password-{}", id),
            name: name.to_string(),
            country_code: defaults.country_code.clone(),
            enrollment_status: EnrollmentStatus::Enrolled,
            phone_number: format!("phone-number-{}", id),
            student_external_id: format!("student-external-id-{}", id),
            student_note: format!("some random student note {}", id),
            grade: 5,
            birthday: Some(years_ago(10)),
            gender: Gender::Male,
            location_ids: defaults.location_ids.clone(),
            tag_ids: defaults.tag_ids.clone(),
            ..StudentProfile::default()
        },
    }
}

pub fn update_student_request(defaults: &BuilderDefaults, student_id: &str) -> UpdateStudentRequest {
    let id = new_id();
    UpdateStudentRequest {
        school_id: defaults.school_id,
        student_profile: UpdateStudentProfile {
            student_id: student_id.to_string(),
            name: String::new(),
            first_name: format!("updated-first-name-{}", id),
            last_name: format!("updated-last-name-{}", id),
            email: format!("student-email-edited-{}@example.com", id),
            grade: 1,
            enrollment_status: EnrollmentStatus::Enrolled,
            student_external_id: format!("student-external-id-{}", id),
            student_note: format!("some random student note edited {}", id),
            birthday: Some(years_ago(10)),
            gender: Gender::Male,
            location_ids: defaults.location_ids.clone(),
            tag_ids: defaults.tag_ids.clone(),
        },
    }
}

pub fn parent_profile(defaults: &BuilderDefaults) -> ParentProfile {
    let id = new_id();
    ParentProfile {
        name: format!("user-{}", id),
        email: format!("{}@example.com", id),
        password: format!("password-{}", id),
        phone_number: format!("phone-number-{}", id),
        country_code: defaults.country_code.clone(),
        relationship: FamilyRelationship::Father,
        ..ParentProfile::default()
    }
}

/// One parent for `student_id`.
pub fn parents_request(defaults: &BuilderDefaults, student_id: &str) -> CreateParentsRequest {
    CreateParentsRequest {
        school_id: defaults.school_id,
        student_id: student_id.to_string(),
        parent_profiles: vec![parent_profile(defaults)],
    }
}

pub fn update_parents_request(student_id: &str, parent_ids: &[String]) -> UpdateParentsRequest {
    let parent_profiles = parent_ids
        .iter()
        .map(|parent_id| {
            let id = new_id();
            UpdateParentProfile {
                parent_id: parent_id.clone(),
                name: format!("updated-user-{}", id),
                email: format!("updated-{}@example.com", id),
                relationship: FamilyRelationship::Mother,
                tag_ids: Vec::new(),
            }
        })
        .collect();
    UpdateParentsRequest {
        student_id: student_id.to_string(),
        parent_profiles,
    }
}

pub fn user_group_request(defaults: &BuilderDefaults) -> CreateUserGroupRequest {
    CreateUserGroupRequest {
        user_group_name: format!("user-group-{}", new_id()),
        role_with_locations: vec![RoleWithLocations {
            role_name: defaults.role.clone(),
            location_ids: defaults.location_ids.clone(),
        }],
    }
}

pub fn update_user_group_request(
    defaults: &BuilderDefaults,
    user_group_id: &str,
) -> UpdateUserGroupRequest {
    UpdateUserGroupRequest {
        user_group_id: user_group_id.to_string(),
        user_group_name: format!("updated-user-group-{}", new_id()),
        role_with_locations: vec![RoleWithLocations {
            role_name: defaults.role.clone(),
            location_ids: defaults.location_ids.clone(),
        }],
    }
}

fn staff_profile(defaults: &BuilderDefaults, user_group_ids: Vec<String>) -> StaffProfile {
    let id = new_id();
    let today = Utc::now().date_naive();
    StaffProfile {
        name: format!("create_staff+{}", id),
        email: format!("staff+{}@example.com", id),
        country: defaults.country_code.clone(),
        phone_number: String::new(),
        gender: Gender::Male,
        birthday: Some(years_ago(30)),
        start_date: Some(today),
        end_date: Some(today + Duration::days(3650)),
        remarks: "Hello remarks".to_string(),
        user_group_ids,
        location_ids: defaults.location_ids.clone(),
        tag_ids: defaults.tag_ids.clone(),
    }
}

pub fn staff_request(defaults: &BuilderDefaults, user_group_ids: Vec<String>) -> CreateStaffRequest {
    CreateStaffRequest {
        staff: staff_profile(defaults, user_group_ids),
    }
}

pub fn update_staff_request(
    defaults: &BuilderDefaults,
    staff_id: &str,
    user_group_ids: Vec<String>,
) -> UpdateStaffRequest {
    let mut staff = staff_profile(defaults, user_group_ids);
    staff.name = format!("updated_staff+{}", new_id());
    staff.remarks = "Updated remarks".to_string();
    UpdateStaffRequest {
        staff_id: staff_id.to_string(),
        staff,
    }
}

pub fn reissue_password_request(user_id: &str) -> ReissueUserPasswordRequest {
    ReissueUserPasswordRequest {
        user_id: user_id.to_string(),
        new_password: format!("password-{}", new_id()),
    }
}

/// One import row linking a new parent to `student_id`.
pub fn import_parent_row(student_id: &str) -> ImportParentRow {
    let id = new_id();
    ImportParentRow {
        email: format!("{}@example.com", id),
        name: format!("user-{}", id),
        phone_number: format!("phone-number-{}", id),
        student_ids: vec![student_id.to_string()],
        relationship: FamilyRelationship::Father,
    }
}
