//! User-management RPC contract.
//!
//! [`UserManagementApi`] is the surface the harness drives. Every call takes a
//! [`CallContext`] carrying the exchanged token and the organization, and
//! fails with an [`RpcStatus`] modelled on gRPC status codes.
//! [`InMemoryUserService`] implements the contract over any message bus and
//! store.

pub mod in_memory;
pub mod types;

pub use in_memory::InMemoryUserService;
pub use types::*;

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};

/// Per-call metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    /// Exchanged application token; `None` for an anonymous call.
    pub token: Option<String>,
    /// Resource path of the organization the call acts in.
    pub organization_id: String,
}

impl CallContext {
    pub fn new(token: impl Into<String>, organization_id: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            organization_id: organization_id.into(),
        }
    }

    pub fn anonymous(organization_id: impl Into<String>) -> Self {
        Self {
            token: None,
            organization_id: organization_id.into(),
        }
    }
}

/// RPC status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl StatusCode {
    /// Parse a code name as written in scenario tables, e.g. `InvalidArgument`
    /// or `INVALID_ARGUMENT`.
    pub fn parse(name: &str) -> Option<Self> {
        let normalized: String = name
            .chars()
            .filter(|c| *c != '_')
            .flat_map(char::to_lowercase)
            .collect();
        let code = match normalized.as_str() {
            "ok" => StatusCode::Ok,
            "cancelled" => StatusCode::Cancelled,
            "unknown" => StatusCode::Unknown,
            "invalidargument" => StatusCode::InvalidArgument,
            "deadlineexceeded" => StatusCode::DeadlineExceeded,
            "notfound" => StatusCode::NotFound,
            "alreadyexists" => StatusCode::AlreadyExists,
            "permissiondenied" => StatusCode::PermissionDenied,
            "resourceexhausted" => StatusCode::ResourceExhausted,
            "failedprecondition" => StatusCode::FailedPrecondition,
            "aborted" => StatusCode::Aborted,
            "outofrange" => StatusCode::OutOfRange,
            "unimplemented" => StatusCode::Unimplemented,
            "internal" => StatusCode::Internal,
            "unavailable" => StatusCode::Unavailable,
            "dataloss" => StatusCode::DataLoss,
            "unauthenticated" => StatusCode::Unauthenticated,
            _ => return None,
        };
        Some(code)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A failed RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcStatus {
    pub code: StatusCode,
    pub message: String,
}

impl RpcStatus {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(StatusCode::AlreadyExists, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unauthenticated, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }
}

impl fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcStatus {}

pub type RpcResult<T> = Result<T, RpcStatus>;

/// The user-management service.
pub trait UserManagementApi: Send + Sync {
    fn create_student(
        &self,
        ctx: &CallContext,
        request: CreateStudentRequest,
    ) -> impl Future<Output = RpcResult<CreateStudentResponse>> + Send;

    fn update_student(
        &self,
        ctx: &CallContext,
        request: UpdateStudentRequest,
    ) -> impl Future<Output = RpcResult<UpdateStudentResponse>> + Send;

    /// Create parents and assign them to an existing student.
    fn create_parents(
        &self,
        ctx: &CallContext,
        request: CreateParentsRequest,
    ) -> impl Future<Output = RpcResult<CreateParentsResponse>> + Send;

    fn update_parents(
        &self,
        ctx: &CallContext,
        request: UpdateParentsRequest,
    ) -> impl Future<Output = RpcResult<UpdateParentsResponse>> + Send;

    fn create_staff(
        &self,
        ctx: &CallContext,
        request: CreateStaffRequest,
    ) -> impl Future<Output = RpcResult<CreateStaffResponse>> + Send;

    fn update_staff(
        &self,
        ctx: &CallContext,
        request: UpdateStaffRequest,
    ) -> impl Future<Output = RpcResult<UpdateStaffResponse>> + Send;

    fn create_user_group(
        &self,
        ctx: &CallContext,
        request: CreateUserGroupRequest,
    ) -> impl Future<Output = RpcResult<CreateUserGroupResponse>> + Send;

    fn update_user_group(
        &self,
        ctx: &CallContext,
        request: UpdateUserGroupRequest,
    ) -> impl Future<Output = RpcResult<UpdateUserGroupResponse>> + Send;

    fn reissue_user_password(
        &self,
        ctx: &CallContext,
        request: ReissueUserPasswordRequest,
    ) -> impl Future<Output = RpcResult<ReissueUserPasswordResponse>> + Send;

    fn import_parents_and_assign_to_student(
        &self,
        ctx: &CallContext,
        request: ImportParentsRequest,
    ) -> impl Future<Output = RpcResult<ImportParentsResponse>> + Send;
}
