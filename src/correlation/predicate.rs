//! Match predicates evaluated against decoded events.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::events::{EventKind, UserEvent};

/// What a predicate sees for one decoded message.
#[derive(Debug, Clone, Copy)]
pub struct EventContext<'a> {
    pub subject: &'a str,
    pub sequence: u64,
    pub published_at: DateTime<Utc>,
    /// Tenant the publisher stamped on the envelope.
    pub resource_path: &'a str,
    pub user_id: &'a str,
    pub event: &'a UserEvent,
}

type PredicateFn = dyn Fn(&EventContext<'_>) -> bool + Send + Sync;

/// A pure test over a decoded event, with a description used in timeout
/// errors.
///
/// Predicates run on the bus delivery task. They must not block.
#[derive(Clone)]
pub struct MatchPredicate {
    description: String,
    test: Arc<PredicateFn>,
}

impl MatchPredicate {
    pub fn new<F>(description: impl Into<String>, test: F) -> Self
    where
        F: Fn(&EventContext<'_>) -> bool + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            test: Arc::new(test),
        }
    }

    /// Matches any user event that concerns the student called `name`.
    pub fn student_named(name: impl Into<String>) -> Self {
        let name = name.into();
        let description = format!("event for student named '{}'", name);
        Self::new(description, move |ctx| ctx.event.student_name() == name)
    }

    /// Matches any user event that concerns the student with id `student_id`.
    pub fn student_id(student_id: impl Into<String>) -> Self {
        let student_id = student_id.into();
        let description = format!("event for student '{}'", student_id);
        Self::new(description, move |ctx| ctx.event.student_id() == student_id)
    }

    /// Matches parent events for the parent called `name`.
    pub fn parent_named(name: impl Into<String>) -> Self {
        let name = name.into();
        let description = format!("event for parent named '{}'", name);
        Self::new(description, move |ctx| match ctx.event {
            UserEvent::CreateParent(e) | UserEvent::UpdateParent(e) => e.parent_name == name,
            _ => false,
        })
    }

    /// Matches parent events for the parent with id `parent_id`.
    pub fn parent_id(parent_id: impl Into<String>) -> Self {
        let parent_id = parent_id.into();
        let description = format!("event for parent '{}'", parent_id);
        Self::new(description, move |ctx| match ctx.event {
            UserEvent::CreateParent(e) | UserEvent::UpdateParent(e) => e.parent_id == parent_id,
            _ => false,
        })
    }

    /// Matches events of one kind.
    pub fn kind(kind: EventKind) -> Self {
        Self::new(format!("{} event", kind), move |ctx| ctx.event.kind() == kind)
    }

    /// Both predicates must hold. `self` is evaluated first.
    pub fn and(self, other: MatchPredicate) -> Self {
        let description = format!("{} and {}", self.description, other.description);
        let (left, right) = (self.test, other.test);
        Self {
            description,
            test: Arc::new(move |ctx| left(ctx) && right(ctx)),
        }
    }

    /// Restrict to events published for one organization.
    pub fn in_resource_path(self, resource_path: impl Into<String>) -> Self {
        let resource_path = resource_path.into();
        let scope = MatchPredicate::new(
            format!("in resource path '{}'", resource_path),
            move |ctx| ctx.resource_path == resource_path,
        );
        self.and(scope)
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn evaluate(&self, ctx: &EventContext<'_>) -> bool {
        (self.test)(ctx)
    }
}

impl fmt::Debug for MatchPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchPredicate")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}
