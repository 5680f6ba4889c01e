//! Backing-store contracts the engine consumes. The engine holds these as
//! injected trait objects; `InMemoryStore` is the reference implementation.

mod memory;

pub use memory::{Fixture, InMemoryStore};

use async_trait::async_trait;
use chrono::{NaiveDate, Weekday};
use ulid::Ulid;

use crate::filter::Filter;
use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backing store unreachable or the transaction could not run. Transient.
    Unavailable(String),
    NotFound(Ulid),
    /// Insert-time re-check found this active appointment in the way.
    SlotTaken(Ulid),
    /// Attempt to modify an AUTO_RESOLVED conflict.
    Immutable(Ulid),
    /// Record id or idempotency key already used by this record.
    DuplicateKey(Ulid),
    InvalidTransition(Ulid),
    LimitExceeded(&'static str),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(e) => write!(f, "store unavailable: {e}"),
            StoreError::NotFound(id) => write!(f, "record not found: {id}"),
            StoreError::SlotTaken(id) => write!(f, "slot taken by appointment {id}"),
            StoreError::Immutable(id) => write!(f, "conflict {id} is resolved and immutable"),
            StoreError::DuplicateKey(id) => write!(f, "duplicate key, existing record {id}"),
            StoreError::InvalidTransition(id) => {
                write!(f, "invalid status transition for appointment {id}")
            }
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// One write inside an atomic `commit`. A batch either applies in full or not at all.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// With `recheck`, the store rejects the insert with `SlotTaken` if any active
    /// appointment of a performer overlaps at commit time.
    InsertAppointment { appointment: Appointment, recheck: bool },
    UpdateAppointment { appointment: Appointment, recheck: bool },
    CancelAppointment { id: Ulid },
    SetAppointmentStatus { id: Ulid, status: AppointmentStatus },
    CreateWaitlist { entry: WaitlistEntry },
    InsertConflict { conflict: Conflict },
    /// Rejected with `Immutable` when the stored conflict is AUTO_RESOLVED.
    UpdateConflict { conflict: Conflict },
}

/// Working hours, staff, schedules, overrides and booking rules.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn branch(&self, id: Ulid) -> Result<Option<Branch>, StoreError>;
    /// Every other branch, ordered by id.
    async fn sibling_branches(&self, id: Ulid) -> Result<Vec<Branch>, StoreError>;
    async fn working_hours(
        &self,
        branch_id: Ulid,
        weekday: Weekday,
    ) -> Result<Option<WorkingHours>, StoreError>;
    async fn staff_member(&self, id: Ulid) -> Result<Option<StaffMember>, StoreError>;
    /// Staff of a branch, ordered by id.
    async fn staff_at_branch(&self, branch_id: Ulid) -> Result<Vec<StaffMember>, StoreError>;
    async fn staff_schedule(
        &self,
        staff_id: Ulid,
        date: NaiveDate,
    ) -> Result<Option<StaffSchedule>, StoreError>;
    /// Overrides of `scope` intersecting `range`, ordered by start.
    async fn overrides(
        &self,
        scope: OverrideScope,
        range: Span,
    ) -> Result<Vec<AvailabilityOverride>, StoreError>;
    /// Rules (active or not) whose scope is in `scopes`.
    async fn booking_rules(&self, scopes: &[RuleScope]) -> Result<Vec<BookingRule>, StoreError>;
}

#[async_trait]
pub trait ServiceCatalog: Send + Sync {
    async fn service(&self, id: Ulid) -> Result<Option<Service>, StoreError>;
}

/// Appointments, conflicts and the waitlist, sharing one transaction boundary.
#[async_trait]
pub trait AppointmentLedger: Send + Sync {
    async fn appointment(&self, id: Ulid) -> Result<Option<Appointment>, StoreError>;
    /// Appointments matching `filter`, ordered by start then id.
    async fn appointments(&self, filter: &Filter) -> Result<Vec<Appointment>, StoreError>;
    async fn conflict(&self, id: Ulid) -> Result<Option<Conflict>, StoreError>;
    async fn conflicts_involving(&self, appointment_id: Ulid) -> Result<Vec<Conflict>, StoreError>;
    async fn waitlist(&self, branch_id: Ulid) -> Result<Vec<WaitlistEntry>, StoreError>;
    /// Apply `batch` atomically.
    async fn commit(&self, batch: Vec<Mutation>) -> Result<(), StoreError>;
    /// Remove waitlist entries with `expires_at <= now`; returns how many.
    async fn purge_expired_waitlist(&self, now: Ms) -> Result<usize, StoreError>;
}
