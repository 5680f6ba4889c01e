mod booking;
mod conflict;
mod error;
mod escalation;
mod resolver;
mod rules;
mod slots;
mod window;

pub use booking::{NewAppointment, ServiceLayout};
pub use conflict::DetectionTrigger;
pub use error::EngineError;
pub use resolver::{Action, ResolutionOutcome, ResolutionSuggestion};
pub use rules::{RuleContext, filter_slots};
pub use window::{branch_window, grid_starts, merge_overlapping, staff_window, subtract_intervals};

use std::sync::Arc;

use ulid::Ulid;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::model::*;
use crate::notify::{Channel, Notification, NotificationDispatcher, Recipient};
use crate::store::{
    AppointmentLedger, InMemoryStore, Mutation, ScheduleStore, ServiceCatalog, StoreError,
};

/// A notification held back until its transaction commits.
#[derive(Debug, Clone)]
pub(super) struct Outgoing {
    pub recipient: Recipient,
    pub channel: Channel,
    pub message: Notification,
}

/// The availability and conflict engine. Stateless apart from its injected
/// collaborators; every shared fact lives in the backing store.
pub struct Engine {
    pub(super) schedule: Arc<dyn ScheduleStore>,
    pub(super) catalog: Arc<dyn ServiceCatalog>,
    pub(super) ledger: Arc<dyn AppointmentLedger>,
    pub(super) notifier: Arc<dyn NotificationDispatcher>,
    pub(super) clock: Arc<dyn Clock>,
    pub config: EngineConfig,
}

impl Engine {
    pub fn new(
        schedule: Arc<dyn ScheduleStore>,
        catalog: Arc<dyn ServiceCatalog>,
        ledger: Arc<dyn AppointmentLedger>,
        notifier: Arc<dyn NotificationDispatcher>,
        config: EngineConfig,
    ) -> Self {
        Self {
            schedule,
            catalog,
            ledger,
            notifier,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    /// All three store roles served by one in-memory store.
    pub fn in_memory(
        store: Arc<InMemoryStore>,
        notifier: Arc<dyn NotificationDispatcher>,
        config: EngineConfig,
    ) -> Self {
        Self::new(store.clone(), store.clone(), store, notifier, config)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    // ── Store access ─────────────────────────────────────────

    /// Commit a batch through the write retry policy.
    pub(super) async fn commit(&self, label: &'static str, batch: Vec<Mutation>) -> Result<(), StoreError> {
        self.config
            .write_retry
            .run(label, || self.ledger.commit(batch.clone()))
            .await
    }

    /// Hand post-commit notifications to the dispatcher.
    pub(super) fn dispatch(&self, outbox: Vec<Outgoing>) {
        for out in outbox {
            self.notifier.send(out.recipient, out.channel, out.message);
        }
    }

    pub(super) async fn require_branch(&self, id: Ulid) -> Result<Branch, EngineError> {
        self.config
            .read_retry
            .run("branch", || self.schedule.branch(id))
            .await?
            .ok_or(EngineError::NotFound("branch", id))
    }

    pub(super) async fn require_staff(&self, id: Ulid) -> Result<StaffMember, EngineError> {
        self.config
            .read_retry
            .run("staff", || self.schedule.staff_member(id))
            .await?
            .ok_or(EngineError::NotFound("staff", id))
    }

    pub(super) async fn require_service(&self, id: Ulid) -> Result<Service, EngineError> {
        self.config
            .read_retry
            .run("service", || self.catalog.service(id))
            .await?
            .ok_or(EngineError::NotFound("service", id))
    }

    pub(super) async fn require_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.config
            .read_retry
            .run("appointment", || self.ledger.appointment(id))
            .await?
            .ok_or(EngineError::NotFound("appointment", id))
    }

    pub(super) async fn require_conflict(&self, id: Ulid) -> Result<Conflict, EngineError> {
        self.config
            .read_retry
            .run("conflict", || self.ledger.conflict(id))
            .await?
            .ok_or(EngineError::NotFound("conflict", id))
    }

    pub(super) async fn load_services(&self, ids: &[Ulid]) -> Result<Vec<Service>, EngineError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.require_service(*id).await?);
        }
        Ok(out)
    }

    // ── Reads exposed to callers ─────────────────────────────

    pub async fn appointment(&self, id: Ulid) -> Result<Option<Appointment>, EngineError> {
        Ok(self
            .config
            .read_retry
            .run("appointment", || self.ledger.appointment(id))
            .await?)
    }

    pub async fn conflict(&self, id: Ulid) -> Result<Option<Conflict>, EngineError> {
        Ok(self
            .config
            .read_retry
            .run("conflict", || self.ledger.conflict(id))
            .await?)
    }

    pub async fn conflicts_involving(&self, appointment_id: Ulid) -> Result<Vec<Conflict>, EngineError> {
        Ok(self
            .config
            .read_retry
            .run("conflicts_involving", || self.ledger.conflicts_involving(appointment_id))
            .await?)
    }

    pub async fn waitlist(&self, branch_id: Ulid) -> Result<Vec<WaitlistEntry>, EngineError> {
        Ok(self
            .config
            .read_retry
            .run("waitlist", || self.ledger.waitlist(branch_id))
            .await?)
    }

    /// Drop waitlist entries whose expiry has passed.
    pub async fn purge_expired_waitlist(&self) -> Result<usize, EngineError> {
        let now = self.now();
        let purged = self
            .config
            .write_retry
            .run("purge_waitlist", || self.ledger.purge_expired_waitlist(now))
            .await?;
        if purged > 0 {
            metrics::counter!(crate::observability::WAITLIST_REAPED_TOTAL).increment(purged as u64);
        }
        Ok(purged)
    }
}
