use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{NaiveDate, Weekday};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::filter::Filter;
use crate::limits::MAX_MUTATIONS_PER_COMMIT;
use crate::model::*;

use super::{AppointmentLedger, Mutation, ScheduleStore, ServiceCatalog, StoreError};

/// Reference backing store. Read-mostly tables live in `DashMap`s; the
/// transactional tables sit behind one `RwLock` so `commit` is serialisable.
pub struct InMemoryStore {
    branches: DashMap<Ulid, Branch>,
    hours: DashMap<(Ulid, Weekday), WorkingHours>,
    staff: DashMap<Ulid, StaffMember>,
    schedules: DashMap<(Ulid, NaiveDate), StaffSchedule>,
    overrides: DashMap<Ulid, AvailabilityOverride>,
    rules: DashMap<Ulid, BookingRule>,
    services: DashMap<Ulid, Service>,
    ledger: RwLock<Ledger>,
    // Fault injection
    unreachable_schedules: DashSet<Ulid>,
    failing_commits: AtomicU32,
}

#[derive(Debug, Clone, Default)]
struct Ledger {
    appointments: HashMap<Ulid, Appointment>,
    conflicts: HashMap<Ulid, Conflict>,
    waitlist: HashMap<Ulid, WaitlistEntry>,
    idempotency: HashMap<String, Ulid>,
}

/// Everything needed to seed a store, e.g. from a JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Fixture {
    pub branches: Vec<Branch>,
    pub working_hours: Vec<WorkingHours>,
    pub staff: Vec<StaffMember>,
    pub schedules: Vec<StaffSchedule>,
    pub overrides: Vec<AvailabilityOverride>,
    pub rules: Vec<BookingRule>,
    pub services: Vec<Service>,
    pub appointments: Vec<Appointment>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            branches: DashMap::new(),
            hours: DashMap::new(),
            staff: DashMap::new(),
            schedules: DashMap::new(),
            overrides: DashMap::new(),
            rules: DashMap::new(),
            services: DashMap::new(),
            ledger: RwLock::new(Ledger::default()),
            unreachable_schedules: DashSet::new(),
            failing_commits: AtomicU32::new(0),
        }
    }

    pub fn from_fixture(fixture: Fixture) -> Self {
        let store = Self::new();
        for b in fixture.branches {
            store.put_branch(b);
        }
        for h in fixture.working_hours {
            store.put_working_hours(h);
        }
        for s in fixture.staff {
            store.put_staff(s);
        }
        for s in fixture.schedules {
            store.put_schedule(s);
        }
        for o in fixture.overrides {
            store.put_override(o);
        }
        for r in fixture.rules {
            store.put_rule(r);
        }
        for s in fixture.services {
            store.put_service(s);
        }
        // Not contended yet: the store has not been shared.
        if let Ok(mut ledger) = store.ledger.try_write() {
            for a in fixture.appointments {
                if let Some(key) = &a.idempotency_key {
                    ledger.idempotency.insert(key.clone(), a.id);
                }
                ledger.appointments.insert(a.id, a);
            }
        }
        store
    }

    // ── Schedule data ────────────────────────────────────────

    pub fn put_branch(&self, branch: Branch) {
        self.branches.insert(branch.id, branch);
    }

    pub fn put_working_hours(&self, hours: WorkingHours) {
        self.hours.insert((hours.branch_id, hours.weekday), hours);
    }

    pub fn put_staff(&self, staff: StaffMember) {
        self.staff.insert(staff.id, staff);
    }

    pub fn put_schedule(&self, schedule: StaffSchedule) {
        self.schedules
            .insert((schedule.staff_id, schedule.date), schedule);
    }

    pub fn remove_schedule(&self, staff_id: Ulid, date: NaiveDate) {
        self.schedules.remove(&(staff_id, date));
    }

    pub fn put_override(&self, ov: AvailabilityOverride) {
        self.overrides.insert(ov.id, ov);
    }

    pub fn remove_override(&self, id: &Ulid) {
        self.overrides.remove(id);
    }

    pub fn put_rule(&self, rule: BookingRule) {
        self.rules.insert(rule.id, rule);
    }

    pub fn put_service(&self, service: Service) {
        self.services.insert(service.id, service);
    }

    /// Insert an appointment without any re-check (imports, fixtures).
    pub async fn seed_appointment(&self, appointment: Appointment) {
        let mut ledger = self.ledger.write().await;
        ledger.appointments.insert(appointment.id, appointment);
    }

    pub async fn all_conflicts(&self) -> Vec<Conflict> {
        let ledger = self.ledger.read().await;
        let mut out: Vec<Conflict> = ledger.conflicts.values().cloned().collect();
        out.sort_by_key(|c| c.id);
        out
    }

    // ── Fault injection ──────────────────────────────────────

    /// Make schedule lookups for `staff_id` fail with `Unavailable`.
    pub fn make_schedule_unreachable(&self, staff_id: Ulid) {
        self.unreachable_schedules.insert(staff_id);
    }

    /// Fail the next `n` commits with `Unavailable` before touching state.
    pub fn fail_next_commits(&self, n: u32) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    fn take_injected_commit_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

// ── Ledger transaction ───────────────────────────────────────────

impl Ledger {
    fn apply(&mut self, mutation: Mutation) -> Result<(), StoreError> {
        match mutation {
            Mutation::InsertAppointment {
                appointment,
                recheck,
            } => {
                if self.appointments.contains_key(&appointment.id) {
                    return Err(StoreError::DuplicateKey(appointment.id));
                }
                if let Some(key) = &appointment.idempotency_key
                    && let Some(existing) = self.idempotency.get(key)
                {
                    return Err(StoreError::DuplicateKey(*existing));
                }
                if recheck {
                    self.check_free(&appointment)?;
                }
                if let Some(key) = &appointment.idempotency_key {
                    self.idempotency.insert(key.clone(), appointment.id);
                }
                self.appointments.insert(appointment.id, appointment);
            }
            Mutation::UpdateAppointment {
                appointment,
                recheck,
            } => {
                let current = self
                    .appointments
                    .get(&appointment.id)
                    .ok_or(StoreError::NotFound(appointment.id))?;
                if current.status.is_terminal() {
                    return Err(StoreError::InvalidTransition(appointment.id));
                }
                if recheck {
                    self.check_free(&appointment)?;
                }
                self.appointments.insert(appointment.id, appointment);
            }
            Mutation::CancelAppointment { id } => {
                self.set_status(id, AppointmentStatus::Cancelled)?;
            }
            Mutation::SetAppointmentStatus { id, status } => {
                self.set_status(id, status)?;
            }
            Mutation::CreateWaitlist { entry } => {
                if self.waitlist.contains_key(&entry.id) {
                    return Err(StoreError::DuplicateKey(entry.id));
                }
                self.waitlist.insert(entry.id, entry);
            }
            Mutation::InsertConflict { conflict } => {
                if self.conflicts.contains_key(&conflict.id) {
                    return Err(StoreError::DuplicateKey(conflict.id));
                }
                self.conflicts.insert(conflict.id, conflict);
            }
            Mutation::UpdateConflict { conflict } => {
                let current = self
                    .conflicts
                    .get(&conflict.id)
                    .ok_or(StoreError::NotFound(conflict.id))?;
                if current.is_resolved() {
                    return Err(StoreError::Immutable(conflict.id));
                }
                self.conflicts.insert(conflict.id, conflict);
            }
        }
        Ok(())
    }

    fn set_status(&mut self, id: Ulid, status: AppointmentStatus) -> Result<(), StoreError> {
        let appt = self
            .appointments
            .get_mut(&id)
            .ok_or(StoreError::NotFound(id))?;
        if !appt.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition(id));
        }
        appt.status = status;
        Ok(())
    }

    /// Every performer of `appointment` must be free over its span.
    fn check_free(&self, appointment: &Appointment) -> Result<(), StoreError> {
        if !appointment.status.is_active() {
            return Ok(());
        }
        for staff_id in appointment.performers() {
            let Some(own) = appointment.span_for(staff_id) else {
                continue;
            };
            let filter = Filter::staff_occupancy(staff_id, own).and(Filter::not_id(appointment.id));
            if let Some(other) = self
                .appointments
                .values()
                .find(|a| filter.matches(a) && a.occupies(staff_id, &own))
            {
                return Err(StoreError::SlotTaken(other.id));
            }
        }
        Ok(())
    }
}

// ── Trait implementations ────────────────────────────────────────

#[async_trait]
impl ScheduleStore for InMemoryStore {
    async fn branch(&self, id: Ulid) -> Result<Option<Branch>, StoreError> {
        Ok(self.branches.get(&id).map(|e| e.value().clone()))
    }

    async fn sibling_branches(&self, id: Ulid) -> Result<Vec<Branch>, StoreError> {
        let mut out: Vec<Branch> = self
            .branches
            .iter()
            .filter(|e| *e.key() != id)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|b| b.id);
        Ok(out)
    }

    async fn working_hours(
        &self,
        branch_id: Ulid,
        weekday: Weekday,
    ) -> Result<Option<WorkingHours>, StoreError> {
        Ok(self
            .hours
            .get(&(branch_id, weekday))
            .map(|e| e.value().clone()))
    }

    async fn staff_member(&self, id: Ulid) -> Result<Option<StaffMember>, StoreError> {
        Ok(self.staff.get(&id).map(|e| e.value().clone()))
    }

    async fn staff_at_branch(&self, branch_id: Ulid) -> Result<Vec<StaffMember>, StoreError> {
        let mut out: Vec<StaffMember> = self
            .staff
            .iter()
            .filter(|e| e.value().branch_id == branch_id)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|s| s.id);
        Ok(out)
    }

    async fn staff_schedule(
        &self,
        staff_id: Ulid,
        date: NaiveDate,
    ) -> Result<Option<StaffSchedule>, StoreError> {
        if self.unreachable_schedules.contains(&staff_id) {
            return Err(StoreError::Unavailable(format!(
                "schedule partition for staff {staff_id} unreachable"
            )));
        }
        Ok(self
            .schedules
            .get(&(staff_id, date))
            .map(|e| e.value().clone()))
    }

    async fn overrides(
        &self,
        scope: OverrideScope,
        range: Span,
    ) -> Result<Vec<AvailabilityOverride>, StoreError> {
        let mut out: Vec<AvailabilityOverride> = self
            .overrides
            .iter()
            .filter(|e| e.value().scope == scope && e.value().span.overlaps(&range))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|o| (o.span.start, o.id));
        Ok(out)
    }

    async fn booking_rules(&self, scopes: &[RuleScope]) -> Result<Vec<BookingRule>, StoreError> {
        let mut out: Vec<BookingRule> = self
            .rules
            .iter()
            .filter(|e| scopes.contains(&e.value().scope))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|r| (std::cmp::Reverse(r.priority), r.id));
        Ok(out)
    }
}

#[async_trait]
impl ServiceCatalog for InMemoryStore {
    async fn service(&self, id: Ulid) -> Result<Option<Service>, StoreError> {
        Ok(self.services.get(&id).map(|e| e.value().clone()))
    }
}

#[async_trait]
impl AppointmentLedger for InMemoryStore {
    async fn appointment(&self, id: Ulid) -> Result<Option<Appointment>, StoreError> {
        Ok(self.ledger.read().await.appointments.get(&id).cloned())
    }

    async fn appointments(&self, filter: &Filter) -> Result<Vec<Appointment>, StoreError> {
        let ledger = self.ledger.read().await;
        let mut out: Vec<Appointment> = ledger
            .appointments
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        out.sort_by_key(|a| (a.start, a.id));
        Ok(out)
    }

    async fn conflict(&self, id: Ulid) -> Result<Option<Conflict>, StoreError> {
        Ok(self.ledger.read().await.conflicts.get(&id).cloned())
    }

    async fn conflicts_involving(&self, appointment_id: Ulid) -> Result<Vec<Conflict>, StoreError> {
        let ledger = self.ledger.read().await;
        let mut out: Vec<Conflict> = ledger
            .conflicts
            .values()
            .filter(|c| c.involves(appointment_id))
            .cloned()
            .collect();
        out.sort_by_key(|c| c.id);
        Ok(out)
    }

    async fn waitlist(&self, branch_id: Ulid) -> Result<Vec<WaitlistEntry>, StoreError> {
        let ledger = self.ledger.read().await;
        let mut out: Vec<WaitlistEntry> = ledger
            .waitlist
            .values()
            .filter(|w| w.branch_id == branch_id)
            .cloned()
            .collect();
        out.sort_by_key(|w| w.id);
        Ok(out)
    }

    async fn commit(&self, batch: Vec<Mutation>) -> Result<(), StoreError> {
        if batch.len() > MAX_MUTATIONS_PER_COMMIT {
            return Err(StoreError::LimitExceeded("too many mutations in one commit"));
        }
        if self.take_injected_commit_failure() {
            return Err(StoreError::Unavailable("injected commit failure".into()));
        }
        let mut guard = self.ledger.write().await;
        // Apply to a scratch copy; publish only if every mutation applied.
        let mut scratch = guard.clone();
        for mutation in batch {
            scratch.apply(mutation)?;
        }
        *guard = scratch;
        Ok(())
    }

    async fn purge_expired_waitlist(&self, now: Ms) -> Result<usize, StoreError> {
        let mut ledger = self.ledger.write().await;
        let before = ledger.waitlist.len();
        ledger.waitlist.retain(|_, w| w.expires_at > now);
        Ok(before - ledger.waitlist.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn appt(staff: Ulid, start: Ms, end: Ms) -> Appointment {
        Appointment {
            id: Ulid::new(),
            branch_id: Ulid::new(),
            staff_id: staff,
            customer_id: Ulid::new(),
            start,
            end,
            total_duration_minutes: ((end - start) / MINUTE_MS) as u32,
            status: AppointmentStatus::Pending,
            confirmation_code: "C".into(),
            items: vec![ServiceItem {
                service_id: Ulid::new(),
                staff_id: staff,
                start,
                duration_minutes: ((end - start) / MINUTE_MS) as u32,
                price: Decimal::ZERO,
            }],
            idempotency_key: None,
        }
    }

    fn insert(a: &Appointment) -> Mutation {
        Mutation::InsertAppointment {
            appointment: a.clone(),
            recheck: true,
        }
    }

    #[tokio::test]
    async fn insert_recheck_rejects_overlap() {
        let store = InMemoryStore::new();
        let staff = Ulid::new();
        let first = appt(staff, 0, 60 * MINUTE_MS);
        store.commit(vec![insert(&first)]).await.unwrap();

        let second = appt(staff, 30 * MINUTE_MS, 90 * MINUTE_MS);
        let err = store.commit(vec![insert(&second)]).await.unwrap_err();
        assert_eq!(err, StoreError::SlotTaken(first.id));
        assert!(store.appointment(second.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn adjacent_appointments_do_not_collide() {
        let store = InMemoryStore::new();
        let staff = Ulid::new();
        store
            .commit(vec![insert(&appt(staff, 0, 60 * MINUTE_MS))])
            .await
            .unwrap();
        store
            .commit(vec![insert(&appt(staff, 60 * MINUTE_MS, 90 * MINUTE_MS))])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failed_batch_leaves_no_partial_effect() {
        let store = InMemoryStore::new();
        let staff = Ulid::new();
        let existing = appt(staff, 0, 60 * MINUTE_MS);
        store.commit(vec![insert(&existing)]).await.unwrap();

        let fresh = appt(Ulid::new(), 0, 60 * MINUTE_MS);
        let clash = appt(staff, 0, 30 * MINUTE_MS);
        let result = store
            .commit(vec![
                insert(&fresh),
                Mutation::CancelAppointment { id: existing.id },
                Mutation::CancelAppointment { id: existing.id }, // second cancel is invalid
                insert(&clash),
            ])
            .await;
        assert_eq!(result, Err(StoreError::InvalidTransition(existing.id)));
        assert!(store.appointment(fresh.id).await.unwrap().is_none());
        let still = store.appointment(existing.id).await.unwrap().unwrap();
        assert_eq!(still.status, AppointmentStatus::Pending);
    }

    #[tokio::test]
    async fn cancel_then_insert_in_one_batch_frees_the_slot() {
        let store = InMemoryStore::new();
        let staff = Ulid::new();
        let existing = appt(staff, 0, 60 * MINUTE_MS);
        store.commit(vec![insert(&existing)]).await.unwrap();

        let replacement = appt(staff, 0, 60 * MINUTE_MS);
        store
            .commit(vec![
                Mutation::CancelAppointment { id: existing.id },
                insert(&replacement),
            ])
            .await
            .unwrap();
        assert!(store.appointment(replacement.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn idempotency_key_reuse_is_rejected() {
        let store = InMemoryStore::new();
        let mut a = appt(Ulid::new(), 0, MINUTE_MS);
        a.idempotency_key = Some("req-1".into());
        store.commit(vec![insert(&a)]).await.unwrap();

        let mut b = appt(Ulid::new(), 0, MINUTE_MS);
        b.idempotency_key = Some("req-1".into());
        let err = store.commit(vec![insert(&b)]).await.unwrap_err();
        assert_eq!(err, StoreError::DuplicateKey(a.id));
    }

    #[tokio::test]
    async fn resolved_conflicts_are_immutable() {
        let store = InMemoryStore::new();
        let mut c = Conflict {
            id: Ulid::new(),
            branch_id: Ulid::new(),
            source_appointment: Ulid::new(),
            conflicting_appointment: None,
            kind: ConflictType::StaffUnavailable,
            status: ConflictStatus::AutoResolved,
            auto_resolution_attempts: 1,
            suggested_alternatives: vec![],
            resolution_notes: None,
            resolved_strategy: Some(Strategy::Waitlist),
            escalated: false,
            detected_at: 0,
        };
        store
            .commit(vec![Mutation::InsertConflict { conflict: c.clone() }])
            .await
            .unwrap();
        c.resolution_notes = Some("edit".into());
        let err = store
            .commit(vec![Mutation::UpdateConflict { conflict: c.clone() }])
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Immutable(c.id));
    }

    #[tokio::test]
    async fn injected_commit_failures_are_consumed() {
        let store = InMemoryStore::new();
        store.fail_next_commits(1);
        let a = appt(Ulid::new(), 0, MINUTE_MS);
        assert!(matches!(
            store.commit(vec![insert(&a)]).await,
            Err(StoreError::Unavailable(_))
        ));
        store.commit(vec![insert(&a)]).await.unwrap();
    }

    #[tokio::test]
    async fn purge_removes_only_expired_entries() {
        let store = InMemoryStore::new();
        let branch = Ulid::new();
        let entry = |expires_at| WaitlistEntry {
            id: Ulid::new(),
            customer_id: Ulid::new(),
            branch_id: branch,
            service_ids: vec![],
            preferred_start: 0,
            expires_at,
            source_appointment: None,
        };
        store
            .commit(vec![
                Mutation::CreateWaitlist { entry: entry(100) },
                Mutation::CreateWaitlist { entry: entry(300) },
            ])
            .await
            .unwrap();
        assert_eq!(store.purge_expired_waitlist(200).await.unwrap(), 1);
        assert_eq!(store.waitlist(branch).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn overrides_filtered_by_scope_and_range() {
        let store = InMemoryStore::new();
        let staff = Ulid::new();
        store.put_override(AvailabilityOverride {
            id: Ulid::new(),
            scope: OverrideScope::Staff(staff),
            span: Span::new(100, 200),
            available: false,
            reason: None,
        });
        store.put_override(AvailabilityOverride {
            id: Ulid::new(),
            scope: OverrideScope::Branch(staff),
            span: Span::new(100, 200),
            available: false,
            reason: None,
        });
        let hits = store
            .overrides(OverrideScope::Staff(staff), Span::new(150, 400))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        let none = store
            .overrides(OverrideScope::Staff(staff), Span::new(200, 400))
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
