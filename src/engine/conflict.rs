use tracing::{debug, error, info};
use ulid::Ulid;

use super::slots::SlotRequest;
use super::window::fits;
use super::{Engine, EngineError};
use crate::filter::Filter;
use crate::model::*;
use crate::observability::{CONFLICTS_DETECTED_TOTAL, CONFLICT_PERSIST_FAILURES_TOTAL, conflict_label};
use crate::store::Mutation;

/// What caused a detection run. Cross-appointment overlaps are recorded as
/// DOUBLE_BOOKING unless they come from splitting an appointment's services.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DetectionTrigger {
    #[default]
    Booking,
    ServiceSplit,
    ScheduleChange,
    BranchHoursChange,
}

impl Engine {
    pub async fn detect_conflicts(&self, appointment_id: Ulid) -> Result<Vec<Conflict>, EngineError> {
        self.detect_conflicts_with(appointment_id, DetectionTrigger::Booking).await
    }

    /// Find and record every conflict the appointment takes part in. Pending
    /// conflicts already on record for the same pair and type are returned as-is,
    /// so running detection from either side of a pair yields the same record.
    pub async fn detect_conflicts_with(
        &self,
        appointment_id: Ulid,
        trigger: DetectionTrigger,
    ) -> Result<Vec<Conflict>, EngineError> {
        let target = self.require_appointment(appointment_id).await?;
        if !target.status.is_active() {
            return Ok(Vec::new());
        }
        let branch = self.require_branch(target.branch_id).await?;

        let mut found: Vec<(ConflictType, Option<Ulid>)> = Vec::new();
        let pair_kind = match trigger {
            DetectionTrigger::ServiceSplit => ConflictType::Overlapping,
            _ => ConflictType::DoubleBooking,
        };
        for staff_id in target.performers() {
            let Some(own) = target.span_for(staff_id) else {
                continue;
            };
            let filter = Filter::staff_occupancy(staff_id, own).and(Filter::not_id(target.id));
            let others = self
                .config
                .read_retry
                .run("overlapping_appointments", || self.ledger.appointments(&filter))
                .await?;
            for other in others.into_iter().filter(|o| o.occupies(staff_id, &own)) {
                let hit = (pair_kind, Some(other.id));
                if !found.contains(&hit) {
                    found.push(hit);
                }
            }
        }
        if target.has_self_overlap() {
            found.push((ConflictType::Overlapping, None));
        }
        if let Some(kind) = self.placement_conflict(&branch, &target).await? {
            found.push((kind, None));
        }

        if found.is_empty() {
            debug!("no conflicts for appointment {appointment_id}");
            return Ok(Vec::new());
        }

        let existing = self.conflicts_involving(target.id).await?;
        let now = self.now();
        let mut snapshot: Option<Vec<TimeSlot>> = None;
        let mut result = Vec::with_capacity(found.len());
        let mut fresh = Vec::new();

        for (kind, other) in found {
            if let Some(known) = existing.iter().find(|c| same_pending(c, target.id, kind, other)) {
                result.push(known.clone());
                continue;
            }
            if snapshot.is_none() {
                snapshot = Some(match self.nearest_alternatives(&branch, &target).await {
                    Ok(slots) => slots,
                    Err(e) => {
                        debug!("no alternatives snapshot for {}: {e}", target.id);
                        Vec::new()
                    }
                });
            }
            let conflict = Conflict {
                id: Ulid::new(),
                branch_id: target.branch_id,
                source_appointment: target.id,
                conflicting_appointment: other,
                kind,
                status: ConflictStatus::Pending,
                auto_resolution_attempts: 0,
                suggested_alternatives: snapshot.clone().unwrap_or_default(),
                resolution_notes: None,
                resolved_strategy: None,
                escalated: false,
                detected_at: now,
            };
            fresh.push(conflict.clone());
            result.push(conflict);
        }

        if !fresh.is_empty() {
            let batch = fresh
                .iter()
                .map(|c| Mutation::InsertConflict { conflict: c.clone() })
                .collect();
            if let Err(e) = self.commit("record_conflicts", batch).await {
                error!("failed to record conflicts for appointment {appointment_id}: {e}");
                metrics::counter!(CONFLICT_PERSIST_FAILURES_TOTAL).increment(1);
                return Err(EngineError::ConflictPersistence(e.to_string()));
            }
            for c in &fresh {
                metrics::counter!(CONFLICTS_DETECTED_TOTAL, "kind" => conflict_label(c.kind)).increment(1);
                info!(
                    "conflict {} ({:?}) on appointment {} against {:?}",
                    c.id, c.kind, c.source_appointment, c.conflicting_appointment
                );
            }
        }
        Ok(result)
    }

    /// BRANCH_CLOSED when the appointment leaves the branch's opening for its day,
    /// otherwise STAFF_UNAVAILABLE when any item leaves its performer's window.
    pub(super) async fn placement_conflict(
        &self,
        branch: &Branch,
        target: &Appointment,
    ) -> Result<Option<ConflictType>, EngineError> {
        let date = local_date_of(target.start, branch.timezone);
        let Some(day) = self.day_window(branch, date).await? else {
            return Ok(Some(ConflictType::BranchClosed));
        };
        if !fits(&day.open, &target.span()) {
            return Ok(Some(ConflictType::BranchClosed));
        }

        let mut checks: Vec<(Ulid, Span)> = target
            .items
            .iter()
            .filter_map(|i| i.span().map(|span| (i.staff_id, span)))
            .collect();
        if checks.is_empty() {
            checks.push((target.staff_id, target.span()));
        }
        for (staff_id, span) in checks {
            let window = self.staff_day_window(branch, &day, staff_id).await?;
            if !fits(&window, &span) {
                return Ok(Some(ConflictType::StaffUnavailable));
            }
        }
        Ok(None)
    }

    /// Free slots for the same services closest to the appointment's start.
    async fn nearest_alternatives(
        &self,
        branch: &Branch,
        target: &Appointment,
    ) -> Result<Vec<TimeSlot>, EngineError> {
        let service_ids = target.service_ids();
        let staff: Vec<StaffMember> = self
            .config
            .read_retry
            .run("staff_at_branch", || self.schedule.staff_at_branch(branch.id))
            .await?
            .into_iter()
            .filter(|s| s.offers_all(&service_ids))
            .collect();
        if staff.is_empty() || target.total_duration_minutes == 0 {
            return Ok(Vec::new());
        }
        let req = SlotRequest {
            branch,
            service_ids: &service_ids,
            date: local_date_of(target.start, branch.timezone),
            staff: &staff,
            duration_minutes: target.total_duration_minutes,
            granularity_minutes: self.config.default_granularity_minutes,
            ignore_appointment: Some(target.id),
        };
        let mut slots = self.candidate_slots(&req).await?;
        slots.sort_by_key(|s| ((s.start - target.start).abs(), s.start, s.staff_id));
        slots.truncate(self.config.alternatives_snapshot_len);
        Ok(slots)
    }
}

/// A pending record of the same type between the same (unordered) parties.
fn same_pending(c: &Conflict, target: Ulid, kind: ConflictType, other: Option<Ulid>) -> bool {
    if c.is_resolved() || c.kind != kind {
        return false;
    }
    match other {
        Some(o) => c.other_party(target) == Some(o),
        None => c.source_appointment == target && c.conflicting_appointment.is_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conflict(source: Ulid, other: Option<Ulid>, kind: ConflictType) -> Conflict {
        Conflict {
            id: Ulid::new(),
            branch_id: Ulid::new(),
            source_appointment: source,
            conflicting_appointment: other,
            kind,
            status: ConflictStatus::Pending,
            auto_resolution_attempts: 0,
            suggested_alternatives: vec![],
            resolution_notes: None,
            resolved_strategy: None,
            escalated: false,
            detected_at: 0,
        }
    }

    #[test]
    fn pairs_match_in_either_direction() {
        let a = Ulid::new();
        let b = Ulid::new();
        let c = conflict(a, Some(b), ConflictType::DoubleBooking);
        assert!(same_pending(&c, a, ConflictType::DoubleBooking, Some(b)));
        assert!(same_pending(&c, b, ConflictType::DoubleBooking, Some(a)));
        assert!(!same_pending(&c, b, ConflictType::Overlapping, Some(a)));
    }

    #[test]
    fn resolved_records_are_not_reused() {
        let a = Ulid::new();
        let mut c = conflict(a, None, ConflictType::StaffUnavailable);
        assert!(same_pending(&c, a, ConflictType::StaffUnavailable, None));
        c.status = ConflictStatus::AutoResolved;
        assert!(!same_pending(&c, a, ConflictType::StaffUnavailable, None));
    }
}
