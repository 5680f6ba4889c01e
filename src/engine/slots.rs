use std::time::Instant;

use chrono::NaiveDate;
use futures::future::join_all;
use tracing::{debug, warn};
use ulid::Ulid;

use super::rules::{RuleContext, filter_slots};
use super::window::{self, fits, grid_starts, hits_any, merge_overlapping};
use super::{Engine, EngineError};
use crate::filter::Filter;
use crate::limits::*;
use crate::model::*;
use crate::observability::{SLOT_QUERIES_TOTAL, SLOT_QUERY_DURATION_SECONDS, STAFF_SKIPPED_TOTAL};

/// Branch opening for one local day.
#[derive(Debug, Clone)]
pub(super) struct DayWindow {
    pub date: NaiveDate,
    pub day: Span,
    pub open: Vec<Span>,
}

/// Everything the slot walk needs once ids are resolved.
pub(super) struct SlotRequest<'a> {
    pub branch: &'a Branch,
    pub service_ids: &'a [Ulid],
    pub date: NaiveDate,
    pub staff: &'a [StaffMember],
    pub duration_minutes: u32,
    pub granularity_minutes: u32,
    /// Appointment whose own occupancy is ignored (when looking for a place to move it).
    pub ignore_appointment: Option<Ulid>,
}

impl Engine {
    /// Bookable slots for `service_ids` at a branch on a local date, ordered by start.
    ///
    /// With `staff_id` the search is limited to that staff member; otherwise every
    /// staff member at the branch offering all requested services is considered.
    /// A staff member whose schedule cannot be read is skipped, not fatal.
    pub async fn get_available_slots(
        &self,
        branch_id: Ulid,
        service_ids: &[Ulid],
        date: NaiveDate,
        staff_id: Option<Ulid>,
        granularity_minutes: Option<u32>,
    ) -> Result<Vec<TimeSlot>, EngineError> {
        let started = Instant::now();
        let result = self
            .available_slots_inner(branch_id, service_ids, date, staff_id, granularity_minutes)
            .await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(SLOT_QUERIES_TOTAL, "status" => status).increment(1);
        metrics::histogram!(SLOT_QUERY_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        result
    }

    async fn available_slots_inner(
        &self,
        branch_id: Ulid,
        service_ids: &[Ulid],
        date: NaiveDate,
        staff_id: Option<Ulid>,
        granularity_minutes: Option<u32>,
    ) -> Result<Vec<TimeSlot>, EngineError> {
        let granularity = granularity_minutes.unwrap_or(self.config.default_granularity_minutes);
        if !(MIN_GRANULARITY_MINUTES..=MAX_GRANULARITY_MINUTES).contains(&granularity) {
            return Err(EngineError::LimitExceeded("granularity out of range"));
        }
        let branch = self.require_branch(branch_id).await?;
        let services = self.load_request_services(service_ids).await?;
        let duration_minutes = total_minutes(&services)?;

        let staff = match staff_id {
            Some(id) => vec![self.require_staff(id).await?],
            None => self
                .config
                .read_retry
                .run("staff_at_branch", || self.schedule.staff_at_branch(branch.id))
                .await?
                .into_iter()
                .filter(|s| s.offers_all(service_ids))
                .collect(),
        };
        if staff.is_empty() {
            debug!("no eligible staff at branch {branch_id} for {} services", service_ids.len());
            return Ok(Vec::new());
        }

        let req = SlotRequest {
            branch: &branch,
            service_ids,
            date,
            staff: &staff,
            duration_minutes,
            granularity_minutes: granularity,
            ignore_appointment: None,
        };
        self.candidate_slots(&req).await
    }

    /// Validate and fetch the requested services, in request order.
    pub(super) async fn load_request_services(&self, service_ids: &[Ulid]) -> Result<Vec<Service>, EngineError> {
        if service_ids.is_empty() {
            return Err(EngineError::InvalidInterval("no services requested"));
        }
        if service_ids.len() > MAX_SERVICES_PER_REQUEST {
            return Err(EngineError::LimitExceeded("too many services in one request"));
        }
        self.load_services(service_ids).await
    }

    /// Available slots for an already-resolved request: window walk per staff member,
    /// booking rules, dedup, sort.
    pub(super) async fn candidate_slots(&self, req: &SlotRequest<'_>) -> Result<Vec<TimeSlot>, EngineError> {
        let Some(day) = self.day_window(req.branch, req.date).await? else {
            return Ok(Vec::new());
        };

        let per_staff = join_all(req.staff.iter().map(|s| self.staff_slots(req, &day, s))).await;
        let mut slots = Vec::new();
        for (member, result) in req.staff.iter().zip(per_staff) {
            match result {
                Ok(found) => slots.extend(found),
                Err(e) => {
                    warn!("skipping staff {} for {}: {e}", member.id, req.date);
                    metrics::counter!(STAFF_SKIPPED_TOTAL).increment(1);
                }
            }
        }

        let now = self.now();
        slots.retain(|s| s.start >= now);

        let staff_ids: Vec<Ulid> = req.staff.iter().map(|s| s.id).collect();
        let ctx = RuleContext {
            branch_id: req.branch.id,
            service_ids: req.service_ids,
            timezone: req.branch.timezone,
            now,
        };
        let scopes = ctx.scopes(&staff_ids);
        let rules = self
            .config
            .read_retry
            .run("booking_rules", || self.schedule.booking_rules(&scopes))
            .await?;
        let slots = filter_slots(slots, &rules, &ctx);

        Ok(dedup_and_sort(slots).into_iter().filter(|s| s.available).collect())
    }

    /// Slots for one staff member, each flagged with whether it is free.
    async fn staff_slots(
        &self,
        req: &SlotRequest<'_>,
        day: &DayWindow,
        member: &StaffMember,
    ) -> Result<Vec<TimeSlot>, EngineError> {
        let window = self.staff_day_window(req.branch, day, member.id).await?;
        if window.is_empty() {
            return Ok(Vec::new());
        }
        let occupied = self.occupancy(member.id, day.day, req.ignore_appointment).await?;

        let len = Ms::from(req.duration_minutes) * MINUTE_MS;
        let step = Ms::from(req.granularity_minutes) * MINUTE_MS;
        Ok(grid_starts(&window, len, step)
            .into_iter()
            .map(|start| {
                let span = Span::new(start, start + len);
                TimeSlot {
                    start,
                    end: span.end,
                    staff_id: member.id,
                    available: !hits_any(&occupied, &span),
                }
            })
            .collect())
    }

    /// Branch opening for a local date, or None when it is closed.
    pub(super) async fn day_window(&self, branch: &Branch, date: NaiveDate) -> Result<Option<DayWindow>, EngineError> {
        let tz = branch.timezone;
        let day = local_day(date, tz);
        let hours = self
            .config
            .read_retry
            .run("working_hours", || self.schedule.working_hours(branch.id, weekday_of(date)))
            .await?
            .and_then(|h| h.window(date, tz));
        let overrides = self
            .config
            .read_retry
            .run("branch_overrides", || self.schedule.overrides(OverrideScope::Branch(branch.id), day))
            .await?;
        let open = window::branch_window(hours, &overrides, day);
        if open.is_empty() {
            return Ok(None);
        }
        Ok(Some(DayWindow { date, day, open }))
    }

    /// Effective working window of a staff member on a day; empty when they have no
    /// available schedule.
    pub(super) async fn staff_day_window(
        &self,
        branch: &Branch,
        day: &DayWindow,
        staff_id: Ulid,
    ) -> Result<Vec<Span>, EngineError> {
        let schedule = self
            .config
            .read_retry
            .run("staff_schedule", || self.schedule.staff_schedule(staff_id, day.date))
            .await?;
        let Some(shift) = schedule.and_then(|s| s.window(branch.timezone)) else {
            return Ok(Vec::new());
        };
        let overrides = self
            .config
            .read_retry
            .run("staff_overrides", || self.schedule.overrides(OverrideScope::Staff(staff_id), day.day))
            .await?;
        Ok(window::staff_window(shift, &day.open, &overrides, day.day))
    }

    /// Merged intervals during which `staff_id` is held by active appointments.
    pub(super) async fn occupancy(
        &self,
        staff_id: Ulid,
        range: Span,
        ignore: Option<Ulid>,
    ) -> Result<Vec<Span>, EngineError> {
        let mut filter = Filter::staff_occupancy(staff_id, range);
        if let Some(id) = ignore {
            filter = filter.and(Filter::not_id(id));
        }
        let booked = self
            .config
            .read_retry
            .run("occupancy", || self.ledger.appointments(&filter))
            .await?;
        let mut spans: Vec<Span> = booked
            .iter()
            .filter_map(|a| a.span_for(staff_id))
            .filter(|own| own.overlaps(&range))
            .collect();
        spans.sort_by_key(|s| s.start);
        Ok(merge_overlapping(&spans))
    }

    /// Whether `staff_id` could take a `duration_minutes` booking starting at `start`:
    /// inside their working window, free, and admitted by booking rules.
    pub async fn is_slot_available(
        &self,
        staff_id: Ulid,
        start: Ms,
        duration_minutes: u32,
    ) -> Result<bool, EngineError> {
        if duration_minutes == 0 {
            return Err(EngineError::InvalidInterval("duration must be positive"));
        }
        if duration_minutes > MAX_TOTAL_DURATION_MINUTES {
            return Err(EngineError::LimitExceeded("duration too long"));
        }
        let member = self.require_staff(staff_id).await?;
        let branch = self.require_branch(member.branch_id).await?;
        let span = Span::new(start, start + Ms::from(duration_minutes) * MINUTE_MS);
        self.span_is_bookable(&branch, staff_id, span, &[], None).await
    }

    pub(super) async fn span_is_bookable(
        &self,
        branch: &Branch,
        staff_id: Ulid,
        span: Span,
        service_ids: &[Ulid],
        ignore: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        let now = self.now();
        if span.start < now {
            return Ok(false);
        }
        let date = local_date_of(span.start, branch.timezone);
        let Some(day) = self.day_window(branch, date).await? else {
            return Ok(false);
        };
        let window = self.staff_day_window(branch, &day, staff_id).await?;
        if !fits(&window, &span) {
            return Ok(false);
        }
        if hits_any(&self.occupancy(staff_id, span, ignore).await?, &span) {
            return Ok(false);
        }

        let ctx = RuleContext {
            branch_id: branch.id,
            service_ids,
            timezone: branch.timezone,
            now,
        };
        let scopes = ctx.scopes(&[staff_id]);
        let rules = self
            .config
            .read_retry
            .run("booking_rules", || self.schedule.booking_rules(&scopes))
            .await?;
        let slot = TimeSlot {
            start: span.start,
            end: span.end,
            staff_id,
            available: true,
        };
        Ok(!filter_slots(vec![slot], &rules, &ctx).is_empty())
    }
}

/// Sum of chair time (duration plus buffer) over `services`. Every service must
/// take some time on its own.
pub(super) fn total_minutes(services: &[Service]) -> Result<u32, EngineError> {
    if services.iter().any(|s| s.total_minutes() == 0) {
        return Err(EngineError::InvalidInterval("service duration must be positive"));
    }
    let total: u32 = services.iter().map(|s| s.total_minutes()).sum();
    if total == 0 {
        return Err(EngineError::InvalidInterval("total duration must be positive"));
    }
    if total > MAX_TOTAL_DURATION_MINUTES {
        return Err(EngineError::LimitExceeded("total duration too long"));
    }
    Ok(total)
}

/// One slot per `(start, end, staff)`, preferring an available one, ordered by
/// start then staff.
fn dedup_and_sort(mut slots: Vec<TimeSlot>) -> Vec<TimeSlot> {
    slots.sort_by_key(|s| (s.start, s.staff_id, s.end, !s.available));
    slots.dedup_by_key(|s| (s.start, s.staff_id, s.end));
    slots
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(staff: Ulid, start: Ms, available: bool) -> TimeSlot {
        TimeSlot {
            start,
            end: start + 10,
            staff_id: staff,
            available,
        }
    }

    #[test]
    fn dedup_prefers_available() {
        let staff = Ulid::new();
        let out = dedup_and_sort(vec![slot(staff, 5, false), slot(staff, 0, true), slot(staff, 5, true)]);
        assert_eq!(out, vec![slot(staff, 0, true), slot(staff, 5, true)]);
    }

    #[test]
    fn zero_duration_is_invalid() {
        let svc = Service {
            id: Ulid::new(),
            name: "none".into(),
            duration_minutes: 0,
            buffer_minutes: 0,
            price: rust_decimal::Decimal::ZERO,
            required_specializations: Default::default(),
        };
        assert!(matches!(total_minutes(&[svc]), Err(EngineError::InvalidInterval(_))));
    }

    #[test]
    fn zero_length_service_beside_a_real_one_is_invalid() {
        let svc = |minutes| Service {
            id: Ulid::new(),
            name: "item".into(),
            duration_minutes: minutes,
            buffer_minutes: 0,
            price: rust_decimal::Decimal::ZERO,
            required_specializations: Default::default(),
        };
        assert!(matches!(
            total_minutes(&[svc(60), svc(0)]),
            Err(EngineError::InvalidInterval("service duration must be positive"))
        ));
        assert_eq!(total_minutes(&[svc(60), svc(15)]), Ok(75));
    }
}
