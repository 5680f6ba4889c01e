use std::collections::BTreeSet;

use chrono::{
    DateTime, Datelike, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeDelta,
    TimeZone, Timelike, Utc, Weekday,
};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::notify::Channel;

/// Unix milliseconds. Every instant in the engine uses this.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for spans built from caller input.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Intersection of two spans, if non-empty.
    pub fn intersect(&self, other: &Span) -> Option<Span> {
        Span::try_new(self.start.max(other.start), self.end.min(other.end))
    }
}

// ── Calendar helpers ────────────────────────────────────────────
//
// Branches carry an IANA time zone; every local date / minute-of-day
// conversion goes through these. A wall time skipped by a DST jump is
// pushed forward by the length of the jump, and a repeated wall time
// takes its earlier instant.

/// Instant at which the wall-clock time `local` occurs in `tz`.
pub fn local_instant(local: NaiveDateTime, tz: Tz) -> Ms {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(t) => t.timestamp_millis(),
        LocalResult::Ambiguous(earliest, _) => earliest.timestamp_millis(),
        LocalResult::None => {
            // Read the skipped wall time with the offset in force before the jump.
            let before = tz.offset_from_utc_datetime(&(local - TimeDelta::days(1))).fix();
            local.and_utc().timestamp_millis() - Ms::from(before.local_minus_utc()) * 1000
        }
    }
}

/// Instant of local midnight starting `date` in `tz`.
pub fn local_midnight(date: NaiveDate, tz: Tz) -> Ms {
    local_instant(date.and_time(NaiveTime::MIN), tz)
}

/// The local calendar day `date` as a span of instants. 23 or 25 hours long
/// on DST change days.
pub fn local_day(date: NaiveDate, tz: Tz) -> Span {
    let start = local_midnight(date, tz);
    let end = date
        .succ_opt()
        .map_or(start + DAY_MS, |next| local_midnight(next, tz));
    Span::new(start, end)
}

/// Instant at wall-clock `minute` minutes after midnight of `date`.
pub fn at_local_minute(date: NaiveDate, minute: u32, tz: Tz) -> Ms {
    let wall = date.and_time(NaiveTime::MIN) + TimeDelta::minutes(i64::from(minute));
    local_instant(wall, tz)
}

pub fn local_date_of(t: Ms, tz: Tz) -> NaiveDate {
    DateTime::<Utc>::from_timestamp_millis(t)
        .map(|dt| dt.with_timezone(&tz).date_naive())
        .unwrap_or_default()
}

pub fn local_minute_of_day(t: Ms, tz: Tz) -> u32 {
    DateTime::<Utc>::from_timestamp_millis(t)
        .map(|dt| {
            let local = dt.with_timezone(&tz);
            local.hour() * 60 + local.minute()
        })
        .unwrap_or_default()
}

pub fn weekday_of(date: NaiveDate) -> Weekday {
    date.weekday()
}

// ── Branches, hours, staff ──────────────────────────────────────

/// Closed set of per-branch operating policy flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchSettings {
    /// When false, conflicts skip automated strategies and go straight to escalation.
    pub auto_resolve_conflicts: bool,
    pub tax_rate: Option<Decimal>,
    /// Channel used for management escalations.
    pub management_channel: Channel,
    /// Whether a conflict at this branch may be rescheduled into a sibling branch.
    pub allow_cross_branch_reschedule: bool,
}

impl Default for BranchSettings {
    fn default() -> Self {
        Self {
            auto_resolve_conflicts: true,
            tax_rate: None,
            management_channel: Channel::Email,
            allow_cross_branch_reschedule: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub id: Ulid,
    pub name: Option<String>,
    /// IANA zone the branch's hours and schedules are written in.
    pub timezone: Tz,
    #[serde(default)]
    pub settings: BranchSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHours {
    pub branch_id: Ulid,
    pub weekday: Weekday,
    /// Minutes after local midnight.
    pub open_minute: u32,
    pub close_minute: u32,
    pub closed: bool,
}

impl WorkingHours {
    /// Opening window for `date`, or None when the branch is closed that day.
    pub fn window(&self, date: NaiveDate, tz: Tz) -> Option<Span> {
        if self.closed {
            return None;
        }
        Span::try_new(
            at_local_minute(date, self.open_minute, tz),
            at_local_minute(date, self.close_minute, tz),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffMember {
    pub id: Ulid,
    pub branch_id: Ulid,
    pub name: Option<String>,
    #[serde(default)]
    pub specializations: BTreeSet<String>,
    #[serde(default)]
    pub services: BTreeSet<Ulid>,
}

impl StaffMember {
    pub fn offers_all(&self, service_ids: &[Ulid]) -> bool {
        service_ids.iter().all(|s| self.services.contains(s))
    }

    /// Number of `required` specializations this staff member holds.
    pub fn matching_specializations(&self, required: &BTreeSet<String>) -> usize {
        required.intersection(&self.specializations).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffSchedule {
    pub staff_id: Ulid,
    pub date: NaiveDate,
    pub start_minute: u32,
    pub end_minute: u32,
    pub available: bool,
}

impl StaffSchedule {
    pub fn window(&self, tz: Tz) -> Option<Span> {
        if !self.available {
            return None;
        }
        Span::try_new(
            at_local_minute(self.date, self.start_minute, tz),
            at_local_minute(self.date, self.end_minute, tz),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OverrideScope {
    Staff(Ulid),
    Branch(Ulid),
}

/// Time-bounded exception: `available = false` is a blackout, `true` an extra opening.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityOverride {
    pub id: Ulid,
    pub scope: OverrideScope,
    pub span: Span,
    pub available: bool,
    pub reason: Option<String>,
}

// ── Booking policy ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleScope {
    Branch(Ulid),
    Staff(Ulid),
    Service(Ulid),
}

/// Local-time window `[start_minute, end_minute)` slots must fall inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestrictedHours {
    pub start_minute: u32,
    pub end_minute: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRule {
    pub id: Ulid,
    pub scope: RuleScope,
    pub min_advance_hours: Option<u32>,
    pub max_advance_days: Option<u32>,
    pub restricted_hours: Option<RestrictedHours>,
    /// Higher runs first.
    pub priority: i32,
    pub active: bool,
}

// ── Catalog ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub name: String,
    pub duration_minutes: u32,
    #[serde(default)]
    pub buffer_minutes: u32,
    pub price: Decimal,
    #[serde(default)]
    pub required_specializations: BTreeSet<String>,
}

impl Service {
    /// Chair time including the trailing buffer.
    pub fn total_minutes(&self) -> u32 {
        self.duration_minutes + self.buffer_minutes
    }
}

// ── Appointments ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Rescheduled,
    Cancelled,
    Completed,
    NoShow,
}

impl AppointmentStatus {
    /// Statuses that still hold the staff member's time.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Cancelled | Self::NoShow)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::NoShow)
    }

    pub fn can_transition_to(self, next: AppointmentStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match self {
            Self::Pending => next != Self::Pending,
            Self::Confirmed | Self::Rescheduled => {
                !matches!(next, Self::Pending)
            }
            _ => false,
        }
    }
}

/// One booked service inside an appointment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceItem {
    pub service_id: Ulid,
    /// Staff member performing this item.
    pub staff_id: Ulid,
    pub start: Ms,
    pub duration_minutes: u32,
    pub price: Decimal,
}

impl ServiceItem {
    /// None for a zero-length item, which occupies no time.
    pub fn span(&self) -> Option<Span> {
        Span::try_new(self.start, self.start + Ms::from(self.duration_minutes) * MINUTE_MS)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub branch_id: Ulid,
    pub staff_id: Ulid,
    pub customer_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub total_duration_minutes: u32,
    pub status: AppointmentStatus,
    pub confirmation_code: String,
    pub items: Vec<ServiceItem>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl Appointment {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }

    /// True when `staff_id` is the primary staff member or performs any item.
    pub fn performed_by(&self, staff_id: Ulid) -> bool {
        self.staff_id == staff_id || self.items.iter().any(|i| i.staff_id == staff_id)
    }

    /// Every staff member whose time this appointment occupies, primary first.
    pub fn performers(&self) -> Vec<Ulid> {
        let mut out = vec![self.staff_id];
        for item in &self.items {
            if !out.contains(&item.staff_id) {
                out.push(item.staff_id);
            }
        }
        out
    }

    /// Time `staff_id` spends on this appointment: the hull of their own items, or
    /// the whole appointment for a primary staff member without items.
    pub fn span_for(&self, staff_id: Ulid) -> Option<Span> {
        let mut own = self
            .items
            .iter()
            .filter(|i| i.staff_id == staff_id)
            .filter_map(ServiceItem::span);
        match own.next() {
            Some(first) => Some(own.fold(first, |hull, s| Span {
                start: hull.start.min(s.start),
                end: hull.end.max(s.end),
            })),
            None if self.staff_id == staff_id => Span::try_new(self.start, self.end),
            None => None,
        }
    }

    /// True when this appointment is active and holds `staff_id` at some point of `span`.
    pub fn occupies(&self, staff_id: Ulid, span: &Span) -> bool {
        self.status.is_active() && self.span_for(staff_id).is_some_and(|own| own.overlaps(span))
    }

    /// True when two items performed by the same staff member overlap in time.
    pub fn has_self_overlap(&self) -> bool {
        self.items.iter().enumerate().any(|(i, a)| {
            self.items[i + 1..]
                .iter()
                .any(|b| match (a.span(), b.span()) {
                    (Some(x), Some(y)) => a.staff_id == b.staff_id && x.overlaps(&y),
                    _ => false,
                })
        })
    }

    pub fn service_ids(&self) -> Vec<Ulid> {
        self.items.iter().map(|i| i.service_id).collect()
    }

    /// Recompute `start`, `end` and total duration from the service items so that
    /// `end == start + total_duration` holds after items move.
    pub fn recompute_bounds(&mut self) {
        let Some(start) = self.items.iter().map(|i| i.start).min() else {
            return;
        };
        let end = self
            .items
            .iter()
            .filter_map(ServiceItem::span)
            .map(|s| s.end)
            .max()
            .unwrap_or(start);
        self.start = start;
        self.end = end;
        self.total_duration_minutes = ((end - start) / MINUTE_MS) as u32;
    }

    /// Shift the whole appointment (all items) by `delta` and reassign the staff of
    /// items that belonged to the previous primary staff.
    pub fn moved(&self, start: Ms, staff_id: Ulid) -> Appointment {
        let delta = start - self.start;
        let mut moved = self.clone();
        for item in &mut moved.items {
            item.start += delta;
            if item.staff_id == self.staff_id {
                item.staff_id = staff_id;
            }
        }
        moved.staff_id = staff_id;
        moved.start = start;
        moved.end = self.end + delta;
        moved
    }

    pub fn total_price(&self) -> Decimal {
        self.items.iter().map(|i| i.price).sum()
    }

    /// The appointment total including the branch tax rate, when one is configured.
    pub fn total_with_tax(&self, settings: &BranchSettings) -> Decimal {
        let net = self.total_price();
        match settings.tax_rate {
            Some(rate) => net + net * rate,
            None => net,
        }
    }
}

// ── Conflicts ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    DoubleBooking,
    Overlapping,
    StaffUnavailable,
    BranchClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStatus {
    Pending,
    AutoResolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    FindAlternativeStaff,
    RescheduleNearby,
    SplitServices,
    Waitlist,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Strategy::FindAlternativeStaff => "FIND_ALTERNATIVE_STAFF",
            Strategy::RescheduleNearby => "RESCHEDULE_NEARBY",
            Strategy::SplitServices => "SPLIT_SERVICES",
            Strategy::Waitlist => "WAITLIST",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: Ulid,
    pub branch_id: Ulid,
    pub source_appointment: Ulid,
    pub conflicting_appointment: Option<Ulid>,
    pub kind: ConflictType,
    pub status: ConflictStatus,
    pub auto_resolution_attempts: u32,
    /// Nearest alternative slots captured at detection time.
    pub suggested_alternatives: Vec<TimeSlot>,
    pub resolution_notes: Option<String>,
    pub resolved_strategy: Option<Strategy>,
    pub escalated: bool,
    pub detected_at: Ms,
}

impl Conflict {
    pub fn involves(&self, appointment_id: Ulid) -> bool {
        self.source_appointment == appointment_id
            || self.conflicting_appointment == Some(appointment_id)
    }

    /// The other appointment in a pairwise conflict, from `appointment_id`'s viewpoint.
    pub fn other_party(&self, appointment_id: Ulid) -> Option<Ulid> {
        if self.source_appointment == appointment_id {
            self.conflicting_appointment
        } else if self.conflicting_appointment == Some(appointment_id) {
            Some(self.source_appointment)
        } else {
            None
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status == ConflictStatus::AutoResolved
    }
}

/// Candidate slot. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeSlot {
    pub start: Ms,
    pub end: Ms,
    pub staff_id: Ulid,
    pub available: bool,
}

impl TimeSlot {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: Ulid,
    pub customer_id: Ulid,
    pub branch_id: Ulid,
    pub service_ids: Vec<Ulid>,
    pub preferred_start: Ms,
    pub expires_at: Ms,
    pub source_appointment: Option<Ulid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn span_try_new_rejects_empty() {
        assert!(Span::try_new(100, 100).is_none());
        assert!(Span::try_new(200, 100).is_none());
        assert_eq!(Span::try_new(1, 2), Some(Span::new(1, 2)));
    }

    #[test]
    fn span_intersect() {
        let a = Span::new(100, 300);
        assert_eq!(a.intersect(&Span::new(200, 400)), Some(Span::new(200, 300)));
        assert_eq!(a.intersect(&Span::new(300, 400)), None);
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> Ms {
        date(y, m, d).and_hms_opt(h, min, 0).unwrap().and_utc().timestamp_millis()
    }

    #[test]
    fn local_day_follows_zone_rules() {
        let paris = chrono_tz::Europe::Paris;
        let winter = local_day(date(2026, 3, 2), paris);
        assert_eq!(winter.start, utc(2026, 3, 1, 23, 0));
        assert_eq!(winter.duration_ms(), DAY_MS);
        // Clocks go forward on the last Sunday of March and back in October.
        assert_eq!(local_day(date(2026, 3, 29), paris).duration_ms(), 23 * HOUR_MS);
        assert_eq!(local_day(date(2026, 10, 25), paris).duration_ms(), 25 * HOUR_MS);
    }

    #[test]
    fn skipped_wall_time_moves_forward() {
        let paris = chrono_tz::Europe::Paris;
        // 02:30 does not exist on 2026-03-29; it reads as 03:30 summer time.
        let t = at_local_minute(date(2026, 3, 29), 2 * 60 + 30, paris);
        assert_eq!(t, utc(2026, 3, 29, 1, 30));
        assert_eq!(local_minute_of_day(t, paris), 3 * 60 + 30);
        assert_eq!(at_local_minute(date(2026, 3, 29), 9 * 60, paris), utc(2026, 3, 29, 7, 0));
    }

    #[test]
    fn repeated_wall_time_takes_the_earlier_instant() {
        let paris = chrono_tz::Europe::Paris;
        let t = at_local_minute(date(2026, 10, 25), 2 * 60 + 30, paris);
        assert_eq!(t, utc(2026, 10, 25, 0, 30));
    }

    #[test]
    fn local_conversions_round_trip() {
        let d = date(2026, 3, 2);
        let new_york = chrono_tz::America::New_York;
        let t = at_local_minute(d, 9 * 60 + 30, new_york);
        assert_eq!(t, utc(2026, 3, 2, 14, 30));
        assert_eq!(local_date_of(t, new_york), d);
        assert_eq!(local_minute_of_day(t, new_york), 570);
    }

    #[test]
    fn closed_day_has_no_window() {
        let wh = WorkingHours {
            branch_id: Ulid::new(),
            weekday: Weekday::Mon,
            open_minute: 540,
            close_minute: 1020,
            closed: true,
        };
        assert!(wh.window(date(2026, 3, 2), Tz::UTC).is_none());
    }

    #[test]
    fn status_lifecycle() {
        use AppointmentStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Confirmed.can_transition_to(Completed));
        assert!(!Cancelled.can_transition_to(Confirmed));
        assert!(!NoShow.is_active());
        assert!(Completed.is_active());
        assert!(Completed.is_terminal());
    }

    #[test]
    fn recompute_bounds_after_split() {
        let staff = Ulid::new();
        let other = Ulid::new();
        let mut appt = Appointment {
            id: Ulid::new(),
            branch_id: Ulid::new(),
            staff_id: staff,
            customer_id: Ulid::new(),
            start: 0,
            end: 90 * MINUTE_MS,
            total_duration_minutes: 90,
            status: AppointmentStatus::Pending,
            confirmation_code: "X".into(),
            items: vec![
                ServiceItem {
                    service_id: Ulid::new(),
                    staff_id: staff,
                    start: 0,
                    duration_minutes: 60,
                    price: Decimal::new(4000, 2),
                },
                ServiceItem {
                    service_id: Ulid::new(),
                    staff_id: other,
                    start: 0,
                    duration_minutes: 30,
                    price: Decimal::new(1500, 2),
                },
            ],
            idempotency_key: None,
        };
        appt.recompute_bounds();
        assert_eq!(appt.end, 60 * MINUTE_MS);
        assert_eq!(appt.total_duration_minutes, 60);
        assert_eq!(appt.total_price(), Decimal::new(5500, 2));
    }

    #[test]
    fn zero_length_item_occupies_no_time() {
        let staff = Ulid::new();
        let item = |start, minutes| ServiceItem {
            service_id: Ulid::new(),
            staff_id: staff,
            start,
            duration_minutes: minutes,
            price: Decimal::ZERO,
        };
        assert_eq!(item(0, 0).span(), None);
        let mut appt = Appointment {
            id: Ulid::new(),
            branch_id: Ulid::new(),
            staff_id: staff,
            customer_id: Ulid::new(),
            start: 0,
            end: 0,
            total_duration_minutes: 0,
            status: AppointmentStatus::Pending,
            confirmation_code: "X".into(),
            items: vec![item(0, 60), item(60 * MINUTE_MS, 0)],
            idempotency_key: None,
        };
        appt.recompute_bounds();
        assert_eq!(appt.span(), Span::new(0, 60 * MINUTE_MS));
        assert!(!appt.has_self_overlap());
    }

    #[test]
    fn helper_is_held_only_for_their_own_items() {
        let staff = Ulid::new();
        let helper = Ulid::new();
        let appt = Appointment {
            id: Ulid::new(),
            branch_id: Ulid::new(),
            staff_id: staff,
            customer_id: Ulid::new(),
            start: 0,
            end: 60 * MINUTE_MS,
            total_duration_minutes: 60,
            status: AppointmentStatus::Confirmed,
            confirmation_code: "X".into(),
            items: vec![
                ServiceItem {
                    service_id: Ulid::new(),
                    staff_id: staff,
                    start: 0,
                    duration_minutes: 60,
                    price: Decimal::ZERO,
                },
                ServiceItem {
                    service_id: Ulid::new(),
                    staff_id: helper,
                    start: 0,
                    duration_minutes: 30,
                    price: Decimal::ZERO,
                },
            ],
            idempotency_key: None,
        };
        assert_eq!(appt.span_for(staff), Some(Span::new(0, 60 * MINUTE_MS)));
        assert_eq!(appt.span_for(helper), Some(Span::new(0, 30 * MINUTE_MS)));
        assert_eq!(appt.span_for(Ulid::new()), None);
        let later = Span::new(30 * MINUTE_MS, 60 * MINUTE_MS);
        assert!(appt.occupies(staff, &later));
        assert!(!appt.occupies(helper, &later));
    }

    #[test]
    fn tax_applies_from_settings() {
        let mut appt = Appointment {
            id: Ulid::new(),
            branch_id: Ulid::new(),
            staff_id: Ulid::new(),
            customer_id: Ulid::new(),
            start: 0,
            end: 30 * MINUTE_MS,
            total_duration_minutes: 30,
            status: AppointmentStatus::Pending,
            confirmation_code: "X".into(),
            items: vec![],
            idempotency_key: None,
        };
        appt.items.push(ServiceItem {
            service_id: Ulid::new(),
            staff_id: appt.staff_id,
            start: 0,
            duration_minutes: 30,
            price: Decimal::new(10000, 2),
        });
        let settings = BranchSettings {
            tax_rate: Some(Decimal::new(10, 2)),
            ..BranchSettings::default()
        };
        assert_eq!(appt.total_with_tax(&settings), Decimal::new(11000, 2));
    }

    #[test]
    fn conflict_parties() {
        let a = Ulid::new();
        let b = Ulid::new();
        let c = Conflict {
            id: Ulid::new(),
            branch_id: Ulid::new(),
            source_appointment: a,
            conflicting_appointment: Some(b),
            kind: ConflictType::DoubleBooking,
            status: ConflictStatus::Pending,
            auto_resolution_attempts: 0,
            suggested_alternatives: vec![],
            resolution_notes: None,
            resolved_strategy: None,
            escalated: false,
            detected_at: 0,
        };
        assert_eq!(c.other_party(a), Some(b));
        assert_eq!(c.other_party(b), Some(a));
        assert!(c.involves(b));
        assert_eq!(c.other_party(Ulid::new()), None);
    }
}
