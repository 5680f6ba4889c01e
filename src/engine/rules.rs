use chrono_tz::Tz;
use ulid::Ulid;

use crate::model::*;

/// What a rule is evaluated against, besides the slot itself.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext<'a> {
    pub branch_id: Ulid,
    pub service_ids: &'a [Ulid],
    pub timezone: Tz,
    pub now: Ms,
}

impl RuleContext<'_> {
    /// Scopes to fetch rules for, given the staff members in play.
    pub fn scopes(&self, staff: &[Ulid]) -> Vec<RuleScope> {
        let mut scopes = vec![RuleScope::Branch(self.branch_id)];
        scopes.extend(staff.iter().map(|s| RuleScope::Staff(*s)));
        scopes.extend(self.service_ids.iter().map(|s| RuleScope::Service(*s)));
        scopes
    }

    fn applies(&self, rule: &BookingRule, slot: &TimeSlot) -> bool {
        match rule.scope {
            RuleScope::Branch(b) => b == self.branch_id,
            RuleScope::Staff(s) => s == slot.staff_id,
            RuleScope::Service(s) => self.service_ids.contains(&s),
        }
    }
}

/// Keep only slots every applicable active rule admits. Rules run in priority
/// order (highest first) and are cumulative.
pub fn filter_slots(slots: Vec<TimeSlot>, rules: &[BookingRule], ctx: &RuleContext<'_>) -> Vec<TimeSlot> {
    let mut active: Vec<&BookingRule> = rules.iter().filter(|r| r.active).collect();
    if active.is_empty() {
        return slots;
    }
    active.sort_by_key(|r| std::cmp::Reverse(r.priority));

    slots
        .into_iter()
        .filter(|slot| {
            active
                .iter()
                .filter(|r| ctx.applies(r, slot))
                .all(|r| admits(r, slot, ctx))
        })
        .collect()
}

fn admits(rule: &BookingRule, slot: &TimeSlot, ctx: &RuleContext<'_>) -> bool {
    if let Some(h) = rule.min_advance_hours
        && slot.start < ctx.now + Ms::from(h) * HOUR_MS
    {
        return false;
    }
    if let Some(d) = rule.max_advance_days
        && slot.start > ctx.now + Ms::from(d) * DAY_MS
    {
        return false;
    }
    if let Some(rh) = rule.restricted_hours {
        let date = local_date_of(slot.start, ctx.timezone);
        let open = at_local_minute(date, rh.start_minute, ctx.timezone);
        let close = at_local_minute(date, rh.end_minute, ctx.timezone);
        if slot.start < open || slot.end > close {
            return false;
        }
    }
    true
}
