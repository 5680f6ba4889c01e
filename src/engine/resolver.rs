use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, info, warn};
use ulid::Ulid;

use super::slots::SlotRequest;
use super::{Engine, EngineError, Outgoing};
use crate::model::*;
use crate::notify::{Notification, Priority, Recipient};
use crate::observability::RESOLUTIONS_TOTAL;
use crate::store::{Mutation, StoreError};

const ALTERNATIVE_STAFF_CONFIDENCE: f64 = 0.9;
const NEARBY_CONFIDENCE: f64 = 0.8;
const SPLIT_CONFIDENCE: f64 = 0.75;
const CROSS_BRANCH_CONFIDENCE: f64 = 0.6;
const WAITLIST_CONFIDENCE: f64 = 0.5;

/// One atomic step of a resolution plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Action {
    UpdateAppointment { appointment: Appointment },
    CancelAppointment { appointment_id: Ulid },
    CreateWaitlist { entry: WaitlistEntry },
    /// Sent only once the plan has committed.
    NotifyCustomer {
        customer_id: Ulid,
        subject: String,
        appointment_id: Ulid,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolutionSuggestion {
    pub strategy: Strategy,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub description: String,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResolutionOutcome {
    Resolved(Strategy),
    /// The conflict was resolved by an earlier or concurrent call.
    AlreadyResolved,
    /// The appointments no longer clash; the conflict was closed without
    /// touching them.
    Superseded,
    /// No suggestion above the threshold could be executed; the attempt was counted.
    Unresolved,
    Escalated,
}

impl ResolutionOutcome {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_) | Self::AlreadyResolved | Self::Superseded)
    }
}

impl Engine {
    /// Ranked plans for a conflict, highest confidence first. Never empty:
    /// WAITLIST is always offered.
    pub async fn generate_resolution_suggestions(
        &self,
        conflict_id: Ulid,
    ) -> Result<Vec<ResolutionSuggestion>, EngineError> {
        let conflict = self.require_conflict(conflict_id).await?;
        self.suggestions_for(&conflict).await
    }

    pub async fn attempt_auto_resolution(&self, conflict_id: Ulid) -> Result<bool, EngineError> {
        Ok(self.resolve(conflict_id).await?.is_resolved())
    }

    /// Run one resolution attempt. A conflict the appointments no longer bear
    /// out is closed as superseded. Otherwise suggestions at or above the
    /// auto-execute threshold are tried in order until one commits. Once the
    /// failed-attempt budget is spent (or the branch disables auto-resolution)
    /// the conflict is escalated instead.
    pub async fn resolve(&self, conflict_id: Ulid) -> Result<ResolutionOutcome, EngineError> {
        let conflict = self.require_conflict(conflict_id).await?;
        if conflict.is_resolved() {
            return Ok(ResolutionOutcome::AlreadyResolved);
        }
        if let Some(reason) = self.superseded_reason(&conflict).await? {
            return self.close_superseded(conflict, reason).await;
        }
        let branch = self.require_branch(conflict.branch_id).await?;

        if !branch.settings.auto_resolve_conflicts
            || conflict.auto_resolution_attempts >= self.config.max_failed_attempts
        {
            let mut counted = conflict.clone();
            counted.auto_resolution_attempts += 1;
            return match self.escalate(counted).await {
                Ok(()) => Ok(ResolutionOutcome::Escalated),
                Err(EngineError::Store(StoreError::Immutable(_))) => {
                    Ok(ResolutionOutcome::AlreadyResolved)
                }
                Err(e) => Err(e),
            };
        }

        let suggestions = self.suggestions_for(&conflict).await?;
        let threshold = self.config.auto_execute_threshold;
        for suggestion in suggestions.iter().filter(|s| s.confidence >= threshold) {
            let label = strategy_label(suggestion.strategy);
            match self.execute(&conflict, suggestion).await {
                Ok(()) => {
                    metrics::counter!(RESOLUTIONS_TOTAL, "strategy" => label, "outcome" => "success")
                        .increment(1);
                    info!(
                        "conflict {conflict_id} resolved by {} ({:.2})",
                        suggestion.strategy, suggestion.confidence
                    );
                    return Ok(ResolutionOutcome::Resolved(suggestion.strategy));
                }
                Err(e) => {
                    metrics::counter!(RESOLUTIONS_TOTAL, "strategy" => label, "outcome" => "failure")
                        .increment(1);
                    warn!("conflict {conflict_id}: {} failed: {e}", suggestion.strategy);
                }
            }
        }

        self.record_failed_attempt(conflict).await
    }

    /// Count an attempt that executed nothing. A concurrent resolver that closed
    /// the conflict first wins.
    pub(super) async fn record_failed_attempt(&self, conflict: Conflict) -> Result<ResolutionOutcome, EngineError> {
        let id = conflict.id;
        let mut counted = conflict;
        counted.auto_resolution_attempts += 1;
        counted.resolution_notes = Some(format!(
            "attempt {}: no strategy at or above {:.2} could be executed",
            counted.auto_resolution_attempts, self.config.auto_execute_threshold
        ));
        match self
            .commit("count_resolution_attempt", vec![Mutation::UpdateConflict { conflict: counted }])
            .await
        {
            Ok(()) => Ok(ResolutionOutcome::Unresolved),
            Err(StoreError::Immutable(_)) => {
                debug!("conflict {id} was resolved concurrently");
                Ok(ResolutionOutcome::AlreadyResolved)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Why a pending conflict no longer matches the appointments on record, or
    /// None while it still holds.
    async fn superseded_reason(&self, conflict: &Conflict) -> Result<Option<String>, EngineError> {
        let Some(source) = self.appointment(conflict.source_appointment).await? else {
            return Ok(Some(format!("appointment {} no longer exists", conflict.source_appointment)));
        };
        if !source.status.is_active() {
            return Ok(Some(format!("appointment {} is {:?}", source.id, source.status)));
        }

        if let Some(other_id) = conflict.conflicting_appointment {
            let still_clashes = self.appointment(other_id).await?.is_some_and(|other| {
                source.performers().into_iter().any(|staff_id| {
                    source
                        .span_for(staff_id)
                        .is_some_and(|own| other.occupies(staff_id, &own))
                })
            });
            return Ok((!still_clashes)
                .then(|| format!("appointment {other_id} no longer overlaps {}", source.id)));
        }

        let holds = match conflict.kind {
            ConflictType::Overlapping => source.has_self_overlap(),
            ConflictType::StaffUnavailable | ConflictType::BranchClosed => {
                let branch = self.require_branch(source.branch_id).await?;
                self.placement_conflict(&branch, &source).await? == Some(conflict.kind)
            }
            ConflictType::DoubleBooking => true,
        };
        Ok((!holds)
            .then(|| format!("appointment {} no longer has a {:?} conflict", source.id, conflict.kind)))
    }

    async fn close_superseded(&self, conflict: Conflict, reason: String) -> Result<ResolutionOutcome, EngineError> {
        let id = conflict.id;
        let mut closed = conflict;
        closed.status = ConflictStatus::AutoResolved;
        closed.resolution_notes = Some(format!("superseded: {reason}"));
        match self
            .commit("close_superseded_conflict", vec![Mutation::UpdateConflict { conflict: closed }])
            .await
        {
            Ok(()) => {}
            Err(StoreError::Immutable(_)) => return Ok(ResolutionOutcome::AlreadyResolved),
            Err(e) => return Err(e.into()),
        }
        metrics::counter!(RESOLUTIONS_TOTAL, "strategy" => "none", "outcome" => "superseded").increment(1);
        info!("conflict {id} closed as superseded: {reason}");
        Ok(ResolutionOutcome::Superseded)
    }

    /// Detect conflicts for an appointment and try to resolve each pending one.
    pub async fn detect_and_resolve(
        &self,
        appointment_id: Ulid,
    ) -> Result<Vec<(Conflict, ResolutionOutcome)>, EngineError> {
        let conflicts = self.detect_conflicts(appointment_id).await?;
        let mut out = Vec::with_capacity(conflicts.len());
        for c in conflicts {
            let outcome = self.resolve(c.id).await?;
            out.push((c, outcome));
        }
        Ok(out)
    }

    /// Apply a plan and mark the conflict resolved in one commit, then notify.
    async fn execute(&self, conflict: &Conflict, suggestion: &ResolutionSuggestion) -> Result<(), EngineError> {
        let mut batch = Vec::with_capacity(suggestion.actions.len() + 1);
        let mut outbox = Vec::new();
        for action in &suggestion.actions {
            match action {
                Action::UpdateAppointment { appointment } => batch.push(Mutation::UpdateAppointment {
                    appointment: appointment.clone(),
                    recheck: true,
                }),
                Action::CancelAppointment { appointment_id } => {
                    batch.push(Mutation::CancelAppointment { id: *appointment_id })
                }
                Action::CreateWaitlist { entry } => batch.push(Mutation::CreateWaitlist { entry: entry.clone() }),
                Action::NotifyCustomer {
                    customer_id,
                    subject,
                    appointment_id,
                } => outbox.push(Outgoing {
                    recipient: Recipient::Customer(*customer_id),
                    channel: self.config.customer_channel,
                    message: Notification {
                        priority: Priority::Normal,
                        subject: subject.clone(),
                        payload: serde_json::json!({
                            "appointment_id": appointment_id.to_string(),
                            "conflict_id": conflict.id.to_string(),
                            "strategy": suggestion.strategy.to_string(),
                        }),
                    },
                }),
            }
        }

        let mut resolved = conflict.clone();
        resolved.status = ConflictStatus::AutoResolved;
        resolved.resolved_strategy = Some(suggestion.strategy);
        resolved.auto_resolution_attempts += 1;
        resolved.resolution_notes = Some(suggestion.description.clone());
        batch.push(Mutation::UpdateConflict { conflict: resolved });

        self.commit("execute_resolution", batch)
            .await
            .map_err(|e| EngineError::ResolutionExecution(e.to_string()))?;
        self.dispatch(outbox);
        Ok(())
    }

    async fn suggestions_for(&self, conflict: &Conflict) -> Result<Vec<ResolutionSuggestion>, EngineError> {
        let source = self.require_appointment(conflict.source_appointment).await?;
        let branch = self.require_branch(conflict.branch_id).await?;
        let other = match conflict.conflicting_appointment {
            Some(id) => self.appointment(id).await?,
            None => None,
        };

        let planned = match conflict.kind {
            ConflictType::DoubleBooking => vec![
                self.alternative_staff(&branch, &source).await,
                self.nearby_slot(&branch, &source).await,
            ],
            ConflictType::StaffUnavailable => vec![self.skill_matched_staff(&branch, &source).await],
            ConflictType::Overlapping => vec![self.split_services(&branch, &source).await],
            ConflictType::BranchClosed => vec![self.other_branch(&branch, &source).await],
        };

        let mut suggestions = Vec::new();
        for plan in planned {
            match plan {
                Ok(Some(s)) => suggestions.push(s),
                Ok(None) => {}
                // A failed lookup only costs that strategy; the fallback remains.
                Err(e) => warn!("conflict {}: strategy lookup failed: {e}", conflict.id),
            }
        }
        suggestions.push(self.waitlist_plan(&source, other.as_ref()));
        suggestions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Ok(suggestions)
    }

    // ── Strategies ───────────────────────────────────────────

    /// Staff at the branch, other than `exclude`, offering every one of `service_ids`.
    async fn colleagues(
        &self,
        branch_id: Ulid,
        exclude: Ulid,
        service_ids: &[Ulid],
    ) -> Result<Vec<StaffMember>, EngineError> {
        Ok(self
            .config
            .read_retry
            .run("staff_at_branch", || self.schedule.staff_at_branch(branch_id))
            .await?
            .into_iter()
            .filter(|s| s.id != exclude && s.offers_all(service_ids))
            .collect())
    }

    async fn alternative_staff(
        &self,
        branch: &Branch,
        source: &Appointment,
    ) -> Result<Option<ResolutionSuggestion>, EngineError> {
        let service_ids = source.service_ids();
        for member in self.colleagues(branch.id, source.staff_id, &service_ids).await? {
            if self
                .span_is_bookable(branch, member.id, source.span(), &service_ids, Some(source.id))
                .await?
            {
                return Ok(Some(reassign(
                    source,
                    &member,
                    ALTERNATIVE_STAFF_CONFIDENCE,
                )));
            }
        }
        Ok(None)
    }

    async fn nearby_slot(
        &self,
        branch: &Branch,
        source: &Appointment,
    ) -> Result<Option<ResolutionSuggestion>, EngineError> {
        let member = self.require_staff(source.staff_id).await?;
        let service_ids = source.service_ids();
        let staff = [member];
        let req = SlotRequest {
            branch,
            service_ids: &service_ids,
            date: local_date_of(source.start, branch.timezone),
            staff: &staff,
            duration_minutes: source.total_duration_minutes,
            granularity_minutes: self.config.default_granularity_minutes,
            ignore_appointment: Some(source.id),
        };
        let reach = Ms::from(self.config.reschedule_window_minutes) * MINUTE_MS;
        let best = self
            .candidate_slots(&req)
            .await?
            .into_iter()
            .filter(|s| s.staff_id == source.staff_id && s.start != source.start)
            .filter(|s| (s.start - source.start).abs() <= reach)
            .min_by_key(|s| ((s.start - source.start).abs(), s.start));

        Ok(best.map(|slot| {
            let mut moved = source.moved(slot.start, source.staff_id);
            moved.status = AppointmentStatus::Rescheduled;
            let delta = (slot.start - source.start) / MINUTE_MS;
            ResolutionSuggestion {
                strategy: Strategy::RescheduleNearby,
                confidence: NEARBY_CONFIDENCE,
                description: format!("move appointment {} by {delta:+} minutes", source.id),
                actions: vec![
                    Action::UpdateAppointment { appointment: moved },
                    notify(source, "Your appointment time has changed"),
                ],
            }
        }))
    }

    /// Staff sharing the required specializations; confidence is the share of
    /// required skills held, never below the configured floor.
    async fn skill_matched_staff(
        &self,
        branch: &Branch,
        source: &Appointment,
    ) -> Result<Option<ResolutionSuggestion>, EngineError> {
        let service_ids = source.service_ids();
        let services = self.load_services(&service_ids).await?;
        let required: BTreeSet<String> = services
            .iter()
            .flat_map(|s| s.required_specializations.iter().cloned())
            .collect();

        let mut best: Option<(f64, StaffMember)> = None;
        for member in self.colleagues(branch.id, source.staff_id, &service_ids).await? {
            let matching = member.matching_specializations(&required);
            if !required.is_empty() && matching == 0 {
                continue;
            }
            let ratio = if required.is_empty() {
                1.0
            } else {
                matching as f64 / required.len() as f64
            };
            let confidence = ratio.max(self.config.skill_match_floor).min(1.0);
            if best.as_ref().is_some_and(|(c, _)| *c >= confidence) {
                continue;
            }
            if self
                .span_is_bookable(branch, member.id, source.span(), &service_ids, Some(source.id))
                .await?
            {
                best = Some((confidence, member));
            }
        }
        Ok(best.map(|(confidence, member)| reassign(source, &member, confidence)))
    }

    /// Keep the first service with the booked staff member and hand the rest to a
    /// colleague, run back to back from the appointment start.
    async fn split_services(
        &self,
        branch: &Branch,
        source: &Appointment,
    ) -> Result<Option<ResolutionSuggestion>, EngineError> {
        if source.items.len() < 2 {
            return Ok(None);
        }
        let secondary_ids: Vec<Ulid> = source.items[1..].iter().map(|i| i.service_id).collect();
        let primary = source.items[0].staff_id;

        for member in self.colleagues(branch.id, primary, &secondary_ids).await? {
            let mut split = source.clone();
            split.items[0].start = source.start;
            let mut cursor = source.start;
            for item in &mut split.items[1..] {
                item.staff_id = member.id;
                item.start = cursor;
                cursor += Ms::from(item.duration_minutes) * MINUTE_MS;
            }
            split.recompute_bounds();
            if split.has_self_overlap() {
                continue;
            }
            // The colleague only needs to be free while their own services run.
            let Some(handed_over) = Span::try_new(source.start, cursor) else {
                continue;
            };
            if self
                .span_is_bookable(branch, member.id, handed_over, &secondary_ids, Some(source.id))
                .await?
            {
                return Ok(Some(ResolutionSuggestion {
                    strategy: Strategy::SplitServices,
                    confidence: SPLIT_CONFIDENCE,
                    description: format!(
                        "run {} secondary service(s) concurrently with staff {}",
                        secondary_ids.len(),
                        member.id
                    ),
                    actions: vec![
                        Action::UpdateAppointment { appointment: split },
                        notify(source, "Your services have been rearranged"),
                    ],
                }));
            }
        }
        Ok(None)
    }

    /// Same time at a sibling branch that is open and has a free, qualified staff member.
    async fn other_branch(
        &self,
        branch: &Branch,
        source: &Appointment,
    ) -> Result<Option<ResolutionSuggestion>, EngineError> {
        if !branch.settings.allow_cross_branch_reschedule {
            return Ok(None);
        }
        let service_ids = source.service_ids();
        let siblings = self
            .config
            .read_retry
            .run("sibling_branches", || self.schedule.sibling_branches(branch.id))
            .await?;
        for sibling in siblings {
            for member in self.colleagues(sibling.id, source.staff_id, &service_ids).await? {
                if self
                    .span_is_bookable(&sibling, member.id, source.span(), &service_ids, Some(source.id))
                    .await?
                {
                    let mut moved = source.moved(source.start, member.id);
                    moved.branch_id = sibling.id;
                    moved.status = AppointmentStatus::Rescheduled;
                    return Ok(Some(ResolutionSuggestion {
                        strategy: Strategy::RescheduleNearby,
                        confidence: CROSS_BRANCH_CONFIDENCE,
                        description: format!(
                            "move appointment {} to branch {} with staff {}",
                            source.id, sibling.id, member.id
                        ),
                        actions: vec![
                            Action::UpdateAppointment { appointment: moved },
                            notify(source, "Your appointment has moved to another branch"),
                        ],
                    }));
                }
            }
        }
        Ok(None)
    }

    /// Always available: cancel the conflicting booking (or the source when there is
    /// none left active) and put its customer on the waitlist.
    fn waitlist_plan(&self, source: &Appointment, other: Option<&Appointment>) -> ResolutionSuggestion {
        let victim = other.filter(|o| o.status.is_active()).unwrap_or(source);
        let entry = WaitlistEntry {
            id: Ulid::new(),
            customer_id: victim.customer_id,
            branch_id: victim.branch_id,
            service_ids: victim.service_ids(),
            preferred_start: victim.start,
            expires_at: self.now() + Ms::from(self.config.waitlist_expiry_days) * DAY_MS,
            source_appointment: Some(victim.id),
        };
        ResolutionSuggestion {
            strategy: Strategy::Waitlist,
            confidence: WAITLIST_CONFIDENCE,
            description: format!("cancel appointment {} and waitlist its customer", victim.id),
            actions: vec![
                Action::CreateWaitlist { entry },
                Action::CancelAppointment { appointment_id: victim.id },
                notify(victim, "You have been added to the waitlist"),
            ],
        }
    }
}

fn reassign(source: &Appointment, member: &StaffMember, confidence: f64) -> ResolutionSuggestion {
    ResolutionSuggestion {
        strategy: Strategy::FindAlternativeStaff,
        confidence,
        description: format!("reassign appointment {} to staff {}", source.id, member.id),
        actions: vec![
            Action::UpdateAppointment {
                appointment: source.moved(source.start, member.id),
            },
            notify(source, "Your appointment has a new staff member"),
        ],
    }
}

fn notify(appointment: &Appointment, subject: &str) -> Action {
    Action::NotifyCustomer {
        customer_id: appointment.customer_id,
        subject: subject.to_string(),
        appointment_id: appointment.id,
    }
}

fn strategy_label(strategy: Strategy) -> &'static str {
    match strategy {
        Strategy::FindAlternativeStaff => "find_alternative_staff",
        Strategy::RescheduleNearby => "reschedule_nearby",
        Strategy::SplitServices => "split_services",
        Strategy::Waitlist => "waitlist",
    }
}
