use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use ulid::Ulid;

use super::conflict::DetectionTrigger;
use super::slots::total_minutes;
use super::{Engine, EngineError};
use crate::limits::*;
use crate::model::*;
use crate::observability::{BOOKINGS_CREATED_TOTAL, BOOKINGS_REJECTED_TOTAL};
use crate::store::{Mutation, StoreError};

/// How the services of one booking are laid out in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceLayout {
    /// One after another, each starting when the previous one's buffer ends.
    #[default]
    Sequential,
    /// All at the booking start.
    Concurrent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAppointment {
    pub branch_id: Ulid,
    pub staff_id: Ulid,
    pub customer_id: Ulid,
    pub service_ids: Vec<Ulid>,
    pub start: Ms,
    #[serde(default)]
    pub layout: ServiceLayout,
    /// Fresh per attempt; a reused key is rejected with `AlreadyExists`.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// Front-desk override: skip the insert-time re-check and let detection
    /// record whatever overlap results.
    #[serde(default)]
    pub force: bool,
}

impl Engine {
    pub async fn create_appointment(&self, req: NewAppointment) -> Result<Appointment, EngineError> {
        if let Some(key) = &req.idempotency_key
            && (key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN)
        {
            return Err(EngineError::LimitExceeded("idempotency key length"));
        }
        self.require_branch(req.branch_id).await?;
        self.require_staff(req.staff_id).await?;
        let services = self.load_request_services(&req.service_ids).await?;
        total_minutes(&services)?;

        let mut items = Vec::with_capacity(services.len());
        let mut cursor = req.start;
        for svc in &services {
            let minutes = svc.total_minutes();
            let start = match req.layout {
                ServiceLayout::Sequential => cursor,
                ServiceLayout::Concurrent => req.start,
            };
            items.push(ServiceItem {
                service_id: svc.id,
                staff_id: req.staff_id,
                start,
                duration_minutes: minutes,
                price: svc.price,
            });
            cursor += Ms::from(minutes) * MINUTE_MS;
        }

        let id = Ulid::new();
        let mut appointment = Appointment {
            id,
            branch_id: req.branch_id,
            staff_id: req.staff_id,
            customer_id: req.customer_id,
            start: req.start,
            end: req.start,
            total_duration_minutes: 0,
            status: AppointmentStatus::Pending,
            confirmation_code: confirmation_code(id),
            items,
            idempotency_key: req.idempotency_key,
        };
        appointment.recompute_bounds();
        if appointment.end <= appointment.start {
            return Err(EngineError::InvalidInterval("end must be after start"));
        }

        let insert = Mutation::InsertAppointment {
            appointment: appointment.clone(),
            recheck: !req.force,
        };
        if let Err(e) = self.commit("create_appointment", vec![insert]).await {
            if let StoreError::SlotTaken(other) = &e {
                metrics::counter!(BOOKINGS_REJECTED_TOTAL).increment(1);
                info!("booking for staff {} rejected: slot taken by {other}", req.staff_id);
            }
            return Err(e.into());
        }
        metrics::counter!(BOOKINGS_CREATED_TOTAL).increment(1);
        info!(
            "created appointment {} ({}) for staff {}",
            appointment.id, appointment.confirmation_code, appointment.staff_id
        );

        if let Err(e) = self.detect_conflicts(appointment.id).await {
            warn!("conflict detection after booking {} failed: {e}", appointment.id);
        }
        Ok(appointment)
    }

    /// Move an appointment to `start`, optionally onto another staff member.
    pub async fn reschedule_appointment(
        &self,
        id: Ulid,
        start: Ms,
        staff_id: Option<Ulid>,
    ) -> Result<Appointment, EngineError> {
        let current = self.require_appointment(id).await?;
        if !current.status.can_transition_to(AppointmentStatus::Rescheduled) {
            return Err(EngineError::InvalidTransition(id));
        }
        let staff_id = match staff_id {
            Some(s) => self.require_staff(s).await?.id,
            None => current.staff_id,
        };
        let mut moved = current.moved(start, staff_id);
        moved.status = AppointmentStatus::Rescheduled;

        self.commit(
            "reschedule_appointment",
            vec![Mutation::UpdateAppointment {
                appointment: moved.clone(),
                recheck: true,
            }],
        )
        .await?;
        info!("rescheduled appointment {id} to {start} with staff {staff_id}");

        if let Err(e) = self.detect_conflicts_with(id, DetectionTrigger::ScheduleChange).await {
            warn!("conflict detection after reschedule of {id} failed: {e}");
        }
        Ok(moved)
    }

    pub async fn set_appointment_status(
        &self,
        id: Ulid,
        status: AppointmentStatus,
    ) -> Result<Appointment, EngineError> {
        let mut current = self.require_appointment(id).await?;
        if !current.status.can_transition_to(status) {
            return Err(EngineError::InvalidTransition(id));
        }
        self.commit(
            "set_appointment_status",
            vec![Mutation::SetAppointmentStatus { id, status }],
        )
        .await?;
        current.status = status;
        Ok(current)
    }

    pub async fn cancel_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.set_appointment_status(id, AppointmentStatus::Cancelled).await
    }
}

/// Short human-facing code taken from the random tail of the id.
fn confirmation_code(id: Ulid) -> String {
    let s = id.to_string();
    let len = MAX_CONFIRMATION_CODE_LEN.min(10);
    s[s.len() - len..].to_string()
}
