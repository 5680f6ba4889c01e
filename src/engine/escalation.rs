use tracing::{debug, warn};
use ulid::Ulid;

use super::{Engine, EngineError, Outgoing};
use crate::model::*;
use crate::notify::{Notification, Priority, Recipient};
use crate::observability::ESCALATIONS_TOTAL;
use crate::store::Mutation;

pub(super) const ESCALATION_NOTE: &str = "requires manual intervention";

impl Engine {
    /// Hand a conflict to branch management. The conflict stays PENDING; only the
    /// first escalation notifies, later calls just rewrite the notes.
    pub async fn escalate_to_manual(&self, conflict_id: Ulid) -> Result<(), EngineError> {
        let conflict = self.require_conflict(conflict_id).await?;
        self.escalate(conflict).await
    }

    pub(super) async fn escalate(&self, mut conflict: Conflict) -> Result<(), EngineError> {
        if conflict.is_resolved() {
            debug!("conflict {} already resolved, not escalating", conflict.id);
            return Ok(());
        }
        let first = !conflict.escalated;
        conflict.escalated = true;
        conflict.resolution_notes = Some(ESCALATION_NOTE.to_string());

        let mut outbox = Vec::new();
        if first {
            let branch = self.require_branch(conflict.branch_id).await?;
            outbox.push(Outgoing {
                recipient: Recipient::BranchManagement(branch.id),
                channel: branch.settings.management_channel,
                message: Notification {
                    priority: Priority::High,
                    subject: format!("Conflict {} needs manual review", conflict.id),
                    payload: serde_json::json!({
                        "conflict_id": conflict.id.to_string(),
                        "type": conflict.kind,
                        "source_appointment": conflict.source_appointment.to_string(),
                        "conflicting_appointment": conflict.conflicting_appointment.map(|id| id.to_string()),
                        "attempts": conflict.auto_resolution_attempts,
                        "alternatives": conflict.suggested_alternatives.len(),
                    }),
                },
            });
        }

        let id = conflict.id;
        self.commit("escalate_conflict", vec![Mutation::UpdateConflict { conflict }])
            .await?;

        if first {
            metrics::counter!(ESCALATIONS_TOTAL).increment(1);
            warn!("conflict {id} escalated to manual review");
            self.dispatch(outbox);
        }
        Ok(())
    }
}
