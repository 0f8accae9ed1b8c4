//! Tag/status reconciliation
//!
//! After every delivery write the requisition's system tag and status
//! history are brought in line with [`classify`]. Reconciliation is
//! planned here without touching the store; the caller stages the plan
//! into the same [`WriteSet`] as the delivery write so both land in one
//! atomic commit or not at all.
//!
//! # Invariants
//!
//! - Exactly one of the three system tags is attached afterwards
//! - User tags are never touched
//! - A status event is appended only when the classified state differs
//!   from the most recent `RE`/`PA`/`CO` event
//! - Re-running with unchanged inputs plans nothing

use crate::{
    classifier::{classify, FulfillmentState},
    storage::WriteSet,
    types::{Delivery, Requisition, StatusCode, StatusEvent},
    Error, Result,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Planned reconciliation for one requisition
#[derive(Debug, Clone)]
pub struct Reconciliation {
    /// Classified state
    pub state: FulfillmentState,

    /// Sum of active delivered males
    pub delivered_males: u64,

    /// Sum of active delivered females
    pub delivered_females: u64,

    /// Tags to attach
    pub tags_added: Vec<String>,

    /// Tags to detach
    pub tags_removed: Vec<String>,

    /// Requisition with its new tag set, if the tag set changes
    pub requisition: Option<Requisition>,

    /// Status event to append, if the state changed
    pub status_event: Option<StatusEvent>,

    requisition_id: Uuid,
}

/// What a reconciliation did, reported back to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    /// Requisition reconciled
    pub requisition_id: Uuid,

    /// Classified state
    pub state: FulfillmentState,

    /// Whether the tag set changed
    pub tags_changed: bool,

    /// Status appended, if any
    pub status_appended: Option<StatusCode>,
}

impl Reconciliation {
    /// True if applying this plan changes nothing
    pub fn is_noop(&self) -> bool {
        self.requisition.is_none() && self.status_event.is_none()
    }

    /// Stage the plan into a write set
    pub fn stage(self, set: &mut WriteSet) -> ReconcileOutcome {
        let outcome = ReconcileOutcome {
            requisition_id: self.requisition_id,
            state: self.state,
            tags_changed: self.requisition.is_some(),
            status_appended: self.status_event.as_ref().map(|e| e.status),
        };

        if let Some(requisition) = self.requisition {
            set.requisitions.retain(|r| r.id != requisition.id);
            set.requisitions.push(requisition);
        }
        if let Some(event) = self.status_event {
            set.status_events.push(event);
        }

        outcome
    }
}

/// Sum of active deliveries for a requisition
pub fn delivered_totals(deliveries: &[Delivery], requisition_id: Uuid) -> (u64, u64) {
    deliveries
        .iter()
        .filter(|d| d.active && d.requisition_id == requisition_id)
        .fold((0, 0), |(males, females), d| {
            (males + u64::from(d.males), females + u64::from(d.females))
        })
}

/// Plan the reconciliation of a requisition
///
/// `deliveries` must already include the in-flight delivery write and
/// `history` is the requisition's status history in sequence order.
/// Fails with [`Error::Conflict`] when the requisition is held
/// (`SU`/`CA`) and the plan would change it.
pub fn reconcile(
    requisition: &Requisition,
    deliveries: &[Delivery],
    history: &[StatusEvent],
    now: DateTime<Utc>,
) -> Result<Reconciliation> {
    let (delivered_males, delivered_females) = delivered_totals(deliveries, requisition.id);
    let state = classify(
        u64::from(requisition.required_males),
        u64::from(requisition.required_females),
        delivered_males,
        delivered_females,
    );

    // Desired tag set: user tags plus the one system tag for `state`
    let desired: BTreeSet<String> = requisition
        .tags
        .iter()
        .filter(|name| !FulfillmentState::is_system_tag(name))
        .cloned()
        .chain(std::iter::once(state.tag_name().to_string()))
        .collect();

    let tags_added: Vec<String> = desired.difference(&requisition.tags).cloned().collect();
    let tags_removed: Vec<String> = requisition.tags.difference(&desired).cloned().collect();

    let attached_system_tags = requisition
        .tags
        .iter()
        .filter(|name| FulfillmentState::is_system_tag(name))
        .count();
    if attached_system_tags > 1 {
        tracing::warn!(
            protocol = %requisition.protocol,
            attached = attached_system_tags,
            "Repairing requisition carrying several system tags"
        );
    }

    let last_recorded = history
        .iter()
        .rev()
        .find_map(|event| FulfillmentState::from_status(event.status));
    let transition = last_recorded != Some(state);
    let tags_change = !tags_added.is_empty() || !tags_removed.is_empty();

    if transition || tags_change {
        if let Some(latest) = history.last() {
            if latest.status.is_hold() {
                tracing::warn!(
                    protocol = %requisition.protocol,
                    held = %latest.status,
                    classified = %state,
                    "Reconciliation blocked by manual status"
                );
                return Err(Error::Conflict(format!(
                    "requisition {} is {} ({}); refusing to move it to {}",
                    requisition.protocol,
                    latest.status.label(),
                    latest.status,
                    state
                )));
            }

            if transition && latest.status == StatusCode::InProduction {
                tracing::warn!(
                    protocol = %requisition.protocol,
                    classified = %state,
                    "Superseding in-production status"
                );
            }
        }
    }

    let requisition_update = tags_change.then(|| Requisition {
        tags: desired,
        last_updated: now,
        ..requisition.clone()
    });

    let status_event = transition.then(|| StatusEvent {
        id: Uuid::now_v7(),
        requisition_id: requisition.id,
        sequence: history.last().map(|e| e.sequence + 1).unwrap_or(0),
        status: state.status_code(),
        message: state.transition_message().to_string(),
        timestamp: now,
        author: None,
    });

    if let Some(event) = &status_event {
        tracing::info!(
            protocol = %requisition.protocol,
            from = ?last_recorded,
            to = %state,
            status = %event.status,
            "Fulfillment state transition"
        );
    }

    Ok(Reconciliation {
        state,
        delivered_males,
        delivered_females,
        tags_added,
        tags_removed,
        requisition: requisition_update,
        status_event,
        requisition_id: requisition.id,
    })
}
