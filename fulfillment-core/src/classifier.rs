//! Fulfillment classification
//!
//! Maps required vs. delivered quantities to one of three states.
//! Rules are evaluated in order:
//!
//! 1. `Fulfilled` when both sexes are met
//! 2. `PartiallyFulfilled` when *both* sexes are short
//! 3. `Received` otherwise (one sex met, the other short)
//!
//! Rule 2 is a conjunction: a requisition fully served in one sex but
//! not the other falls through to `Received`.

use crate::types::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fulfillment state derived from delivery totals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FulfillmentState {
    /// Nothing (or only one sex) delivered in full
    Received,
    /// Both sexes short
    PartiallyFulfilled,
    /// Both sexes met
    Fulfilled,
}

impl FulfillmentState {
    /// All states, in tag-catalogue order
    pub const ALL: [FulfillmentState; 3] = [
        FulfillmentState::Received,
        FulfillmentState::PartiallyFulfilled,
        FulfillmentState::Fulfilled,
    ];

    /// System tag carried by requisitions in this state
    pub fn tag_name(&self) -> &'static str {
        match self {
            FulfillmentState::Received => "Received",
            FulfillmentState::PartiallyFulfilled => "PartiallyFulfilled",
            FulfillmentState::Fulfilled => "Fulfilled",
        }
    }

    /// Status code recorded on transition
    pub fn status_code(&self) -> StatusCode {
        match self {
            FulfillmentState::Received => StatusCode::Received,
            FulfillmentState::PartiallyFulfilled => StatusCode::PartiallyConcluded,
            FulfillmentState::Fulfilled => StatusCode::Concluded,
        }
    }

    /// State recorded by a status code, if it is one of the three
    pub fn from_status(status: StatusCode) -> Option<Self> {
        match status {
            StatusCode::Received => Some(FulfillmentState::Received),
            StatusCode::PartiallyConcluded => Some(FulfillmentState::PartiallyFulfilled),
            StatusCode::Concluded => Some(FulfillmentState::Fulfilled),
            _ => None,
        }
    }

    /// Canned status message for a transition into this state
    pub fn transition_message(&self) -> &'static str {
        match self {
            FulfillmentState::Received => "Status changed to requisition received.",
            FulfillmentState::PartiallyFulfilled => "Status changed to requisition in progress.",
            FulfillmentState::Fulfilled => "Status changed to requisition concluded.",
        }
    }

    /// True if `name` is one of the reserved system tags
    pub fn is_system_tag(name: &str) -> bool {
        Self::ALL.iter().any(|state| state.tag_name() == name)
    }
}

impl fmt::Display for FulfillmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag_name())
    }
}

/// Classify delivered totals against requirements
pub fn classify(
    required_males: u64,
    required_females: u64,
    delivered_males: u64,
    delivered_females: u64,
) -> FulfillmentState {
    let males_met = delivered_males >= required_males;
    let females_met = delivered_females >= required_females;

    if males_met && females_met {
        FulfillmentState::Fulfilled
    } else if !males_met && !females_met {
        FulfillmentState::PartiallyFulfilled
    } else {
        FulfillmentState::Received
    }
}
