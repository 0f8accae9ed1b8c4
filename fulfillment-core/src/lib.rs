//! Biotério Fulfillment Core
//!
//! Requisition fulfillment ledger: classifies requisitions from their
//! deliveries, keeps derived tags and status history consistent, and
//! aggregates required-vs-delivered statistics.
//!
//! # Architecture
//!
//! - **Classifier**: pure function from required/delivered totals to a state
//! - **Reconciler**: plans tag and status changes, staged atomically with
//!   the delivery write that triggered them
//! - **Single Writer**: one actor task serializes every mutation
//! - **Aggregator**: one pass over a store snapshot, lenient or strict
//!
//! # Invariants
//!
//! - Exactly one system tag (`Received`, `PartiallyFulfilled`, `Fulfilled`)
//!   per requisition after reconciliation
//! - At most one status event per actual state transition
//! - Required quantities counted once per requisition in statistics
//! - A failed store call applies nothing

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod storage;
pub mod memory;
pub mod classifier;
pub mod reconciler;
pub mod statistics;
pub mod ledger;
pub mod error;
pub mod actor;
pub mod config;
pub mod metrics;

// Re-exports
pub use error::{Error, Result};
pub use types::{
    Delivery, Department, Institute, Profile, Project, Protocol, Requisition, StatusCode,
    StatusEvent, Tag, TagColor,
};
pub use classifier::{classify, FulfillmentState};
pub use reconciler::ReconcileOutcome;
pub use statistics::{AggregateReport, AggregationMode, Counters, DateRange, StatisticsAggregator};
pub use storage::{LedgerStore, Storage};
pub use memory::MemoryStore;
pub use ledger::{
    DeliveryReceipt, DeliveryUpdate, Ledger, NewDelivery, NewProfile, NewProject, NewRequisition,
};
pub use config::Config;
