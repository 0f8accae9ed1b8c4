//! Main ledger orchestration layer
//!
//! Ties together storage, the single-writer actor and the statistics
//! aggregator into a high-level API for requisition fulfillment.
//! Input is validated here, before anything reaches the writer.
//!
//! # Example
//!
//! ```no_run
//! use fulfillment_core::{Config, Ledger, NewDelivery};
//!
//! #[tokio::main]
//! async fn main() -> fulfillment_core::Result<()> {
//!     let config = Config::default();
//!     let ledger = Ledger::open(config).await?;
//!
//!     if let Some(requisition) = ledger.find_requisition("00042.2024")? {
//!         let receipt = ledger
//!             .create_delivery(NewDelivery::new(requisition.id, 10, 5))
//!             .await?;
//!         println!("now {}", receipt.reconciliation.state);
//!     }
//!
//!     let report = ledger.get_statistics(None, None).await?;
//!     println!("{} males delivered", report.by_total.delivered_males);
//!
//!     ledger.shutdown().await
//! }
//! ```

use crate::{
    actor::{spawn_ledger_actor, LedgerHandle},
    classifier::FulfillmentState,
    metrics::Metrics,
    reconciler::ReconcileOutcome,
    statistics::{AggregateReport, AggregationMode, DateRange, StatisticsAggregator},
    storage::{LedgerStore, Storage, WriteSet},
    types::{
        Delivery, Department, Institute, Profile, Project, Protocol, Requisition, StatusCode,
        StatusEvent, Tag, TagColor,
    },
    Config, Error, Result,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Requisition to be created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRequisition {
    /// Owning project
    pub project_id: Uuid,
    /// Requested date
    pub date: NaiveDate,
    /// Required males
    pub required_males: u32,
    /// Required females
    pub required_females: u32,
    /// User tags; system tags are managed by the ledger
    #[serde(default)]
    pub tags: Vec<String>,
    /// Notes from the requester
    #[serde(default)]
    pub author_notes: String,
    /// Explicit protocol; drawn at random when absent
    #[serde(default)]
    pub protocol: Option<Protocol>,
}

impl NewRequisition {
    /// Requisition without tags, notes or explicit protocol
    pub fn new(project_id: Uuid, date: NaiveDate, required_males: u32, required_females: u32) -> Self {
        Self {
            project_id,
            date,
            required_males,
            required_females,
            tags: Vec::new(),
            author_notes: String::new(),
            protocol: None,
        }
    }
}

/// Delivery to be recorded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDelivery {
    /// Requisition served
    pub requisition_id: Uuid,
    /// Males delivered
    pub males: u32,
    /// Females delivered
    pub females: u32,
    /// Delivery date; today when absent
    #[serde(default)]
    pub date: Option<NaiveDate>,
    /// Who recorded it
    #[serde(default)]
    pub author: Option<Uuid>,
    /// Notes
    #[serde(default)]
    pub notes: String,
}

impl NewDelivery {
    /// Delivery dated today, without author or notes
    pub fn new(requisition_id: Uuid, males: u32, females: u32) -> Self {
        Self {
            requisition_id,
            males,
            females,
            date: None,
            author: None,
            notes: String::new(),
        }
    }

    /// Set delivery date
    pub fn on(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }
}

/// Changes to an active delivery; absent fields are kept
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryUpdate {
    /// Males delivered
    pub males: Option<u32>,
    /// Females delivered
    pub females: Option<u32>,
    /// Delivery date
    pub date: Option<NaiveDate>,
    /// Notes
    pub notes: Option<String>,
}

/// Profile to be registered
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProfile {
    /// Display name
    pub name: String,
    /// Can advise projects
    pub is_advisor: bool,
    /// Institute
    pub institute_id: Option<Uuid>,
    /// Department, which must belong to the institute
    pub department_id: Option<Uuid>,
    /// Phone
    pub phone: Option<String>,
}

/// Project to be created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProject {
    /// Title
    pub title: String,
    /// Description
    pub description: String,
    /// Ethics committee (CEUA) protocol
    pub ceua_protocol: String,
    /// Author profile
    pub author: Uuid,
    /// Advisor profile
    pub advisor: Uuid,
}

/// Delivery as written, with the reconciliation it triggered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// Delivery
    pub delivery: Delivery,
    /// Reconciliation
    pub reconciliation: ReconcileOutcome,
}

/// Main ledger interface
pub struct Ledger {
    /// Actor handle for writes
    handle: LedgerHandle,

    /// Direct store access (for reads)
    store: Arc<dyn LedgerStore>,

    /// Metrics
    metrics: Metrics,

    /// Configuration
    config: Config,
}

impl Ledger {
    /// Open ledger backed by RocksDB at `config.data_dir`
    pub async fn open(config: Config) -> Result<Self> {
        let storage = Arc::new(Storage::open(&config)?);
        Self::with_store(config, storage).await
    }

    /// Open ledger over an existing store
    pub async fn with_store(config: Config, store: Arc<dyn LedgerStore>) -> Result<Self> {
        bootstrap_system_tags(store.as_ref())?;

        let metrics = Metrics::new()
            .map_err(|e| Error::Other(format!("Failed to create metrics: {}", e)))?;

        // Spawn actor
        let handle = spawn_ledger_actor(
            store.clone(),
            metrics.clone(),
            config.actor.mailbox_capacity,
        );

        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            "Ledger opened"
        );

        Ok(Self {
            handle,
            store,
            metrics,
            config,
        })
    }

    /// Create requisition
    ///
    /// Attaches the `Received` tag, an inactive placeholder delivery and
    /// the initial `RE` event. No reconciliation runs at creation.
    pub async fn create_requisition(&self, mut request: NewRequisition) -> Result<Requisition> {
        self.validate_quantities(request.required_males, request.required_females)?;
        request.tags = normalize_tags(request.tags)?;

        self.handle.create_requisition(request).await
    }

    /// Record delivery and reconcile its requisition
    pub async fn create_delivery(&self, request: NewDelivery) -> Result<DeliveryReceipt> {
        self.validate_quantities(request.males, request.females)?;
        self.handle.create_delivery(request).await
    }

    /// Update active delivery and reconcile its requisition
    pub async fn update_delivery(
        &self,
        delivery_id: Uuid,
        update: DeliveryUpdate,
    ) -> Result<DeliveryReceipt> {
        self.validate_quantities(update.males.unwrap_or(0), update.females.unwrap_or(0))?;
        self.handle.update_delivery(delivery_id, update).await
    }

    /// Soft-delete delivery and reconcile its requisition
    pub async fn delete_delivery(&self, delivery_id: Uuid) -> Result<ReconcileOutcome> {
        self.handle.delete_delivery(delivery_id).await
    }

    /// Reconcile requisition tags and status with its deliveries
    pub async fn reconcile(&self, requisition_id: Uuid) -> Result<ReconcileOutcome> {
        self.handle.reconcile(requisition_id).await
    }

    /// Append a manual status event
    ///
    /// `SU`/`CA` put the requisition on hold: later reconciliations that
    /// would change it fail with [`Error::Conflict`] until an `RE`, `PA`
    /// or `CO` event is recorded.
    pub async fn record_status(
        &self,
        requisition_id: Uuid,
        status: StatusCode,
        message: impl Into<String>,
        author: Option<Uuid>,
    ) -> Result<StatusEvent> {
        let message = message.into();
        if message.trim().is_empty() {
            return Err(Error::Validation("Status message is empty".to_string()));
        }
        self.handle
            .record_status(requisition_id, status, message, author)
            .await
    }

    /// Register institute
    pub async fn register_institute(
        &self,
        name: &str,
        abbreviation: Option<&str>,
    ) -> Result<Institute> {
        let name = required_text("Institute name", name)?;
        let institute = Institute::new(name, abbreviation.map(|a| a.trim().to_string()));
        self.handle.register_institute(institute).await
    }

    /// Register department of an institute
    pub async fn register_department(&self, institute_id: Uuid, name: &str) -> Result<Department> {
        let department = Department {
            id: Uuid::now_v7(),
            name: required_text("Department name", name)?,
            institute_id,
            description: String::new(),
        };
        self.handle.register_department(department).await
    }

    /// Register profile
    pub async fn register_profile(&self, request: NewProfile) -> Result<Profile> {
        let profile = Profile {
            id: Uuid::now_v7(),
            name: required_text("Profile name", &request.name)?,
            is_advisor: request.is_advisor,
            institute_id: request.institute_id,
            department_id: request.department_id,
            phone: request.phone,
            is_hidden: false,
        };
        self.handle.register_profile(profile).await
    }

    /// Create project
    pub async fn create_project(&self, mut request: NewProject) -> Result<Project> {
        request.title = required_text("Project title", &request.title)?;
        self.handle.create_project(request).await
    }

    /// Requisition by ID
    pub fn get_requisition(&self, id: Uuid) -> Result<Requisition> {
        self.store.get_requisition(id)
    }

    /// Requisition by protocol string
    pub fn find_requisition(&self, protocol: &str) -> Result<Option<Requisition>> {
        self.store.find_requisition(&Protocol::parse(protocol)?)
    }

    /// Delivery by ID
    pub fn get_delivery(&self, id: Uuid) -> Result<Delivery> {
        self.store.get_delivery(id)
    }

    /// Deliveries of a requisition, inactive ones included
    pub fn deliveries(&self, requisition_id: Uuid) -> Result<Vec<Delivery>> {
        self.store.get_requisition(requisition_id)?;
        self.store.requisition_deliveries(requisition_id)
    }

    /// Status history of a requisition
    pub fn status_history(&self, requisition_id: Uuid) -> Result<Vec<StatusEvent>> {
        self.store.get_requisition(requisition_id)?;
        self.store.status_history(requisition_id)
    }

    /// Tag catalogue
    pub fn tags(&self) -> Result<Vec<Tag>> {
        self.store.list_tags()
    }

    /// Aggregate statistics over active deliveries dated inside `[from, to]`
    ///
    /// Runs on the blocking pool over one store snapshot.
    pub async fn get_statistics(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<AggregateReport> {
        let range = DateRange::new(from, to)?;
        let mode = if self.config.statistics.strict {
            AggregationMode::Strict
        } else {
            AggregationMode::Lenient
        };

        let store = self.store.clone();
        let started = Instant::now();
        let report = tokio::task::spawn_blocking(move || {
            let snapshot = store.snapshot()?;
            StatisticsAggregator::new(mode).aggregate(&snapshot, &range)
        })
        .await
        .map_err(|e| Error::Concurrency(format!("Statistics task failed: {}", e)))??;

        let elapsed = started.elapsed();
        self.metrics
            .record_statistics(elapsed.as_secs_f64(), report.errors.len());

        tracing::info!(
            from = ?range.from,
            to = ?range.to,
            protocols = report.by_protocol.len(),
            incomplete = report.errors.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Statistics report built"
        );

        Ok(report)
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shutdown ledger
    pub async fn shutdown(self) -> Result<()> {
        self.handle.shutdown().await
    }

    fn validate_quantities(&self, males: u32, females: u32) -> Result<()> {
        let max = self.config.validation.max_quantity;
        if males > max || females > max {
            return Err(Error::Validation(format!(
                "Quantity exceeds maximum of {} (males {}, females {})",
                max, males, females
            )));
        }
        Ok(())
    }
}

/// Make sure the catalogue carries the three system tags
fn bootstrap_system_tags(store: &dyn LedgerStore) -> Result<()> {
    let mut set = WriteSet::new();
    for state in FulfillmentState::ALL {
        if store.get_tag(state.tag_name())?.is_none() {
            set.tags.push(system_tag(state));
        }
    }

    if !set.is_empty() {
        tracing::info!(tags = set.tags.len(), "Bootstrapping system tags");
        store.commit(set)?;
    }
    Ok(())
}

fn system_tag(state: FulfillmentState) -> Tag {
    let (color, description) = match state {
        FulfillmentState::Received => (TagColor::Sky, "Requisition received"),
        FulfillmentState::PartiallyFulfilled => (TagColor::Amber, "Requisition partially delivered"),
        FulfillmentState::Fulfilled => (TagColor::Green, "Requisition fully delivered"),
    };
    Tag {
        color,
        description: description.to_string(),
        ..Tag::new(state.tag_name())
    }
}

fn normalize_tags(tags: Vec<String>) -> Result<Vec<String>> {
    let mut normalized = Vec::with_capacity(tags.len());
    for tag in tags {
        let name = required_text("Tag name", &tag)?;
        if FulfillmentState::is_system_tag(&name) {
            return Err(Error::Validation(format!(
                "Tag {} is reserved for fulfillment state",
                name
            )));
        }
        if !normalized.contains(&name) {
            normalized.push(name);
        }
    }
    Ok(normalized)
}

fn required_text(field: &str, value: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::Validation(format!("{} is empty", field)));
    }
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use std::collections::BTreeSet;

    struct TestLedger {
        ledger: Ledger,
        store: Arc<MemoryStore>,
        project: Project,
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    async fn setup_ledger(ledger: Ledger) -> (Ledger, Project) {
        let institute = ledger
            .register_institute("Instituto de Biologia", Some("IB"))
            .await
            .unwrap();
        let department = ledger
            .register_department(institute.id, "Genetics")
            .await
            .unwrap();
        let advisor = ledger
            .register_profile(NewProfile {
                name: "Dr. Silva".into(),
                is_advisor: true,
                institute_id: Some(institute.id),
                department_id: Some(department.id),
                phone: None,
            })
            .await
            .unwrap();
        let author = ledger
            .register_profile(NewProfile {
                name: "Ana".into(),
                ..NewProfile::default()
            })
            .await
            .unwrap();
        let project = ledger
            .create_project(NewProject {
                title: "Colony growth".into(),
                description: String::new(),
                ceua_protocol: "CEUA-7".into(),
                author: author.id,
                advisor: advisor.id,
            })
            .await
            .unwrap();
        (ledger, project)
    }

    async fn create_test_ledger_with(config: Config) -> TestLedger {
        let store = Arc::new(MemoryStore::new());
        let ledger = Ledger::with_store(config, store.clone()).await.unwrap();
        let (ledger, project) = setup_ledger(ledger).await;
        TestLedger {
            ledger,
            store,
            project,
        }
    }

    async fn create_test_ledger() -> TestLedger {
        create_test_ledger_with(Config::default()).await
    }

    impl TestLedger {
        async fn requisition(&self, males: u32, females: u32) -> Requisition {
            self.ledger
                .create_requisition(NewRequisition::new(self.project.id, day(1), males, females))
                .await
                .unwrap()
        }

        async fn deliver(&self, requisition: &Requisition, males: u32, females: u32) -> DeliveryReceipt {
            self.ledger
                .create_delivery(NewDelivery::new(requisition.id, males, females).on(day(5)))
                .await
                .unwrap()
        }

        fn tags(&self, requisition: &Requisition) -> BTreeSet<String> {
            self.ledger.get_requisition(requisition.id).unwrap().tags
        }

        fn codes(&self, requisition: &Requisition) -> Vec<StatusCode> {
            self.ledger
                .status_history(requisition.id)
                .unwrap()
                .iter()
                .map(|e| e.status)
                .collect()
        }
    }

    fn tag_set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn test_system_tags_bootstrapped() {
        let t = create_test_ledger().await;
        let names: Vec<_> = t.ledger.tags().unwrap().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["Fulfilled", "PartiallyFulfilled", "Received"]);

        // Reopening over the same store leaves the catalogue alone
        let again = Ledger::with_store(Config::default(), t.store.clone()).await.unwrap();
        assert_eq!(again.tags().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_full_delivery_concludes() {
        let t = create_test_ledger().await;
        let requisition = t.requisition(10, 5).await;
        assert_eq!(t.codes(&requisition), vec![StatusCode::Received]);

        let receipt = t.deliver(&requisition, 10, 5).await;
        assert_eq!(receipt.reconciliation.state, FulfillmentState::Fulfilled);
        assert_eq!(receipt.reconciliation.status_appended, Some(StatusCode::Concluded));

        assert_eq!(t.tags(&requisition), tag_set(&["Fulfilled"]));
        assert_eq!(t.codes(&requisition), vec![StatusCode::Received, StatusCode::Concluded]);
    }

    #[tokio::test]
    async fn test_both_short_is_partial() {
        let t = create_test_ledger().await;
        let requisition = t.requisition(10, 5).await;

        t.deliver(&requisition, 3, 2).await;

        assert_eq!(t.tags(&requisition), tag_set(&["PartiallyFulfilled"]));
        assert_eq!(
            t.codes(&requisition),
            vec![StatusCode::Received, StatusCode::PartiallyConcluded]
        );
    }

    #[tokio::test]
    async fn test_one_sex_met_stays_received() {
        let t = create_test_ledger().await;
        let requisition = t.requisition(10, 5).await;

        let receipt = t.deliver(&requisition, 10, 0).await;

        assert_eq!(receipt.reconciliation.state, FulfillmentState::Received);
        assert_eq!(receipt.reconciliation.status_appended, None);
        assert!(!receipt.reconciliation.tags_changed);
        assert_eq!(t.tags(&requisition), tag_set(&["Received"]));
        assert_eq!(t.codes(&requisition), vec![StatusCode::Received]);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let t = create_test_ledger().await;
        let requisition = t.requisition(10, 5).await;
        t.deliver(&requisition, 3, 2).await;

        let tags_before = t.tags(&requisition);
        let codes_before = t.codes(&requisition);

        for _ in 0..2 {
            let outcome = t.ledger.reconcile(requisition.id).await.unwrap();
            assert!(!outcome.tags_changed);
            assert_eq!(outcome.status_appended, None);
        }

        assert_eq!(t.tags(&requisition), tags_before);
        assert_eq!(t.codes(&requisition), codes_before);
    }

    #[tokio::test]
    async fn test_converges_to_fulfilled() {
        let t = create_test_ledger().await;
        let requisition = t.requisition(10, 5).await;

        t.deliver(&requisition, 3, 2).await;
        t.deliver(&requisition, 4, 1).await;
        t.deliver(&requisition, 3, 2).await;

        assert_eq!(t.tags(&requisition), tag_set(&["Fulfilled"]));
        assert_eq!(
            t.codes(&requisition),
            vec![
                StatusCode::Received,
                StatusCode::PartiallyConcluded,
                StatusCode::Concluded
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_delivery_reconciles() {
        let t = create_test_ledger().await;
        let requisition = t.requisition(10, 5).await;
        let receipt = t.deliver(&requisition, 10, 5).await;

        let outcome = t.ledger.delete_delivery(receipt.delivery.id).await.unwrap();
        assert_eq!(outcome.state, FulfillmentState::PartiallyFulfilled);
        assert!(!t.ledger.get_delivery(receipt.delivery.id).unwrap().active);
        assert_eq!(t.tags(&requisition), tag_set(&["PartiallyFulfilled"]));

        // Deleting twice changes nothing further
        let outcome = t.ledger.delete_delivery(receipt.delivery.id).await.unwrap();
        assert_eq!(outcome.status_appended, None);
        assert_eq!(t.codes(&requisition).len(), 3);
    }

    #[tokio::test]
    async fn test_update_delivery_reconciles() {
        let t = create_test_ledger().await;
        let requisition = t.requisition(10, 5).await;
        let receipt = t.deliver(&requisition, 10, 5).await;

        let update = DeliveryUpdate {
            females: Some(0),
            ..DeliveryUpdate::default()
        };
        let updated = t
            .ledger
            .update_delivery(receipt.delivery.id, update)
            .await
            .unwrap();

        assert_eq!(updated.delivery.males, 10);
        assert_eq!(updated.delivery.females, 0);
        assert_eq!(updated.reconciliation.state, FulfillmentState::Received);
        assert_eq!(
            t.codes(&requisition),
            vec![StatusCode::Received, StatusCode::Concluded, StatusCode::Received]
        );

        t.ledger.delete_delivery(receipt.delivery.id).await.unwrap();
        let err = t
            .ledger
            .update_delivery(receipt.delivery.id, DeliveryUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_user_tags_survive_reconciliation() {
        let t = create_test_ledger().await;
        let mut request = NewRequisition::new(t.project.id, day(1), 2, 2);
        request.tags = vec!["Mice".into(), " Urgent ".into(), "Mice".into()];
        let requisition = t.ledger.create_requisition(request).await.unwrap();
        assert_eq!(t.tags(&requisition), tag_set(&["Mice", "Received", "Urgent"]));

        t.deliver(&requisition, 2, 2).await;
        assert_eq!(t.tags(&requisition), tag_set(&["Fulfilled", "Mice", "Urgent"]));
        assert_eq!(t.ledger.tags().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_catalogue_tag_slugs_unique() {
        let t = create_test_ledger().await;
        let mut request = NewRequisition::new(t.project.id, day(1), 1, 1);
        request.tags = vec!["Immunology trial A".into(), "Immunology trial B".into()];
        t.ledger.create_requisition(request).await.unwrap();

        let mut request = NewRequisition::new(t.project.id, day(2), 1, 1);
        request.tags = vec!["Immunology trial C".into()];
        t.ledger.create_requisition(request).await.unwrap();

        let slugs: BTreeSet<String> = t.ledger.tags().unwrap().into_iter().map(|t| t.slug).collect();
        assert_eq!(slugs.len(), 6);
        assert!(slugs.contains("immunology-trial"));
        assert!(slugs.contains("immunology-tri-2"));
        assert!(slugs.contains("immunology-tri-3"));
    }

    #[tokio::test]
    async fn test_hold_blocks_delivery() {
        let t = create_test_ledger().await;
        let requisition = t.requisition(10, 5).await;

        t.ledger
            .record_status(requisition.id, StatusCode::Suspended, "Colony quarantined", None)
            .await
            .unwrap();

        let err = t
            .ledger
            .create_delivery(NewDelivery::new(requisition.id, 10, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(err.is_retryable());
        assert_eq!(t.ledger.metrics().conflicts_total.get(), 1);

        // Nothing written: only the placeholder exists
        assert_eq!(t.ledger.deliveries(requisition.id).unwrap().len(), 1);
        assert_eq!(t.tags(&requisition), tag_set(&["Received"]));

        // Resuming with a manual RE lifts the hold
        t.ledger
            .record_status(requisition.id, StatusCode::Received, "Quarantine lifted", None)
            .await
            .unwrap();
        let receipt = t.deliver(&requisition, 10, 5).await;
        assert_eq!(receipt.reconciliation.status_appended, Some(StatusCode::Concluded));
    }

    #[tokio::test]
    async fn test_duplicate_manual_status_rejected() {
        let t = create_test_ledger().await;
        let requisition = t.requisition(1, 1).await;

        let err = t
            .ledger
            .record_status(requisition.id, StatusCode::Received, "again", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = t
            .ledger
            .record_status(requisition.id, StatusCode::Cancelled, "  ", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_store_outage_applies_nothing() {
        let t = create_test_ledger().await;
        let requisition = t.requisition(10, 5).await;

        t.store.set_unavailable(true);
        let err = t
            .ledger
            .create_delivery(NewDelivery::new(requisition.id, 10, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert!(err.is_retryable());
        t.store.set_unavailable(false);

        assert_eq!(t.ledger.deliveries(requisition.id).unwrap().len(), 1);
        assert_eq!(t.codes(&requisition), vec![StatusCode::Received]);

        // Retrying once the store is back applies it exactly once
        t.deliver(&requisition, 10, 5).await;
        assert_eq!(t.codes(&requisition), vec![StatusCode::Received, StatusCode::Concluded]);
    }

    #[tokio::test]
    async fn test_failed_commit_rolls_back_reconciliation() {
        let t = create_test_ledger().await;
        let requisition = t.requisition(10, 5).await;
        let first = t.deliver(&requisition, 3, 2).await;

        let deliveries_before = t.ledger.deliveries(requisition.id).unwrap();
        let tags_before = t.tags(&requisition);
        let codes_before = t.codes(&requisition);

        t.store.set_commit_failure(true);

        let err = t
            .ledger
            .create_delivery(NewDelivery::new(requisition.id, 7, 3).on(day(6)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));

        let err = t.ledger.delete_delivery(first.delivery.id).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));

        let update = DeliveryUpdate {
            males: Some(10),
            females: Some(5),
            ..DeliveryUpdate::default()
        };
        let err = t
            .ledger
            .update_delivery(first.delivery.id, update)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));

        t.store.set_commit_failure(false);

        assert_eq!(t.ledger.deliveries(requisition.id).unwrap(), deliveries_before);
        assert_eq!(t.tags(&requisition), tags_before);
        assert_eq!(t.codes(&requisition), codes_before);
        assert!(t.ledger.get_delivery(first.delivery.id).unwrap().active);

        // The same write goes through once commits succeed again
        t.ledger
            .create_delivery(NewDelivery::new(requisition.id, 7, 3).on(day(6)))
            .await
            .unwrap();
        assert_eq!(t.tags(&requisition), tag_set(&["Fulfilled"]));
        assert_eq!(
            t.codes(&requisition),
            vec![
                StatusCode::Received,
                StatusCode::PartiallyConcluded,
                StatusCode::Concluded
            ]
        );
    }

    #[tokio::test]
    async fn test_validation_before_write() {
        let mut config = Config::default();
        config.validation.max_quantity = 100;
        let t = create_test_ledger_with(config).await;

        let err = t
            .ledger
            .create_requisition(NewRequisition::new(t.project.id, day(1), 101, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let mut request = NewRequisition::new(t.project.id, day(1), 1, 1);
        request.tags = vec!["Fulfilled".into()];
        let err = t.ledger.create_requisition(request).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = t
            .ledger
            .create_delivery(NewDelivery::new(Uuid::now_v7(), 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RequisitionNotFound(_)));

        let err = t
            .ledger
            .create_requisition(NewRequisition::new(Uuid::now_v7(), day(1), 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProjectNotFound(_)));

        assert!(t.ledger.find_requisition("not-a-protocol").is_err());
        assert_eq!(t.ledger.metrics().requisitions_total.get(), 0);
    }

    #[tokio::test]
    async fn test_find_requisition_by_protocol() {
        let t = create_test_ledger().await;
        let requisition = t.requisition(1, 1).await;

        let found = t
            .ledger
            .find_requisition(requisition.protocol.as_str())
            .unwrap();
        assert_eq!(found.map(|r| r.id), Some(requisition.id));
        assert!(t.ledger.find_requisition("00000.1999").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_statistics_counts_required_once() {
        let t = create_test_ledger().await;
        let requisition = t.requisition(10, 5).await;
        t.deliver(&requisition, 4, 1).await;
        t.deliver(&requisition, 6, 2).await;

        let report = t.ledger.get_statistics(None, None).await.unwrap();
        assert_eq!(report.by_total.required_males, 10);
        assert_eq!(report.by_total.required_females, 5);
        assert_eq!(report.by_total.delivered_males, 10);
        assert_eq!(report.by_total.delivered_females, 3);

        assert_eq!(report.by_department["Genetics (IB)"], report.by_total);
        assert_eq!(report.by_advisor["Dr. Silva"], report.by_total);
        assert_eq!(report.by_author["Ana"], report.by_total);
        assert_eq!(report.by_institute["IB"], report.by_total);
        assert_eq!(report.by_project["Colony growth"], report.by_total);
        // (10, 3) meets males only, so the requisition is back to Received
        assert_eq!(report.by_tags["Received"], report.by_total);
        assert!(report.errors.is_empty());
        assert_eq!(t.ledger.metrics().statistics_duration.get_sample_count(), 1);
    }

    #[tokio::test]
    async fn test_statistics_date_window() {
        let t = create_test_ledger().await;
        let requisition = t.requisition(10, 5).await;
        t.deliver(&requisition, 4, 1).await;

        let report = t
            .ledger
            .get_statistics(Some(day(6)), Some(day(30)))
            .await
            .unwrap();
        assert_eq!(report.by_total.delivered_males, 0);
        assert!(report.by_protocol.is_empty());

        let err = t
            .ledger
            .get_statistics(Some(day(30)), Some(day(6)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_rocksdb_backed_ledger() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();

        let ledger = Ledger::open(config).await.unwrap();
        let (ledger, project) = setup_ledger(ledger).await;

        let requisition = ledger
            .create_requisition(NewRequisition::new(project.id, day(1), 10, 5))
            .await
            .unwrap();
        ledger
            .create_delivery(NewDelivery::new(requisition.id, 10, 5).on(day(2)))
            .await
            .unwrap();

        let stored = ledger.get_requisition(requisition.id).unwrap();
        assert_eq!(stored.tags, tag_set(&["Fulfilled"]));
        assert_eq!(ledger.status_history(requisition.id).unwrap().len(), 2);

        let report = ledger.get_statistics(None, None).await.unwrap();
        assert_eq!(report.by_total.required_males, 10);
        assert_eq!(report.by_total.delivered_females, 5);

        ledger.shutdown().await.unwrap();
    }
}
