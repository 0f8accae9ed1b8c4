//! Single-writer actor for the fulfillment ledger
//!
//! Every mutation is a message to one Tokio task that owns the write
//! path:
//! - Writes to the same requisition are serialized, so two reconciliations
//!   can never both append an event for one transition
//! - Each operation reads, plans and commits one [`WriteSet`]
//! - Bounded mailbox gives callers backpressure
//!
//! Reads do not pass through the actor; they go straight to the store.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                 Ledger (public API)                   │
//! │          validates input, then sends message          │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       │ mpsc::channel (bounded)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │              LedgerActor (Single Task)                │
//! │  ┌────────────────────────────────────────────────┐  │
//! │  │ read requisition, deliveries, history          │  │
//! │  │ plan delivery write + reconciliation           │  │
//! │  └────────────────────────────────────────────────┘  │
//! │                       │                               │
//! │                       ▼                               │
//! │             LedgerStore::commit()                     │
//! │           (one atomic write set)                      │
//! └───────────────────────────────────────────────────────┘
//! ```

use crate::{
    ledger::{DeliveryReceipt, DeliveryUpdate, NewDelivery, NewProject, NewRequisition},
    metrics::Metrics,
    reconciler::{self, ReconcileOutcome},
    storage::{LedgerStore, WriteSet},
    types::{
        Delivery, Department, Institute, Profile, Project, Protocol, Requisition, StatusCode,
        StatusEvent, Tag,
    },
    classifier::FulfillmentState,
    Error, Result,
};
use chrono::{DateTime, Datelike, Utc};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Attempts at drawing an unused protocol or project slug
const MAX_IDENTIFIER_ATTEMPTS: usize = 64;

/// Message sent to the ledger actor
#[derive(Debug)]
pub enum LedgerMessage {
    /// Create a requisition with its placeholder delivery and first event
    CreateRequisition {
        request: NewRequisition,
        response: oneshot::Sender<Result<Requisition>>,
    },

    /// Record a delivery and reconcile its requisition
    CreateDelivery {
        request: NewDelivery,
        response: oneshot::Sender<Result<DeliveryReceipt>>,
    },

    /// Change an active delivery and reconcile its requisition
    UpdateDelivery {
        delivery_id: Uuid,
        update: DeliveryUpdate,
        response: oneshot::Sender<Result<DeliveryReceipt>>,
    },

    /// Soft-delete a delivery and reconcile its requisition
    DeleteDelivery {
        delivery_id: Uuid,
        response: oneshot::Sender<Result<ReconcileOutcome>>,
    },

    /// Reconcile without a delivery write
    Reconcile {
        requisition_id: Uuid,
        response: oneshot::Sender<Result<ReconcileOutcome>>,
    },

    /// Append a manual status event
    RecordStatus {
        requisition_id: Uuid,
        status: StatusCode,
        message: String,
        author: Option<Uuid>,
        response: oneshot::Sender<Result<StatusEvent>>,
    },

    /// Register institute
    RegisterInstitute {
        institute: Institute,
        response: oneshot::Sender<Result<Institute>>,
    },

    /// Register department
    RegisterDepartment {
        department: Department,
        response: oneshot::Sender<Result<Department>>,
    },

    /// Register profile
    RegisterProfile {
        profile: Profile,
        response: oneshot::Sender<Result<Profile>>,
    },

    /// Create project
    CreateProject {
        request: NewProject,
        response: oneshot::Sender<Result<Project>>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Actor that processes ledger writes
pub struct LedgerActor {
    /// Storage backend
    store: Arc<dyn LedgerStore>,

    /// Mailbox for incoming messages
    mailbox: mpsc::Receiver<LedgerMessage>,

    /// Metrics
    metrics: Metrics,
}

impl LedgerActor {
    /// Create new actor
    pub fn new(
        store: Arc<dyn LedgerStore>,
        mailbox: mpsc::Receiver<LedgerMessage>,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            mailbox,
            metrics,
        }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                LedgerMessage::Shutdown => break,
                msg => self.handle_message(msg),
            }
        }

        tracing::info!("Ledger writer stopped");
    }

    /// Handle a single message
    fn handle_message(&mut self, msg: LedgerMessage) {
        match msg {
            LedgerMessage::CreateRequisition { request, response } => {
                let _ = response.send(self.create_requisition(request));
            }

            LedgerMessage::CreateDelivery { request, response } => {
                let _ = response.send(self.create_delivery(request));
            }

            LedgerMessage::UpdateDelivery {
                delivery_id,
                update,
                response,
            } => {
                let _ = response.send(self.update_delivery(delivery_id, update));
            }

            LedgerMessage::DeleteDelivery {
                delivery_id,
                response,
            } => {
                let _ = response.send(self.delete_delivery(delivery_id));
            }

            LedgerMessage::Reconcile {
                requisition_id,
                response,
            } => {
                let _ = response.send(self.reconcile(requisition_id));
            }

            LedgerMessage::RecordStatus {
                requisition_id,
                status,
                message,
                author,
                response,
            } => {
                let _ = response.send(self.record_status(requisition_id, status, message, author));
            }

            LedgerMessage::RegisterInstitute {
                institute,
                response,
            } => {
                let _ = response.send(self.register_institute(institute));
            }

            LedgerMessage::RegisterDepartment {
                department,
                response,
            } => {
                let _ = response.send(self.register_department(department));
            }

            LedgerMessage::RegisterProfile { profile, response } => {
                let _ = response.send(self.register_profile(profile));
            }

            LedgerMessage::CreateProject { request, response } => {
                let _ = response.send(self.create_project(request));
            }

            LedgerMessage::Shutdown => {
                // Handled in main loop
            }
        }
    }

    fn create_requisition(&self, request: NewRequisition) -> Result<Requisition> {
        let project = self.store.get_project(request.project_id)?;
        let now = Utc::now();

        let protocol = match request.protocol {
            Some(protocol) => {
                if self.store.find_requisition(&protocol)?.is_some() {
                    return Err(Error::Validation(format!(
                        "Protocol {} already in use",
                        protocol
                    )));
                }
                protocol
            }
            None => self.unused_protocol(now.year())?,
        };

        let tags: BTreeSet<String> = request
            .tags
            .into_iter()
            .chain(std::iter::once(
                FulfillmentState::Received.tag_name().to_string(),
            ))
            .collect();

        let mut set = WriteSet::new();
        let mut missing = Vec::new();
        for name in &tags {
            if self.store.get_tag(name)?.is_none() {
                missing.push(name);
            }
        }
        if !missing.is_empty() {
            let mut taken: HashSet<String> = self
                .store
                .list_tags()?
                .into_iter()
                .map(|tag| tag.slug)
                .collect();
            for name in missing {
                let tag = Tag::with_unique_slug(name.clone(), &taken);
                taken.insert(tag.slug.clone());
                set.tags.push(tag);
            }
        }

        let requisition = Requisition {
            id: Uuid::now_v7(),
            protocol,
            date: request.date,
            created_at: now,
            last_updated: now,
            required_males: request.required_males,
            required_females: request.required_females,
            tags,
            project_id: project.id,
            author: Some(project.author),
            author_notes: request.author_notes,
        };

        set.deliveries.push(Delivery::placeholder(requisition.id, now));
        set.status_events.push(StatusEvent {
            id: Uuid::now_v7(),
            requisition_id: requisition.id,
            sequence: 0,
            status: StatusCode::Received,
            message: "Requisition received.".to_string(),
            timestamp: now,
            author: requisition.author,
        });
        set.requisitions.push(requisition.clone());

        self.store.commit(set)?;
        self.metrics.record_requisition();

        tracing::info!(
            protocol = %requisition.protocol,
            project = %project.slug,
            required_males = requisition.required_males,
            required_females = requisition.required_females,
            "Requisition created"
        );

        Ok(requisition)
    }

    fn create_delivery(&self, request: NewDelivery) -> Result<DeliveryReceipt> {
        let requisition = self.store.get_requisition(request.requisition_id)?;
        if let Some(author) = request.author {
            self.store.get_profile(author)?;
        }

        let now = Utc::now();
        let delivery = Delivery {
            id: Uuid::now_v7(),
            requisition_id: requisition.id,
            date: request.date.unwrap_or_else(|| now.date_naive()),
            timestamp: now,
            author: request.author,
            males: request.males,
            females: request.females,
            notes: request.notes,
            active: true,
        };

        self.write_delivery(&requisition, delivery, now)
    }

    fn update_delivery(&self, delivery_id: Uuid, update: DeliveryUpdate) -> Result<DeliveryReceipt> {
        let existing = self.store.get_delivery(delivery_id)?;
        if !existing.active {
            return Err(Error::Validation(format!(
                "Delivery {} is deleted",
                delivery_id
            )));
        }
        let requisition = self.store.get_requisition(existing.requisition_id)?;

        let delivery = Delivery {
            males: update.males.unwrap_or(existing.males),
            females: update.females.unwrap_or(existing.females),
            date: update.date.unwrap_or(existing.date),
            notes: update.notes.unwrap_or_else(|| existing.notes.clone()),
            ..existing
        };

        self.write_delivery(&requisition, delivery, Utc::now())
    }

    fn delete_delivery(&self, delivery_id: Uuid) -> Result<ReconcileOutcome> {
        let existing = self.store.get_delivery(delivery_id)?;
        let requisition = self.store.get_requisition(existing.requisition_id)?;

        let delivery = Delivery {
            active: false,
            ..existing
        };

        self.write_delivery(&requisition, delivery, Utc::now())
            .map(|receipt| receipt.reconciliation)
    }

    fn reconcile(&self, requisition_id: Uuid) -> Result<ReconcileOutcome> {
        let requisition = self.store.get_requisition(requisition_id)?;
        let now = Utc::now();

        let mut set = WriteSet::new();
        let outcome = self.stage_reconciliation(&requisition, None, now, &mut set)?;

        if !set.is_empty() {
            self.store.commit(set)?;
        }
        self.metrics
            .record_reconciliation(outcome.status_appended.is_some());

        Ok(outcome)
    }

    /// Commit a delivery write together with its reconciliation
    fn write_delivery(
        &self,
        requisition: &Requisition,
        delivery: Delivery,
        now: DateTime<Utc>,
    ) -> Result<DeliveryReceipt> {
        let mut set = WriteSet::new();
        let reconciliation = self.stage_reconciliation(requisition, Some(&delivery), now, &mut set)?;
        set.deliveries.push(delivery.clone());

        self.store.commit(set)?;
        self.metrics.record_delivery();
        self.metrics
            .record_reconciliation(reconciliation.status_appended.is_some());

        tracing::info!(
            protocol = %requisition.protocol,
            delivery_id = %delivery.id,
            males = delivery.males,
            females = delivery.females,
            active = delivery.active,
            state = %reconciliation.state,
            "Delivery recorded"
        );

        Ok(DeliveryReceipt {
            delivery,
            reconciliation,
        })
    }

    /// Plan reconciliation as if `pending` were already written
    fn stage_reconciliation(
        &self,
        requisition: &Requisition,
        pending: Option<&Delivery>,
        now: DateTime<Utc>,
        set: &mut WriteSet,
    ) -> Result<ReconcileOutcome> {
        let mut deliveries = self.store.requisition_deliveries(requisition.id)?;
        if let Some(pending) = pending {
            deliveries.retain(|d| d.id != pending.id);
            deliveries.push(pending.clone());
        }
        let history = self.store.status_history(requisition.id)?;

        let plan = match reconciler::reconcile(requisition, &deliveries, &history, now) {
            Ok(plan) => plan,
            Err(e) => {
                if matches!(e, Error::Conflict(_)) {
                    self.metrics.record_conflict();
                }
                return Err(e);
            }
        };

        Ok(plan.stage(set))
    }

    fn record_status(
        &self,
        requisition_id: Uuid,
        status: StatusCode,
        message: String,
        author: Option<Uuid>,
    ) -> Result<StatusEvent> {
        let requisition = self.store.get_requisition(requisition_id)?;
        if let Some(author) = author {
            self.store.get_profile(author)?;
        }

        let history = self.store.status_history(requisition_id)?;
        if let Some(latest) = history.last() {
            if latest.status == status {
                return Err(Error::Validation(format!(
                    "Requisition {} is already {}",
                    requisition.protocol,
                    status.label()
                )));
            }
        }

        let now = Utc::now();
        let event = StatusEvent {
            id: Uuid::now_v7(),
            requisition_id,
            sequence: history.last().map(|e| e.sequence + 1).unwrap_or(0),
            status,
            message,
            timestamp: now,
            author,
        };

        let mut set = WriteSet::new();
        set.status_events.push(event.clone());
        set.requisitions.push(Requisition {
            last_updated: now,
            ..requisition.clone()
        });
        self.store.commit(set)?;

        tracing::info!(
            protocol = %requisition.protocol,
            status = %status,
            "Manual status recorded"
        );

        Ok(event)
    }

    fn register_institute(&self, institute: Institute) -> Result<Institute> {
        let mut set = WriteSet::new();
        set.institutes.push(institute.clone());
        self.store.commit(set)?;

        tracing::info!(abbreviation = %institute.abbreviation, "Institute registered");
        Ok(institute)
    }

    fn register_department(&self, department: Department) -> Result<Department> {
        let institute = self.store.get_institute(department.institute_id)?;

        let mut set = WriteSet::new();
        set.departments.push(department.clone());
        self.store.commit(set)?;

        tracing::info!(
            department = %department.name,
            institute = %institute.abbreviation,
            "Department registered"
        );
        Ok(department)
    }

    fn register_profile(&self, profile: Profile) -> Result<Profile> {
        if let Some(institute_id) = profile.institute_id {
            self.store.get_institute(institute_id)?;
        }
        if let Some(department_id) = profile.department_id {
            let department = self.store.get_department(department_id)?;
            if profile.institute_id != Some(department.institute_id) {
                return Err(Error::Validation(format!(
                    "Department {} does not belong to the profile's institute",
                    department.name
                )));
            }
        }

        let mut set = WriteSet::new();
        set.profiles.push(profile.clone());
        self.store.commit(set)?;

        tracing::info!(profile_id = %profile.id, advisor = profile.is_advisor, "Profile registered");
        Ok(profile)
    }

    fn create_project(&self, request: NewProject) -> Result<Project> {
        self.store.get_profile(request.author)?;
        let advisor = self.store.get_profile(request.advisor)?;
        if !advisor.is_advisor {
            return Err(Error::Validation(format!(
                "Profile {} is not an advisor",
                advisor.name
            )));
        }

        let slug = self.unused_slug(&request.title)?;
        let project = Project {
            id: Uuid::now_v7(),
            title: request.title,
            description: request.description,
            ceua_protocol: request.ceua_protocol,
            slug,
            author: request.author,
            advisor: request.advisor,
        };

        let mut set = WriteSet::new();
        set.projects.push(project.clone());
        self.store.commit(set)?;

        tracing::info!(slug = %project.slug, "Project created");
        Ok(project)
    }

    fn unused_protocol(&self, year: i32) -> Result<Protocol> {
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_IDENTIFIER_ATTEMPTS {
            let protocol = Protocol::generate(&mut rng, year);
            if self.store.find_requisition(&protocol)?.is_none() {
                return Ok(protocol);
            }
        }
        Err(Error::Conflict(format!(
            "No unused protocol found for {} after {} attempts",
            year, MAX_IDENTIFIER_ATTEMPTS
        )))
    }

    fn unused_slug(&self, title: &str) -> Result<String> {
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_IDENTIFIER_ATTEMPTS {
            let slug = Project::generate_slug(&mut rng, title);
            if self.store.find_project_by_slug(&slug)?.is_none() {
                return Ok(slug);
            }
        }
        Err(Error::Conflict(format!(
            "No unused slug found for {:?} after {} attempts",
            title, MAX_IDENTIFIER_ATTEMPTS
        )))
    }
}

/// Handle for sending messages to the actor
#[derive(Clone, Debug)]
pub struct LedgerHandle {
    sender: mpsc::Sender<LedgerMessage>,
}

impl LedgerHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<LedgerMessage>) -> Self {
        Self { sender }
    }

    async fn request<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<Result<T>>) -> LedgerMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(message(tx))
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Create requisition
    pub async fn create_requisition(&self, request: NewRequisition) -> Result<Requisition> {
        self.request(|response| LedgerMessage::CreateRequisition { request, response })
            .await
    }

    /// Create delivery
    pub async fn create_delivery(&self, request: NewDelivery) -> Result<DeliveryReceipt> {
        self.request(|response| LedgerMessage::CreateDelivery { request, response })
            .await
    }

    /// Update delivery
    pub async fn update_delivery(
        &self,
        delivery_id: Uuid,
        update: DeliveryUpdate,
    ) -> Result<DeliveryReceipt> {
        self.request(|response| LedgerMessage::UpdateDelivery {
            delivery_id,
            update,
            response,
        })
        .await
    }

    /// Delete delivery
    pub async fn delete_delivery(&self, delivery_id: Uuid) -> Result<ReconcileOutcome> {
        self.request(|response| LedgerMessage::DeleteDelivery {
            delivery_id,
            response,
        })
        .await
    }

    /// Reconcile requisition
    pub async fn reconcile(&self, requisition_id: Uuid) -> Result<ReconcileOutcome> {
        self.request(|response| LedgerMessage::Reconcile {
            requisition_id,
            response,
        })
        .await
    }

    /// Record manual status
    pub async fn record_status(
        &self,
        requisition_id: Uuid,
        status: StatusCode,
        message: String,
        author: Option<Uuid>,
    ) -> Result<StatusEvent> {
        self.request(|response| LedgerMessage::RecordStatus {
            requisition_id,
            status,
            message,
            author,
            response,
        })
        .await
    }

    /// Register institute
    pub async fn register_institute(&self, institute: Institute) -> Result<Institute> {
        self.request(|response| LedgerMessage::RegisterInstitute {
            institute,
            response,
        })
        .await
    }

    /// Register department
    pub async fn register_department(&self, department: Department) -> Result<Department> {
        self.request(|response| LedgerMessage::RegisterDepartment {
            department,
            response,
        })
        .await
    }

    /// Register profile
    pub async fn register_profile(&self, profile: Profile) -> Result<Profile> {
        self.request(|response| LedgerMessage::RegisterProfile { profile, response })
            .await
    }

    /// Create project
    pub async fn create_project(&self, request: NewProject) -> Result<Project> {
        self.request(|response| LedgerMessage::CreateProject { request, response })
            .await
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(LedgerMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the ledger actor
pub fn spawn_ledger_actor(
    store: Arc<dyn LedgerStore>,
    metrics: Metrics,
    mailbox_capacity: usize,
) -> LedgerHandle {
    let (tx, rx) = mpsc::channel(mailbox_capacity.max(1)); // Bounded channel for backpressure
    let actor = LedgerActor::new(store, rx, metrics);

    tokio::spawn(async move {
        actor.run().await;
    });

    LedgerHandle::new(tx)
}
