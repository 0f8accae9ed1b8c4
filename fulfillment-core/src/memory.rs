//! In-process ledger store
//!
//! Holds everything behind one `RwLock`, so a commit is applied under a
//! single write guard and readers never observe half a write set. The
//! outage switch makes every call fail the way an unreachable database
//! would; the commit fault fails only `commit`, after reads succeeded.

use crate::{
    error::{Error, Result},
    storage::{sort_deliveries, LedgerSnapshot, LedgerStore, WriteSet},
    types::{
        Delivery, Department, Institute, Profile, Project, Protocol, Requisition, StatusEvent,
        Tag,
    },
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

#[derive(Debug, Default)]
struct State {
    requisitions: HashMap<Uuid, Requisition>,
    protocols: HashMap<Protocol, Uuid>,
    deliveries: HashMap<Uuid, Delivery>,
    status: HashMap<Uuid, BTreeMap<u64, StatusEvent>>,
    tags: BTreeMap<String, Tag>,
    projects: HashMap<Uuid, Project>,
    slugs: HashMap<String, Uuid>,
    profiles: HashMap<Uuid, Profile>,
    institutes: HashMap<Uuid, Institute>,
    departments: HashMap<Uuid, Department>,
}

/// Ledger store kept in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    unavailable: AtomicBool,
    failing_commits: AtomicBool,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while set, every call fails with a storage error
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// While set, reads succeed and every `commit` fails with a storage error
    pub fn set_commit_failure(&self, failing: bool) {
        self.failing_commits.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Storage("memory store unavailable".to_string()));
        }
        Ok(())
    }
}

impl LedgerStore for MemoryStore {
    fn get_requisition(&self, id: Uuid) -> Result<Requisition> {
        self.check_available()?;
        self.state
            .read()
            .requisitions
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::RequisitionNotFound(id.to_string()))
    }

    fn find_requisition(&self, protocol: &Protocol) -> Result<Option<Requisition>> {
        self.check_available()?;
        let state = self.state.read();
        Ok(state
            .protocols
            .get(protocol)
            .and_then(|id| state.requisitions.get(id))
            .cloned())
    }

    fn get_delivery(&self, id: Uuid) -> Result<Delivery> {
        self.check_available()?;
        self.state
            .read()
            .deliveries
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::DeliveryNotFound(id.to_string()))
    }

    fn requisition_deliveries(&self, requisition_id: Uuid) -> Result<Vec<Delivery>> {
        self.check_available()?;
        let mut deliveries: Vec<Delivery> = self
            .state
            .read()
            .deliveries
            .values()
            .filter(|d| d.requisition_id == requisition_id)
            .cloned()
            .collect();
        sort_deliveries(&mut deliveries);
        Ok(deliveries)
    }

    fn status_history(&self, requisition_id: Uuid) -> Result<Vec<StatusEvent>> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .status
            .get(&requisition_id)
            .map(|events| events.values().cloned().collect())
            .unwrap_or_default())
    }

    fn get_tag(&self, name: &str) -> Result<Option<Tag>> {
        self.check_available()?;
        Ok(self.state.read().tags.get(name).cloned())
    }

    fn list_tags(&self) -> Result<Vec<Tag>> {
        self.check_available()?;
        Ok(self.state.read().tags.values().cloned().collect())
    }

    fn get_project(&self, id: Uuid) -> Result<Project> {
        self.check_available()?;
        self.state
            .read()
            .projects
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::ProjectNotFound(id.to_string()))
    }

    fn find_project_by_slug(&self, slug: &str) -> Result<Option<Project>> {
        self.check_available()?;
        let state = self.state.read();
        Ok(state
            .slugs
            .get(slug)
            .and_then(|id| state.projects.get(id))
            .cloned())
    }

    fn get_profile(&self, id: Uuid) -> Result<Profile> {
        self.check_available()?;
        self.state
            .read()
            .profiles
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::ProfileNotFound(id.to_string()))
    }

    fn get_institute(&self, id: Uuid) -> Result<Institute> {
        self.check_available()?;
        self.state
            .read()
            .institutes
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::InstituteNotFound(id.to_string()))
    }

    fn get_department(&self, id: Uuid) -> Result<Department> {
        self.check_available()?;
        self.state
            .read()
            .departments
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::DepartmentNotFound(id.to_string()))
    }

    fn snapshot(&self) -> Result<LedgerSnapshot> {
        self.check_available()?;
        let state = self.state.read();

        let mut deliveries: Vec<Delivery> = state.deliveries.values().cloned().collect();
        sort_deliveries(&mut deliveries);

        Ok(LedgerSnapshot {
            requisitions: state.requisitions.clone(),
            deliveries,
            projects: state.projects.clone(),
            profiles: state.profiles.clone(),
            institutes: state.institutes.clone(),
            departments: state.departments.clone(),
        })
    }

    fn commit(&self, set: WriteSet) -> Result<()> {
        self.check_available()?;
        if self.failing_commits.load(Ordering::SeqCst) {
            return Err(Error::Storage("memory store commit failed".to_string()));
        }
        let mut state = self.state.write();

        for requisition in set.requisitions {
            state.protocols.insert(requisition.protocol.clone(), requisition.id);
            state.requisitions.insert(requisition.id, requisition);
        }
        for delivery in set.deliveries {
            state.deliveries.insert(delivery.id, delivery);
        }
        for event in set.status_events {
            state
                .status
                .entry(event.requisition_id)
                .or_default()
                .insert(event.sequence, event);
        }
        for tag in set.tags {
            state.tags.insert(tag.name.clone(), tag);
        }
        for institute in set.institutes {
            state.institutes.insert(institute.id, institute);
        }
        for department in set.departments {
            state.departments.insert(department.id, department);
        }
        for profile in set.profiles {
            state.profiles.insert(profile.id, profile);
        }
        for project in set.projects {
            state.slugs.insert(project.slug.clone(), project.id);
            state.projects.insert(project.id, project);
        }

        Ok(())
    }
}
