//! In-memory tenant store used by tests. Transactions work on a copy of the
//! state that replaces the shared state only on commit, and statements can be
//! made to fail at a chosen point.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{AggregateTransaction, StoreError, TenantStore};
use crate::models::{
    ChildRecord, Collection, ProjectAggregate, ProjectHeader, ProjectSummary,
};
use crate::server::connection::{ConnectionError, Connector};
use crate::server::routing::ConnectionDescriptor;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MemoryState {
    pub projects: Vec<ProjectHeader>,
    pub children: Vec<(String, ChildRecord)>,
}

impl MemoryState {
    pub fn shared() -> Arc<Mutex<MemoryState>> {
        Arc::new(Mutex::new(MemoryState::default()))
    }

    fn project_mut(&mut self, id: &str) -> Option<&mut ProjectHeader> {
        self.projects.iter_mut().find(|p| p.id == id)
    }

    fn owner_of(&self, collection: Collection, child_id: &str) -> Option<&str> {
        self.children
            .iter()
            .find(|(_, c)| c.collection() == collection && c.id() == child_id)
            .map(|(owner, _)| owner.as_str())
    }

    fn touch(&mut self, project_id: &str) {
        if let Some(header) = self.project_mut(project_id) {
            header.touch(chrono::Utc::now());
        }
    }

    pub fn aggregate(&self, id: &str) -> Option<ProjectAggregate> {
        let header = self.projects.iter().find(|p| p.id == id)?.clone();
        let mut aggregate = ProjectAggregate::new(header);
        for (owner, child) in &self.children {
            if owner != id {
                continue;
            }
            match child.clone() {
                ChildRecord::Measurement(m) => aggregate.measurements.push(m),
                ChildRecord::Photo(p) => aggregate.photos.push(p),
                ChildRecord::SafetyAction(s) => aggregate.safety_actions.push(s),
                ChildRecord::CostItem(c) => aggregate.cost_items.push(c),
            }
        }
        Some(aggregate)
    }
}

/// Where an injected failure fires during a batch write.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FailPoint {
    Header,
    Collection(Collection),
}

#[derive(Clone)]
pub struct MemoryConnector {
    state: Arc<Mutex<MemoryState>>,
    attempts: Arc<AtomicUsize>,
    open: Arc<AtomicUsize>,
    connect_delay: Option<Duration>,
    refuse: Option<String>,
    fail_point: Option<FailPoint>,
}

impl MemoryConnector {
    pub fn new(state: Arc<Mutex<MemoryState>>) -> Self {
        Self {
            state,
            attempts: Arc::new(AtomicUsize::new(0)),
            open: Arc::new(AtomicUsize::new(0)),
            connect_delay: None,
            refuse: None,
            fail_point: None,
        }
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    pub fn refusing(mut self, cause: &str) -> Self {
        self.refuse = Some(cause.to_string());
        self
    }

    pub fn failing_at(mut self, fail_point: FailPoint) -> Self {
        self.fail_point = Some(fail_point);
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Box<dyn TenantStore>, ConnectionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(cause) = &self.refuse {
            return Err(ConnectionError::Failed {
                target: descriptor.to_string(),
                cause: cause.clone(),
            });
        }

        self.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryStore {
            state: self.state.clone(),
            open: self.open.clone(),
            fail_point: self.fail_point,
        }))
    }
}

pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    open: Arc<AtomicUsize>,
    fail_point: Option<FailPoint>,
}

impl MemoryStore {
    pub fn new(state: Arc<Mutex<MemoryState>>) -> Self {
        Self {
            state,
            open: Arc::new(AtomicUsize::new(1)),
            fail_point: None,
        }
    }

    pub fn failing_at(mut self, fail_point: FailPoint) -> Self {
        self.fail_point = Some(fail_point);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TenantStore for MemoryStore {
    async fn ping(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn list_projects(&mut self) -> Result<Vec<ProjectSummary>, StoreError> {
        Ok(self.lock().projects.iter().map(ProjectHeader::summary).collect())
    }

    async fn load_aggregate(&mut self, id: &str) -> Result<Option<ProjectAggregate>, StoreError> {
        Ok(self.lock().aggregate(id))
    }

    async fn create_project(&mut self, header: &ProjectHeader) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.project_mut(&header.id).is_some() {
            return Err(StoreError::Conflict(header.id.clone()));
        }
        state.projects.push(header.clone());
        Ok(())
    }

    async fn update_project(
        &mut self,
        header: &ProjectHeader,
    ) -> Result<Option<ProjectHeader>, StoreError> {
        let mut state = self.lock();
        let Some(stored) = state.project_mut(&header.id) else {
            return Ok(None);
        };
        let created_at = stored.created_at;
        let previous = stored.updated_at;
        *stored = header.clone();
        stored.created_at = created_at;
        stored.updated_at = previous;
        stored.touch(chrono::Utc::now());
        Ok(Some(stored.clone()))
    }

    async fn delete_project(&mut self, id: &str) -> Result<bool, StoreError> {
        let mut state = self.lock();
        state.children.retain(|(owner, _)| owner != id);
        let before = state.projects.len();
        state.projects.retain(|p| p.id != id);
        Ok(state.projects.len() < before)
    }

    async fn list_children(
        &mut self,
        collection: Collection,
        project_id: &str,
    ) -> Result<Vec<ChildRecord>, StoreError> {
        Ok(self
            .lock()
            .children
            .iter()
            .filter(|(owner, c)| owner == project_id && c.collection() == collection)
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn insert_child(
        &mut self,
        project_id: &str,
        child: &ChildRecord,
    ) -> Result<Option<ChildRecord>, StoreError> {
        let mut state = self.lock();
        if state.project_mut(project_id).is_none() {
            return Ok(None);
        }
        if state.owner_of(child.collection(), child.id()).is_some() {
            return Err(StoreError::Conflict(child.id().to_string()));
        }
        state.children.push((project_id.to_string(), child.clone()));
        state.touch(project_id);
        Ok(Some(child.clone()))
    }

    async fn delete_child(
        &mut self,
        collection: Collection,
        child_id: &str,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let Some(owner) = state.owner_of(collection, child_id).map(str::to_string) else {
            return Ok(false);
        };
        state
            .children
            .retain(|(_, c)| !(c.collection() == collection && c.id() == child_id));
        state.touch(&owner);
        Ok(true)
    }

    async fn begin(&mut self) -> Result<Box<dyn AggregateTransaction + '_>, StoreError> {
        let working = self.lock().clone();
        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
            working,
            fail_point: self.fail_point,
        }))
    }

    async fn close(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    working: MemoryState,
    fail_point: Option<FailPoint>,
}

impl MemoryTransaction {
    fn check(&self, at: FailPoint) -> Result<(), StoreError> {
        if self.fail_point == Some(at) {
            return Err(StoreError::Injected(format!("{at:?}")));
        }
        Ok(())
    }
}

#[async_trait]
impl AggregateTransaction for MemoryTransaction {
    async fn upsert_header(&mut self, header: &ProjectHeader) -> Result<(), StoreError> {
        self.check(FailPoint::Header)?;
        match self.working.project_mut(&header.id) {
            Some(stored) => {
                let created_at = stored.created_at;
                let previous = stored.updated_at;
                *stored = header.clone();
                stored.created_at = created_at;
                stored.updated_at = previous.max(header.updated_at);
            }
            None => self.working.projects.push(header.clone()),
        }
        Ok(())
    }

    async fn child_owner(
        &mut self,
        collection: Collection,
        child_id: &str,
    ) -> Result<Option<String>, StoreError> {
        Ok(self.working.owner_of(collection, child_id).map(str::to_string))
    }

    async fn update_child(&mut self, project_id: &str, child: &ChildRecord) -> Result<(), StoreError> {
        self.check(FailPoint::Collection(child.collection()))?;
        for (owner, stored) in &mut self.working.children {
            if owner == project_id
                && stored.collection() == child.collection()
                && stored.id() == child.id()
            {
                *stored = child.clone();
            }
        }
        Ok(())
    }

    async fn insert_child(&mut self, project_id: &str, child: &ChildRecord) -> Result<(), StoreError> {
        self.check(FailPoint::Collection(child.collection()))?;
        self.working
            .children
            .push((project_id.to_string(), child.clone()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        *this.state.lock().unwrap() = this.working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
