//! Tenant storage backends.
//!
//! A [`TenantStore`] is one live connection to one tenant database. It is
//! opened per request by the connection manager and never shared.

use async_trait::async_trait;

use crate::models::{ChildRecord, Collection, ParseEnumError, ProjectAggregate, ProjectHeader, ProjectSummary};

#[cfg(test)]
pub mod memory;
pub mod postgres;
mod schema;

pub use schema::SCHEMA;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("a row with id '{0}' already exists")]
    Conflict(String),

    #[error("stored row is invalid: {0}")]
    InvalidRow(#[from] ParseEnumError),

    /// Raised by test doubles to simulate a failing statement.
    #[cfg(test)]
    #[error("injected failure: {0}")]
    Injected(String),
}

/// Operations available on a routed tenant connection.
#[async_trait]
pub trait TenantStore: Send {
    async fn ping(&mut self) -> Result<(), StoreError>;

    async fn list_projects(&mut self) -> Result<Vec<ProjectSummary>, StoreError>;

    async fn load_aggregate(&mut self, id: &str) -> Result<Option<ProjectAggregate>, StoreError>;

    /// Insert a new header. Fails with [`StoreError::Conflict`] if the id is taken.
    async fn create_project(&mut self, header: &ProjectHeader) -> Result<(), StoreError>;

    /// Update header fields in place; `None` if no such project exists.
    async fn update_project(
        &mut self,
        header: &ProjectHeader,
    ) -> Result<Option<ProjectHeader>, StoreError>;

    /// Remove a project together with all of its child rows.
    async fn delete_project(&mut self, id: &str) -> Result<bool, StoreError>;

    async fn list_children(
        &mut self,
        collection: Collection,
        project_id: &str,
    ) -> Result<Vec<ChildRecord>, StoreError>;

    /// Insert one child row; `None` if the parent project does not exist.
    async fn insert_child(
        &mut self,
        project_id: &str,
        child: &ChildRecord,
    ) -> Result<Option<ChildRecord>, StoreError>;

    async fn delete_child(
        &mut self,
        collection: Collection,
        child_id: &str,
    ) -> Result<bool, StoreError>;

    /// Open a transaction for a batch aggregate write.
    async fn begin(&mut self) -> Result<Box<dyn AggregateTransaction + '_>, StoreError>;

    /// Gracefully close the connection.
    async fn close(self: Box<Self>) -> Result<(), StoreError>;
}

/// The statements the aggregate writer issues inside one transaction.
#[async_trait]
pub trait AggregateTransaction: Send {
    /// Insert or update the header. An existing `created_at` is kept and
    /// `updated_at` never moves backwards.
    async fn upsert_header(&mut self, header: &ProjectHeader) -> Result<(), StoreError>;

    /// The project a child id currently belongs to, if the id is in use.
    async fn child_owner(
        &mut self,
        collection: Collection,
        child_id: &str,
    ) -> Result<Option<String>, StoreError>;

    async fn update_child(&mut self, project_id: &str, child: &ChildRecord) -> Result<(), StoreError>;

    async fn insert_child(&mut self, project_id: &str, child: &ChildRecord) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
