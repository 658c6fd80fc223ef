//! The transactional aggregate writer behind `PUT /api/project-complete/{id}`.
//!
//! One header upsert plus upserts for every child row run in a single
//! transaction. Rows missing from the payload are left alone; only the
//! single-row delete endpoints remove children.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::db::{AggregateTransaction, StoreError, TenantStore};
use crate::models::{ChildRecord, Collection, ProjectAggregate, derived_child_id, new_child_id};

#[derive(thiserror::Error, Debug)]
pub enum WriteError {
    #[error("changes not saved, transaction rolled back: {0}")]
    TransactionFailed(#[source] StoreError),
}

/// What a successful batch write changed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct WriteSummary {
    pub updated: usize,
    pub inserted: usize,
    pub per_collection: HashMap<Collection, usize>,
}

/// How a single child row is written.
#[derive(Debug, Clone, PartialEq)]
enum ChildPlan {
    /// The id exists and belongs to this project.
    Update,
    /// The id is unused.
    Insert,
    /// The id belongs to another project; the row moves to an id derived from
    /// this project and the original id.
    Rehome,
}

fn plan_child(owner: Option<&str>, project_id: &str) -> ChildPlan {
    match owner {
        Some(owner) if owner == project_id => ChildPlan::Update,
        Some(_) => ChildPlan::Rehome,
        None => ChildPlan::Insert,
    }
}

/// Persist `aggregate` under `project_id` atomically.
///
/// The header id is forced to `project_id`, `updated_at` is stamped with the
/// server clock, every cost total is recomputed and children without an id get
/// a stable one. On any failure the transaction is rolled back before the
/// error is returned.
pub async fn write_aggregate(
    store: &mut dyn TenantStore,
    project_id: &str,
    mut aggregate: ProjectAggregate,
) -> Result<WriteSummary, WriteError> {
    aggregate.header.id = project_id.to_string();
    aggregate.header.updated_at = Utc::now();
    for item in &mut aggregate.cost_items {
        item.recompute_total();
    }
    aggregate.assign_missing_child_ids();

    let mut tx = store.begin().await.map_err(WriteError::TransactionFailed)?;

    let applied = apply(tx.as_mut(), &aggregate).await;
    match applied {
        Ok(summary) => {
            tx.commit().await.map_err(WriteError::TransactionFailed)?;
            info!(
                project_id,
                updated = summary.updated,
                inserted = summary.inserted,
                per_collection = ?summary.per_collection,
                "aggregate committed"
            );
            Ok(summary)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(project_id, error = %rollback_err, "explicit rollback failed");
            }
            warn!(project_id, error = %err, "aggregate write rolled back");
            Err(WriteError::TransactionFailed(err))
        }
    }
}

async fn apply(
    tx: &mut dyn AggregateTransaction,
    aggregate: &ProjectAggregate,
) -> Result<WriteSummary, StoreError> {
    let project_id = aggregate.id();
    let mut summary = WriteSummary::default();

    tx.upsert_header(&aggregate.header).await?;

    for mut child in aggregate.children() {
        let collection = child.collection();
        let mut owner = tx.child_owner(collection, child.id()).await?;

        if plan_child(owner.as_deref(), project_id) == ChildPlan::Rehome {
            let rehomed = derived_child_id(project_id, collection, child.id());
            debug!(project_id, from = child.id(), to = %rehomed, "child id owned elsewhere");
            child.set_id(rehomed);
            owner = tx.child_owner(collection, child.id()).await?;
        }

        match plan_child(owner.as_deref(), project_id) {
            ChildPlan::Update => {
                tx.update_child(project_id, &child).await?;
                summary.updated += 1;
            }
            ChildPlan::Insert => {
                tx.insert_child(project_id, &child).await?;
                summary.inserted += 1;
            }
            ChildPlan::Rehome => {
                return Err(StoreError::Conflict(format!(
                    "{} id {} belongs to another project",
                    collection.table(),
                    child.id()
                )));
            }
        }
        *summary.per_collection.entry(collection).or_default() += 1;
    }

    Ok(summary)
}

/// Assign an id to a child row arriving on a single-row endpoint.
pub fn prepare_new_child(child: &mut ChildRecord) {
    if child.id().is_empty() {
        child.set_id(new_child_id());
    }
    if let ChildRecord::CostItem(item) = child {
        item.recompute_total();
    }
}
