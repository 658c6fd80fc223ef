use uuid::Uuid;

mod aggregate;
mod cost_item;
mod measurement;
mod photo;
mod project;
mod safety_action;

pub use aggregate::{
    migrate, ChildRecord, Collection, ProjectAggregate, StoredAggregate, CURRENT_SCHEMA_VERSION,
};
pub use cost_item::CostItem;
pub use measurement::Measurement;
pub use photo::{Photo, PhotoCategory};
pub use project::{ProjectHeader, ProjectStatus, ProjectSummary};
pub use safety_action::{SafetyAction, SafetyStatus};

/// A random id for a child row created on its own.
pub fn new_child_id() -> String {
    Uuid::new_v4().to_string()
}

/// An id for a child row of `project_id` that depends only on its inputs, so
/// the same row saved again lands on the same id.
pub fn derived_child_id(project_id: &str, collection: Collection, seed: &str) -> String {
    let name = format!("{project_id}/{}/{seed}", collection.table());
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

/// A stored enum column held a value this build does not know.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
