use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::LocalStorageError;
use super::local::LocalStorage;
use crate::models::{ProjectStatus, ProjectSummary};

const SELECTED_KEY: &str = "selected-project";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SelectedProject {
    pub id: String,
    pub name: String,
    pub status: ProjectStatus,
    pub selected_at: DateTime<Utc>,
}

/// The project every editor on this device is working on.
///
/// There is a single slot; the last `set` wins.
#[derive(Clone)]
pub struct SelectedProjectRegistry {
    storage: Arc<dyn LocalStorage>,
}

impl SelectedProjectRegistry {
    pub fn new(storage: Arc<dyn LocalStorage>) -> Self {
        Self { storage }
    }

    pub fn set(&self, project: &ProjectSummary) -> Result<SelectedProject, LocalStorageError> {
        let selected = SelectedProject {
            id: project.id.clone(),
            name: project.name.clone(),
            status: project.status,
            selected_at: Utc::now(),
        };
        self.storage
            .set(SELECTED_KEY, &serde_json::to_string(&selected)?)?;
        debug!(project_id = %selected.id, "project selected");
        Ok(selected)
    }

    pub fn get(&self) -> Result<Option<SelectedProject>, LocalStorageError> {
        let Some(json) = self.storage.get(SELECTED_KEY)? else {
            return Ok(None);
        };
        match serde_json::from_str(&json) {
            Ok(selected) => Ok(Some(selected)),
            Err(err) => {
                warn!(error = %err, "selected project slot is unreadable");
                Ok(None)
            }
        }
    }

    pub fn clear(&self) -> Result<(), LocalStorageError> {
        self.storage.remove(SELECTED_KEY)
    }

    pub fn is_selected(&self, id: &str) -> Result<bool, LocalStorageError> {
        Ok(self.get()?.is_some_and(|selected| selected.id == id))
    }
}
