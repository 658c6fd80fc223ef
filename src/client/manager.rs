//! The local-first data manager.
//!
//! In local mode everything goes to on-device storage. In remote mode the sync
//! service is tried first and the device takes over whenever the service cannot
//! be reached, so a save only fails outright when both stores refuse it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use super::error::{ClientError, LocalStorageError, RemoteError};
use super::local::{LocalProjectStore, LocalStorage};
use super::remote::{DEFAULT_REQUEST_TIMEOUT, HttpProjectClient, RemoteProjectApi};
use super::settings::{ClientSettings, StorageMode};
use crate::models::{ProjectAggregate, ProjectSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreLocation {
    Local,
    Remote,
}

/// Result of a save that did not fail outright.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    /// The named store holds the authoritative copy.
    Saved(StoreLocation),
    /// The remote write failed; the device copy is the only one.
    SavedLocallyOnly { cause: RemoteError },
}

/// Decide the outcome of a save from the remote attempt, if there was one,
/// running the local write only when it is needed.
pub fn settle_save<F>(
    remote: Option<Result<StoreLocation, RemoteError>>,
    local: F,
) -> Result<SaveOutcome, ClientError>
where
    F: FnOnce() -> Result<StoreLocation, LocalStorageError>,
{
    match remote {
        None => Ok(SaveOutcome::Saved(local()?)),
        Some(Ok(location)) => Ok(SaveOutcome::Saved(location)),
        Some(Err(cause)) => match local() {
            Ok(_) => Ok(SaveOutcome::SavedLocallyOnly { cause }),
            Err(local) => Err(ClientError::FallbackFailed {
                remote: cause,
                local,
            }),
        },
    }
}

pub struct ProjectDataManager {
    local: LocalProjectStore,
    settings: ClientSettings,
    remote: Option<Arc<dyn RemoteProjectApi>>,
    timeout: Duration,
}

impl ProjectDataManager {
    /// A manager over `storage` that builds its HTTP client from the stored
    /// remote settings whenever remote mode is active.
    pub fn new(storage: Arc<dyn LocalStorage>) -> Self {
        Self {
            local: LocalProjectStore::new(storage.clone()),
            settings: ClientSettings::new(storage),
            remote: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub fn with_remote(mut self, remote: Arc<dyn RemoteProjectApi>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    fn remote_api(&self) -> Result<Arc<dyn RemoteProjectApi>, RemoteError> {
        if let Some(remote) = &self.remote {
            return Ok(remote.clone());
        }
        let settings = self.settings.remote().map_err(|err| {
            warn!(error = %err, "remote settings unreadable");
            RemoteError::NotConfigured
        })?;
        Ok(Arc::new(HttpProjectClient::new(settings, self.timeout)?))
    }

    async fn save_remote(&self, aggregate: &ProjectAggregate) -> Result<StoreLocation, RemoteError> {
        self.remote_api()?.save_project(aggregate).await?;
        Ok(StoreLocation::Remote)
    }

    pub async fn save_project_data(
        &self,
        mut aggregate: ProjectAggregate,
    ) -> Result<SaveOutcome, ClientError> {
        aggregate.normalize(Utc::now());

        let remote = match self.settings.mode()? {
            StorageMode::Local => None,
            StorageMode::Remote => Some(self.save_remote(&aggregate).await),
        };

        let outcome = settle_save(remote, || {
            self.local.save(&aggregate)?;
            Ok(StoreLocation::Local)
        })?;

        match &outcome {
            SaveOutcome::Saved(StoreLocation::Remote) => {
                // Keep an offline copy of what the service accepted.
                aggregate.last_synced_at = Some(Utc::now());
                if let Err(err) = self.local.save(&aggregate) {
                    warn!(project_id = %aggregate.id(), error = %err, "caching synced project failed");
                }
                info!(project_id = %aggregate.id(), "project saved remotely");
            }
            SaveOutcome::Saved(StoreLocation::Local) => {
                info!(project_id = %aggregate.id(), "project saved locally");
            }
            SaveOutcome::SavedLocallyOnly { cause } => {
                warn!(project_id = %aggregate.id(), %cause, "saved locally only");
            }
        }
        Ok(outcome)
    }

    pub async fn load_project_data(
        &self,
        id: &str,
    ) -> Result<Option<ProjectAggregate>, ClientError> {
        if self.settings.mode()? == StorageMode::Remote {
            let remote = match self.remote_api() {
                Ok(api) => api.load_project(id).await,
                Err(err) => Err(err),
            };
            match remote {
                Ok(found) => return Ok(found),
                Err(err) => warn!(project_id = id, error = %err, "remote load failed, reading local copy"),
            }
        }

        Ok(self.local.load(id)?)
    }

    /// Remove the project remotely when possible and always on the device.
    pub async fn delete_project_data(&self, id: &str) -> Result<(), ClientError> {
        if self.settings.mode()? == StorageMode::Remote {
            let remote = match self.remote_api() {
                Ok(api) => api.delete_project(id).await,
                Err(err) => Err(err),
            };
            if let Err(err) = remote {
                warn!(project_id = id, error = %err, "remote delete failed");
            }
        }

        self.local.delete(id)?;
        info!(project_id = id, "project deleted");
        Ok(())
    }

    pub async fn load_all_projects(&self) -> Result<Vec<ProjectSummary>, ClientError> {
        if self.settings.mode()? == StorageMode::Remote {
            let remote = match self.remote_api() {
                Ok(api) => api.list_projects().await,
                Err(err) => Err(err),
            };
            match remote {
                Ok(projects) => return Ok(projects),
                Err(err) => warn!(error = %err, "remote listing failed, using local index"),
            }
        }

        Ok(self.local.list()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::local::MemoryStorage;
    use crate::models::{CostItem, ProjectHeader};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeRemote {
        down: bool,
        projects: Mutex<HashMap<String, ProjectAggregate>>,
    }

    impl FakeRemote {
        fn down() -> Self {
            FakeRemote {
                down: true,
                ..FakeRemote::default()
            }
        }

        fn check(&self) -> Result<(), RemoteError> {
            if self.down {
                return Err(RemoteError::Unreachable("connection refused".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RemoteProjectApi for FakeRemote {
        async fn save_project(&self, aggregate: &ProjectAggregate) -> Result<(), RemoteError> {
            self.check()?;
            self.projects
                .lock()
                .unwrap()
                .insert(aggregate.id().to_string(), aggregate.clone());
            Ok(())
        }

        async fn load_project(&self, id: &str) -> Result<Option<ProjectAggregate>, RemoteError> {
            self.check()?;
            Ok(self.projects.lock().unwrap().get(id).cloned())
        }

        async fn delete_project(&self, id: &str) -> Result<bool, RemoteError> {
            self.check()?;
            Ok(self.projects.lock().unwrap().remove(id).is_some())
        }

        async fn list_projects(&self) -> Result<Vec<ProjectSummary>, RemoteError> {
            self.check()?;
            Ok(self
                .projects
                .lock()
                .unwrap()
                .values()
                .map(|p| p.header.summary())
                .collect())
        }
    }

    /// Storage whose writes always fail.
    struct ReadOnlyStorage;

    impl LocalStorage for ReadOnlyStorage {
        fn get(&self, key: &str) -> Result<Option<String>, LocalStorageError> {
            Ok((key == "storage-mode").then(|| "\"remote\"".to_string()))
        }

        fn set(&self, _key: &str, _value: &str) -> Result<(), LocalStorageError> {
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only").into())
        }

        fn remove(&self, _key: &str) -> Result<(), LocalStorageError> {
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only").into())
        }

        fn keys(&self) -> Result<Vec<String>, LocalStorageError> {
            Ok(vec!["storage-mode".to_string()])
        }
    }

    fn project(id: &str) -> ProjectAggregate {
        let mut header = ProjectHeader::new("Site A");
        header.id = id.into();
        let mut aggregate = ProjectAggregate::new(header);
        aggregate.cost_items.push(CostItem {
            id: "c1".into(),
            position: "Excavation".into(),
            quantity: 2.0,
            unit: "m3".into(),
            unit_price: 50.0,
            total: 7.0,
            note: None,
            timestamp: Utc::now(),
        });
        aggregate
    }

    fn manager(mode: StorageMode, remote: FakeRemote) -> (ProjectDataManager, Arc<FakeRemote>) {
        let remote = Arc::new(remote);
        let manager =
            ProjectDataManager::new(Arc::new(MemoryStorage::new())).with_remote(remote.clone());
        manager.settings().set_mode(mode).unwrap();
        (manager, remote)
    }

    #[test]
    fn settle_save_decisions() {
        let local_ok = || Ok(StoreLocation::Local);

        assert_eq!(
            settle_save(None, local_ok).unwrap(),
            SaveOutcome::Saved(StoreLocation::Local)
        );
        assert_eq!(
            settle_save(Some(Ok(StoreLocation::Remote)), || unreachable!()).unwrap(),
            SaveOutcome::Saved(StoreLocation::Remote)
        );
        assert_eq!(
            settle_save(Some(Err(RemoteError::Timeout)), local_ok).unwrap(),
            SaveOutcome::SavedLocallyOnly {
                cause: RemoteError::Timeout
            }
        );

        let both = settle_save(Some(Err(RemoteError::Timeout)), || {
            Err(std::io::Error::other("disk full").into())
        });
        assert!(matches!(both, Err(ClientError::FallbackFailed { .. })));
    }

    #[tokio::test]
    async fn local_mode_never_touches_remote() {
        let (manager, remote) = manager(StorageMode::Local, FakeRemote::default());

        let outcome = manager.save_project_data(project("P1")).await.unwrap();

        assert_eq!(outcome, SaveOutcome::Saved(StoreLocation::Local));
        assert!(remote.projects.lock().unwrap().is_empty());
        let loaded = manager.load_project_data("P1").await.unwrap().unwrap();
        assert_eq!(loaded.cost_items[0].total, 100.0);
    }

    #[tokio::test]
    async fn unreachable_remote_falls_back_to_device() {
        let (manager, _) = manager(StorageMode::Remote, FakeRemote::down());

        let outcome = manager.save_project_data(project("P1")).await.unwrap();

        assert!(matches!(
            outcome,
            SaveOutcome::SavedLocallyOnly {
                cause: RemoteError::Unreachable(_)
            }
        ));
        let loaded = manager.load_project_data("P1").await.unwrap().unwrap();
        assert_eq!(loaded.id(), "P1");
        assert_eq!(loaded.last_synced_at, None);
        let listed = manager.load_all_projects().await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn remote_save_keeps_synced_copy() {
        let (manager, remote) = manager(StorageMode::Remote, FakeRemote::default());

        let outcome = manager.save_project_data(project("P1")).await.unwrap();

        assert_eq!(outcome, SaveOutcome::Saved(StoreLocation::Remote));
        assert_eq!(remote.projects.lock().unwrap()["P1"].cost_items[0].total, 100.0);
        let cached = manager.local.load("P1").unwrap().unwrap();
        assert!(cached.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn remote_not_found_is_authoritative() {
        let (manager, _) = manager(StorageMode::Local, FakeRemote::default());
        manager.save_project_data(project("P1")).await.unwrap();
        manager.settings().set_mode(StorageMode::Remote).unwrap();

        assert_eq!(manager.load_project_data("P1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_is_local_even_when_remote_is_down() {
        let (manager, _) = manager(StorageMode::Remote, FakeRemote::down());
        manager.save_project_data(project("P1")).await.unwrap();

        manager.delete_project_data("P1").await.unwrap();

        assert_eq!(manager.load_project_data("P1").await.unwrap(), None);
        assert!(manager.load_all_projects().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn both_stores_failing_is_fatal() {
        let manager =
            ProjectDataManager::new(Arc::new(ReadOnlyStorage)).with_remote(Arc::new(FakeRemote::down()));

        let err = manager.save_project_data(project("P1")).await.unwrap_err();

        assert!(matches!(
            err,
            ClientError::FallbackFailed {
                remote: RemoteError::Unreachable(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn remote_mode_without_url_saves_locally() {
        let manager = ProjectDataManager::new(Arc::new(MemoryStorage::new()));
        manager.settings().set_mode(StorageMode::Remote).unwrap();

        let outcome = manager.save_project_data(project("P1")).await.unwrap();

        assert_eq!(
            outcome,
            SaveOutcome::SavedLocallyOnly {
                cause: RemoteError::NotConfigured
            }
        );
    }

    #[tokio::test]
    async fn repeated_remote_saves_add_no_rows() {
        use crate::db::memory::{MemoryConnector, MemoryState};
        use crate::models::Measurement;
        use crate::server::connection::ConnectionManager;
        use crate::server::routing::ConnectionParams;
        use crate::server::{AppState, router};
        use crate::client::RemoteSettings;
        use tokio::net::TcpListener;

        let state = MemoryState::shared();
        let app = router(AppState {
            fallback: ConnectionParams::default(),
            connections: ConnectionManager::new(
                Arc::new(MemoryConnector::new(state.clone())),
                Duration::from_secs(1),
            ),
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let manager = ProjectDataManager::new(Arc::new(MemoryStorage::new()));
        manager.settings().set_mode(StorageMode::Remote).unwrap();
        manager
            .settings()
            .set_remote(&RemoteSettings {
                url: format!("http://{addr}"),
                host: Some("localhost".into()),
                port: Some(5432),
                database: Some("tenant_a".into()),
                user: Some("site".into()),
                password: None,
            })
            .unwrap();

        let mut aggregate = project("P1");
        aggregate.cost_items[0].id = String::new();
        aggregate.measurements.push(Measurement {
            id: String::new(),
            kind: "length".into(),
            value: "12,40".into(),
            unit: Some("m".into()),
            timestamp: Utc::now(),
            note: None,
        });

        for _ in 0..3 {
            let outcome = manager.save_project_data(aggregate.clone()).await.unwrap();
            assert_eq!(outcome, SaveOutcome::Saved(StoreLocation::Remote));
        }

        let stored = state.lock().unwrap().aggregate("P1").unwrap();
        assert_eq!(stored.measurements.len(), 1);
        assert_eq!(stored.cost_items.len(), 1);

        let cached = manager.local.load("P1").unwrap().unwrap();
        assert_eq!(cached.measurements[0].id, stored.measurements[0].id);
    }
}
