use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;

use super::error::RemoteError;
use super::settings::RemoteSettings;
use crate::models::{ProjectAggregate, ProjectSummary};
use crate::server::routing::{
    HEADER_DB_HOST, HEADER_DB_NAME, HEADER_DB_PASSWORD, HEADER_DB_PORT, HEADER_DB_USER,
};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The sync service as seen from the device.
#[async_trait]
pub trait RemoteProjectApi: Send + Sync {
    /// Batch-write the whole aggregate.
    async fn save_project(&self, aggregate: &ProjectAggregate) -> Result<(), RemoteError>;

    /// `None` when the service says the project does not exist.
    async fn load_project(&self, id: &str) -> Result<Option<ProjectAggregate>, RemoteError>;

    /// `false` when the service did not know the project.
    async fn delete_project(&self, id: &str) -> Result<bool, RemoteError>;

    async fn list_projects(&self) -> Result<Vec<ProjectSummary>, RemoteError>;
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    details: Option<String>,
}

#[derive(Clone)]
pub struct HttpProjectClient {
    client: reqwest::Client,
    settings: RemoteSettings,
}

impl HttpProjectClient {
    pub fn new(settings: RemoteSettings, timeout: Duration) -> Result<Self, RemoteError> {
        if settings.url.trim().is_empty() {
            return Err(RemoteError::NotConfigured);
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpProjectClient { client, settings })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.url.trim_end_matches('/'), path)
    }

    /// Attach the tenant credentials this device is configured with.
    fn routed(&self, mut request: RequestBuilder) -> RequestBuilder {
        let s = &self.settings;
        if let Some(host) = &s.host {
            request = request.header(HEADER_DB_HOST, host);
        }
        if let Some(port) = s.port {
            request = request.header(HEADER_DB_PORT, port.to_string());
        }
        if let Some(database) = &s.database {
            request = request.header(HEADER_DB_NAME, database);
        }
        if let Some(user) = &s.user {
            request = request.header(HEADER_DB_USER, user);
        }
        if let Some(password) = &s.password {
            request = request.header(HEADER_DB_PASSWORD, password);
        }
        request
    }

    async fn server_error(response: reqwest::Response) -> RemoteError {
        let status = response.status().as_u16();
        let message = match response.json::<ErrorBody>().await {
            Ok(body) => match body.details {
                Some(details) => format!("{}: {}", body.error, details),
                None => body.error,
            },
            Err(_) => String::from("no error body"),
        };
        RemoteError::Server { status, message }
    }
}

#[async_trait]
impl RemoteProjectApi for HttpProjectClient {
    async fn save_project(&self, aggregate: &ProjectAggregate) -> Result<(), RemoteError> {
        let url = self.url(&format!("/api/project-complete/{}", aggregate.id()));
        let response = self.routed(self.client.put(url)).json(aggregate).send().await?;

        match response.status() {
            StatusCode::OK => Ok(()),
            _ => Err(Self::server_error(response).await),
        }
    }

    async fn load_project(&self, id: &str) -> Result<Option<ProjectAggregate>, RemoteError> {
        let url = self.url(&format!("/api/projects/{id}"));
        let response = self.routed(self.client.get(url)).send().await?;

        match response.status() {
            StatusCode::OK => Ok(Some(response.json::<ProjectAggregate>().await?)),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(Self::server_error(response).await),
        }
    }

    async fn delete_project(&self, id: &str) -> Result<bool, RemoteError> {
        let url = self.url(&format!("/api/projects/{id}"));
        let response = self.routed(self.client.delete(url)).send().await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(Self::server_error(response).await),
        }
    }

    async fn list_projects(&self) -> Result<Vec<ProjectSummary>, RemoteError> {
        let response = self
            .routed(self.client.get(self.url("/api/projects")))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(response.json::<Vec<ProjectSummary>>().await?),
            _ => Err(Self::server_error(response).await),
        }
    }
}
