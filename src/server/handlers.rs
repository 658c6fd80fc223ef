use axum::{
    Json,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use super::AppState;
use super::error::ApiError;
use super::routing::{ConnectionParams, resolve};
use super::writer::{prepare_new_child, write_aggregate};
use crate::models::{
    ChildRecord, Collection, CURRENT_SCHEMA_VERSION, ProjectAggregate, ProjectHeader,
    ProjectSummary,
};

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidInput(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::InvalidInput(rejection.body_text())
    }
}

#[derive(Serialize)]
struct Success {
    success: bool,
}

const SUCCESS: Success = Success { success: true };

fn collection_from_path(segment: &str) -> Result<Collection, ApiError> {
    Collection::from_path_segment(segment)
        .ok_or_else(|| ApiError::NotFound(format!("collection '{segment}'")))
}

pub async fn status() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "schemaVersion": CURRENT_SCHEMA_VERSION,
    }))
}

#[derive(Deserialize, Debug)]
pub struct TestConnectionRequest {
    host: Option<String>,
    port: Option<Value>,
    name: Option<String>,
    user: Option<String>,
    password: Option<String>,
}

/// Try the supplied parameters alone; the fallback set is not consulted.
pub async fn test_db_connection(
    State(state): State<AppState>,
    payload: Result<Json<TestConnectionRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = payload?;
    let port = request.port.map(|port| match port {
        Value::String(s) => s,
        other => other.to_string(),
    });
    let params = ConnectionParams {
        host: request.host,
        port,
        database: request.name,
        user: request.user,
        password: request.password,
    };
    let descriptor = resolve(&params, &ConnectionParams::default())?;

    let mut conn = state.connections.open(&descriptor).await?;
    let result = conn.store().ping().await;
    conn.release().await;
    result?;

    info!(tenant = %descriptor, "connection test succeeded");
    Ok(Json(SUCCESS))
}

pub async fn save_project_complete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    payload: Result<Json<ProjectAggregate>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(aggregate) = payload?;

    let mut conn = state.open(&headers).await?;
    let result = write_aggregate(conn.store(), &id, aggregate).await;
    conn.release().await;
    result?;

    Ok(Json(SUCCESS))
}

pub async fn list_projects(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ProjectSummary>>, ApiError> {
    let mut conn = state.open(&headers).await?;
    let result = conn.store().list_projects().await;
    conn.release().await;

    Ok(Json(result?))
}

pub async fn get_project(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ProjectAggregate>, ApiError> {
    let mut conn = state.open(&headers).await?;
    let result = conn.store().load_aggregate(&id).await;
    conn.release().await;

    result?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("project '{id}'")))
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInput {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(flatten)]
    rest: serde_json::Map<String, Value>,
}

/// Build a header from request input, keeping anything the caller did not send
/// from `base`.
fn merge_header(base: ProjectHeader, input: ProjectInput) -> Result<ProjectHeader, ApiError> {
    if input.name.trim().is_empty() {
        return Err(ApiError::InvalidInput("project name must not be empty".into()));
    }

    let mut merged = match serde_json::to_value(&base) {
        Ok(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    for (key, value) in input.rest {
        if !matches!(key.as_str(), "id" | "createdAt" | "updatedAt") {
            merged.insert(key, value);
        }
    }
    merged.insert("name".into(), Value::String(input.name));

    serde_json::from_value(Value::Object(merged))
        .map_err(|err| ApiError::InvalidInput(err.to_string()))
}

pub async fn create_project(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ProjectInput>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(input) = payload?;
    let mut base = ProjectHeader::new(input.name.clone());
    if let Some(id) = input.id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
        base.id = id.to_string();
    }
    let header = merge_header(base, input)?;

    let mut conn = state.open(&headers).await?;
    let result = conn.store().create_project(&header).await;
    conn.release().await;
    result?;

    info!(project_id = %header.id, "project created");
    Ok((StatusCode::CREATED, Json(header)))
}

pub async fn update_project(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    payload: Result<Json<ProjectInput>, JsonRejection>,
) -> Result<Json<ProjectHeader>, ApiError> {
    let Json(input) = payload?;
    let mut base = ProjectHeader::new(input.name.clone());
    base.id = id.clone();
    let header = merge_header(base, input)?;

    let mut conn = state.open(&headers).await?;
    let result = conn.store().update_project(&header).await;
    conn.release().await;

    result?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("project '{id}'")))
}

pub async fn delete_project(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let mut conn = state.open(&headers).await?;
    let result = conn.store().delete_project(&id).await;
    conn.release().await;

    if !result? {
        return Err(ApiError::NotFound(format!("project '{id}'")));
    }
    info!(project_id = %id, "project deleted");
    Ok(Json(SUCCESS))
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ChildQuery {
    project_id: String,
}

pub async fn list_children(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(segment): Path<String>,
    query: Result<Query<ChildQuery>, QueryRejection>,
) -> Result<Json<Vec<ChildRecord>>, ApiError> {
    let collection = collection_from_path(&segment)?;
    let Query(query) = query?;

    let mut conn = state.open(&headers).await?;
    let result = conn.store().list_children(collection, &query.project_id).await;
    conn.release().await;

    Ok(Json(result?))
}

pub async fn create_child(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(segment): Path<String>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let collection = collection_from_path(&segment)?;
    let Json(body) = payload?;

    let project_id = body
        .get("projectId")
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ApiError::InvalidInput("projectId is required".into()))?;
    let mut child = ChildRecord::from_value(collection, body)
        .map_err(|err| ApiError::InvalidInput(err.to_string()))?;
    prepare_new_child(&mut child);

    let mut conn = state.open(&headers).await?;
    let result = conn.store().insert_child(&project_id, &child).await;
    conn.release().await;

    let stored = result?.ok_or_else(|| ApiError::NotFound(format!("project '{project_id}'")))?;
    info!(
        project_id = %project_id,
        collection = collection.path_segment(),
        child_id = stored.id(),
        "child row inserted"
    );
    Ok((StatusCode::CREATED, Json(stored)))
}

pub async fn delete_child(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((segment, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let collection = collection_from_path(&segment)?;

    let mut conn = state.open(&headers).await?;
    let result = conn.store().delete_child(collection, &id).await;
    conn.release().await;

    if !result? {
        return Err(ApiError::NotFound(format!(
            "{} entry '{id}'",
            collection.path_segment()
        )));
    }
    Ok(Json(SUCCESS))
}
