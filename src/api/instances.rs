//! Instance registry REST endpoints

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::get,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::AppState;
use crate::db::{CreateInstance, InstanceRecord, UpdateInstance};

use super::ApiError;

#[derive(Debug, Deserialize)]
pub struct CreateInstanceRequest {
    pub name: String,
    pub host: String,
    pub port: i64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateInstanceRequest {
    pub name: Option<String>,
    pub host: Option<String>,
    pub port: Option<i64>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// The pool builds client URLs from a u16 port, so reject anything outside
/// that range here instead of letting it truncate later.
fn valid_port(port: i64) -> bool {
    (1..=i64::from(u16::MAX)).contains(&port)
}

/// Instance JSON for the wire; the id travels as containerId.
fn instance_json(record: &InstanceRecord) -> Value {
    json!({
        "containerId": record.id,
        "name": record.name,
        "host": record.host,
        "port": record.port,
        "username": record.username,
        "createdAt": record.created_at,
    })
}

async fn list_instances(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let instances = state.db.instances().list().await?;
    let statuses = state.db.sync_status().list().await?;
    let items: Vec<Value> = instances
        .iter()
        .map(|record| {
            let mut item = instance_json(record);
            if let Some(status) = statuses.iter().find(|s| s.instance_id == record.id) {
                item["syncStatus"] = json!({
                    "lastSync": status.last_sync,
                    "status": status.status,
                    "error": status.error,
                });
            }
            item
        })
        .collect();
    Ok(Json(json!(items)))
}

async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let record = instance_or_404(&state, id).await?;
    Ok(Json(instance_json(&record)))
}

async fn create_instance(
    State(state): State<AppState>,
    Json(body): Json<CreateInstanceRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if body.name.trim().is_empty() || body.host.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "name and host are required".to_string(),
        ));
    }
    if !valid_port(body.port) {
        return Err(ApiError::BadRequest(
            "port must be between 1 and 65535".to_string(),
        ));
    }
    let record = state
        .db
        .instances()
        .create(CreateInstance {
            name: body.name,
            host: body.host,
            port: body.port,
            username: body.username,
            password: body.password,
        })
        .await?;
    info!(instance_id = record.id, name = %record.name, "instance registered");
    Ok((StatusCode::CREATED, Json(instance_json(&record))))
}

async fn update_instance(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateInstanceRequest>,
) -> Result<Json<Value>, ApiError> {
    if let Some(port) = body.port
        && !valid_port(port)
    {
        return Err(ApiError::BadRequest(
            "port must be between 1 and 65535".to_string(),
        ));
    }
    let changes = UpdateInstance {
        name: body.name,
        host: body.host,
        port: body.port,
        username: body.username,
        password: body.password,
    };
    if changes.is_empty() {
        return Err(ApiError::BadRequest("no fields to update".to_string()));
    }
    if !state.db.instances().update(id, changes).await? {
        return Err(ApiError::NotFound(format!("instance {id} not found")));
    }
    // The pool compares endpoints on next use, so an edited instance gets a
    // fresh client and session automatically.
    let record = instance_or_404(&state, id).await?;
    Ok(Json(instance_json(&record)))
}

async fn delete_instance(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if !state.db.instances().delete(id).await? {
        return Err(ApiError::NotFound(format!("instance {id} not found")));
    }
    state.clients.remove(id);
    info!(instance_id = id, "instance deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn sync_status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let statuses = state.db.sync_status().list().await?;
    let items: Vec<Value> = statuses
        .iter()
        .map(|status| {
            json!({
                "containerId": status.instance_id,
                "lastSync": status.last_sync,
                "status": status.status,
                "error": status.error,
            })
        })
        .collect();
    Ok(Json(json!(items)))
}

/// Fetches the instance record or maps its absence to a 404.
pub async fn instance_or_404(state: &AppState, id: i64) -> Result<InstanceRecord, ApiError> {
    state
        .db
        .instances()
        .get(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("instance {id} not found")))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/instances", get(list_instances).post(create_instance))
        .route(
            "/instances/{id}",
            get(get_instance)
                .put(update_instance)
                .delete(delete_instance),
        )
        .route("/sync-status", get(sync_status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_range_matches_what_clients_can_dial() {
        assert!(valid_port(1));
        assert!(valid_port(8080));
        assert!(valid_port(65535));
        assert!(!valid_port(0));
        assert!(!valid_port(-1));
        // Out-of-range values must be rejected, not truncated to u16.
        assert!(!valid_port(70000));
    }
}
