//! Torrent REST endpoints
//!
//! List, filter and stats reads come from the local cache; actions go to the
//! remote instance and, where the effect is knowable, are mirrored into the
//! cache immediately so the UI reflects them before the next sync tick.

use std::collections::BTreeMap;

use axum::{
    Json, Router,
    extract::{Multipart, Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::AppState;
use crate::db::torrents::TorrentQuery;
use crate::qbit::AddTorrentOptions;

use super::ApiError;
use super::instances::instance_or_404;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub status: Option<String>,
    pub category: Option<String>,
    pub tag: Option<String>,
    pub tracker: Option<String>,
    pub save_path: Option<String>,
    pub search: Option<String>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HashesRequest {
    pub hashes: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
    pub hashes: Vec<String>,
    #[serde(default)]
    pub delete_files: bool,
}

#[derive(Debug, Deserialize)]
pub struct SetCategoryRequest {
    pub hashes: Vec<String>,
    #[serde(default)]
    pub category: String,
}

#[derive(Debug, Deserialize)]
pub struct SetTagsRequest {
    pub hashes: Vec<String>,
    pub tags: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePriorityRequest {
    pub file_ids: Vec<i64>,
    pub priority: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterScope {
    pub container_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryRequest {
    pub category: String,
    #[serde(default)]
    pub save_path: String,
}

#[derive(Debug, Deserialize)]
pub struct RemoveCategoriesRequest {
    pub categories: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogQuery {
    #[serde(default)]
    pub last_known_id: Option<i64>,
}

/// Serves the cached torrent list with filters applied in SQL.
async fn list_torrents(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    instance_or_404(&state, id).await?;
    let rows = state
        .db
        .torrents()
        .list_filtered(
            id,
            &TorrentQuery {
                status: query.status,
                category: query.category,
                tag: query.tag,
                tracker: query.tracker,
                save_path: query.save_path,
                search: query.search,
                sort_by: query.sort_by,
                sort_order: query.sort_order,
            },
        )
        .await?;
    Ok(Json(json!({ "containerId": id, "torrents": rows })))
}

/// Cache-side aggregates plus live transfer limits. The remote call is
/// best-effort; when the instance is unreachable the limits degrade to zero
/// rather than failing the whole stats panel.
async fn torrent_stats(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let instance = instance_or_404(&state, id).await?;
    let stats = state.db.torrents().stats(id).await?;

    let client = state.clients.client_for(&instance);
    let transfer = match client.transfer_info().await {
        Ok(info) => info,
        Err(e) => {
            warn!(instance_id = id, error = %e, "transfer info unavailable, reporting zero limits");
            Default::default()
        }
    };

    Ok(Json(json!({
        "containerId": id,
        "stats": stats,
        "dlRateLimit": transfer.dl_rate_limit,
        "upRateLimit": transfer.up_rate_limit,
    })))
}

/// Distinct filter values across the cache, optionally scoped to one
/// instance. Trackers collapse to their host and tags split out of the
/// comma-joined wire form here rather than in SQL.
async fn filter_values(
    State(state): State<AppState>,
    Query(scope): Query<FilterScope>,
) -> Result<Json<Value>, ApiError> {
    let torrents = state.db.torrents();
    let categories = torrents.category_facets(scope.container_id).await?;
    let save_paths = torrents.save_path_facets(scope.container_id).await?;

    let mut trackers: BTreeMap<String, i64> = BTreeMap::new();
    for raw in torrents.tracker_values(scope.container_id).await? {
        let domain = url::Url::parse(&raw)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or(raw);
        *trackers.entry(domain).or_default() += 1;
    }

    let mut tags: BTreeMap<String, i64> = BTreeMap::new();
    for joined in torrents.tag_values(scope.container_id).await? {
        for tag in joined.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            *tags.entry(tag.to_string()).or_default() += 1;
        }
    }

    let counted = |map: BTreeMap<String, i64>| -> Vec<Value> {
        map.into_iter()
            .map(|(label, count)| json!({ "label": label, "count": count }))
            .collect()
    };

    Ok(Json(json!({
        "categories": categories,
        "savePaths": save_paths,
        "trackers": counted(trackers),
        "tags": counted(tags),
    })))
}

/// Shared path for bulk remote actions addressed by hash list.
async fn handle_action(
    state: &AppState,
    id: i64,
    action: &str,
    hashes: &[String],
    extra: &[(&str, String)],
) -> Result<Json<Value>, ApiError> {
    if hashes.is_empty() {
        return Err(ApiError::BadRequest("hashes must not be empty".to_string()));
    }
    let instance = instance_or_404(state, id).await?;
    let client = state.clients.client_for(&instance);
    client.perform_action(action, &hashes.join("|"), extra).await?;
    debug!(instance_id = id, action, count = hashes.len(), "action applied");
    Ok(Json(json!({ "success": true })))
}

// v5 renamed resume/pause to start/stop; the remote keeps the old spellings
// as aliases so the new ones work against both generations.

async fn resume_torrents(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<HashesRequest>,
) -> Result<Json<Value>, ApiError> {
    handle_action(&state, id, "start", &body.hashes, &[]).await
}

async fn pause_torrents(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<HashesRequest>,
) -> Result<Json<Value>, ApiError> {
    handle_action(&state, id, "stop", &body.hashes, &[]).await
}

async fn reannounce_torrents(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<HashesRequest>,
) -> Result<Json<Value>, ApiError> {
    handle_action(&state, id, "reannounce", &body.hashes, &[]).await
}

async fn recheck_torrents(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<HashesRequest>,
) -> Result<Json<Value>, ApiError> {
    handle_action(&state, id, "recheck", &body.hashes, &[]).await
}

/// Deletes remotely, then mirrors the removal into the cache so the rows
/// vanish without waiting for the next sync tick.
async fn delete_torrents(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<DeleteRequest>,
) -> Result<Json<Value>, ApiError> {
    if body.hashes.is_empty() {
        return Err(ApiError::BadRequest("hashes must not be empty".to_string()));
    }
    let instance = instance_or_404(&state, id).await?;
    let client = state.clients.client_for(&instance);
    client
        .delete_torrents(&body.hashes.join("|"), body.delete_files)
        .await?;
    state.db.torrents().delete_many(id, &body.hashes).await?;
    Ok(Json(json!({ "success": true })))
}

/// Applies the category remotely, then mirrors it into the cache.
async fn set_category(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<SetCategoryRequest>,
) -> Result<Json<Value>, ApiError> {
    let response = handle_action(
        &state,
        id,
        "setCategory",
        &body.hashes,
        &[("category", body.category.clone())],
    )
    .await?;
    state
        .db
        .torrents()
        .set_category(id, &body.hashes, &body.category)
        .await?;
    Ok(response)
}

/// Adds tags remotely. No cache mirror: the remote merges tags into its own
/// comma-joined form, so the next sync tick is the source of truth.
async fn set_tags(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<SetTagsRequest>,
) -> Result<Json<Value>, ApiError> {
    handle_action(
        &state,
        id,
        "addTags",
        &body.hashes,
        &[("tags", body.tags.clone())],
    )
    .await
}

/// Accepts magnet links and/or uploaded .torrent files in one multipart
/// form, in the remote's own field names.
async fn add_torrent(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let instance = instance_or_404(&state, id).await?;

    let mut options = AddTorrentOptions::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "torrents" => {
                let filename = field
                    .file_name()
                    .unwrap_or("upload.torrent")
                    .to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("failed to read upload: {e}")))?;
                options.torrents.push((filename, bytes.to_vec()));
            }
            _ => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("failed to read field: {e}")))?;
                match name.as_str() {
                    "urls" => options.urls = Some(value),
                    "savepath" | "savePath" => options.savepath = Some(value),
                    "category" => options.category = Some(value),
                    "tags" => options.tags = Some(value),
                    "paused" => options.paused = value == "true",
                    "contentLayout" => options.content_layout = Some(value),
                    "ratioLimit" => options.ratio_limit = Some(value),
                    "seedingTimeLimit" => options.seeding_time_limit = Some(value),
                    "upLimit" => options.up_limit = Some(value),
                    "dlLimit" => options.dl_limit = Some(value),
                    other => debug!(field = other, "ignoring unknown add field"),
                }
            }
        }
    }

    if options.urls.is_none() && options.torrents.is_empty() {
        return Err(ApiError::BadRequest(
            "either urls or a torrent file is required".to_string(),
        ));
    }

    let client = state.clients.client_for(&instance);
    client.add_torrent(&options).await?;
    Ok((StatusCode::CREATED, Json(json!({ "success": true }))))
}

async fn export_torrent(
    State(state): State<AppState>,
    Path((id, hash)): Path<(i64, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let instance = instance_or_404(&state, id).await?;
    let client = state.clients.client_for(&instance);
    let bytes = client.export_torrent(&hash).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/x-bittorrent".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{hash}.torrent\""),
            ),
        ],
        bytes,
    ))
}

async fn torrent_properties(
    State(state): State<AppState>,
    Path((id, hash)): Path<(i64, String)>,
) -> Result<Json<Value>, ApiError> {
    let instance = instance_or_404(&state, id).await?;
    let client = state.clients.client_for(&instance);
    Ok(Json(client.torrent_properties(&hash).await?))
}

async fn torrent_trackers(
    State(state): State<AppState>,
    Path((id, hash)): Path<(i64, String)>,
) -> Result<Json<Value>, ApiError> {
    let instance = instance_or_404(&state, id).await?;
    let client = state.clients.client_for(&instance);
    Ok(Json(json!(client.torrent_trackers(&hash).await?)))
}

async fn torrent_peers(
    State(state): State<AppState>,
    Path((id, hash)): Path<(i64, String)>,
) -> Result<Json<Value>, ApiError> {
    let instance = instance_or_404(&state, id).await?;
    let client = state.clients.client_for(&instance);
    Ok(Json(client.torrent_peers(&hash).await?))
}

async fn torrent_files(
    State(state): State<AppState>,
    Path((id, hash)): Path<(i64, String)>,
) -> Result<Json<Value>, ApiError> {
    let instance = instance_or_404(&state, id).await?;
    let client = state.clients.client_for(&instance);
    Ok(Json(json!(client.torrent_files(&hash).await?)))
}

async fn set_file_priority(
    State(state): State<AppState>,
    Path((id, hash)): Path<(i64, String)>,
    Json(body): Json<FilePriorityRequest>,
) -> Result<Json<Value>, ApiError> {
    if body.file_ids.is_empty() {
        return Err(ApiError::BadRequest(
            "fileIds must not be empty".to_string(),
        ));
    }
    let instance = instance_or_404(&state, id).await?;
    let client = state.clients.client_for(&instance);
    let ids = body
        .file_ids
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join("|");
    client.set_file_priority(&hash, &ids, body.priority).await?;
    Ok(Json(json!({ "success": true })))
}

async fn instance_logs(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Value>, ApiError> {
    let instance = instance_or_404(&state, id).await?;
    let client = state.clients.client_for(&instance);
    Ok(Json(
        client.main_log(query.last_known_id.unwrap_or(-1)).await?,
    ))
}

async fn instance_preferences(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let instance = instance_or_404(&state, id).await?;
    let client = state.clients.client_for(&instance);
    Ok(Json(client.preferences().await?))
}

async fn list_categories(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let instance = instance_or_404(&state, id).await?;
    let client = state.clients.client_for(&instance);
    Ok(Json(json!(client.categories().await?)))
}

async fn create_category(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<CategoryRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if body.category.trim().is_empty() {
        return Err(ApiError::BadRequest("category is required".to_string()));
    }
    let instance = instance_or_404(&state, id).await?;
    let client = state.clients.client_for(&instance);
    client.create_category(&body.category, &body.save_path).await?;
    Ok((StatusCode::CREATED, Json(json!({ "success": true }))))
}

async fn edit_category(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<CategoryRequest>,
) -> Result<Json<Value>, ApiError> {
    let instance = instance_or_404(&state, id).await?;
    let client = state.clients.client_for(&instance);
    client.edit_category(&body.category, &body.save_path).await?;
    Ok(Json(json!({ "success": true })))
}

async fn remove_categories(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<RemoveCategoriesRequest>,
) -> Result<Json<Value>, ApiError> {
    if body.categories.is_empty() {
        return Err(ApiError::BadRequest(
            "categories must not be empty".to_string(),
        ));
    }
    let instance = instance_or_404(&state, id).await?;
    let client = state.clients.client_for(&instance);
    client.remove_categories(&body.categories.join("\n")).await?;
    Ok(Json(json!({ "success": true })))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/filters", get(filter_values))
        .route(
            "/instances/{id}/torrents",
            get(list_torrents).post(add_torrent),
        )
        .route("/instances/{id}/torrents/stats", get(torrent_stats))
        .route("/instances/{id}/torrents/resume", post(resume_torrents))
        .route("/instances/{id}/torrents/pause", post(pause_torrents))
        .route(
            "/instances/{id}/torrents/reannounce",
            post(reannounce_torrents),
        )
        .route("/instances/{id}/torrents/recheck", post(recheck_torrents))
        .route("/instances/{id}/torrents/delete", post(delete_torrents))
        .route("/instances/{id}/torrents/set-category", post(set_category))
        .route("/instances/{id}/torrents/set-tags", post(set_tags))
        .route(
            "/instances/{id}/torrents/{hash}/export",
            get(export_torrent),
        )
        .route(
            "/instances/{id}/torrents/{hash}/properties",
            get(torrent_properties),
        )
        .route(
            "/instances/{id}/torrents/{hash}/trackers",
            get(torrent_trackers),
        )
        .route("/instances/{id}/torrents/{hash}/peers", get(torrent_peers))
        .route("/instances/{id}/torrents/{hash}/files", get(torrent_files))
        .route(
            "/instances/{id}/torrents/{hash}/file-priority",
            post(set_file_priority),
        )
        .route("/instances/{id}/logs", get(instance_logs))
        .route("/instances/{id}/preferences", get(instance_preferences))
        .route(
            "/instances/{id}/categories",
            get(list_categories)
                .post(create_category)
                .put(edit_category),
        )
        .route(
            "/instances/{id}/categories/remove",
            post(remove_categories),
        )
}
