//! Route handlers and middleware for the `/api` surface.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{Html, IntoResponse, Response};
use axum::{Extension, Json};

use voxd_db::{DataConfig, DataContext, DataRequest, Error, ResolvedVersion};

use crate::state::AppState;

// ============================================================================
// Error mapping
// ============================================================================

/// Adapter mapping [`voxd_db::Error`] kinds onto HTTP statuses in one place.
/// Bodies are JSON with a stable machine-readable `kind`, so e.g. read-only
/// refusals are programmatically recognizable.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::BatcherUnsupported(_)
            | Error::EngineNotOrdered(_)
            | Error::Cancelled
            | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        if status.is_server_error() {
            tracing::error!(kind = self.0.kind(), error = %self.0, "request failed");
        } else {
            tracing::debug!(kind = self.0.kind(), error = %self.0, "request refused");
        }
        let body = Json(serde_json::json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Middleware
// ============================================================================

/// Counts in-flight requests for `/api/load`.
pub async fn track_tasks(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let _guard = state.stats.task_guard();
    next.run(req).await
}

/// Adds `Timing-Allow-Origin: *` when enabled in the config.
pub async fn timing_allow(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    if state.allow_timing {
        response
            .headers_mut()
            .insert("Timing-Allow-Origin", HeaderValue::from_static("*"));
    }
    response
}

/// Resolves the `{uuid}` path segment (which may be a prefix) before the
/// handler runs and attaches the result as a request extension. Also
/// enforces the read-only mode for every route underneath it.
pub async fn version_selector(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    if state.readonly && req.method() != Method::GET && req.method() != Method::HEAD {
        return ApiError(Error::ReadOnly).into_response();
    }

    // Both /api/repo/{uuid}/... and /api/node/{uuid}/... carry the UUID as
    // the third path segment.
    let uuid_param = req
        .uri()
        .path()
        .trim_start_matches('/')
        .split('/')
        .nth(2)
        .unwrap_or("")
        .to_string();
    match state.manager.matching_uuid(&uuid_param) {
        Ok(resolved) => {
            req.extensions_mut().insert(resolved);
            next.run(req).await
        }
        Err(err) => ApiError(err).into_response(),
    }
}

// ============================================================================
// Server-level handlers
// ============================================================================

pub async fn help(State(state): State<Arc<AppState>>) -> Html<String> {
    let mut list = String::new();
    for service in state.registry.services() {
        let name = service.info.name;
        list.push_str(&format!(
            "<li><a href='/api/help/{name}'>{name}</a></li>\n"
        ));
    }
    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset='utf-8'/><title>voxd server</title></head>
<body>
<h2>voxd server on {host}</h2>
<p>Versioned volumetric data server. Repos hold a DAG of version nodes;
data instances are addressed as /api/node/&lt;UUID&gt;/&lt;data name&gt;/...</p>
<h3>General endpoints</h3>
<pre>
 GET  /api/help                   this page
 GET  /api/help/{{typename}}        help for one data type
 GET  /api/load                   runtime load counters
 GET  /api/server/info            server properties
 GET  /api/server/types           compiled-in data types
 POST /api/repos                  create a repo
 GET  /api/repos/info             all repos
 GET  /api/repo/{{uuid}}/info       one repo
 POST /api/repo/{{uuid}}/instance   create a data instance
 POST /api/repo/{{uuid}}/lock       lock a version node
 POST /api/repo/{{uuid}}/branch     branch a locked version node
 DEL  /api/repo/{{uuid}}/{{dataname}} delete a data instance
</pre>
<h3>Data types</h3>
<ul>
{list}</ul>
</body>
</html>
"#,
        host = state.host,
        list = list,
    ))
}

pub async fn type_help(
    State(state): State<Arc<AppState>>,
    Path(typename): Path<String>,
) -> ApiResult<Response> {
    let service = state.registry.get(&typename)?;
    Ok(service.help.into_response())
}

pub async fn load(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(state.stats.report())
}

pub async fn server_info(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let types: Vec<&str> = state.registry.services().map(|s| s.info.name).collect();
    Json(serde_json::json!({
        "Host": state.host,
        "Server version": env!("CARGO_PKG_VERSION"),
        "Mode": if state.readonly { "read-only" } else { "read-write" },
        "Storage backends": state.backend.descriptions(),
        "Datatypes": types,
    }))
}

pub async fn server_types(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(state.registry.types_json())
}

pub async fn repos_info(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(state.manager.repos_json())
}

pub async fn repos_post(State(state): State<Arc<AppState>>) -> ApiResult<Json<serde_json::Value>> {
    let root = state.manager.new_repo()?;
    Ok(Json(serde_json::json!({ "Root": root })))
}

// ============================================================================
// Repo-level handlers
// ============================================================================

pub async fn repo_info(
    State(state): State<Arc<AppState>>,
    Extension(resolved): Extension<ResolvedVersion>,
) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(state.manager.repo_json(resolved.repo)?))
}

pub async fn repo_new_instance(
    State(state): State<Arc<AppState>>,
    Extension(resolved): Extension<ResolvedVersion>,
    body: Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    let config = DataConfig::from_json(&body)?;
    let name = state.manager.new_data(
        &state.registry,
        &resolved.uuid,
        &config,
        state.backend.mutable(),
    )?;
    Ok(Json(serde_json::json!({
        "result": format!("added data instance {:?} to node {}", name, resolved.uuid),
    })))
}

pub async fn repo_lock(
    State(state): State<Arc<AppState>>,
    Extension(resolved): Extension<ResolvedVersion>,
) -> ApiResult<Json<serde_json::Value>> {
    state.manager.lock(&resolved.uuid)?;
    Ok(Json(serde_json::json!({
        "result": format!("locked node {}", resolved.uuid),
    })))
}

pub async fn repo_branch(
    State(state): State<Arc<AppState>>,
    Extension(resolved): Extension<ResolvedVersion>,
) -> ApiResult<Json<serde_json::Value>> {
    let child = state.manager.new_version(&resolved.uuid)?;
    Ok(Json(serde_json::json!({ "Child": child })))
}

pub async fn repo_delete(
    State(state): State<Arc<AppState>>,
    Extension(resolved): Extension<ResolvedVersion>,
    Path((_uuid, dataname)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    state
        .manager
        .delete_data(resolved.repo, &dataname, &state.backend)?;
    Ok(Json(serde_json::json!({
        "result": format!("deleted data instance {:?} from repo {}", dataname, resolved.uuid),
    })))
}

// ============================================================================
// Node dispatch
// ============================================================================

/// `/api/node/{uuid}/{dataname}/{endpoint...}`: look up the instance, gate
/// mutations on the node's lock state, build the storage context, and hand
/// off to the data type's handler.
pub async fn node(
    State(state): State<Arc<AppState>>,
    Extension(resolved): Extension<ResolvedVersion>,
    Path((_uuid, dataname, rest)): Path<(String, String, String)>,
    Query(query): Query<HashMap<String, String>>,
    method: Method,
    body: Bytes,
) -> ApiResult<Response> {
    let data = state.manager.get_data(resolved.repo, &dataname)?;

    let mutating = method != Method::GET && method != Method::HEAD;
    if mutating && state.manager.is_locked(&resolved.uuid)? {
        return Err(Error::VersionLocked(resolved.uuid.clone()).into());
    }

    let _handler = state.stats.handler_guard();
    let ctx = DataContext::new(data.instance_id(), resolved.version);
    let endpoint = rest.split('/').next().unwrap_or("");
    let request = DataRequest {
        method: method.as_str(),
        endpoint,
        query: &query,
        body: &body,
    };
    let response = data.handle(state.backend.mutable(), &state.manager, &ctx, request)?;
    Ok((
        [(axum::http::header::CONTENT_TYPE, response.content_type)],
        response.body,
    )
        .into_response())
}
