//! HTTP surface for the voxd data server.
//!
//! This is the leaf crate that wires everything together: it loads the
//! declarative config, opens the storage backend, restores the repo
//! manager, and serves the `/api` routes. Layer order, outermost first:
//! request-id stamping, trace logging, panic recovery, CORS (which also
//! answers preflight OPTIONS). `/api/load` is mounted outside the trace
//! layer so polling it does not flood the logs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::http::StatusCode;
use axum::middleware;
use axum::routing::{any, delete, get, post};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

pub mod config;
pub mod routes;
pub mod state;

pub use config::Config;
pub use state::AppState;

/// Build the full `/api` router.
///
/// In read-only mode the `POST /api/repos` route is not registered at all;
/// every other mutation under `/api/repo` and `/api/node` is refused by the
/// resolution middleware.
pub fn build_app(state: Arc<AppState>) -> Router {
    let versioned = Router::new()
        .route("/api/repo/{uuid}/info", get(routes::repo_info))
        .route("/api/repo/{uuid}/instance", post(routes::repo_new_instance))
        .route("/api/repo/{uuid}/lock", post(routes::repo_lock))
        .route("/api/repo/{uuid}/branch", post(routes::repo_branch))
        .route("/api/repo/{uuid}/{dataname}", delete(routes::repo_delete))
        .route("/api/node/{uuid}/{dataname}/{*rest}", any(routes::node))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            routes::version_selector,
        ));

    let mut api = Router::new()
        .route("/api/help", get(routes::help))
        .route("/api/help/{typename}", get(routes::type_help))
        .route("/api/server/info", get(routes::server_info))
        .route("/api/server/types", get(routes::server_types))
        .route("/api/repos/info", get(routes::repos_info))
        .merge(versioned);
    if !state.readonly {
        api = api.route("/api/repos", post(routes::repos_post));
    }

    let api = api
        .layer(middleware::from_fn_with_state(
            state.clone(),
            routes::timing_allow,
        ))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            routes::track_tasks,
        ));

    // The load route stays outside the trace/request-id stack.
    Router::new()
        .route("/api/load", get(routes::load))
        .merge(api)
        .with_state(state)
}

/// Convert a handler panic into a 500 without taking the server down.
fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> axum::http::Response<axum::body::Body> {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic payload".to_string()
    };
    tracing::error!(panic = %detail, "handler panicked");
    let body = serde_json::json!({
        "error": format!("internal error: {}", detail),
        "kind": "Panic",
    });
    axum::http::Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(axum::http::header::CONTENT_TYPE, "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .expect("static response parts")
}

/// Open the backend, restore state, and serve HTTP until Ctrl-C.
pub async fn serve(config: Config, readonly: bool) -> Result<()> {
    let state = AppState::init(&config, readonly)?;
    let app = build_app(state.clone());

    // Fold raw storage counters into per-second rates for /api/load.
    let stats = state.stats.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            stats.sample();
        }
    });

    let address = config.server.http_address.clone();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .map_err(|e| anyhow::anyhow!("cannot bind HTTP address {}: {}", address, e))?;

    let mode = if readonly { " (read-only mode)" } else { "" };
    tracing::info!("web server listening at {}{}", address, mode);
    tracing::info!(
        host = %config.server.host,
        rpc_address = %config.server.rpc_address,
        backends = ?state.backend.descriptions(),
        "voxd ready"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("graceful shutdown initiated");
        })
        .await?;
    Ok(())
}
