use axum::http::{HeaderValue, StatusCode};
use axum::{
    extract::{DefaultBodyLimit, State},
    routing::{get, post},
    Json, Router,
};
use diesel::RunQueryDsl;
use serde_json::json;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::state::AppState;

pub mod borrowers;
pub mod documents;
pub mod tasks;

/// Liveness: the process is only useful if it can reach its database, so
/// the probe checks out a connection and runs a trivial statement.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let pool = state.pool.clone();
    let database_ok = tokio::task::spawn_blocking(move || {
        pool.get()
            .map_err(|_| ())
            .and_then(|mut conn| diesel::sql_query("SELECT 1").execute(&mut conn).map_err(|_| ()))
            .is_ok()
    })
    .await
    .unwrap_or(false);

    if database_ok {
        (StatusCode::OK, Json(json!({ "status": "ok" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "database": "unreachable" })),
        )
    }
}

pub fn create_router(state: AppState) -> Router<()> {
    let cors = if let Some(origins) = state.config.cors_allowed_origin.as_ref() {
        let headers: Vec<HeaderValue> = origins
            .split(',')
            .filter_map(|value| {
                let trimmed = value.trim();
                (!trimmed.is_empty()).then(|| {
                    trimmed
                        .parse::<HeaderValue>()
                        .expect("invalid CORS allowed origin")
                })
            })
            .collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(headers))
            .allow_methods(tower_http::cors::AllowMethods::mirror_request())
            .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::mirror_request())
            .allow_methods(tower_http::cors::AllowMethods::mirror_request())
            .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
    };

    let documents_routes = Router::new()
        .route(
            "/",
            get(documents::list_documents).post(documents::upload_document),
        )
        .route(
            "/:id",
            get(documents::get_document).delete(documents::delete_document),
        );

    let borrowers_routes = Router::new()
        .route("/", get(borrowers::list_borrowers))
        .route("/:id", get(borrowers::get_borrower));

    let tasks_routes = Router::new().route("/process-document", post(tasks::process_document));

    Router::new()
        .nest("/api/documents", documents_routes)
        .nest("/api/borrowers", borrowers_routes)
        .nest("/api/tasks", tasks_routes)
        .route("/api/health", get(health_check))
        .with_state(state)
        .layer(cors)
        .layer(DefaultBodyLimit::max(1024 * 1024 * 64))
}
