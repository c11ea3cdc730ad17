use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::aggregator::Ingester;
use crate::handler::{handle_client_stats, HandleError, HandleResponse};
use crate::info::Languages;

/// Header tracers use to announce their language.
pub const HEADER_META_LANG: &str = "Datadog-Meta-Lang";

const MAX_REQUEST_BODY: usize = 10 * 1024 * 1024;

/// Initialize the tracing subscriber.
/// Uses RUST_LOG env var for filtering (defaults to info).
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(true))
            .with(filter)
            .init();
    }
}

struct IntakeState {
    ingester: Ingester,
    languages: Languages,
}

pub fn build_router(ingester: Ingester, languages: Languages) -> Router {
    let state = Arc::new(IntakeState {
        ingester,
        languages,
    });
    Router::new()
        .route("/v0.1/pipeline_stats", post(handle_pipeline_stats_axum))
        .route("/health", get(|| async { "ok" }))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY))
        .with_state(state)
}

async fn handle_pipeline_stats_axum(
    State(state): State<Arc<IntakeState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<HandleResponse>, (StatusCode, String)> {
    let (is_gzipped, language) = parse_axum_headers(&headers);

    handle_client_stats(
        body,
        is_gzipped,
        language.as_deref(),
        &state.languages,
        &state.ingester,
    )
    .await
    .map(Json)
    .map_err(|e| {
        let status = match e {
            HandleError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_REQUEST,
        };
        (status, e.to_string())
    })
}

fn parse_axum_headers(headers: &HeaderMap) -> (bool, Option<String>) {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };
    let is_gzipped = header("content-encoding")
        .map(|v| v.eq_ignore_ascii_case("gzip"))
        .unwrap_or(false);
    (is_gzipped, header(HEADER_META_LANG))
}
