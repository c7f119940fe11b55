//! JSON query surface over the unified viz table and the per-source record tables.

mod options;
mod query;
mod store;

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use swm_core::{DimensionRow, FilterQuery, Selector, WeightColumn};
use swm_sync::{SyncConfig, SyncPipeline};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{error, info};

pub use options::{
    agency_options, cluster_options, display_label, options_for, resolve_selection, site_options, FilterSelection,
    OptionItem, SelectionOptions,
};
pub use query::{aggregate, breakdown, matches, query, Aggregates, BreakdownRow, Dimension, QueryResult};
pub use store::{DashboardStore, StoreCounts};

pub const CRATE_NAME: &str = "swm-web";

const DEFAULT_ROW_LIMIT: usize = 500;

pub struct AppState {
    pub store: RwLock<DashboardStore>,
}

impl AppState {
    pub fn new(store: DashboardStore) -> Self {
        Self {
            store: RwLock::new(store),
        }
    }
}

/// Which table a request reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dataset {
    #[default]
    Viz,
    Records,
}

#[derive(Debug, Deserialize, Default)]
struct FilterParams {
    agency: Option<String>,
    cluster: Option<String>,
    site: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
    dataset: Option<Dataset>,
    weight: Option<WeightColumn>,
    limit: Option<usize>,
    group_by: Option<Dimension>,
}

fn parse_bound(name: &str, raw: Option<&str>) -> Result<Option<NaiveDate>, String> {
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => NaiveDate::parse_from_str(v, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| format!("{name} must be YYYY-MM-DD, got {v:?}")),
    }
}

impl FilterParams {
    fn filter(&self) -> Result<FilterQuery, String> {
        let start = parse_bound("start_date", self.start_date.as_deref())?;
        let end = parse_bound("end_date", self.end_date.as_deref())?;
        Ok(FilterQuery {
            agency: Selector::parse(self.agency.as_deref()),
            cluster: Selector::parse(self.cluster.as_deref()),
            site: Selector::parse(self.site.as_deref()),
            start_date: start,
            end_date: end,
        })
    }

    fn dataset(&self) -> Dataset {
        self.dataset.unwrap_or_default()
    }

    fn weight(&self) -> WeightColumn {
        self.weight.unwrap_or_default()
    }
}

#[derive(Debug, Deserialize, Default)]
struct SelectionParams {
    agency: Option<String>,
    cluster: Option<String>,
    site: Option<String>,
    changed: Option<Dimension>,
    dataset: Option<Dataset>,
}

#[derive(Debug, Serialize)]
struct QueryResponse {
    dataset: Dataset,
    weight_column: &'static str,
    #[serde(flatten)]
    aggregates: Aggregates,
    returned_rows: usize,
    rows: Vec<serde_json::Value>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/query", get(query_handler))
        .route("/api/breakdown", get(breakdown_handler))
        .route("/api/options/agencies", get(agency_options_handler))
        .route("/api/options/clusters", get(cluster_options_handler))
        .route("/api/options/sites", get(site_options_handler))
        .route("/api/selection", get(selection_handler))
        .route("/api/refresh", post(refresh_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "dashboard api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("SWM_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8050);
    let pipeline = Arc::new(SyncPipeline::new(SyncConfig::from_env())?);
    let store = DashboardStore::load(pipeline).await?;
    serve(AppState::new(store), port).await
}

async fn healthz_handler(State(state): State<Arc<AppState>>) -> Response {
    let counts = state.store.read().await.counts();
    Json(json!({
        "status": "ok",
        "viz_rows": counts.viz_rows,
        "record_rows": counts.record_rows,
    }))
    .into_response()
}

fn query_response<R: DimensionRow + Serialize>(
    rows: &[R],
    filter: &FilterQuery,
    params: &FilterParams,
) -> anyhow::Result<QueryResponse> {
    let result = query(rows, filter, params.weight());
    let limit = params.limit.unwrap_or(DEFAULT_ROW_LIMIT);
    let rows = result
        .rows
        .iter()
        .take(limit)
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()
        .context("serializing query rows")?;
    Ok(QueryResponse {
        dataset: params.dataset(),
        weight_column: params.weight().column_name(),
        aggregates: result.aggregates,
        returned_rows: rows.len(),
        rows,
    })
}

async fn query_handler(State(state): State<Arc<AppState>>, Query(params): Query<FilterParams>) -> Response {
    let filter = match params.filter() {
        Ok(filter) => filter,
        Err(message) => return bad_request(message),
    };
    let store = state.store.read().await;
    let response = match params.dataset() {
        Dataset::Viz => query_response(store.viz(), &filter, &params),
        Dataset::Records => query_response(store.records(), &filter, &params),
    };
    match response {
        Ok(body) => Json(body).into_response(),
        Err(err) => server_error(err),
    }
}

async fn breakdown_handler(State(state): State<Arc<AppState>>, Query(params): Query<FilterParams>) -> Response {
    let filter = match params.filter() {
        Ok(filter) => filter,
        Err(message) => return bad_request(message),
    };
    let group_by = params.group_by.unwrap_or_default();
    let store = state.store.read().await;
    let groups = match params.dataset() {
        Dataset::Viz => breakdown(store.viz(), &filter, params.weight(), group_by),
        Dataset::Records => breakdown(store.records(), &filter, params.weight(), group_by),
    };
    Json(groups).into_response()
}

async fn agency_options_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SelectionParams>,
) -> Response {
    let store = state.store.read().await;
    let options = match params.dataset.unwrap_or_default() {
        Dataset::Viz => agency_options(store.viz()),
        Dataset::Records => agency_options(store.records()),
    };
    Json(options).into_response()
}

async fn cluster_options_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SelectionParams>,
) -> Response {
    let agency = Selector::parse(params.agency.as_deref());
    let store = state.store.read().await;
    let options = match params.dataset.unwrap_or_default() {
        Dataset::Viz => cluster_options(store.viz(), &agency),
        Dataset::Records => cluster_options(store.records(), &agency),
    };
    Json(options).into_response()
}

async fn site_options_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SelectionParams>,
) -> Response {
    let cluster = Selector::parse(params.cluster.as_deref());
    let store = state.store.read().await;
    let options = match params.dataset.unwrap_or_default() {
        Dataset::Viz => site_options(store.viz(), &cluster),
        Dataset::Records => site_options(store.records(), &cluster),
    };
    Json(options).into_response()
}

async fn selection_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SelectionParams>,
) -> Response {
    let mut selection = FilterSelection {
        agency: Selector::parse(params.agency.as_deref()),
        cluster: Selector::parse(params.cluster.as_deref()),
        site: Selector::parse(params.site.as_deref()),
    };
    if let Some(changed) = params.changed {
        selection = selection.reset_below(changed);
    }
    let store = state.store.read().await;
    let resolved = match params.dataset.unwrap_or_default() {
        Dataset::Viz => resolve_selection(store.viz(), selection),
        Dataset::Records => resolve_selection(store.records(), selection),
    };
    Json(resolved).into_response()
}

/// Reloads outside the lock; queries keep reading the old rows until the swap.
async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    let current = state.store.read().await.pipeline();
    let Some(pipeline) = current else {
        return Json(state.store.read().await.counts()).into_response();
    };
    match DashboardStore::load(pipeline).await {
        Ok(fresh) => {
            let counts = fresh.counts();
            *state.store.write().await = fresh;
            Json(counts).into_response()
        }
        Err(err) => server_error(err),
    }
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!("request failed: {err:#}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}
