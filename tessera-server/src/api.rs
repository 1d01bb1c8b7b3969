//! HTTP API endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tessera_core::core::{
    Crosstab, FlatRowSource, Flatten, Group, QueryContext, RequestOptions,
};
use tessera_core::db::wall_now;
use tessera_core::encoding::ByteMap;
use tessera_core::table::TableStats;
use tessera_core::Db;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state
pub type AppState = Arc<Db>;

/// Create the API router
pub fn create_router(db: Arc<Db>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/streams/:stream/points", post(insert_point))
        .route("/query", post(query))
        .route("/stats", get(all_stats))
        .route("/stats/:table", get(table_stats))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(db)
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn bad_request(msg: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse { error: msg.into() }),
    )
}

fn from_core_error(err: tessera_core::Error) -> ApiError {
    let status = match &err {
        tessera_core::Error::NotFound(_) => StatusCode::NOT_FOUND,
        tessera_core::Error::InvalidExpression(_) | tessera_core::Error::Config(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub now: i64,
}

#[derive(Debug, Deserialize)]
pub struct InsertRequest {
    /// Nanoseconds since the epoch; defaults to the current time
    pub ts: Option<i64>,
    #[serde(default)]
    pub dims: BTreeMap<String, String>,
    #[serde(default)]
    pub vals: BTreeMap<String, f64>,
}

#[derive(Debug, Serialize)]
pub struct InsertResponse {
    pub offset: String,
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub table: String,
    /// Dimensions to re-group rows onto; empty keeps the table's grouping
    #[serde(default)]
    pub group_by: Vec<String>,
    /// Pivot the `_crosstab` dimension into field suffixes
    #[serde(default)]
    pub crosstab: bool,
    #[serde(default = "default_include_memstore")]
    pub include_memstore: bool,
    pub timeout_secs: Option<u64>,
}

fn default_include_memstore() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub fields: Vec<String>,
    pub rows: Vec<QueryRow>,
    /// Set when the deadline cut the row stream short
    pub partial: bool,
}

#[derive(Debug, Serialize)]
pub struct QueryRow {
    pub ts: i64,
    pub dims: BTreeMap<String, String>,
    pub values: Vec<f64>,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health(State(db): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        now: db.now(),
    })
}

async fn insert_point(
    State(db): State<AppState>,
    Path(stream): Path<String>,
    Json(req): Json<InsertRequest>,
) -> Result<Json<InsertResponse>, ApiError> {
    if req.vals.is_empty() {
        return Err(bad_request("point carries no values"));
    }
    let ts = req.ts.unwrap_or_else(wall_now);
    let dims = ByteMap::of_strings(req.dims.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    let vals = ByteMap::of_floats(req.vals.iter().map(|(k, v)| (k.as_str(), *v)));

    let offset = db
        .insert(&stream, ts, &dims, &vals)
        .map_err(from_core_error)?;
    Ok(Json(InsertResponse {
        offset: offset.to_string(),
    }))
}

async fn query(
    State(db): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    // The pipeline blocks on table scans, so run it off the async runtime
    let result = tokio::task::spawn_blocking(move || run_query(&db, req))
        .await
        .map_err(|err| bad_request(format!("query task failed: {}", err)))?;
    result.map(Json).map_err(from_core_error)
}

fn run_query(db: &Db, req: QueryRequest) -> tessera_core::Result<QueryResponse> {
    let scan = db.table_source(&req.table)?;

    let grouped: Arc<dyn tessera_core::core::RowSource> = if req.group_by.is_empty() {
        scan
    } else {
        let mut group = Group::new(req.group_by.clone());
        group.connect(scan);
        Arc::new(group)
    };
    let flat: Arc<dyn FlatRowSource> = if req.crosstab {
        Arc::new(Crosstab::new(Arc::new(Flatten::new(grouped))))
    } else {
        Arc::new(Flatten::new(grouped))
    };

    let mut ctx = QueryContext {
        opts: RequestOptions {
            include_memstore: req.include_memstore,
            is_sub_query: false,
        },
        ..Default::default()
    };
    if let Some(secs) = req.timeout_secs {
        ctx.deadline = Some(std::time::Instant::now() + Duration::from_secs(secs));
    }

    let mut fields = Vec::new();
    let mut rows = Vec::new();
    let result = flat.iterate_flat(
        &ctx,
        &mut |announced| {
            fields = announced.iter().map(|f| f.name.clone()).collect();
            Ok(())
        },
        &mut |row| {
            rows.push(QueryRow {
                ts: row.ts,
                dims: row
                    .key
                    .iter()
                    .map(|(k, v)| {
                        (
                            k.to_string(),
                            String::from_utf8_lossy(v).into_owned(),
                        )
                    })
                    .collect(),
                values: row.values.clone(),
            });
            Ok(true)
        },
    );

    // A deadline mid-stream still returns what was produced
    let partial = match result {
        Ok(()) => false,
        Err(err) if err.is_deadline() => true,
        Err(err) => return Err(err),
    };

    Ok(QueryResponse {
        fields,
        rows,
        partial,
    })
}

async fn all_stats(State(db): State<AppState>) -> Json<BTreeMap<String, TableStats>> {
    Json(db.all_table_stats().into_iter().collect())
}

async fn table_stats(
    State(db): State<AppState>,
    Path(table): Path<String>,
) -> Result<Json<TableStats>, ApiError> {
    db.get_table(&table)
        .map(|t| Json(t.stats()))
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    error: format!("table '{}' not found", table),
                }),
            )
        })
}
