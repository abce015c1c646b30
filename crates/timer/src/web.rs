use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tokio::net::TcpListener;

use crate::db::{Db, DeviceRecord, HistoryEvent, ScheduleRow};
use crate::state::SharedState;

/// Stored schedule rows returned per device by `/data`.
const SCHEDULE_ROWS: i64 = 50;

#[derive(Clone)]
pub struct AppState {
    pub status: SharedState,
    pub db: Db,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/data", get(data))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.status.read().await;
    Json(st.to_status())
}

#[derive(Deserialize)]
struct DataQuery {
    /// Only history after this unix timestamp.
    #[serde(default)]
    since: i64,
}

#[derive(Serialize)]
struct DataResponse {
    devices: BTreeMap<i64, DeviceData>,
}

#[derive(Serialize)]
struct DeviceData {
    #[serde(flatten)]
    record: DeviceRecord,
    history: Vec<HistoryEvent>,
    schedule: Vec<ScheduleRow>,
}

async fn data(
    State(state): State<AppState>,
    Query(q): Query<DataQuery>,
) -> Result<Json<DataResponse>, (StatusCode, String)> {
    collect_data(&state.db, q.since).await.map(Json).map_err(|e| {
        tracing::warn!(error = %e, "failed to read /data");
        (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
    })
}

async fn collect_data(db: &Db, since: i64) -> anyhow::Result<DataResponse> {
    let mut devices = BTreeMap::new();
    for record in db.list_devices().await? {
        let history = db.history(record.device_id, since).await?;
        let schedule = db.latest_schedule(record.device_id, SCHEDULE_ROWS).await?;
        devices.insert(
            record.device_id,
            DeviceData {
                record,
                history,
                schedule,
            },
        );
    }
    Ok(DataResponse { devices })
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(%addr, "status api listening");

    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
