//! Administrative HTTP API.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tracing::error;

use sensorhub_core::SystemClock;

use crate::store::Store;

/// Local time reported before this point is considered unset and surfaces
/// as `-1`. Corresponds to 2024/12/03.
pub const TIME_START_POINT: i64 = 1_733_215_816;

/// State shared by the admin handlers.
pub struct AppState {
    /// Device inventory, decorated with awake/monitor layers.
    pub store: Arc<dyn Store>,
    /// Local system clock exposed over `/api/v1/system/time`.
    pub clock: Arc<dyn SystemClock>,
    /// Timestamps before this UNIX second read back as `-1`.
    pub time_start_point: i64,
}

/// Build the admin API router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/device/add", get(handle_add))
        .route("/api/v1/device/remove", get(handle_remove))
        .route("/api/v1/device/list", get(handle_list))
        .route("/api/v1/system/time", get(handle_system_time))
        .with_state(state)
}

type Params = Query<HashMap<String, String>>;

fn require<'a>(params: &'a HashMap<String, String>, name: &str) -> Result<&'a str, Response> {
    match params.get(name).map(String::as_str) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err((
            StatusCode::BAD_REQUEST,
            format!("error: missed `{name}` query parameter"),
        )
            .into_response()),
    }
}

async fn handle_add(State(state): State<Arc<AppState>>, Query(params): Params) -> Response {
    let uri = match require(&params, "uri") {
        Ok(uri) => uri,
        Err(response) => return response,
    };
    let desc = match require(&params, "desc") {
        Ok(desc) => desc,
        Err(response) => return response,
    };
    let kind = match require(&params, "type") {
        Ok(kind) => kind,
        Err(response) => return response,
    };

    if let Err(err) = state.store.add(uri, kind, desc).await {
        return (
            StatusCode::BAD_REQUEST,
            format!("error: failed to add device with uri={uri}: {err}"),
        )
            .into_response();
    }

    "OK".into_response()
}

async fn handle_remove(State(state): State<Arc<AppState>>, Query(params): Params) -> Response {
    let uri = match require(&params, "uri") {
        Ok(uri) => uri,
        Err(response) => return response,
    };

    if let Err(err) = state.store.remove(uri).await {
        return (
            StatusCode::BAD_REQUEST,
            format!("error: failed to remove device with uri={uri}: {err}"),
        )
            .into_response();
    }

    "OK".into_response()
}

async fn handle_list(State(state): State<Arc<AppState>>) -> Response {
    let records = state.store.get_desc().await;

    match serde_json::to_vec(&records) {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "application/json")],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(%err, "failed to format device list");

            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("error: failed to format JSON: {err}"),
            )
                .into_response()
        }
    }
}

async fn handle_system_time(State(state): State<Arc<AppState>>, Query(params): Params) -> Response {
    match params.get("timestamp") {
        None => match state.clock.get_timestamp().await {
            Ok(timestamp) => {
                let timestamp = if timestamp < state.time_start_point {
                    -1
                } else {
                    timestamp
                };

                timestamp.to_string().into_response()
            }
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to get UNIX time: {err}"),
            )
                .into_response(),
        },
        Some(raw) => {
            let timestamp: i64 = match raw.parse() {
                Ok(timestamp) => timestamp,
                Err(err) => {
                    return (StatusCode::BAD_REQUEST, format!("{err}")).into_response();
                }
            };

            match state.clock.set_timestamp(timestamp).await {
                Ok(()) => "OK".into_response(),
                Err(err) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("failed to set UNIX time: {err}"),
                )
                    .into_response(),
            }
        }
    }
}
