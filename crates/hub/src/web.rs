use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::controller::{ControllerHandle, Request, RequestError};
use crate::emitter::Command;
use crate::schedule::{ScheduleConfig, ScheduleError, SlotParseError, SlotTime};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

enum ApiError {
    /// Manual controls are disabled while the tank is offline.
    Offline,
    BadCommand(String),
    InvalidSlot(SlotParseError),
    Request(RequestError),
}

impl From<RequestError> for ApiError {
    fn from(err: RequestError) -> Self {
        Self::Request(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Offline => (StatusCode::CONFLICT, "tank is offline".to_string()),
            Self::BadCommand(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::InvalidSlot(err) => (StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
            Self::Request(RequestError::Schedule(
                err @ (ScheduleError::NoSlots | ScheduleError::TooManySlots(_)),
            )) => (StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
            Self::Request(RequestError::Unavailable) => (
                StatusCode::SERVICE_UNAVAILABLE,
                RequestError::Unavailable.to_string(),
            ),
            Self::Request(err @ RequestError::Emit(_)) => {
                error!("manual command failed: {err}");
                (StatusCode::BAD_GATEWAY, err.to_string())
            }
            Self::Request(err) => {
                error!("request failed: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        (status, Json(ErrorBody { error: message })).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct EnabledBody {
    enabled: bool,
}

#[derive(Deserialize)]
struct SlotsBody {
    feed_times: Vec<String>,
}

#[derive(Serialize)]
struct CommandAccepted {
    sent: Command,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(handle: ControllerHandle) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/command/{name}", post(api_command))
        .route("/api/schedule/enabled", put(api_set_enabled))
        .route("/api/schedule/slots", put(api_set_slots))
        .route("/api/schedule/reset", post(api_reset_history))
        .with_state(handle)
}

async fn api_status(State(handle): State<ControllerHandle>) -> impl IntoResponse {
    Json(handle.snapshot())
}

async fn api_command(
    State(handle): State<ControllerHandle>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let command: Command = name
        .parse()
        .map_err(|e| ApiError::BadCommand(format!("{e}")))?;
    if !command.is_manual() {
        return Err(ApiError::BadCommand(format!(
            "{command} is reserved for the scheduler"
        )));
    }
    if !handle.snapshot().online {
        return Err(ApiError::Offline);
    }

    handle.request(Request::Command(command)).await?;
    Ok((StatusCode::ACCEPTED, Json(CommandAccepted { sent: command })))
}

async fn api_set_enabled(
    State(handle): State<ControllerHandle>,
    Json(body): Json<EnabledBody>,
) -> Result<Json<ScheduleConfig>, ApiError> {
    handle.request(Request::SetEnabled(body.enabled)).await?;
    Ok(Json(handle.snapshot().schedule))
}

async fn api_set_slots(
    State(handle): State<ControllerHandle>,
    Json(body): Json<SlotsBody>,
) -> Result<Json<ScheduleConfig>, ApiError> {
    let slots = body
        .feed_times
        .iter()
        .map(|s| s.parse::<SlotTime>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(ApiError::InvalidSlot)?;

    handle.request(Request::SetSlots(slots)).await?;
    Ok(Json(handle.snapshot().schedule))
}

async fn api_reset_history(
    State(handle): State<ControllerHandle>,
) -> Result<Json<ScheduleConfig>, ApiError> {
    handle.request(Request::ResetHistory).await?;
    Ok(Json(handle.snapshot().schedule))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(handle: ControllerHandle, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "status api listening");

    axum::serve(listener, router(handle))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
