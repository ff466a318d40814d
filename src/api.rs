//! HTTP boundary
//!
//! Translates JSON requests into [`ProcedureRequest`] values and controller
//! results into JSON responses. Handlers never wait on a procedure: a start
//! answers `202 Accepted` as soon as the executor takes the run.
//!
//! | Route                   | Success                               | Failure          |
//! |-------------------------|---------------------------------------|------------------|
//! | `GET /`                 | 200 health                            |                  |
//! | `POST /start_procedure` | 202 `{status: "success", run_id}`     | 409, 422, 503    |
//! | `POST /stop_procedure`  | 200 `{status: "signaled"}` / `"not_running"` |           |
//! | `GET /status`           | 200 executor snapshot                 |                  |
//! | `POST /manual_control`  | 200                                   | 409, 502, 503    |
//! | `POST /program_control` | 200                                   | 409, 502, 503    |

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderValue, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ServerSettings;
use crate::controller::{Controller, StopOutcome};
use crate::error::{AppError, AppResult, ControlError, RejectionReason, RequestError};
use crate::hardware::ChannelSet;
use crate::procedures::{ConnectionState, ExecutorStatus, ProcedureRequest, ProcedureStep};

// =============================================================================
// Wire types
// =============================================================================

/// One step as sent by the front-end
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepBody {
    /// `HH:MM:SS`, `MM:SS` or seconds
    pub time: String,
    /// Percent; clamped into `0..=100`
    pub intensity: i64,
}

/// Body of `POST /start_procedure`, also the on-disk format for `uv_exposure run`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureBody {
    /// Executed in order
    pub steps: Vec<StepBody>,
    /// 1-based channel ids
    #[serde(default)]
    pub selected_channels: Vec<i64>,
}

impl ProcedureBody {
    /// Validate against a device with `channel_count` channels.
    pub fn into_request(self, channel_count: u8) -> Result<ProcedureRequest, RequestError> {
        let steps = self
            .steps
            .iter()
            .map(|step| ProcedureStep::parse(&step.time, step.intensity))
            .collect::<Result<Vec<_>, _>>()?;
        let channels = ChannelSet::within(&self.selected_channels, channel_count)?;
        ProcedureRequest::new(steps, channels)
    }
}

/// JSON body of every non-2xx response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    /// Machine-readable code, e.g. `already_running`
    pub status: String,
    /// Operator-facing description
    pub message: String,
}

impl ApiError {
    fn new(status: &str, message: impl Into<String>) -> Self {
        Self {
            status: status.to_string(),
            message: message.into(),
        }
    }
}

type ApiFailure = (StatusCode, Json<ApiError>);

#[derive(Debug, Serialize)]
struct Health {
    message: &'static str,
    connection: ConnectionState,
}

#[derive(Debug, Serialize)]
struct StartResponse {
    status: &'static str,
    run_id: Uuid,
}

#[derive(Debug, Serialize)]
struct StopResponse {
    status: StopOutcome,
}

#[derive(Debug, Serialize)]
struct ControlResponse {
    status: &'static str,
    message: &'static str,
}

// =============================================================================
// Router
// =============================================================================

#[derive(Clone)]
struct ApiState {
    controller: Arc<Controller>,
    channel_count: u8,
}

/// Build the application router.
///
/// Fails only if an entry in `allowed_origins` is not a valid header value.
pub fn build_router(
    controller: Arc<Controller>,
    server: &ServerSettings,
    channel_count: u8,
) -> AppResult<Router> {
    let state = ApiState {
        controller,
        channel_count,
    };
    Ok(Router::new()
        .route("/", get(health))
        .route("/start_procedure", post(start_procedure))
        .route("/stop_procedure", post(stop_procedure))
        .route("/status", get(status))
        .route("/manual_control", post(manual_control))
        .route("/program_control", post(program_control))
        .layer(build_cors_layer(server)?)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

fn build_cors_layer(server: &ServerSettings) -> AppResult<CorsLayer> {
    let cors = CorsLayer::new().allow_headers(Any).allow_methods(Any);

    if server.allowed_origins.is_empty() {
        warn!("server.allowed_origins is empty; browser requests will be blocked by CORS");
        return Ok(cors.allow_origin(AllowOrigin::list(Vec::<HeaderValue>::new())));
    }

    let origins = server
        .allowed_origins
        .iter()
        .map(|origin| HeaderValue::from_str(origin))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            AppError::Configuration(format!("Invalid origin in server.allowed_origins: {}", e))
        })?;
    Ok(cors.allow_origin(AllowOrigin::list(origins)))
}

// =============================================================================
// Handlers
// =============================================================================

async fn health(State(state): State<ApiState>) -> Json<Health> {
    Json(Health {
        message: "UV exposure controller",
        connection: state.controller.connection_status(),
    })
}

async fn start_procedure(
    State(state): State<ApiState>,
    Json(body): Json<ProcedureBody>,
) -> Result<(StatusCode, Json<StartResponse>), ApiFailure> {
    let request = body.into_request(state.channel_count).map_err(|e| {
        warn!(error = %e, "Invalid procedure request");
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ApiError::new("invalid_request", e.to_string())),
        )
    })?;

    let accepted = state
        .controller
        .start_procedure(request)
        .map_err(rejection)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(StartResponse {
            status: "success",
            run_id: accepted.run_id,
        }),
    ))
}

async fn stop_procedure(State(state): State<ApiState>) -> Json<StopResponse> {
    let outcome = state.controller.stop_procedure();
    info!(?outcome, "Stop endpoint called");
    Json(StopResponse { status: outcome })
}

async fn status(State(state): State<ApiState>) -> Json<ExecutorStatus> {
    Json(state.controller.status_snapshot())
}

async fn manual_control(
    State(state): State<ApiState>,
) -> Result<Json<ControlResponse>, ApiFailure> {
    state
        .controller
        .enable_manual_control()
        .await
        .map_err(control_failure)?;
    Ok(Json(ControlResponse {
        status: "success",
        message: "Manual control enabled",
    }))
}

async fn program_control(
    State(state): State<ApiState>,
) -> Result<Json<ControlResponse>, ApiFailure> {
    state
        .controller
        .enable_program_control()
        .await
        .map_err(control_failure)?;
    Ok(Json(ControlResponse {
        status: "success",
        message: "Program control enabled",
    }))
}

fn rejection(reason: RejectionReason) -> ApiFailure {
    let (code, status) = match reason {
        RejectionReason::AlreadyRunning => (StatusCode::CONFLICT, "already_running"),
        RejectionReason::SafeMode => (StatusCode::SERVICE_UNAVAILABLE, "safe_mode"),
        RejectionReason::ControlInProgress => (StatusCode::CONFLICT, "control_in_progress"),
    };
    (code, Json(ApiError::new(status, reason.to_string())))
}

fn control_failure(error: ControlError) -> ApiFailure {
    match error {
        ControlError::Rejected(reason) => rejection(reason),
        ControlError::Hardware(e) => {
            warn!(error = %e, "Control command failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(ApiError::new("hardware_error", e.to_string())),
            )
        }
    }
}
