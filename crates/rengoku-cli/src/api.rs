use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use rengoku::{Error, ProcessStatus, Supervisor};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

#[derive(Clone)]
pub struct AppState {
	pub supervisor: Arc<Supervisor>,
}

pub fn router(supervisor: Arc<Supervisor>) -> Router {
	let state = AppState { supervisor };

	Router::new()
		.route("/status", get(status))
		.route("/status/pid/{pid}", get(status_by_pid))
		.route("/processes/{name}/start", post(start_process))
		.route("/processes/{name}/stop", post(stop_process))
		.route("/processes/{name}/restart", post(restart_process))
		.layer(CorsLayer::permissive())
		.with_state(state)
}

#[derive(Serialize)]
struct StatusResponse {
	status: Vec<ProcessStatus>,
}

#[derive(Serialize)]
struct ActionResponse {
	message: String,
}

#[derive(Serialize)]
struct ErrorResponse {
	error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
	Json(StatusResponse {
		status: state.supervisor.status(None),
	})
}

async fn status_by_pid(State(state): State<AppState>, Path(pid): Path<u32>) -> Json<StatusResponse> {
	Json(StatusResponse {
		status: state.supervisor.status(Some(pid)),
	})
}

#[derive(Clone, Copy)]
enum Action {
	Start,
	Stop,
	Restart,
}

impl Action {
	fn past_tense(self) -> &'static str {
		match self {
			Action::Start => "started",
			Action::Stop => "stopped",
			Action::Restart => "restarted",
		}
	}
}

async fn start_process(State(state): State<AppState>, Path(name): Path<String>) -> Result<Json<ActionResponse>, ApiError> {
	control(state, name, Action::Start).await
}

async fn stop_process(State(state): State<AppState>, Path(name): Path<String>) -> Result<Json<ActionResponse>, ApiError> {
	control(state, name, Action::Stop).await
}

async fn restart_process(State(state): State<AppState>, Path(name): Path<String>) -> Result<Json<ActionResponse>, ApiError> {
	control(state, name, Action::Restart).await
}

// stopping reaps the child, so keep it off the async workers
async fn control(state: AppState, name: String, action: Action) -> Result<Json<ActionResponse>, ApiError> {
	let sup = Arc::clone(&state.supervisor);
	let target = name.clone();
	let result = tokio::task::spawn_blocking(move || match action {
		Action::Start => sup.start_process(&target),
		Action::Stop => sup.stop_process(&target),
		Action::Restart => sup.restart_process(&target),
	})
	.await
	.map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

	match result {
		Ok(()) => Ok(Json(ActionResponse {
			message: format!("{}: {}", name, action.past_tense()),
		})),
		Err(e @ Error::UnknownProcess(_)) => Err(error_response(StatusCode::NOT_FOUND, e.to_string())),
		Err(e) => Err(error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())),
	}
}

fn error_response(code: StatusCode, error: String) -> ApiError {
	(code, Json(ErrorResponse { error }))
}
