use std::convert::Infallible;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::Json,
    routing::{get, post},
    Router,
};
use futures_util::{Stream, StreamExt};
use serde::{Serialize, Deserialize};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::manager::{ActionKind, SessionManager, SessionQueryError, SessionView, ValidationError};

#[derive(Clone)]
pub struct AppState {
    pub manager: SessionManager,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateChallengeRequest {
    pub server_id: Uuid,
    pub problem_id: String,
    pub participants: Vec<Uuid>,
    pub length_minutes: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateChallengeResponse {
    pub challenge_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActionBody {
    pub participant_id: Uuid,
    pub action: ActionKind,
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorResponse {
    error: String,
}

pub fn router(manager: SessionManager) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/challenges", post(create_challenge).get(list_challenges))
        .route("/challenges/{challenge_id}", get(get_challenge))
        .route("/challenges/{challenge_id}/actions", post(submit_action))
        .route("/challenges/{challenge_id}/events", get(challenge_events))
        .layer(CorsLayer::permissive())
        .with_state(AppState { manager })
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "Gauntlet Challenge Server",
        "endpoints": {
            "create_challenge": "POST /challenges",
            "list_challenges": "GET /challenges",
            "get_challenge": "GET /challenges/{challenge_id}",
            "submit_action": "POST /challenges/{challenge_id}/actions",
            "challenge_events": "GET /challenges/{challenge_id}/events"
        }
    }))
}

fn validation_status(err: &ValidationError) -> StatusCode {
    match err {
        ValidationError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    }
}

fn query_error_status(err: &SessionQueryError) -> StatusCode {
    match err {
        SessionQueryError::SessionNotFound => StatusCode::NOT_FOUND,
        SessionQueryError::LockError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn create_challenge(
    State(state): State<AppState>,
    Json(request): Json<CreateChallengeRequest>,
) -> Result<Json<CreateChallengeResponse>, (StatusCode, Json<ErrorResponse>)> {
    state
        .manager
        .start_challenge(
            request.server_id,
            &request.problem_id,
            &request.participants,
            request.length_minutes,
        )
        .map(|(challenge_id, _events)| Json(CreateChallengeResponse { challenge_id }))
        .map_err(|e| {
            (
                validation_status(&e),
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
        })
}

async fn list_challenges(State(state): State<AppState>) -> Json<Vec<Uuid>> {
    Json(state.manager.list_sessions())
}

async fn get_challenge(
    State(state): State<AppState>,
    Path(challenge_id): Path<Uuid>,
) -> Result<Json<SessionView>, (StatusCode, Json<ErrorResponse>)> {
    state.manager.session_view(challenge_id).map(Json).map_err(|e| {
        (
            query_error_status(&e),
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
    })
}

async fn submit_action(
    State(state): State<AppState>,
    Path(challenge_id): Path<Uuid>,
    Json(body): Json<ActionBody>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    state
        .manager
        .submit_action(challenge_id, body.participant_id, body.action)
        .map(|_| Json(serde_json::json!({ "success": true })))
        .map_err(|e| {
            (
                query_error_status(&e),
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
        })
}

async fn challenge_events(
    State(state): State<AppState>,
    Path(challenge_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, Json<ErrorResponse>)> {
    let rx = state.manager.subscribe(challenge_id).map_err(|e| {
        (
            query_error_status(&e),
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
    })?;

    let stream = BroadcastStream::new(rx).filter_map(|event| {
        futures_util::future::ready(match event {
            Ok(event) => serde_json::to_string(&event)
                .ok()
                .map(|json| Ok(Event::default().data(json))),
            // A lagged subscriber just skips ahead.
            Err(BroadcastStreamRecvError::Lagged(_)) => None,
        })
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
