use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use axum::Json;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};

use triage_core::ids::SessionId;
use triage_core::ticket::{AnalysisResult, FeedbackTicket};

use crate::error::{ApiError, ApiResult};
use crate::server::AppState;
use crate::service::TicketService;
use crate::wire::{AnalysisUpdate, ApproveRequest, ApproveResponse, ErrorEvent, SessionSnapshot};

const KEEP_ALIVE: Duration = Duration::from_secs(15);

type SseStream = BoxStream<'static, Result<Event, Infallible>>;

pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

pub async fn analyze(
    State(state): State<AppState>,
    Json(ticket): Json<FeedbackTicket>,
) -> Json<AnalysisResult> {
    Json(state.service.analyze(ticket).await)
}

pub async fn analyze_batch(
    State(state): State<AppState>,
    Json(tickets): Json<Vec<FeedbackTicket>>,
) -> Json<Vec<AnalysisResult>> {
    let service = &state.service;
    let results = futures::future::join_all(tickets.into_iter().map(|t| service.analyze(t))).await;
    Json(results)
}

/// Streams `analysis_update` events, then one `result` (or `error`) event.
pub async fn analyze_stream(
    State(state): State<AppState>,
    Json(ticket): Json<FeedbackTicket>,
) -> Sse<KeepAliveStream<SseStream>> {
    let service = Arc::clone(&state.service);
    let stream: SseStream = match service.stream(ticket) {
        Ok((ticket, session_id, events)) => {
            let updates = events.map(|event| {
                Ok::<_, Infallible>(json_event("analysis_update", &AnalysisUpdate::from_event(event)))
            });
            let last = stream::once(async move { Ok(final_event(&service, ticket, &session_id)) });
            updates.chain(last).boxed()
        }
        Err(e) => stream::once(async move { Ok::<_, Infallible>(error_event(e.to_string())) }).boxed(),
    };
    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE))
}

pub async fn approve(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<ApproveRequest>,
) -> ApiResult<Json<ApproveResponse>> {
    if session_id.trim().is_empty() {
        return Err(ApiError::BadRequest("session id is required".into()));
    }
    let (tool_name, feedback) = request.into_feedback()?;
    let session_id = SessionId::from_raw(session_id);
    let result = state.service.approve(&session_id, &tool_name, feedback).await?;
    Ok(Json(ApproveResponse {
        acknowledged: true,
        session_id,
        result,
    }))
}

/// Streams the resumed run as `analysis_update` events, then one `result` (or `error`) event.
pub async fn approve_stream(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<ApproveRequest>,
) -> ApiResult<Sse<KeepAliveStream<SseStream>>> {
    if session_id.trim().is_empty() {
        return Err(ApiError::BadRequest("session id is required".into()));
    }
    let (tool_name, feedback) = request.into_feedback()?;
    let session_id = SessionId::from_raw(session_id);
    let service = Arc::clone(&state.service);
    let events = service.approve_stream(&session_id, &tool_name, feedback)?;
    let updates = events.map(|event| {
        Ok::<_, Infallible>(json_event("analysis_update", &AnalysisUpdate::from_event(event)))
    });
    let last = stream::once(async move {
        let event = match service.engine().session(&session_id) {
            Ok(Some(session)) => json_event("result", &service.finish_resumed(&session)),
            Ok(None) => error_event(format!("session {session_id} was not saved")),
            Err(e) => error_event(e.to_string()),
        };
        Ok(event)
    });
    let stream: SseStream = updates.chain(last).boxed();
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE)))
}

pub async fn session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionSnapshot>> {
    let id = SessionId::from_raw(session_id);
    let session = state
        .service
        .engine()
        .session(&id)?
        .ok_or_else(|| ApiError::NotFound(format!("session {id}")))?;
    Ok(Json(session.into()))
}

fn final_event(service: &TicketService, ticket: FeedbackTicket, session_id: &SessionId) -> Event {
    match service.engine().session(session_id) {
        Ok(Some(session)) => json_event("result", &service.conclude(ticket, &session)),
        Ok(None) => error_event(format!("session {session_id} was not saved")),
        Err(e) => error_event(e.to_string()),
    }
}

fn json_event(name: &'static str, payload: &impl Serialize) -> Event {
    Event::default()
        .event(name)
        .json_data(payload)
        .unwrap_or_else(|e| error_event(format!("failed to encode {name}: {e}")))
}

fn error_event(error: String) -> Event {
    let body = serde_json::to_string(&ErrorEvent { error }).unwrap_or_default();
    Event::default().event("error").data(body)
}
