//! # Consultation Control Endpoints
//!
//! REST surface over the session controller: start, stop, and status. Start
//! and stop enqueue a request with the controller and return immediately; the
//! state transition is observable through the status endpoint (or the status
//! pushes on the WebSocket).

use crate::{error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// POST /api/v1/consult/start
///
/// Requesting a start while a session is already active is accepted and
/// ignored by the controller, so this endpoint is safe to retry.
pub async fn start_consult(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    state.consult.start();

    Ok(HttpResponse::Accepted().json(json!({
        "status": "accepted",
        "message": "Consultation start requested",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": session_body(&state)
    })))
}

/// POST /api/v1/consult/stop
pub async fn stop_consult(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    state.consult.stop();

    Ok(HttpResponse::Accepted().json(json!({
        "status": "accepted",
        "message": "Consultation stop requested",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": session_body(&state)
    })))
}

/// GET /api/v1/consult/status
pub async fn consult_status(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": session_body(&state)
    })))
}

fn session_body(state: &AppState) -> serde_json::Value {
    let status = state.consult.status();
    let counters = state.consult.counters();

    json!({
        "state": status.state.as_str(),
        "consultation_id": status.consultation_id,
        "input_volume": state.consult.volume(),
        "counters": {
            "frames_sent": counters.frames_sent,
            "frames_dropped": counters.frames_dropped,
            "chunks_scheduled": counters.chunks_scheduled,
            "decode_errors": counters.decode_errors
        }
    })
}
