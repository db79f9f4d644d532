use crate::{error::{AppError, AppResult}, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_body(&config)
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> AppResult<HttpResponse> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config.update_from_json(&json_str)?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_body(&current_config)
    })))
}

/// Public view of the configuration. The remote section deliberately exposes
/// the name of the API key variable, never the key itself.
fn config_body(config: &crate::config::AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port,
            "status_interval_ms": config.server.status_interval_ms
        },
        "audio": {
            "capture_sample_rate": config.audio.capture_sample_rate,
            "playback_sample_rate": config.audio.playback_sample_rate,
            "block_size": config.audio.block_size,
            "capture_queue_blocks": config.audio.capture_queue_blocks
        },
        "remote": {
            "endpoint": config.remote.endpoint,
            "api_key_env": config.remote.api_key_env,
            "model": config.remote.model,
            "voice": config.remote.voice
        }
    })
}
