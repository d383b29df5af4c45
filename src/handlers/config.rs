use crate::{error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// GET /api/v1/config: the effective configuration after all sources were merged.
pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": {
                "host": config.server.host,
                "port": config.server.port
            },
            "relay": {
                "close_grace_ms": config.relay.close_grace_ms,
                "max_payload_bytes": config.relay.max_payload_bytes,
                "heartbeat_interval_secs": config.relay.heartbeat_interval_secs,
                "client_timeout_secs": config.relay.client_timeout_secs,
                "mailbox_capacity": config.relay.mailbox_capacity,
                "max_connections": config.relay.max_connections,
                "strict_join": config.relay.strict_join
            }
        }
    })))
}
