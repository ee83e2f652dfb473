//! Voice connection status and maintenance.

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

pub async fn voice_status(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.manager.status())
}

/// Tear down every conversation actor, connected or not.
pub async fn force_cleanup(state: web::Data<AppState>) -> HttpResponse {
    let cleaned = state.manager.cleanup_all().await;
    info!(cleaned, "Forced cleanup of voice actors");

    HttpResponse::Ok().json(json!({
        "status": "success",
        "cleaned": cleaned,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}
