use crate::{config::AppConfig, error::AppResult, error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": redacted(&config)?
    })))
}

/// Apply a partial update. New values affect voice connections accepted afterwards.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> AppResult<HttpResponse> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(format!("{:#}", e)))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": redacted(&current_config)?
    })))
}

/// The configuration as JSON with provider API keys masked.
fn redacted(config: &AppConfig) -> AppResult<serde_json::Value> {
    let mut value = serde_json::to_value(config)?;
    if let Some(providers) = value.get_mut("providers").and_then(|p| p.as_object_mut()) {
        for provider in providers.values_mut() {
            if let Some(key) = provider.get_mut("api_key") {
                if key.as_str().is_some_and(|k| !k.is_empty()) {
                    *key = json!("***");
                }
            }
        }
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_get_config_masks_api_keys() {
        let state = test_state();
        state.config.write().providers.planner.api_key = "sk-secret".to_string();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/config", web::get().to(get_config)),
        )
        .await;

        let body: serde_json::Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::get().uri("/config").to_request(),
        )
        .await;

        assert_eq!(body["config"]["providers"]["planner"]["api_key"], "***");
        assert_eq!(body["config"]["providers"]["recognizer"]["api_key"], "");
        assert_eq!(body["config"]["voice"]["silence_timeout_secs"], 2.0);
    }

    #[actix_web::test]
    async fn test_update_config_partial() {
        let state = web::Data::new(test_state());
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let resp = test::call_service(
            &app,
            test::TestRequest::put()
                .uri("/config")
                .set_json(json!({"voice": {"silence_timeout_secs": 1.0}}))
                .to_request(),
        )
        .await;
        assert!(resp.status().is_success());

        let config = state.get_config();
        assert_eq!(config.voice.silence_timeout_secs, 1.0);
        assert_eq!(config.voice.window_secs, 0.4);
    }

    #[actix_web::test]
    async fn test_update_config_rejects_invalid_values() {
        let state = web::Data::new(test_state());
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let resp = test::call_service(
            &app,
            test::TestRequest::put()
                .uri("/config")
                .set_json(json!({"server": {"port": 0}}))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);
        assert_eq!(state.get_config().server.port, 8080);
    }
}
