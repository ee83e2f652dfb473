//! Interview session CRUD.

use crate::{error::AppError, error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub job_description: String,
    #[serde(default)]
    pub interview_type: Option<String>,
}

pub async fn create_session(
    state: web::Data<AppState>,
    body: web::Json<CreateSessionRequest>,
) -> AppResult<HttpResponse> {
    let request = body.into_inner();
    if request.job_description.trim().is_empty() {
        return Err(AppError::ValidationError(
            "job_description must not be empty".to_string(),
        ));
    }

    let session = state
        .store
        .create(request.job_description, request.interview_type)
        .await;
    info!(session_id = %session.session_id, interview_type = %session.interview_type, "Session created");

    Ok(HttpResponse::Created().json(session))
}

pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let session_id = path.into_inner();
    match state.store.get(&session_id).await {
        Some(session) => Ok(HttpResponse::Ok().json(session)),
        None => Err(AppError::NotFound(format!("Session {} not found", session_id))),
    }
}

/// Delete a session and disconnect its voice connection, if any.
pub async fn delete_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let session_id = path.into_inner();
    if !state.store.delete(&session_id).await {
        return Err(AppError::NotFound(format!("Session {} not found", session_id)));
    }

    let disconnected = state.manager.disconnect(&session_id);
    info!(session_id = %session_id, disconnected, "Session deleted");

    Ok(HttpResponse::NoContent().finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use serde_json::json;

    macro_rules! app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data($state.clone())
                    .route("/sessions", web::post().to(create_session))
                    .route("/sessions/{session_id}", web::get().to(get_session))
                    .route("/sessions/{session_id}", web::delete().to(delete_session)),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_session_lifecycle() {
        let state = web::Data::new(test_state());
        let app = app!(state);

        let created: serde_json::Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::post()
                .uri("/sessions")
                .set_json(json!({"job_description": "Backend engineer", "interview_type": "technical"}))
                .to_request(),
        )
        .await;
        let session_id = created["session_id"].as_str().unwrap().to_string();
        assert_eq!(created["interview_type"], "technical");
        assert_eq!(created["is_completed"], false);

        let fetched: serde_json::Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::get()
                .uri(&format!("/sessions/{}", session_id))
                .to_request(),
        )
        .await;
        assert_eq!(fetched["job_description"], "Backend engineer");

        let resp = test::call_service(
            &app,
            test::TestRequest::delete()
                .uri(&format!("/sessions/{}", session_id))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = test::call_service(
            &app,
            test::TestRequest::delete()
                .uri(&format!("/sessions/{}", session_id))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_create_session_status_and_default_type() {
        let state = web::Data::new(test_state());
        let app = app!(state);

        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/sessions")
                .set_json(json!({"job_description": "Product manager"}))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["interview_type"], "behavioral");
    }

    #[actix_web::test]
    async fn test_create_session_requires_job_description() {
        let state = web::Data::new(test_state());
        let app = app!(state);

        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/sessions")
                .set_json(json!({"job_description": "   "}))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_unknown_session_is_404() {
        let state = web::Data::new(test_state());
        let app = app!(state);

        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/sessions/missing").to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "not_found");
    }
}
