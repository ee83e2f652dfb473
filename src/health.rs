//! Health and metrics endpoints.

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let connections = state.manager.stats();
    let sessions = state.store.stats().await;

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
        },
        "voice": {
            "active_connections": connections.active_connections,
            "sessions": sessions,
        },
        "providers": state.services.provider_stats(),
        "system": load_status(
            connections.active_connections,
            config.performance.max_concurrent_sessions
        )
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let config = state.get_config();
    let connections = state.manager.stats();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "connections": connections,
        "actors": state.manager.actor_snapshots(),
        "providers": state.services.provider_stats(),
        "performance": {
            "max_concurrent_sessions": config.performance.max_concurrent_sessions
        }
    }))
}

fn load_status(active: usize, max_sessions: usize) -> serde_json::Value {
    let usage = if max_sessions > 0 {
        active as f64 / max_sessions as f64
    } else {
        0.0
    };

    let status = if usage > 0.9 {
        "high_load"
    } else if usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (usage * 100.0).round(),
        "max_sessions": max_sessions,
        "current_sessions": active,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_health_check() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(test_state()))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let body: serde_json::Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::get().uri("/health").to_request(),
        )
        .await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["voice"]["active_connections"], 0);
        assert_eq!(body["system"]["status"], "normal");
    }

    #[actix_web::test]
    async fn test_detailed_metrics_reports_connections() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(test_state()))
                .route("/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let body: serde_json::Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::get().uri("/metrics").to_request(),
        )
        .await;

        assert_eq!(body["connections"]["total_connections"], 0);
        assert_eq!(body["connections"]["failed_connections"], 0);
        assert_eq!(body["actors"], json!([]));
    }

    #[actix_web::test]
    async fn test_load_status_thresholds() {
        assert_eq!(load_status(0, 10)["status"], "normal");
        assert_eq!(load_status(8, 10)["status"], "moderate_load");
        assert_eq!(load_status(10, 10)["status"], "high_load");
        assert_eq!(load_status(5, 0)["session_usage_percent"], 0.0);
    }
}
