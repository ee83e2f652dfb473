//! # Application State Management
//!
//! Shared state handed to every HTTP handler and to the WebSocket upgrade
//! handler through `web::Data<AppState>`.
//!
//! ## What lives here:
//! - **config**: the live configuration, updatable at runtime via `PUT /api/v1/config`
//! - **metrics**: HTTP request counters written by the metrics middleware
//! - **store**: the interview session store
//! - **services**: recognizer, synthesizer and planner shared by every actor
//! - **manager**: the voice connection manager
//!
//! ## Locking:
//! `config` and `metrics` sit behind `parking_lot::RwLock`. Guards are short
//! lived and never held across an `.await`, so the non-async lock is fine here.
//! The config lock is shared with the connection manager, which reads it when a
//! new voice connection is accepted.

use crate::config::AppConfig;
use crate::conversation::manager::ConnectionManager;
use crate::services::VoiceServices;
use crate::session::SessionStore;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// The main application state shared across all request handlers.
///
/// Cloning is cheap: every field is an `Arc` or `Copy`.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// HTTP request metrics
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,

    pub store: Arc<dyn SessionStore>,

    pub services: VoiceServices,

    pub manager: Arc<ConnectionManager>,
}

/// HTTP metrics collected across all requests.
///
/// Voice connection counters are not kept here; they come from the
/// connection manager's registry.
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of 4xx/5xx responses since server start
    pub error_count: u64,

    /// Per-endpoint statistics keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed metrics for a single endpoint.
#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    pub error_count: u64,
}

impl AppState {
    /// Create the application state.
    ///
    /// ## What this does:
    /// 1. Wraps the config for shared, updatable access
    /// 2. Builds the connection manager over the same config lock
    /// 3. Records the server start time
    pub fn new(config: AppConfig, store: Arc<dyn SessionStore>, services: VoiceServices) -> Self {
        let config = Arc::new(RwLock::new(config));
        let manager = ConnectionManager::new(store.clone(), services.clone(), config.clone());

        Self {
            config,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            store,
            services,
            manager,
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately so handlers never hold it.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// Replace the configuration after validating it.
    ///
    /// Running conversations keep the settings they started with; the new
    /// values apply to connections accepted afterwards.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write() = new_config;
        Ok(())
    }

    /// Record one finished HTTP request.
    pub fn record_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write();
        metrics.request_count += 1;
        if is_error {
            metrics.error_count += 1;
        }

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Snapshot of the HTTP metrics, taken under a read lock and cloned so
    /// serialization happens without the lock.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl AppMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl EndpointMetric {
    /// Average response time for this endpoint.
    ///
    /// ## Example:
    /// 10 requests taking 500ms in total average 50ms per request.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, from 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::conversation::actor::tests::{FixedSynthesizer, ScriptedRecognizer};
    use crate::services::planner::ScriptedPlanner;
    use crate::session::InMemorySessionStore;

    /// State wired to in-memory collaborators.
    pub fn test_state() -> AppState {
        let services = VoiceServices::new(
            ScriptedRecognizer::new(0),
            FixedSynthesizer::new(2),
            Arc::new(ScriptedPlanner::new(8)),
        );
        AppState::new(AppConfig::default(), Arc::new(InMemorySessionStore::new()), services)
    }

    #[test]
    fn test_record_request() {
        let state = test_state();
        state.record_request("GET /health", 10, false);
        state.record_request("GET /health", 30, false);
        state.record_request("PUT /api/v1/config", 5, true);

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.request_count, 3);
        assert_eq!(metrics.error_count, 1);

        let health = &metrics.endpoint_metrics["GET /health"];
        assert_eq!(health.request_count, 2);
        assert_eq!(health.average_duration_ms(), 20.0);
        assert_eq!(health.error_rate(), 0.0);

        let config = &metrics.endpoint_metrics["PUT /api/v1/config"];
        assert_eq!(config.error_rate(), 1.0);
    }

    #[test]
    fn test_empty_metrics_rates() {
        let metrics = AppMetrics::default();
        assert_eq!(metrics.error_rate(), 0.0);
        assert_eq!(EndpointMetric::default().average_duration_ms(), 0.0);
    }

    #[test]
    fn test_update_config_validates() {
        let state = test_state();

        let mut invalid = state.get_config();
        invalid.server.port = 0;
        assert!(state.update_config(invalid).is_err());
        assert_ne!(state.get_config().server.port, 0);

        let mut valid = state.get_config();
        valid.performance.max_concurrent_sessions = 3;
        state.update_config(valid).unwrap();
        assert_eq!(state.get_config().performance.max_concurrent_sessions, 3);
    }
}
