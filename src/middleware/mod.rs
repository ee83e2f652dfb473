pub mod metrics;

pub use metrics::HttpMetrics;
