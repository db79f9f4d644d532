pub mod logging;
pub mod metrics;

pub use logging::RequestLog;
pub use metrics::HttpMetrics;
