//! # Application State Management
//!
//! Shared state handed to every HTTP handler and the WebSocket bridge.
//!
//! ## What lives here:
//! - The runtime configuration, behind `Arc<RwLock<AppConfig>>` so handlers can
//!   read it concurrently while the config endpoints update it
//! - HTTP request metrics, updated by the metrics middleware
//! - The consultation controller handle and the channel-backed device provider,
//!   which together connect the HTTP/WebSocket surface to the session core
//!
//! ## Locking discipline:
//! Locks are held only long enough to read or bump a counter; nothing here is
//! held across an await point. The session controller itself holds no locks at
//! all (see `session`), so state contention is limited to config reads and
//! metric increments.

use crate::config::AppConfig;
use crate::device::ChannelDeviceProvider;
use crate::session::ConsultHandle;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Application state shared across all HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Runtime configuration (readable everywhere, updatable via the API)
    pub config: Arc<RwLock<AppConfig>>,

    /// HTTP performance metrics, updated by middleware on every request
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,

    /// Handle to the consultation session controller
    pub consult: ConsultHandle,

    /// Device provider the WebSocket bridge installs client endpoints into
    pub devices: Arc<ChannelDeviceProvider>,
}

/// Performance metrics collected across all HTTP requests.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of errors encountered since server start
    pub error_count: u64,

    /// Current number of connected WebSocket clients
    pub connected_clients: u32,

    /// Per-endpoint statistics, keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    /// Number of requests to this specific endpoint
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    /// Number of errors that occurred for this endpoint
    pub error_count: u64,
}

impl AppState {
    /// Create the shared state from a validated configuration and the session
    /// controller's handle.
    pub fn new(
        config: AppConfig,
        consult: ConsultHandle,
        devices: Arc<ChannelDeviceProvider>,
    ) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            consult,
            devices,
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the read lock immediately; AppConfig is cheap to clone.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Replace the configuration after validating it, so the stored config is
    /// always valid.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap() = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    /// Increment the total request counter (called by middleware for every
    /// request).
    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    /// Increment the total error counter (called when any request fails).
    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();

        let endpoint_metric = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// A WebSocket client connected.
    pub fn increment_connected_clients(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.connected_clients += 1;
    }

    /// A WebSocket client disconnected. Guards against underflow so a double
    /// disconnect can't wrap the counter.
    pub fn decrement_connected_clients(&self) {
        let mut metrics = self.metrics.write().unwrap();
        if metrics.connected_clients > 0 {
            metrics.connected_clients -= 1;
        }
    }

    /// Get a snapshot of current metrics for the /metrics endpoint.
    ///
    /// Clones under a read lock so the response never serializes a
    /// half-updated map.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            connected_clients: metrics.connected_clients,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time for this endpoint in milliseconds.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate for this endpoint as a fraction (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
