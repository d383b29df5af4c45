//! # Application State Management
//!
//! This module manages state shared by every HTTP handler and every WebSocket actor.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Allows multiple parts of the program to safely share ownership of data
//! - **Why needed**: Each actix worker thread builds its own `App`, and every WebSocket
//!   actor needs the same coordinator
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Allows multiple readers OR one writer at a time
//! - **Used for**: configuration and request metrics, which are small and rarely contended
//!
//! The session table itself is *not* behind one of these locks. It lives in the
//! [`SessionRegistry`], which serializes per session id instead of globally.

use crate::config::AppConfig;
use crate::relay::registry::SessionRegistry;
use crate::relay::{ConnectionHub, RelayCoordinator, RelaySettings};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// State shared across all handlers and connections.
///
/// ## Thread Safety Pattern:
/// Cloning an `AppState` clones the `Arc`s, not the data, so every clone sees the
/// same coordinator, hub and metrics.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<RwLock<AppConfig>>,

    /// Request metrics, updated by middleware on every request
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// The session relay
    pub coordinator: Arc<RelayCoordinator>,

    /// Live WebSocket connections (also the coordinator's outbox)
    pub hub: Arc<ConnectionHub>,

    /// When the server started
    pub start_time: Instant,
}

/// Metrics collected across all HTTP requests and connections.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of errors encountered since server start
    pub error_count: u64,

    /// Current number of open relay WebSocket connections
    pub active_connections: u32,

    /// Detailed metrics for each API endpoint
    /// Key: endpoint name (e.g., "GET /health")
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
    /// Create the shared state and wire the relay together.
    ///
    /// ## What this does:
    /// 1. Creates the empty session registry
    /// 2. Creates the connection hub, which doubles as the coordinator's outbox
    /// 3. Builds the coordinator from the `[relay]` configuration
    /// 4. Records the current time as the server start time
    pub fn new(config: AppConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let hub = Arc::new(ConnectionHub::new());
        let coordinator = Arc::new(RelayCoordinator::new(
            registry,
            hub.clone(),
            RelaySettings::from(&config.relay),
        ));

        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            coordinator,
            hub,
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Increment the total request counter (called by middleware for every request).
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
    ///
    /// ## HashMap operations:
    /// The first time we see an endpoint, we create a new EndpointMetric with default values.
    /// Subsequent requests update the existing metrics for that endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Called when a relay WebSocket actor starts.
    pub fn increment_active_connections(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.active_connections += 1;
    }

    /// Called when a relay WebSocket actor stops.
    ///
    /// ## Safety check:
    /// Includes a check to prevent underflow (u32 would panic on underflow in debug builds).
    pub fn decrement_active_connections(&self) {
        let mut metrics = self.metrics.write().unwrap();
        if metrics.active_connections > 0 {
            metrics.active_connections -= 1;
        }
    }

    /// Get a snapshot of current metrics.
    ///
    /// Clones the data so the lock isn't held while a response is being serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_connections: metrics.active_connections,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time for this endpoint (0.0 before the first request).
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
