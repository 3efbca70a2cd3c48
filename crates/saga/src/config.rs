//! Orchestrator configuration loaded from environment variables.

/// Housekeeping configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `SAGA_CLEANUP_INTERVAL_SECS` — seconds between cleanup sweeps
///   (default: `3600`)
/// - `SAGA_RETENTION_SECS` — how long terminal executions are kept
///   (default: `86400`)
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub cleanup_interval_secs: u64,
    pub retention_secs: u64,
}

impl OrchestratorConfig {
    /// Loads configuration from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        Self {
            cleanup_interval_secs: std::env::var("SAGA_CLEANUP_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3600),
            retention_secs: std::env::var("SAGA_RETENTION_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(86400),
        }
    }

    /// Returns the sweep interval as a std duration for the timer.
    pub fn cleanup_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Returns the retention window as a chrono duration for timestamp
    /// comparison.
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_secs as i64)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: 3600,
            retention_secs: 86400,
        }
    }
}
