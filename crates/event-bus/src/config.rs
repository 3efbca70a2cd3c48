//! Event bus configuration loaded from environment variables.

/// Bus configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `EVENT_NAMESPACE` — topic namespace prefix (default: `"farm"`)
/// - `EVENT_SOURCE` — source stamped on events this process publishes
///   (default: `"saga-orchestrator"`)
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub namespace: String,
    pub source: String,
}

impl BusConfig {
    /// Loads configuration from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        Self {
            namespace: std::env::var("EVENT_NAMESPACE").unwrap_or_else(|_| "farm".to_string()),
            source: std::env::var("EVENT_SOURCE")
                .unwrap_or_else(|_| "saga-orchestrator".to_string()),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            namespace: "farm".to_string(),
            source: "saga-orchestrator".to_string(),
        }
    }
}
