//! Configuration for the consistency layer.

use crate::error::ErrorPolicy;

/// Configuration for the consistency layer.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Longest gap, in whole days, that an incremental catch-up may cover.
    /// Older cursors trigger a full local reset.
    pub drift_limit_days: i64,
    /// Error signatures used to classify failures.
    pub error_policy: ErrorPolicy,
    /// Name of the pipeline feeding inbound events into local storage.
    pub mirror_pipeline_name: String,
}

impl EngineConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            drift_limit_days: 30,
            error_policy: ErrorPolicy::default(),
            mirror_pipeline_name: "offline-mirror".into(),
        }
    }

    /// Sets the drift limit.
    pub fn with_drift_limit_days(mut self, days: i64) -> Self {
        self.drift_limit_days = days;
        self
    }

    /// Sets the error policy.
    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// Sets the mirror pipeline name.
    pub fn with_mirror_pipeline_name(mut self, name: impl Into<String>) -> Self {
        self.mirror_pipeline_name = name.into();
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}
