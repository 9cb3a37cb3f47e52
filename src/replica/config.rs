use std::time::Duration;

/// Replica manager configuration
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// How long a retired handle may stay referenced before it is reported
    /// as a suspected leak
    pub leak_threshold: Duration,

    /// Poll cadence while waiting for retired handles to close
    pub retirement_poll_interval: Duration,

    /// Delete a retired location from disk once its handle is closed
    pub remove_retired_locations: bool,
}

impl ReplicaConfig {
    pub fn new() -> Self {
        Self {
            leak_threshold: Duration::from_secs(60),
            retirement_poll_interval: Duration::from_millis(10),
            remove_retired_locations: false,
        }
    }

    /// Set the leak threshold
    pub fn leak_threshold(mut self, threshold: Duration) -> Self {
        self.leak_threshold = threshold;
        self
    }

    /// Set the retirement poll interval
    pub fn retirement_poll_interval(mut self, interval: Duration) -> Self {
        self.retirement_poll_interval = interval;
        self
    }

    /// Remove retired snapshot directories after close
    pub fn remove_retired_locations(mut self, remove: bool) -> Self {
        self.remove_retired_locations = remove;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.leak_threshold.is_zero() {
            return Err("leak_threshold must be > 0".to_string());
        }

        if self.retirement_poll_interval.is_zero() {
            return Err("retirement_poll_interval must be > 0".to_string());
        }

        Ok(())
    }
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self::new()
    }
}
