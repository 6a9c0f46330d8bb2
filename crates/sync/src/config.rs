use std::time::Duration;

use ferry_core::DEFAULT_FIELD_MANAGER;

/// Controller tunables. `from_env` reads `FERRY_*` overrides on top of the defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub workers: usize,
    /// Requeue delay while a service namespace is not provisioned.
    pub not_ready_delay: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub field_manager: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            not_ready_delay: Duration::from_secs(1),
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
        }
    }
}

fn env_u64(name: &str) -> Option<u64> { std::env::var(name).ok().and_then(|s| s.trim().parse::<u64>().ok()) }

impl ControllerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            workers: env_u64("FERRY_WORKERS").map(|n| n as usize).filter(|n| *n > 0).unwrap_or(d.workers),
            not_ready_delay: env_u64("FERRY_NOT_READY_DELAY_MS").map(Duration::from_millis).unwrap_or(d.not_ready_delay),
            backoff_base: env_u64("FERRY_BACKOFF_BASE_MS").map(Duration::from_millis).unwrap_or(d.backoff_base),
            backoff_max: env_u64("FERRY_BACKOFF_MAX_SECS").map(Duration::from_secs).unwrap_or(d.backoff_max),
            field_manager: std::env::var("FERRY_FIELD_MANAGER").ok().filter(|s| !s.is_empty()).unwrap_or(d.field_manager),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_defaults() {
        std::env::set_var("FERRY_WORKERS", "6");
        std::env::set_var("FERRY_NOT_READY_DELAY_MS", "250");
        std::env::set_var("FERRY_BACKOFF_MAX_SECS", "not-a-number");
        let c = ControllerConfig::from_env();
        assert_eq!(c.workers, 6);
        assert_eq!(c.not_ready_delay, Duration::from_millis(250));
        assert_eq!(c.backoff_max, ControllerConfig::default().backoff_max);
        std::env::remove_var("FERRY_WORKERS");
        std::env::remove_var("FERRY_NOT_READY_DELAY_MS");
        std::env::remove_var("FERRY_BACKOFF_MAX_SECS");
    }
}
