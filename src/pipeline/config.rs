//! Pipeline configuration with environment overrides.

use std::time::Duration;

/// Tunables for the executor.
///
/// Defaults match the system's documented behavior: ten stages, a 0.995
/// global completion threshold, and a five-minute per-session budget.
/// Each field can be overridden through the environment (`.env` files
/// are honored via dotenvy):
///
/// - `ECHELON_MAX_STAGES`
/// - `ECHELON_CONFIDENCE_THRESHOLD`
/// - `ECHELON_MAX_SIMULATION_SECS`
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Upper bound on stages driven in one run.
    pub max_stages: u8,
    /// Confidence at or above which a non-escalating stage completes the
    /// run.
    pub global_confidence_threshold: f64,
    /// Wall-clock budget per session, checked before each stage.
    pub max_simulation_time: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_stages: 10,
            global_confidence_threshold: 0.995,
            max_simulation_time: Duration::from_secs(300),
        }
    }
}

impl PipelineConfig {
    /// Defaults overlaid with any `ECHELON_*` environment variables.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();
        Self {
            max_stages: env_parse("ECHELON_MAX_STAGES", defaults.max_stages).clamp(1, 10),
            global_confidence_threshold: env_parse(
                "ECHELON_CONFIDENCE_THRESHOLD",
                defaults.global_confidence_threshold,
            ),
            max_simulation_time: Duration::from_secs(env_parse(
                "ECHELON_MAX_SIMULATION_SECS",
                defaults.max_simulation_time.as_secs(),
            )),
        }
    }

    #[must_use]
    pub fn with_max_stages(mut self, max_stages: u8) -> Self {
        self.max_stages = max_stages.clamp(1, 10);
        self
    }

    #[must_use]
    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.global_confidence_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_max_simulation_time(mut self, budget: Duration) -> Self {
        self.max_simulation_time = budget;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
