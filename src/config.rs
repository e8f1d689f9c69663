//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for one [`Engine`](crate::engine::Engine).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum in-flight tasks across all waves of a run.
    pub concurrency_limit: usize,

    /// Applied to tasks that declare no timeout of their own, milliseconds.
    pub default_task_timeout_ms: u64,

    /// Maximum forEach nesting depth accepted at graph build time.
    pub foreach_max_depth: usize,

    /// Stop starting new waves once any task has failed.
    pub fail_fast: bool,

    /// Sort ready tasks by id when forming waves; disable to keep authorial
    /// order within a wave.
    pub deterministic_tiebreak: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 10,
            default_task_timeout_ms: 30_000,
            foreach_max_depth: 3,
            fail_fast: true,
            deterministic_tiebreak: true,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_millis(self.default_task_timeout_ms)
    }

    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables (`STARLING__*`, highest priority)
    /// 2. Config file (`starling.yaml` in the current dir or
    ///    `~/.config/starling/starling.yaml`)
    /// 3. Defaults (lowest priority)
    ///
    /// # Errors
    /// Returns an error if a source is present but cannot be parsed.
    pub fn load() -> std::result::Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&EngineConfig::default())?)
            .add_source(
                config::File::with_name("starling")
                    .format(config::FileFormat::Yaml)
                    .required(false),
            )
            .add_source(
                config::File::with_name(&format!(
                    "{}/.config/starling/starling",
                    std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
                ))
                .format(config::FileFormat::Yaml)
                .required(false),
            )
            .add_source(
                config::Environment::with_prefix("STARLING")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = EngineConfig::default();
        assert_eq!(config.concurrency_limit, 10);
        assert_eq!(config.default_task_timeout(), Duration::from_secs(30));
        assert_eq!(config.foreach_max_depth, 3);
        assert!(config.fail_fast);
        assert!(config.deterministic_tiebreak);
    }
}
