//! Runtime configuration.
//!
//! Priority (highest to lowest):
//! 1. Environment variables prefixed with `STORXLAT_` (nested keys split on `__`,
//!    e.g. `STORXLAT_DISPATCH__RETRY_ON_TIMEOUT=true`)
//! 2. The TOML file passed to [`Config::load`]
//! 3. Built-in defaults

use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const ENV_PREFIX: &str = "STORXLAT_";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub dispatch: DispatchConfig,
    pub probe: ProbeConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Fall back to the next transport after a timeout instead of reporting it.
    ///
    /// Off by default: a timed-out command may still complete on the device,
    /// and resubmitting it elsewhere can execute it twice.
    pub retry_on_timeout: bool,
    /// Demote transports that soft-fail so later commands skip them.
    pub negative_cache: bool,
    /// Timeout for contexts that don't carry their own.
    pub default_timeout_ms: u64,
}

impl DispatchConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry_on_timeout: false,
            negative_cache: true,
            default_timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Issue identify-class trial commands on buses whose metadata can't be trusted.
    pub trials: bool,
    pub trial_timeout_ms: u64,
    /// Probe SMART, firmware download and reset support.
    pub capability_queries: bool,
}

impl ProbeConfig {
    pub fn trial_timeout(&self) -> Duration {
        Duration::from_millis(self.trial_timeout_ms)
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            trials: true,
            trial_timeout_ms: 5_000,
            capability_queries: true,
        }
    }
}

impl Config {
    /// Loads configuration from defaults, an optional TOML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_without_sources() {
        Jail::expect_with(|_jail| {
            let config = Config::load(None).expect("defaults load");
            assert_eq!(config, Config::default());
            assert!(!config.dispatch.retry_on_timeout);
            assert!(config.dispatch.negative_cache);
            Ok(())
        });
    }

    #[test]
    fn file_then_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "storxlat.toml",
                r#"
                [dispatch]
                default_timeout_ms = 2500
                negative_cache = false

                [probe]
                trials = false
                "#,
            )?;
            jail.set_env("STORXLAT_DISPATCH__RETRY_ON_TIMEOUT", "true");
            jail.set_env("STORXLAT_PROBE__TRIAL_TIMEOUT_MS", "750");

            let config = Config::load(Some(Path::new("storxlat.toml"))).expect("config loads");
            assert_eq!(config.dispatch.default_timeout(), Duration::from_millis(2500));
            assert!(!config.dispatch.negative_cache);
            assert!(config.dispatch.retry_on_timeout);
            assert!(!config.probe.trials);
            assert_eq!(config.probe.trial_timeout(), Duration::from_millis(750));
            assert!(config.probe.capability_queries);
            Ok(())
        });
    }

    #[test]
    fn rejects_malformed_values() {
        Jail::expect_with(|jail| {
            jail.set_env("STORXLAT_DISPATCH__DEFAULT_TIMEOUT_MS", "soon");
            assert!(Config::load(None).is_err());
            Ok(())
        });
    }
}
