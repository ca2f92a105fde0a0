//! Layered settings: built-in defaults, then `pydex.toml`, then `PYDEX_*`
//! environment variables (nested keys split on `__`).

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

pub const CONFIG_FILE: &str = "pydex.toml";
pub const ENV_PREFIX: &str = "PYDEX_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory holding one JSON document per project plus the manifest.
    pub cache_dir: PathBuf,
    /// Package registry base URL; metadata lives at `{url}/pypi/{name}/json`.
    pub registry_url: String,
    pub crawl: CrawlConfig,
    pub logging: LoggingConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("index"),
            registry_url: "https://pypi.org".to_string(),
            crawl: CrawlConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    /// Upper bound on concurrent registry/download requests.
    pub network_concurrency: usize,
    /// Attempts per metadata fetch; only transient network errors retry.
    pub retries: u32,
    /// Upper bound on concurrently parsed files.
    pub parse_threads: usize,
    /// Projects whose extracted `.py` sources exceed this many bytes get a
    /// placeholder note instead of indexed modules.
    pub max_source_bytes: u64,
    /// Projects to refuse to index; stored as placeholder entries.
    pub blocklist: Vec<String>,
    /// Ignore cached copies and re-index from the registry.
    pub skip_existing: bool,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            network_concurrency: 20,
            retries: 3,
            parse_threads: num_cpus::get(),
            max_source_bytes: 50 * 1024 * 1024,
            blocklist: Vec::new(),
            skip_existing: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base level for the crate's own spans and events.
    pub level: String,
    /// Per-module overrides, e.g. `crawler = "debug"`.
    pub modules: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            modules: HashMap::new(),
        }
    }
}

impl Settings {
    /// Defaults, overridden by `pydex.toml` in the working directory,
    /// overridden by `PYDEX_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let settings = Settings::default();
        assert_eq!(settings.registry_url, "https://pypi.org");
        assert_eq!(settings.crawl.network_concurrency, 20);
        assert_eq!(settings.crawl.retries, 3);
        assert!(settings.crawl.blocklist.is_empty());
        assert!(!settings.crawl.skip_existing);
    }

    #[test]
    fn toml_and_env_layering() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                CONFIG_FILE,
                r#"
                cache_dir = "/tmp/pydex-cache"

                [crawl]
                network_concurrency = 4
                blocklist = ["pytest-runner"]
                "#,
            )?;
            jail.set_env("PYDEX_CRAWL__RETRIES", "5");

            let settings = Settings::load().expect("settings load");
            assert_eq!(settings.cache_dir, PathBuf::from("/tmp/pydex-cache"));
            assert_eq!(settings.crawl.network_concurrency, 4);
            assert_eq!(settings.crawl.retries, 5);
            assert_eq!(settings.crawl.blocklist, vec!["pytest-runner"]);
            Ok(())
        });
    }
}
