use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::plugins::registry::ServiceContext;

/// Orchestration timings and output location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory exported files are written to.
    pub out_dir: PathBuf,
    /// Re-check interval while a session is paused.
    pub pause_poll_ms: u64,
    /// Delay between two chapter fetches.
    pub chapter_delay_ms: u64,
    /// How long a finished session stays queryable.
    pub cleanup_delay_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("./downloads"),
            pause_poll_ms: 100,
            chapter_delay_ms: 500,
            cleanup_delay_secs: 5,
        }
    }
}

impl EngineConfig {
    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms)
    }

    pub fn chapter_delay(&self) -> Duration {
        Duration::from_millis(self.chapter_delay_ms)
    }

    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_secs(self.cleanup_delay_secs)
    }
}

/// HTTP settings shared by the lib.social services.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub user_agent: String,
    pub timeout_secs: u64,
    /// Extra attempts after the first failed request.
    pub retries: u32,
    pub retry_backoff_ms: u64,
    pub api_base: String,
    pub image_base: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let ctx = ServiceContext::default();
        Self {
            user_agent: ctx.user_agent,
            timeout_secs: ctx.timeout_secs,
            retries: ctx.retries,
            retry_backoff_ms: ctx.retry_backoff_ms,
            api_base: ctx.api_base,
            image_base: ctx.image_base,
        }
    }
}

impl From<&ServiceConfig> for ServiceContext {
    fn from(cfg: &ServiceConfig) -> Self {
        Self {
            user_agent: cfg.user_agent.clone(),
            timeout_secs: cfg.timeout_secs,
            retries: cfg.retries,
            retry_backoff_ms: cfg.retry_backoff_ms,
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            image_base: cfg.image_base.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub service: ServiceConfig,
}

/// Loads `path`, or returns the built-in defaults when no path is given.
pub fn load(path: Option<&Path>) -> Result<AppConfig> {
    let Some(path) = path else {
        return Ok(AppConfig::default());
    };
    let data = std::fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    let cfg: AppConfig = toml::from_str(&data).with_context(|| format!("parse config {}", path.display()))?;
    tracing::debug!("loaded config from {}", path.display());
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.engine.pause_poll_ms, 100);
        assert_eq!(cfg.engine.chapter_delay_ms, 500);
        assert_eq!(cfg.engine.cleanup_delay_secs, 5);
        assert_eq!(cfg.service.retries, 2);
        assert_eq!(cfg.service.timeout_secs, 60);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let toml = r#"
            [engine]
            chapter_delay_ms = 50

            [service]
            api_base = "http://localhost:8080/api/"
        "#;
        let cfg: AppConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.engine.chapter_delay_ms, 50);
        assert_eq!(cfg.engine.pause_poll_ms, 100);
        assert_eq!(cfg.engine.out_dir, PathBuf::from("./downloads"));

        let ctx = ServiceContext::from(&cfg.service);
        assert_eq!(ctx.api_base, "http://localhost:8080/api");
        assert_eq!(ctx.retries, 2);
    }

    #[test]
    fn load_reads_file_and_reports_errors() {
        assert_eq!(load(None).unwrap().engine.cleanup_delay_secs, 5);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[engine]\ncleanup_delay_secs = 1\n").unwrap();
        assert_eq!(load(Some(&path)).unwrap().engine.cleanup_delay_secs, 1);

        std::fs::write(&path, "[engine\n").unwrap();
        let err = load(Some(&path)).unwrap_err();
        assert!(format!("{:#}", err).contains("parse config"));
        assert!(load(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
