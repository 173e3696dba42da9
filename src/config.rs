use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::orchestration::breaker::BreakerConfig;
use crate::orchestration::feedback::DEFAULT_QC_OUTPUT_LIMIT;
use crate::orchestration::gate::Quota;
use crate::{clog_debug, Error, Result};

/// Settings loaded from `~/.cadre/cadre.toml`. Every table is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Name of the shared downstream resource.
    pub resource: String,
    /// `-1` disables throttling.
    pub requests_per_hour: i64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            resource: "llm".to_string(),
            requests_per_hour: -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Characters of worker output forwarded to QC.
    pub qc_output_limit: usize,
    /// Where run state is written. Defaults to `~/.cadre/runs`.
    pub store_dir: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            qc_output_limit: DEFAULT_QC_OUTPUT_LIMIT,
            store_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent CLI, looked up on `PATH`.
    pub command: String,
    /// Extra arguments placed before the generated ones.
    pub args: Vec<String>,
    pub working_dir: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: Vec::new(),
            working_dir: None,
        }
    }
}

impl Config {
    pub fn cadre_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".cadre"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::cadre_dir()?.join("cadre.toml"))
    }

    /// Load the user config, falling back to defaults when the file is absent.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        clog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        clog_debug!(
            "Config loaded: resource={} requests_per_hour={} agent={}",
            config.gate.resource,
            config.gate.requests_per_hour,
            config.agent.command
        );
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        clog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn quota(&self) -> Result<Quota> {
        Quota::from_limit(self.gate.requests_per_hour)
    }

    pub fn store_dir(&self) -> Result<PathBuf> {
        match &self.engine.store_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::cadre_dir()?.join("runs")),
        }
    }

    pub fn agent_working_dir(&self) -> Option<PathBuf> {
        self.agent.working_dir.as_deref().map(expand_tilde)
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.gate.resource, "llm");
        assert_eq!(config.quota().unwrap(), Quota::Unlimited);
        assert_eq!(config.engine.qc_output_limit, 15_000);
        assert_eq!(config.agent.command, "claude");
        assert_eq!(config.breaker, BreakerConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cadre.toml");
        fs::write(
            &path,
            "[gate]\nrequests_per_hour = 120\n\n[breaker]\nmax_duration_secs = 300\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.gate.resource, "llm");
        assert_eq!(config.quota().unwrap(), Quota::PerHour(120));
        assert_eq!(config.breaker.max_duration_secs, Some(300));
        assert_eq!(config.breaker.soft_tool_calls, 30);
        assert_eq!(config.agent, AgentConfig::default());
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("cadre.toml");
        let mut config = Config::default();
        config.agent.args = vec!["--model".to_string(), "fast".to_string()];
        config.engine.store_dir = Some("/var/cadre".to_string());
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.agent.args, config.agent.args);
        assert_eq!(loaded.store_dir().unwrap(), PathBuf::from("/var/cadre"));
    }

    #[test]
    fn test_invalid_limit_rejected() {
        let mut config = Config::default();
        config.gate.requests_per_hour = 0;
        assert!(matches!(config.quota(), Err(Error::InvalidRateLimit(0))));
    }

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde("~/runs");
        assert!(expanded.ends_with("runs"));
        assert!(!expanded.to_string_lossy().contains('~'));
        assert_eq!(expand_tilde("/abs"), PathBuf::from("/abs"));
    }
}
