//! Configuration
//!
//! One `CascadeConfig` groups every tunable section. Files are TOML or JSON,
//! chosen by extension; missing fields take their defaults.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use cascade_llm::RetryPolicy;

use crate::services::core::CompactionConfig;
use crate::services::orchestrator::{GatewayConfig, LoopConfig, SingleShotConfig};
use crate::services::task_mode::SchedulerConfig;
use crate::utils::error::{AppError, AppResult};

const CONFIG_DIR: &str = "cascade-agents";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Toml,
    Json,
}

impl Format {
    fn for_path(path: &Path) -> AppResult<Self> {
        match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase) {
            Some(ext) if ext == "toml" => Ok(Format::Toml),
            Some(ext) if ext == "json" => Ok(Format::Json),
            _ => Err(AppError::config(format!(
                "unsupported config file '{}': expected .toml or .json",
                path.display()
            ))),
        }
    }
}

/// Complete configuration for the loop and the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CascadeConfig {
    #[serde(default)]
    pub agent: LoopConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub single_shot: SingleShotConfig,
}

impl CascadeConfig {
    /// `<config dir>/cascade-agents/config.toml`.
    pub fn default_path() -> AppResult<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
            .ok_or_else(|| AppError::config("could not determine the user config directory"))
    }

    /// Load and validate a TOML or JSON file.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let format = Format::for_path(path)?;
        let content = fs::read_to_string(path)?;
        let config: CascadeConfig = match format {
            Format::Toml => toml::from_str(&content)?,
            Format::Json => serde_json::from_str(&content)?,
        };
        config.validate().map_err(AppError::validation)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Load `path` if it exists, otherwise the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate, then write pretty-printed in the format the extension names.
    pub fn save(&self, path: impl AsRef<Path>) -> AppResult<()> {
        let path = path.as_ref();
        self.validate().map_err(AppError::validation)?;
        let content = match Format::for_path(path)? {
            Format::Toml => toml::to_string_pretty(self).map_err(|e| AppError::config(e.to_string()))?,
            Format::Json => serde_json::to_string_pretty(self)?,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), String> {
        self.agent.validate()?;
        self.scheduler.validate()?;
        self.compaction.validate()?;
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(format!(
                "retry.base_delay_ms ({}) must not exceed retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            ));
        }
        if self.gateway.max_output_chars == 0 {
            return Err("gateway.max_output_chars must be at least 1".to_string());
        }
        if self.gateway.tool_timeout_secs == Some(0) {
            return Err("gateway.tool_timeout_secs must be at least 1 when set".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_partial_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(
            br#"
[agent]
max_steps = 12

[compaction]
keep_last_turns = 4

[gateway]
ignore_patterns = ["target/", "*.lock"]
"#,
        )
        .unwrap();

        let config = CascadeConfig::load(file.path()).unwrap();
        assert_eq!(config.agent.max_steps, 12);
        assert_eq!(config.agent.no_tool_grace, 2);
        assert_eq!(config.compaction.keep_last_turns, 4);
        assert!((config.compaction.hard_threshold - 0.90).abs() < f32::EPSILON);
        assert_eq!(config.gateway.ignore_patterns.len(), 2);
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn test_save_and_load_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.json");
        let mut config = CascadeConfig::default();
        config.scheduler.max_concurrency = Some(2);

        config.save(&path).unwrap();
        let loaded = CascadeConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_rejects_inconsistent_thresholds() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(b"[compaction]\nproactive_threshold = 0.95\n").unwrap();
        let err = CascadeConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_unknown_extension() {
        let file = NamedTempFile::new().unwrap();
        assert!(matches!(
            CascadeConfig::load(file.path()),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = CascadeConfig::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, CascadeConfig::default());
    }

    #[test]
    fn test_default_path_file_name() {
        if let Ok(path) = CascadeConfig::default_path() {
            assert!(path.ends_with("cascade-agents/config.toml"));
        }
    }
}
