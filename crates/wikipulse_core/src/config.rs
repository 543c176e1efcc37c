use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::windows::parse_target_date;

pub const DEFAULT_API_URL: &str = "https://en.wikipedia.org/w/api.php";
pub const DEFAULT_USER_AGENT: &str = "wikipulse/0.1";
pub const DEFAULT_LIMIT: usize = 500;
pub const MAX_LIMIT: usize = 500;
pub const DEFAULT_SLICE_SECS: u32 = 30;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct PulseConfig {
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ApiSection {
    pub url: Option<String>,
    pub user_agent: Option<String>,
    pub limit: Option<usize>,
    pub slice_secs: Option<u32>,
    pub fail_on_saturation: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct PipelineSection {
    pub target_date: Option<String>,
}

/// Extraction settings after env/config/default resolution and validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSettings {
    pub limit: usize,
    pub slice_secs: u32,
    pub fail_on_saturation: bool,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            slice_secs: DEFAULT_SLICE_SECS,
            fail_on_saturation: true,
        }
    }
}

impl PulseConfig {
    /// Resolve the API URL: env WIKI_API_URL > config > DEFAULT_API_URL.
    pub fn api_url(&self) -> String {
        env_override("WIKI_API_URL")
            .or_else(|| self.api.url.clone())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string())
    }

    /// Resolve user agent: env WIKI_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        env_override("WIKI_USER_AGENT")
            .or_else(|| self.api.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn ingest_settings(&self) -> Result<IngestSettings, PipelineError> {
        let limit = self.api.limit.unwrap_or(DEFAULT_LIMIT);
        if limit == 0 || limit > MAX_LIMIT {
            return Err(PipelineError::invalid_argument(format!(
                "api.limit must be between 1 and {MAX_LIMIT}, got {limit}"
            )));
        }
        let slice_secs = self.api.slice_secs.unwrap_or(DEFAULT_SLICE_SECS);
        if slice_secs == 0 {
            return Err(PipelineError::invalid_argument(
                "api.slice_secs must be at least 1",
            ));
        }
        Ok(IngestSettings {
            limit,
            slice_secs,
            fail_on_saturation: self.api.fail_on_saturation.unwrap_or(true),
        })
    }

    /// Resolve the target day: flag > env WIKIPULSE_TARGET_DATE > config.
    pub fn target_date(&self, flag: Option<&str>) -> Result<NaiveDate, PipelineError> {
        self.target_date_with_lookup(flag, |key| env::var(key).ok())
    }

    pub(crate) fn target_date_with_lookup<F>(
        &self,
        flag: Option<&str>,
        lookup_env: F,
    ) -> Result<NaiveDate, PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = flag
            .map(str::to_string)
            .or_else(|| lookup_env("WIKIPULSE_TARGET_DATE"))
            .or_else(|| self.pipeline.target_date.clone())
            .ok_or_else(|| {
                PipelineError::invalid_argument(
                    "target date is not configured; pass --date, set WIKIPULSE_TARGET_DATE, or set pipeline.target_date",
                )
            })?;
        parse_target_date(&raw)
    }
}

/// Load and parse a PulseConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<PulseConfig> {
    if !config_path.exists() {
        return Ok(PulseConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: PulseConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn env_override(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_has_no_overrides() {
        let config = PulseConfig::default();
        assert!(config.api.url.is_none());
        assert!(config.pipeline.target_date.is_none());
        assert_eq!(
            config.ingest_settings().expect("settings"),
            IngestSettings::default()
        );
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert_eq!(config, PulseConfig::default());
    }

    #[test]
    fn load_config_parses_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[api]
url = "https://wiki.example.org/w/api.php"
user_agent = "test-agent/1.0"
limit = 400
slice_secs = 25
fail_on_saturation = false

[pipeline]
target_date = "2024-10-31"
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(
            config.api.url.as_deref(),
            Some("https://wiki.example.org/w/api.php")
        );
        assert_eq!(config.api.user_agent.as_deref(), Some("test-agent/1.0"));
        assert_eq!(
            config.ingest_settings().expect("settings"),
            IngestSettings {
                limit: 400,
                slice_secs: 25,
                fail_on_saturation: false,
            }
        );
        assert_eq!(config.pipeline.target_date.as_deref(), Some("2024-10-31"));
    }

    #[test]
    fn load_config_tolerates_partial_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[other]\nkey = 1\n").expect("write config");
        let config = load_config(&config_path).expect("load config");
        assert_eq!(config, PulseConfig::default());
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[api\nurl = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn ingest_settings_reject_out_of_range_values() {
        let mut config = PulseConfig::default();
        config.api.limit = Some(501);
        assert!(matches!(
            config.ingest_settings(),
            Err(PipelineError::InvalidArgument { .. })
        ));
        config.api.limit = Some(0);
        assert!(config.ingest_settings().is_err());
        config.api.limit = None;
        config.api.slice_secs = Some(0);
        assert!(config.ingest_settings().is_err());
    }

    #[test]
    fn target_date_prefers_flag_then_env_then_config() {
        let mut config = PulseConfig::default();
        config.pipeline.target_date = Some("2024-10-29".to_string());
        let env = HashMap::from([(
            "WIKIPULSE_TARGET_DATE".to_string(),
            "2024-10-30".to_string(),
        )]);

        let from_flag = config
            .target_date_with_lookup(Some("2024-10-31"), |key| env.get(key).cloned())
            .expect("flag");
        assert_eq!(from_flag, NaiveDate::from_ymd_opt(2024, 10, 31).unwrap());

        let from_env = config
            .target_date_with_lookup(None, |key| env.get(key).cloned())
            .expect("env");
        assert_eq!(from_env, NaiveDate::from_ymd_opt(2024, 10, 30).unwrap());

        let from_config = config
            .target_date_with_lookup(None, |_| None)
            .expect("config");
        assert_eq!(from_config, NaiveDate::from_ymd_opt(2024, 10, 29).unwrap());
    }

    #[test]
    fn missing_or_malformed_target_date_is_invalid_argument() {
        let config = PulseConfig::default();
        let missing = config
            .target_date_with_lookup(None, |_| None)
            .expect_err("missing");
        assert!(matches!(missing, PipelineError::InvalidArgument { .. }));

        let malformed = config
            .target_date_with_lookup(Some("31-10-2024"), |_| None)
            .expect_err("malformed");
        assert!(matches!(malformed, PipelineError::InvalidArgument { .. }));
    }
}
