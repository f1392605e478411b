use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Top-level process config, loaded from `pipeline-core.toml` if present, else
/// defaults. Mirrors the teacher's `Config::load` pattern: tolerant of a missing
/// file, never panics on a malformed one (propagates instead).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub directory: Option<String>,
    pub retention_days: Option<u64>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Path::new("pipeline-core.toml");
        if config_path.exists() {
            let content = fs::read_to_string(config_path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig { port: 8080 },
            logging: LoggingConfig::default(),
        }
    }
}

/// Typed read-through over the `pipeline.*` settings namespace (`spec.md` §6, §9
/// design note "Dynamic settings registry → typed config surface"). Each field has
/// a compiled default; a missing or non-numeric DB value falls back to it rather
/// than panicking.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
    pub max_build_fix_attempts: u32,
    pub max_remediation_cycles: u32,
    pub build_fix_max_output_tokens: u32,
    pub build_fix_max_tool_steps: u32,
    pub default_max_output_tokens: u32,
    pub default_max_tool_steps: u32,
    pub build_timeout_ms: u64,
    pub test_timeout_ms: u64,
    pub max_test_failures: u32,
    pub max_unique_errors: u32,
    pub warning_threshold: u32,
    pub max_versions_retained: u32,
    pub max_agent_versions_per_run: u32,
    pub max_retries: u32,
    pub allow_shell_tools: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_build_fix_attempts: 3,
            max_remediation_cycles: 2,
            build_fix_max_output_tokens: 16_000,
            build_fix_max_tool_steps: 10,
            default_max_output_tokens: 8_192,
            default_max_tool_steps: 10,
            build_timeout_ms: 30_000,
            test_timeout_ms: 60_000,
            max_test_failures: 5,
            max_unique_errors: 10,
            warning_threshold: 80,
            max_versions_retained: 50,
            max_agent_versions_per_run: 3,
            max_retries: 3,
            allow_shell_tools: false,
        }
    }
}

/// Classifier `maxOutputTokens` is intentionally not part of `PipelineConfig`: the
/// spec's open question says to keep it a hard-coded constant, not settings-exposed.
pub const CLASSIFIER_MAX_OUTPUT_TOKENS: u32 = 20;

pub const MAX_AUTO_VERSIONS_DISPLAY: usize = 20;
pub const MAX_USER_VERSIONS_DISPLAY: usize = 20;

pub const MAX_PROJECT_SOURCE_CHARS: usize = 60_000;
