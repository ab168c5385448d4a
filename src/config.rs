//! Environment configuration loading and validation.

use crate::error::{Error, Result};
use crate::fake_timers::DEFAULT_MAX_LOOPS;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Environment variable naming a JSON config file for [`EnvironmentConfig::load`].
pub const CONFIG_PATH_ENV: &str = "PIJS_ENV_CONFIG";

pub const DEFAULT_TEST_URL: &str = "http://localhost/";
pub const DEFAULT_STACK_TRACE_LIMIT: u32 = 100;

/// How `run_source_text` gets source into the scope.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "camelCase")]
pub enum EvaluationStrategy {
    /// Evaluate directly in the scope's context.
    #[default]
    Direct,
    /// Inject a `<script src>` and serve the source through the resource loader.
    #[serde(alias = "resource_load", alias = "resource-load")]
    ResourceLoad,
}

/// Per-environment configuration. Never mutated by the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// The address the scope believes it was loaded from.
    #[serde(alias = "testURL", alias = "testUrl")]
    pub test_url: String,
    /// Extra global bindings, deep-copied into every environment.
    pub globals: serde_json::Map<String, Value>,
    #[serde(alias = "evaluationStrategy")]
    pub evaluation_strategy: EvaluationStrategy,
    /// Value for `Error.stackTraceLimit`.
    #[serde(alias = "stackTraceLimit")]
    pub stack_trace_limit: u32,
    /// Runaway guard for the fake timer `run_*` loops.
    #[serde(alias = "maxTimerLoops")]
    pub max_timer_loops: usize,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            test_url: DEFAULT_TEST_URL.to_string(),
            globals: serde_json::Map::new(),
            evaluation_strategy: EvaluationStrategy::Direct,
            stack_trace_limit: DEFAULT_STACK_TRACE_LIMIT,
            max_timer_loops: DEFAULT_MAX_LOOPS,
        }
    }
}

impl EnvironmentConfig {
    pub fn new(test_url: impl Into<String>) -> Self {
        Self {
            test_url: test_url.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_global(mut self, name: impl Into<String>, value: Value) -> Self {
        self.globals.insert(name.into(), value);
        self
    }

    #[must_use]
    pub const fn with_strategy(mut self, strategy: EvaluationStrategy) -> Self {
        self.evaluation_strategy = strategy;
        self
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| Error::config(format!("Failed to parse environment config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the file named by `PIJS_ENV_CONFIG`, or defaults when unset.
    pub fn load() -> Result<Self> {
        Self::load_with_env(env_lookup)
    }

    pub fn load_with_env<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        match get_env(CONFIG_PATH_ENV).filter(|path| !path.trim().is_empty()) {
            Some(path) => Self::load_from_path(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    /// Load settings from a specific JSON file. An empty file yields defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!(
                "Failed to read environment config {}: {e}",
                path.display()
            ))
        })?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Self = serde_json::from_str(&content).map_err(|e| {
            Error::config(format!(
                "Failed to parse environment config {}: {e}",
                path.display()
            ))
        })?;
        config.validate()?;
        tracing::debug!(event = "config.load", path = %path.display(), "Loaded environment config");
        Ok(config)
    }

    /// Write the config as pretty JSON, replacing `path` atomically.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        std::fs::create_dir_all(&parent)?;

        let mut contents = serde_json::to_string_pretty(self)?;
        contents.push('\n');

        let mut tmp = NamedTempFile::new_in(&parent)?;
        tmp.write_all(contents.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|err| {
            Error::config(format!(
                "Failed to persist environment config to {}: {}",
                path.display(),
                err.error
            ))
        })?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.test_url).map_err(|e| {
            Error::config(format!("Invalid testURL {:?}: {e}", self.test_url))
        })?;
        if self.stack_trace_limit == 0 {
            return Err(Error::config("stackTraceLimit must be greater than zero"));
        }
        if self.max_timer_loops == 0 {
            return Err(Error::config("maxTimerLoops must be greater than zero"));
        }
        Ok(())
    }
}

fn env_lookup(var: &str) -> Option<String> {
    std::env::var(var).ok()
}
