//! CLI argument parsing using Clap.

use crate::config::{EnvironmentConfig, EvaluationStrategy};
use crate::error::{Error, Result};
use clap::Parser;
use std::path::PathBuf;

/// Run JavaScript files, each in its own disposable browser-like environment.
#[derive(Parser, Debug)]
#[command(name = "pijs-env")]
#[command(version, about, long_about = None)]
#[command(after_help = "Examples:
  pijs-env test.js                             Run one file with fake timers installed
  pijs-env --run-all-timers a.js b.js          Flush fake timers after each file
  pijs-env --strategy resource-load test.js    Load through a <script src> element
  pijs-env -g 'config={\"debug\":true}' t.js     Inject a global binding
")]
pub struct Cli {
    /// JSON environment config file
    #[arg(short = 'c', long, env = "PIJS_ENV_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address the scope believes it was loaded from
    #[arg(long)]
    pub test_url: Option<String>,

    /// How source files are evaluated
    #[arg(long, value_enum)]
    pub strategy: Option<EvaluationStrategy>,

    /// Run every fake timer after each file
    #[arg(long)]
    pub run_all_timers: bool,

    /// Extra global binding as NAME=JSON (repeatable)
    #[arg(short = 'g', long = "global", value_name = "NAME=JSON")]
    pub globals: Vec<String>,

    /// Source files to run
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

impl Cli {
    /// The config file (if any) with command-line overrides applied.
    pub fn environment_config(&self) -> Result<EnvironmentConfig> {
        let mut config = match &self.config {
            Some(path) => EnvironmentConfig::load_from_path(path)?,
            None => EnvironmentConfig::default(),
        };
        if let Some(test_url) = &self.test_url {
            config.test_url.clone_from(test_url);
        }
        if let Some(strategy) = self.strategy {
            config.evaluation_strategy = strategy;
        }
        for binding in &self.globals {
            let (name, value) = parse_global(binding)?;
            config.globals.insert(name, value);
        }
        config.validate()?;
        Ok(config)
    }
}

fn parse_global(binding: &str) -> Result<(String, serde_json::Value)> {
    let (name, json) = binding
        .split_once('=')
        .ok_or_else(|| Error::config(format!("Expected NAME=JSON, got {binding:?}")))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::config(format!("Missing global name in {binding:?}")));
    }
    let value = serde_json::from_str(json)
        .map_err(|e| Error::config(format!("Invalid JSON for global {name}: {e}")))?;
    Ok((name.to_string(), value))
}
