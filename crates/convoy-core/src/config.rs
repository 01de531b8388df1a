//! Engine configuration
//!
//! All tunable parameters in one place. Loaded from TOML at startup,
//! falls back to defaults if no config file exists.

use crate::error::{Error, Result};
use crate::flags::Flags;
use crate::types::Timeouts;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Ceiling used when neither the node nor the config names one.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(300);

/// Default bound on concurrently running node operations.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on operations in flight. 0 means unbounded.
    pub max_in_flight: usize,
    /// Where the last RunResult is persisted.
    pub state_file: PathBuf,
    /// Append-only JSONL transition log.
    pub event_log: PathBuf,
    /// Markdown table, one line per run.
    pub run_log: PathBuf,
    /// Engine defaults for nodes that declare no ceiling.
    pub timeouts: Timeouts,
    /// Default inclusion flags. Command-line flags override these.
    pub flags: Flags,
    /// Command-backed platform operator.
    pub operator: OperatorConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// Program invoked once per node operation.
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            state_file: PathBuf::from(".convoy/state.yaml"),
            event_log: PathBuf::from(".convoy/events.jsonl"),
            run_log: PathBuf::from(".convoy/runs.md"),
            timeouts: Timeouts::uniform(DEFAULT_OPERATION_TIMEOUT),
            flags: Flags::default(),
            operator: OperatorConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load config from a TOML file. A missing file yields defaults; a file
    /// that exists but does not parse is an error.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let config = Self::from_toml_str(&content)
                    .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?;
                tracing::info!("Loaded config from {}", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (name, d) in [
            ("create", self.timeouts.create),
            ("update", self.timeouts.update),
            ("delete", self.timeouts.delete),
        ] {
            if d == Some(Duration::ZERO) {
                return Err(Error::config(format!("timeouts.{} must be non-zero", name)));
            }
        }
        Ok(())
    }

    /// Write the current config as TOML (for generating a default config file).
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Resolve relative state paths against a base directory.
    pub fn rooted_at(mut self, base: &Path) -> Self {
        for p in [&mut self.state_file, &mut self.event_log, &mut self.run_log] {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        }
        self
    }
}
