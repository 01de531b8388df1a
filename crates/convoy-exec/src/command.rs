//! Command operator: run an external program once per node operation.
//!
//! The request goes to the program as JSON on stdin, with the action, node
//! and kind also exported as `CONVOY_ACTION`, `CONVOY_NODE` and `CONVOY_KIND`.
//! Stdout is either a JSON object or `key=value` lines; both become outputs.

use crate::operation::{OperationRequest, OperationResult, PlatformOperator};
use convoy_core::{OperatorConfig, Outputs};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

pub struct CommandOperator {
    program: PathBuf,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
}

impl CommandOperator {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    /// `None` when the config names no program.
    pub fn from_config(config: &OperatorConfig) -> Option<Self> {
        let program = config.program.as_ref()?;
        Some(Self {
            program: program.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            working_dir: None,
        })
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }
}

#[async_trait::async_trait]
impl PlatformOperator for CommandOperator {
    fn name(&self) -> &str {
        "command"
    }

    async fn execute(&self, request: OperationRequest) -> OperationResult {
        let body = match serde_json::to_vec(&request) {
            Ok(b) => b,
            Err(e) => return OperationResult::failure("encode", e.to_string()),
        };

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .env("CONVOY_ACTION", request.action.to_string())
            .env("CONVOY_NODE", request.node.as_str())
            .env("CONVOY_KIND", request.kind.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The engine drops this future on timeout; the child must die with it.
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        debug!(node = %request.node, action = %request.action, program = %self.program.display(), "spawning operator");

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                return OperationResult::failure(
                    "spawn",
                    format!("failed to spawn {}: {}", self.program.display(), e),
                )
            }
        };

        // Feed stdin while stdout and stderr drain; either side may fill a pipe first.
        let stdin = child.stdin.take();
        let node = &request.node;
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // Programs that ignore stdin may close it early.
                if let Err(e) = stdin.write_all(&body).await {
                    debug!(node = %node, "operator stdin closed: {}", e);
                }
            }
        };
        let ((), output) = tokio::join!(feed, child.wait_with_output());

        let output = match output {
            Ok(o) => o,
            Err(e) => return OperationResult::failure("wait", e.to_string()),
        };

        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".into());
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return OperationResult::failure(format!("exit:{}", code), stderr);
        }

        match parse_outputs(&String::from_utf8_lossy(&output.stdout)) {
            Ok(outputs) => OperationResult::success(outputs),
            Err(message) => OperationResult::failure("malformed_output", message),
        }
    }
}

/// Parse operator stdout: a JSON object, or `key=value` lines. Blank lines
/// and `#` comments are ignored.
pub fn parse_outputs(stdout: &str) -> Result<Outputs, String> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Outputs::new());
    }

    if trimmed.starts_with('{') {
        let map: serde_json::Map<String, Value> =
            serde_json::from_str(trimmed).map_err(|e| format!("invalid JSON outputs: {}", e))?;
        return Ok(map
            .into_iter()
            .map(|(k, v)| {
                let value = match v {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, value)
            })
            .collect());
    }

    let mut outputs = Outputs::new();
    for line in trimmed.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (k, v) = line
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got '{}'", line))?;
        outputs.insert(k.trim().to_string(), v.trim().to_string());
    }
    Ok(outputs)
}
