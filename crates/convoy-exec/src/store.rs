//! State store: where run results and transition events are persisted.

use crate::state::RunResult;
use crate::tracker::RunEvent;
use convoy_core::{EngineConfig, Error, Result};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

const RUN_LOG_HEADER: &str = "| run | mode | name | started | status | executed | wall |\n|---|---|---|---|---|---|---|\n";

#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    /// The last persisted result, if any.
    async fn load(&self) -> Result<Option<RunResult>>;

    async fn save(&self, result: &RunResult) -> Result<()>;

    /// Append one transition to the event log.
    async fn append_event(&self, event: &RunEvent) -> Result<()>;

    /// Append a one-line summary of a finished run.
    async fn append_run_log(&self, result: &RunResult) -> Result<()>;

    fn location(&self) -> String;
}

/// Local filesystem store: YAML state file, JSONL event log, markdown run log.
pub struct LocalFsStore {
    state_file: PathBuf,
    event_log: PathBuf,
    run_log: PathBuf,
}

impl LocalFsStore {
    pub fn new(state_file: impl AsRef<Path>, event_log: impl AsRef<Path>, run_log: impl AsRef<Path>) -> Self {
        Self {
            state_file: state_file.as_ref().to_path_buf(),
            event_log: event_log.as_ref().to_path_buf(),
            run_log: run_log.as_ref().to_path_buf(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(&config.state_file, &config.event_log, &config.run_log)
    }

    /// All three files side by side in `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self::new(dir.join("state.yaml"), dir.join("events.jsonl"), dir.join("runs.md"))
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    pub fn event_log(&self) -> &Path {
        &self.event_log
    }

    pub fn run_log(&self) -> &Path {
        &self.run_log
    }
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    Ok(())
}

async fn append(path: &Path, content: &str) -> Result<()> {
    ensure_parent(path).await?;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(content.as_bytes()).await?;
    Ok(())
}

#[async_trait::async_trait]
impl StateStore for LocalFsStore {
    async fn load(&self) -> Result<Option<RunResult>> {
        match tokio::fs::read_to_string(&self.state_file).await {
            Ok(content) => {
                let result: RunResult = serde_yaml::from_str(&content).map_err(|e| {
                    Error::state(format!("unreadable state file {}: {}", self.state_file.display(), e))
                })?;
                tracing::debug!(path = %self.state_file.display(), run_id = %result.run_id, "loaded prior state");
                Ok(Some(result))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, result: &RunResult) -> Result<()> {
        ensure_parent(&self.state_file).await?;
        // Write-then-rename so a crash never leaves a half-written state file.
        let tmp = self.state_file.with_extension("yaml.tmp");
        tokio::fs::write(&tmp, result.to_yaml()).await?;
        tokio::fs::rename(&tmp, &self.state_file).await?;
        tracing::debug!(path = %self.state_file.display(), run_id = %result.run_id, "saved state");
        Ok(())
    }

    async fn append_event(&self, event: &RunEvent) -> Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        append(&self.event_log, &line).await
    }

    async fn append_run_log(&self, result: &RunResult) -> Result<()> {
        let mut content = String::new();
        if !tokio::fs::try_exists(&self.run_log).await.unwrap_or(false) {
            content.push_str(RUN_LOG_HEADER);
        }
        content.push_str(&result.run_log_line());
        content.push('\n');
        append(&self.run_log, &content).await
    }

    fn location(&self) -> String {
        self.state_file.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::Transition;
    use chrono::Utc;
    use convoy_core::{Mode, NodeState};

    #[tokio::test]
    async fn missing_state_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalFsStore::in_dir(tmp.path());
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalFsStore::in_dir(tmp.path().join("nested/.convoy"));
        let result = RunResult::new("run-1", Mode::Apply, "bootstrap");
        store.save(&result).await.unwrap();
        let back = store.load().await.unwrap().unwrap();
        assert_eq!(back, result);
        assert!(!store.state_file().with_extension("yaml.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_state_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalFsStore::in_dir(tmp.path());
        std::fs::write(store.state_file(), "run_id: [").unwrap();
        assert!(store.load().await.is_err());
    }

    #[tokio::test]
    async fn events_are_json_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalFsStore::in_dir(tmp.path());
        for (seq, to) in [(1, NodeState::Ready), (2, NodeState::Running)] {
            let event = RunEvent {
                run_id: "run-1".into(),
                transition: Transition {
                    seq,
                    node: "ns".into(),
                    from: NodeState::Pending,
                    to,
                    at: Utc::now(),
                    detail: None,
                },
            };
            store.append_event(&event).await.unwrap();
        }
        let content = std::fs::read_to_string(store.event_log()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: RunEvent = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed.transition.to, NodeState::Running);
        assert!(lines[0].contains("\"run_id\":\"run-1\""));
    }

    #[tokio::test]
    async fn run_log_has_single_header() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalFsStore::in_dir(tmp.path());
        store.append_run_log(&RunResult::new("r1", Mode::Apply, "x")).await.unwrap();
        store.append_run_log(&RunResult::new("r2", Mode::Destroy, "x")).await.unwrap();
        let content = std::fs::read_to_string(store.run_log()).unwrap();
        assert_eq!(content.matches("| run | mode |").count(), 1);
        assert!(content.contains("| r2 | destroy | x |"));
    }
}
