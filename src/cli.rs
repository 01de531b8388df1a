//! Wiring shared by the `convoy` subcommands: config, flags, graph, operator
//! and state store.

use anyhow::{bail, Context, Result};
use convoy_core::{DeclarationSet, EngineConfig, Flags};
use convoy_exec::{CommandOperator, LocalFsStore, MockOperator, PlatformOperator};
use convoy_graph::{resolve, ResourceGraph};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Config flags overlaid with `--flag name=value` assignments.
pub fn effective_flags(config: &EngineConfig, assignments: &[String]) -> Result<Flags> {
    let mut flags = config.flags.clone();
    let mut overrides = Flags::new();
    for raw in assignments {
        let (name, value) = Flags::parse_assignment(raw)?;
        overrides.set(name, value);
    }
    flags.merge(&overrides);
    Ok(flags)
}

/// Load declarations, build the graph and resolve inclusion.
pub fn load_graph(path: &Path, flags: &Flags) -> Result<ResourceGraph> {
    let set = DeclarationSet::load(path).with_context(|| format!("loading {}", path.display()))?;
    let graph = ResourceGraph::build(&set).with_context(|| format!("invalid graph in {}", path.display()))?;
    Ok(resolve(graph, flags))
}

pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("convoy.toml"));
    EngineConfig::load(&path).with_context(|| format!("loading config {}", path.display()))
}

/// The state store, honoring a `--state` override of the state file.
pub fn store_for(config: &EngineConfig, state: Option<&Path>) -> LocalFsStore {
    match state {
        Some(file) => {
            let mut config = config.clone();
            config.state_file = file.to_path_buf();
            LocalFsStore::from_config(&config)
        }
        None => LocalFsStore::from_config(config),
    }
}

/// `--mock` rehearses against a mock that emits every referenced output;
/// otherwise the configured command operator is used.
pub fn operator_for(config: &EngineConfig, mock: bool, graph: &ResourceGraph) -> Result<Arc<dyn PlatformOperator>> {
    if mock {
        return Ok(Arc::new(MockOperator::rehearsal(graph)));
    }
    match CommandOperator::from_config(&config.operator) {
        Some(op) => Ok(Arc::new(op)),
        None => bail!("no [operator] program configured; set one in convoy.toml or pass --mock"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::FlagValue;

    #[test]
    fn command_line_flags_override_config() {
        let mut config = EngineConfig::default();
        config.flags.set("enterprise", FlagValue::Bool(true));
        config.flags.set("class", FlagValue::Text("default".into()));
        let flags = effective_flags(&config, &["enterprise=false".to_string()]).unwrap();
        assert_eq!(flags.get("enterprise"), Some(&FlagValue::Bool(false)));
        assert_eq!(flags.get("class"), Some(&FlagValue::Text("default".into())));
        assert!(effective_flags(&config, &["broken".to_string()]).is_err());
    }

    #[test]
    fn state_override_keeps_logs_in_place() {
        let config = EngineConfig::default();
        let store = store_for(&config, Some(Path::new("/tmp/other.yaml")));
        assert_eq!(store.state_file(), Path::new("/tmp/other.yaml"));
        assert_eq!(store.event_log(), config.event_log.as_path());
    }

    #[test]
    fn operator_requires_program_unless_mocked() {
        let graph = ResourceGraph::from_declarations(
            "t",
            vec![convoy_core::Declaration::new("ns", convoy_core::ResourceKind::Namespace)],
        )
        .unwrap();
        let config = EngineConfig::default();
        assert!(operator_for(&config, false, &graph).is_err());
        assert_eq!(operator_for(&config, true, &graph).unwrap().name(), "mock");
    }
}
