//! Declaration sets: the flat, ordering-annotated resource lists a deployment
//! is written as.

use crate::error::{Error, Result};
use crate::flags::Predicate;
use crate::types::{OutputRef, Payload, ResourceKind, Timeouts};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// One declared resource.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Declaration {
    pub id: String,
    pub kind: ResourceKind,
    /// Forwarded verbatim to the platform operator.
    #[serde(default)]
    pub spec: Payload,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Predicate>,
    /// Named inputs taken from other nodes' outputs. Each implies a dependency.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, OutputRef>,
}

impl Declaration {
    pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            spec: Payload::Null,
            depends_on: Vec::new(),
            parent: None,
            timeouts: Timeouts::default(),
            when: None,
            inputs: BTreeMap::new(),
        }
    }

    pub fn spec(mut self, spec: Payload) -> Self {
        self.spec = spec;
        self
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn parent(mut self, id: impl Into<String>) -> Self {
        self.parent = Some(id.into());
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn when(mut self, predicate: Predicate) -> Self {
        self.when = Some(predicate);
        self
    }

    pub fn input(mut self, name: impl Into<String>, from: impl Into<String>, key: impl Into<String>) -> Self {
        self.inputs
            .insert(name.into(), OutputRef::new(from.into(), key));
        self
    }
}

/// A whole deployment: resources plus the outputs it exports.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeclarationSet {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exports: BTreeMap<String, OutputRef>,
    #[serde(default)]
    pub resources: Vec<Declaration>,
}

impl DeclarationSet {
    pub fn new(name: impl Into<String>, resources: Vec<Declaration>) -> Self {
        Self {
            name: name.into(),
            exports: BTreeMap::new(),
            resources,
        }
    }

    pub fn export(mut self, name: impl Into<String>, from: impl Into<String>, key: impl Into<String>) -> Self {
        self.exports
            .insert(name.into(), OutputRef::new(from.into(), key));
        self
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let set: Self = serde_yaml::from_str(content)?;
        if set.resources.is_empty() {
            return Err(Error::declaration("declaration set has no resources"));
        }
        Ok(set)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::declaration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut set = Self::from_yaml_str(&content)?;
        if set.name.is_empty() {
            set.name = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
        }
        tracing::debug!(path = %path.display(), resources = set.resources.len(), "loaded declarations");
        Ok(set)
    }

    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_default()
    }
}
