//! Node configuration

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::merge::SchedulerConfig;
use crate::replication::ReplicatorConfig;

use super::error::{NodeError, NodeResult};

/// Database every node starts with
pub const DEFAULT_DATABASE: &str = "default";

/// Configuration for one node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Node name; also the `{replica}` macro unless overridden
    pub name: String,
    /// Values substituted for `{name}` in engine arguments
    pub macros: BTreeMap<String, String>,
    /// Directory for persisted replica state, one subdirectory per database
    pub state_dir: Option<PathBuf>,
    /// Wait for mutations issued through `query` to finish
    pub mutations_sync: bool,
    pub scheduler: SchedulerConfig,
    pub replicator: ReplicatorConfig,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut macros = BTreeMap::new();
        macros.insert("replica".to_string(), name.clone());
        Self {
            name,
            macros,
            state_dir: None,
            mutations_sync: false,
            scheduler: SchedulerConfig::default(),
            replicator: ReplicatorConfig::default(),
        }
    }

    #[must_use]
    pub fn with_macro(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.macros.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_mutations_sync(mut self, sync: bool) -> Self {
        self.mutations_sync = sync;
        self
    }

    #[must_use]
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    #[must_use]
    pub fn with_replicator(mut self, replicator: ReplicatorConfig) -> Self {
        self.replicator = replicator;
        self
    }

    /// Replace every `{name}` in `text` with its macro value
    pub fn substitute_macros(&self, text: &str) -> NodeResult<String> {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let end = after
                .find('}')
                .ok_or_else(|| NodeError::UnknownMacro(after.to_string()))?;
            let name = &after[..end];
            let value = self
                .macros
                .get(name)
                .ok_or_else(|| NodeError::UnknownMacro(name.to_string()))?;
            out.push_str(value);
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitute_macros() {
        let config = NodeConfig::new("test1").with_macro("shard", "01");
        assert_eq!(config.substitute_macros("{replica}").unwrap(), "test1");
        assert_eq!(
            config
                .substitute_macros("/clickhouse/tables/{shard}/t")
                .unwrap(),
            "/clickhouse/tables/01/t"
        );
        assert_eq!(config.substitute_macros("plain").unwrap(), "plain");
        assert!(matches!(
            config.substitute_macros("{cluster}"),
            Err(NodeError::UnknownMacro(m)) if m == "cluster"
        ));
    }
}
