//! Environment-level configuration for a parameter server node (§6): the
//! scheduler address, this node's kind and listen address, a PS's shard
//! id, and its checkpoint directory. CLI argument parsing and any other
//! outer surface are out of scope (§1); this crate is just the config
//! value a binary would populate from a TOML file and/or environment
//! variables before constructing the node it describes.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use ps_errors::{PsError, PsResult};

/// Which of the three cluster roles (§2) a node started with this config
/// plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// The singleton control-plane node.
    Scheduler,
    /// A parameter-server shard.
    Ps,
    /// A stateless worker.
    Worker,
}

/// A node's full environment-level configuration, deserializable from a
/// TOML file and overridable from environment variables via
/// [`NodeConfig::load`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's role.
    pub node_kind: NodeKind,
    /// The scheduler's address (`host:port`). Every node, including the
    /// scheduler itself, needs this to register on startup; the
    /// scheduler's own value is conventionally its own listen address.
    pub scheduler_addr: String,
    /// This node's own listen address (`host:port`), advertised to the
    /// scheduler on registration.
    pub listen_addr: String,
    /// A PS node's shard id, assigned by the scheduler on join and
    /// persisted here so a restarted PS can request the same id back.
    /// Meaningless for `Scheduler`/`Worker` kinds.
    pub shard_id: Option<u64>,
    /// The directory a PS persists its checkpoint to / loads from (§6's
    /// "Persisted state layout"). Meaningless for `Scheduler`/`Worker`.
    pub checkpoint_dir: Option<PathBuf>,
}

const ENV_PREFIX: &str = "PS_";

impl NodeConfig {
    /// Parse a config from TOML source, then apply any `PS_*` environment
    /// variable overrides present in `env` (kept as an explicit map rather
    /// than reading `std::env` directly so this stays unit-testable; a
    /// binary entry point would call [`Self::load`] with
    /// `std::env::vars().collect()`).
    pub fn load(toml_source: &str, env: &HashMap<String, String>) -> PsResult<Self> {
        let mut config: NodeConfig = toml::from_str(toml_source)
            .map_err(|e| PsError::internal(format!("invalid node config: {e}")))?;
        config.apply_env_overrides(env);
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self, env: &HashMap<String, String>) {
        if let Some(v) = env.get(&format!("{ENV_PREFIX}SCHEDULER_ADDR")) {
            self.scheduler_addr = v.clone();
        }
        if let Some(v) = env.get(&format!("{ENV_PREFIX}LISTEN_ADDR")) {
            self.listen_addr = v.clone();
        }
        if let Some(v) = env.get(&format!("{ENV_PREFIX}SHARD_ID")) {
            self.shard_id = v.parse().ok();
        }
        if let Some(v) = env.get(&format!("{ENV_PREFIX}CHECKPOINT_DIR")) {
            self.checkpoint_dir = Some(PathBuf::from(v));
        }
    }

    fn validate(&self) -> PsResult<()> {
        if self.scheduler_addr.is_empty() {
            return Err(PsError::internal("scheduler_addr must not be empty"));
        }
        if self.listen_addr.is_empty() {
            return Err(PsError::internal("listen_addr must not be empty"));
        }
        if self.node_kind == NodeKind::Ps && self.checkpoint_dir.is_none() {
            return Err(PsError::internal("a ps node requires checkpoint_dir"));
        }
        Ok(())
    }

    /// A scheduler config with no shard id / checkpoint directory.
    pub fn scheduler(listen_addr: impl Into<String>) -> Self {
        let listen_addr = listen_addr.into();
        NodeConfig {
            node_kind: NodeKind::Scheduler,
            scheduler_addr: listen_addr.clone(),
            listen_addr,
            shard_id: None,
            checkpoint_dir: None,
        }
    }

    /// A PS config.
    pub fn ps(
        scheduler_addr: impl Into<String>,
        listen_addr: impl Into<String>,
        checkpoint_dir: impl Into<PathBuf>,
    ) -> Self {
        NodeConfig {
            node_kind: NodeKind::Ps,
            scheduler_addr: scheduler_addr.into(),
            listen_addr: listen_addr.into(),
            shard_id: None,
            checkpoint_dir: Some(checkpoint_dir.into()),
        }
    }

    /// A worker config.
    pub fn worker(scheduler_addr: impl Into<String>, listen_addr: impl Into<String>) -> Self {
        NodeConfig {
            node_kind: NodeKind::Worker,
            scheduler_addr: scheduler_addr.into(),
            listen_addr: listen_addr.into(),
            shard_id: None,
            checkpoint_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        node_kind = "ps"
        scheduler_addr = "127.0.0.1:9000"
        listen_addr = "127.0.0.1:9100"
        shard_id = 3
        checkpoint_dir = "/var/lib/ps/shard-3"
    "#;

    #[test]
    fn parses_a_well_formed_toml_config() {
        let config = NodeConfig::load(SAMPLE, &HashMap::new()).unwrap();
        assert_eq!(config.node_kind, NodeKind::Ps);
        assert_eq!(config.scheduler_addr, "127.0.0.1:9000");
        assert_eq!(config.shard_id, Some(3));
        assert_eq!(config.checkpoint_dir, Some(PathBuf::from("/var/lib/ps/shard-3")));
    }

    #[test]
    fn env_vars_override_toml_values() {
        let mut env = HashMap::new();
        env.insert("PS_LISTEN_ADDR".to_string(), "0.0.0.0:9999".to_string());
        env.insert("PS_SHARD_ID".to_string(), "7".to_string());
        let config = NodeConfig::load(SAMPLE, &env).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9999");
        assert_eq!(config.shard_id, Some(7));
        // untouched fields still come from the TOML source.
        assert_eq!(config.scheduler_addr, "127.0.0.1:9000");
    }

    #[test]
    fn ps_without_checkpoint_dir_is_rejected() {
        let toml_source = r#"
            node_kind = "ps"
            scheduler_addr = "127.0.0.1:9000"
            listen_addr = "127.0.0.1:9100"
        "#;
        assert!(NodeConfig::load(toml_source, &HashMap::new()).is_err());
    }

    #[test]
    fn worker_config_needs_no_checkpoint_dir() {
        let toml_source = r#"
            node_kind = "worker"
            scheduler_addr = "127.0.0.1:9000"
            listen_addr = "127.0.0.1:9200"
        "#;
        let config = NodeConfig::load(toml_source, &HashMap::new()).unwrap();
        assert_eq!(config.node_kind, NodeKind::Worker);
    }

    #[test]
    fn constructors_produce_valid_configs() {
        assert!(NodeConfig::scheduler("127.0.0.1:9000").checkpoint_dir.is_none());
        assert_eq!(
            NodeConfig::ps("127.0.0.1:9000", "127.0.0.1:9100", "/tmp/ps").node_kind,
            NodeKind::Ps
        );
        assert_eq!(
            NodeConfig::worker("127.0.0.1:9000", "127.0.0.1:9200").node_kind,
            NodeKind::Worker
        );
    }
}
