//! Allowed-agents registry.
//!
//! A read-mostly whitelist of `{name, auth_key, approved_cns}` records loaded
//! from a YAML file. Reads go through a single atomic pointer load; reloads
//! parse and validate into a fresh snapshot and swap the pointer only on
//! success, so authentication never observes a partial or invalid list.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwap;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::REGISTRY_POLL_INTERVAL;

/// One registry entry: an auth key and the client-cert common names allowed
/// to use it.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AllowedAgent {
    pub name: String,
    pub auth_key: String,
    #[serde(default)]
    pub approved_cns: Vec<String>,
}

/// The whole whitelist, as found under the config file's `agents` key.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct AllowedAgents {
    #[serde(default)]
    pub agents: Vec<AllowedAgent>,
}

impl AllowedAgents {
    /// Reject entries that could never authenticate anyone, or that would
    /// authenticate everyone.
    pub fn validate(&self) -> Result<()> {
        for agent in &self.agents {
            if agent.auth_key.is_empty() {
                return Err(Error::config(format!("agent {:?}: empty auth key", agent.name)));
            }
            if agent.approved_cns.is_empty() {
                return Err(Error::config(format!("agent {:?}: empty approved CNs", agent.name)));
            }
        }
        Ok(())
    }
}

/// Live registry snapshot holder.
pub struct Registry {
    snapshot: ArcSwap<AllowedAgents>,
}

impl Registry {
    /// Load and validate the registry from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let agents = read_config(path)?;
        info!("loaded {} allowed agent(s) from {}", agents.agents.len(), path.display());
        Ok(Self { snapshot: ArcSwap::from_pointee(agents) })
    }

    /// Build a registry from an in-memory list.
    pub fn from_agents(agents: AllowedAgents) -> Result<Self> {
        agents.validate()?;
        Ok(Self { snapshot: ArcSwap::from_pointee(agents) })
    }

    /// The current snapshot. Immutable once published; safe to iterate
    /// without locking.
    pub fn current(&self) -> Arc<AllowedAgents> {
        self.snapshot.load_full()
    }

    /// Look up an auth key and check the peer certificate CN against the
    /// entry. `peer_cn` is `None` only when TLS is disabled, in which case
    /// the key match alone decides.
    pub fn authorize(&self, key: &str, peer_cn: Option<&str>) -> Option<AllowedAgent> {
        if key.is_empty() {
            return None;
        }
        let snapshot = self.snapshot.load();
        let entry = snapshot.agents.iter().find(|a| a.auth_key == key)?;
        match peer_cn {
            None => Some(entry.clone()),
            Some(cn) => entry
                .approved_cns
                .iter()
                .any(|approved| approved == cn)
                .then(|| entry.clone()),
        }
    }

    /// Re-read the file and swap the snapshot. On any parse or validation
    /// failure the previous snapshot stays live.
    pub fn reload(&self, path: &Path) -> Result<()> {
        let agents = read_config(path)?;
        let count = agents.agents.len();
        self.snapshot.store(Arc::new(agents));
        info!("reloaded {count} allowed agent(s) from {}", path.display());
        Ok(())
    }

    /// Watch the config file for changes by polling its mtime, reloading on
    /// change until cancellation.
    pub fn watch(self: Arc<Self>, path: PathBuf, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut last_modified = file_mtime(&path).await;
            let mut ticker = tokio::time::interval(REGISTRY_POLL_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let modified = file_mtime(&path).await;
                if modified != last_modified {
                    last_modified = modified;
                    info!("config file changed: {}, reload it", path.display());
                    if let Err(e) = self.reload(&path) {
                        warn!("keeping previous allowed agents: {e}");
                    }
                }
            }
        });
    }
}

async fn file_mtime(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.and_then(|m| m.modified()).ok()
}

fn read_config(path: &Path) -> Result<AllowedAgents> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read {}: {e}", path.display())))?;
    let agents: AllowedAgents = serde_yaml::from_str(&text)
        .map_err(|e| Error::config(format!("failed to parse {}: {e}", path.display())))?;
    agents.validate()?;
    Ok(agents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VALID: &str = r#"
agents:
  - name: a
    auth_key: k
    approved_cns: ["agent-a"]
  - name: b
    auth_key: k2
    approved_cns: ["agent-b", "agent-b2"]
"#;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_valid_config() {
        let file = write_config(VALID);
        let registry = Registry::load(file.path()).unwrap();
        assert_eq!(registry.current().agents.len(), 2);
    }

    #[test]
    fn test_validation_rejects_empty_auth_key() {
        let agents = AllowedAgents {
            agents: vec![AllowedAgent {
                name: "x".into(),
                auth_key: "".into(),
                approved_cns: vec!["cn".into()],
            }],
        };
        assert!(agents.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_empty_cns() {
        let agents = AllowedAgents {
            agents: vec![AllowedAgent {
                name: "x".into(),
                auth_key: "k".into(),
                approved_cns: vec![],
            }],
        };
        assert!(agents.validate().is_err());
    }

    #[test]
    fn test_authorize_semantics() {
        let file = write_config(VALID);
        let registry = Registry::load(file.path()).unwrap();

        // TLS disabled: key match alone decides.
        assert!(registry.authorize("k", None).is_some());
        assert!(registry.authorize("nope", None).is_none());
        assert!(registry.authorize("", None).is_none());

        // TLS enabled: the CN must be approved for that entry.
        assert!(registry.authorize("k", Some("agent-a")).is_some());
        assert!(registry.authorize("k", Some("agent-b")).is_none());
        assert!(registry.authorize("k2", Some("agent-b2")).is_some());
    }

    #[test]
    fn test_reload_keeps_prior_snapshot_on_invalid_config() {
        let file = write_config(VALID);
        let registry = Registry::load(file.path()).unwrap();

        std::fs::write(
            file.path(),
            "agents:\n  - name: broken\n    auth_key: \"\"\n    approved_cns: [\"c\"]\n",
        )
        .unwrap();
        assert!(registry.reload(file.path()).is_err());

        // A previously-valid key still authorizes.
        assert!(registry.authorize("k", Some("agent-a")).is_some());
        assert_eq!(registry.current().agents.len(), 2);
    }

    #[test]
    fn test_reload_swaps_on_valid_config() {
        let file = write_config(VALID);
        let registry = Registry::load(file.path()).unwrap();

        std::fs::write(
            file.path(),
            "agents:\n  - name: c\n    auth_key: fresh\n    approved_cns: [\"agent-c\"]\n",
        )
        .unwrap();
        registry.reload(file.path()).unwrap();

        assert!(registry.authorize("k", None).is_none());
        assert!(registry.authorize("fresh", Some("agent-c")).is_some());
    }
}
