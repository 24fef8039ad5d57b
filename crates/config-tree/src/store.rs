//! On-disk configuration store
//!
//! Ties a tree to its durable layout under `<root>/config/`: the append-only
//! transaction log `tlog` and the periodic full snapshot `snapshot.yaml`.
//! Compaction rewrites the snapshot atomically (write-to-temp + rename) and
//! truncates the log to a fresh tail.

use crate::error::Result;
use crate::path::TopicPath;
use crate::tlog::TransactionLog;
use crate::tree::{ConfigTree, MergeBehavior};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::info;

const TLOG_FILE: &str = "tlog";
const SNAPSHOT_FILE: &str = "snapshot.yaml";

/// Durable home of a configuration tree
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    /// Open the store under `<root>/config/`, creating the directory
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let dir = root.as_ref().join("config");
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Path of the transaction log
    pub fn tlog_path(&self) -> PathBuf {
        self.dir.join(TLOG_FILE)
    }

    /// Path of the snapshot file
    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    /// Load persisted state into a tree
    ///
    /// The snapshot (if any) is applied first at timestamp zero, then the
    /// transaction-log tail with its recorded timestamps. Returns `true` when
    /// any state was restored.
    pub fn load_into(&self, tree: &ConfigTree) -> Result<bool> {
        let mut restored = false;

        let snapshot_path = self.snapshot_path();
        if snapshot_path.exists() {
            let text = std::fs::read_to_string(&snapshot_path)?;
            let value: Value = serde_yaml::from_str(&text)?;
            tree.merge_value(&TopicPath::root(), &value, MergeBehavior::Merge, 0)?;
            info!("restored snapshot from {}", snapshot_path.display());
            restored = true;
        }

        let records = TransactionLog::read_all(self.tlog_path())?;
        if !records.is_empty() {
            info!("replaying {} transaction-log records", records.len());
            tree.replay(&records)?;
            restored = true;
        }

        Ok(restored)
    }

    /// Attach the transaction log so later mutations are recorded
    pub fn attach(&self, tree: &ConfigTree) -> Result<()> {
        tree.attach_log(TransactionLog::open(self.tlog_path())?);
        Ok(())
    }

    /// Compact: write a full snapshot atomically and truncate the log
    pub fn compact(&self, tree: &ConfigTree) -> Result<()> {
        let snapshot = tree.snapshot();
        let text = serde_yaml::to_string(&snapshot)?;

        let tmp = self.dir.join(format!("{}.tmp", SNAPSHOT_FILE));
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, self.snapshot_path())?;

        tree.truncate_log()?;
        info!("compacted configuration into {}", self.snapshot_path().display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(text: &str) -> TopicPath {
        TopicPath::parse(text).unwrap()
    }

    #[smol_potat::test]
    async fn test_mutations_survive_restart() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = ConfigStore::open(dir.path()).unwrap();
            let tree = ConfigTree::new();
            store.attach(&tree).unwrap();
            tree.write(&path("/services/main/version"), json!("1.0"), 10)
                .unwrap();
            tree.write(&path("/services/main/_State"), json!("RUNNING"), 11)
                .unwrap();
            tree.remove(&path("/services/main/_State"), 12).unwrap();
        }

        let store = ConfigStore::open(dir.path()).unwrap();
        let tree = ConfigTree::new();
        assert!(store.load_into(&tree).unwrap());
        assert_eq!(
            tree.read(&path("/services/main")),
            Some(json!({"version": "1.0"}))
        );
    }

    #[smol_potat::test]
    async fn test_compaction_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();

        let tree = ConfigTree::new();
        store.attach(&tree).unwrap();
        tree.write(&path("/services/a/version"), json!(1), 1).unwrap();
        store.compact(&tree).unwrap();
        tree.write(&path("/services/b/version"), json!(2), 2).unwrap();

        // Snapshot plus tail restores both writes.
        let restored = ConfigTree::new();
        assert!(store.load_into(&restored).unwrap());
        assert_eq!(restored.read(&path("/services/a/version")), Some(json!(1)));
        assert_eq!(restored.read(&path("/services/b/version")), Some(json!(2)));

        // The log itself only holds the tail.
        assert_eq!(TransactionLog::read_all(store.tlog_path()).unwrap().len(), 1);
    }

    #[smol_potat::test]
    async fn test_fresh_root_restores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path()).unwrap();
        let tree = ConfigTree::new();
        assert!(!store.load_into(&tree).unwrap());
    }

    #[smol_potat::test]
    async fn test_input_config_overrides_replayed_state() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = ConfigStore::open(dir.path()).unwrap();
            let tree = ConfigTree::new();
            store.attach(&tree).unwrap();
            tree.write(&path("/services/main/version"), json!("old"), 10)
                .unwrap();
        }

        let store = ConfigStore::open(dir.path()).unwrap();
        let tree = ConfigTree::new();
        store.load_into(&tree).unwrap();
        // The freshly loaded input config writes with a later timestamp.
        tree.write(&path("/services/main/version"), json!("new"), 100)
            .unwrap();
        assert_eq!(
            tree.read(&path("/services/main/version")),
            Some(json!("new"))
        );
    }
}
