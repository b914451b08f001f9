//! Catalog of the actions front-ends can request, grouped by machine group.
//!
//! Actions are discovered on disk:
//!
//! ```text
//! <logic_dir>/<group>/<action>.lua    the action script
//! <logic_dir>/<group>/<action>.toml   optional display metadata
//! ```
//!
//! The group directory `internal` holds helpers, not actions, and is skipped.
//! Metadata keys are `name` (display name, defaults to the file stem) and
//! `hide` (defaults to false). Display names are served exactly as written,
//! without URL escaping.
//!
//! A scan builds a complete new snapshot which replaces the previous one in
//! a single swap. Readers keep whatever snapshot they loaded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

const SCRIPT_EXTENSION: &str = "lua";
const METADATA_EXTENSION: &str = "toml";
const SKIPPED_GROUP: &str = "internal";

/// Display metadata for one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionInfo {
    pub display_name: String,
    pub hidden: bool,
}

/// group -> action name -> metadata
pub type CatalogSnapshot = BTreeMap<String, BTreeMap<String, ActionInfo>>;

#[derive(Debug, Default, Deserialize)]
struct Metadata {
    name: Option<String>,
    #[serde(default)]
    hide: bool,
}

#[derive(Clone, Default)]
pub struct ActionCatalog {
    current: Arc<RwLock<Arc<CatalogSnapshot>>>,
}

impl ActionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The snapshot in effect right now.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.current.read().clone()
    }

    pub fn replace(&self, snapshot: CatalogSnapshot) {
        *self.current.write() = Arc::new(snapshot);
    }

    /// Rescan `dir` and swap in the result. Returns the number of actions
    /// found.
    pub fn refresh(&self, dir: &Path) -> usize {
        let snapshot = scan(dir);
        let count = snapshot.values().map(BTreeMap::len).sum();
        self.replace(snapshot);
        count
    }

    /// Rescan `dir` every `interval` until `cancel` fires.
    ///
    /// The scan touches the filesystem, so each run happens on the blocking
    /// pool.
    pub fn spawn_refresh(
        &self,
        dir: PathBuf,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let catalog = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; the caller has already
            // done the startup scan.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let catalog = catalog.clone();
                        let dir = dir.clone();
                        match tokio::task::spawn_blocking(move || catalog.refresh(&dir)).await {
                            Ok(count) => tracing::debug!(actions = count, "action catalog refreshed"),
                            Err(e) => tracing::error!(?e, "action catalog refresh panicked"),
                        }
                    }
                }
            }
        })
    }
}

/// Build a snapshot from the scripts under `dir`.
///
/// Never fails: unreadable directories and malformed metadata are logged and
/// skipped or defaulted.
pub fn scan(dir: &Path) -> CatalogSnapshot {
    let mut snapshot = CatalogSnapshot::new();
    let groups = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(path = %dir.display(), error = %e, "cannot read logic directory");
            return snapshot;
        }
    };

    for entry in groups.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(group) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if group == SKIPPED_GROUP {
            continue;
        }
        let actions = scan_group(&path, group);
        if !actions.is_empty() {
            snapshot.insert(group.to_string(), actions);
        }
    }
    snapshot
}

fn scan_group(path: &Path, group: &str) -> BTreeMap<String, ActionInfo> {
    let mut actions = BTreeMap::new();
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "search action failed");
            return actions;
        }
    };

    for entry in entries.flatten() {
        let script = entry.path();
        if !script.is_file()
            || script.extension().and_then(|e| e.to_str()) != Some(SCRIPT_EXTENSION)
        {
            continue;
        }
        let Some(action) = script.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let metadata = read_metadata(&script.with_extension(METADATA_EXTENSION));
        let info = ActionInfo {
            display_name: metadata.name.unwrap_or_else(|| action.to_string()),
            hidden: metadata.hide,
        };
        tracing::debug!(group, action, display_name = %info.display_name, "found action");
        actions.insert(action.to_string(), info);
    }
    actions
}

fn read_metadata(path: &Path) -> Metadata {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(_) => return Metadata::default(),
    };
    match toml::from_str(&contents) {
        Ok(metadata) => metadata,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring malformed action metadata");
            Metadata::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, rel: &str, contents: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn scan_finds_scripts_per_group() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "build/compile.lua", "");
        write(dir.path(), "build/test.lua", "");
        write(dir.path(), "deploy/push.lua", "");

        let snapshot = scan(dir.path());

        assert_eq!(snapshot.len(), 2);
        assert_eq!(
            snapshot["build"].keys().collect::<Vec<_>>(),
            vec!["compile", "test"]
        );
        assert_eq!(
            snapshot["deploy"]["push"],
            ActionInfo {
                display_name: "push".into(),
                hidden: false
            }
        );
    }

    #[test]
    fn scan_reads_metadata() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "build/compile.lua", "");
        write(dir.path(), "build/compile.toml", "name = \"Compile all\"\nhide = true\n");

        let info = &scan(dir.path())["build"]["compile"];
        assert_eq!(info.display_name, "Compile all");
        assert!(info.hidden);
    }

    #[test]
    fn scan_defaults_on_malformed_metadata() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "build/compile.lua", "");
        write(dir.path(), "build/compile.toml", "name = [unterminated");

        let info = &scan(dir.path())["build"]["compile"];
        assert_eq!(info.display_name, "compile");
        assert!(!info.hidden);
    }

    #[test]
    fn scan_skips_internal_and_non_scripts() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "internal/helper.lua", "");
        write(dir.path(), "build/readme.txt", "");
        write(dir.path(), "build/nested/deep.lua", "");
        write(dir.path(), "top.lua", "");

        assert!(scan(dir.path()).is_empty());
    }

    #[test]
    fn scan_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan(&dir.path().join("absent")).is_empty());
    }

    #[test]
    fn refresh_swaps_snapshot_wholesale() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "build/compile.lua", "");
        let catalog = ActionCatalog::new();

        assert_eq!(catalog.refresh(dir.path()), 1);
        let before = catalog.snapshot();

        std::fs::remove_file(dir.path().join("build/compile.lua")).unwrap();
        write(dir.path(), "deploy/push.lua", "");
        assert_eq!(catalog.refresh(dir.path()), 1);

        assert!(before.contains_key("build"));
        let after = catalog.snapshot();
        assert!(!after.contains_key("build"));
        assert!(after.contains_key("deploy"));
    }
}
