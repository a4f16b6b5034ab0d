//! Hot reload support: map file changes back to plugin names.
//!
//! Watches the directory of every plugin file (editors tend to save by
//! rename, which a watch on the file itself would miss) and reports which
//! plugins changed since the last poll. `notify` pushes raw events into a
//! channel; the daemon drains it once per tick.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use anyhow::{Context, Result};
use notify::event::{AccessKind, AccessMode, ModifyKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

/// Watches plugin files and yields the names of changed plugins.
pub struct PluginWatcher {
    watcher: RecommendedWatcher,
    rx: mpsc::Receiver<notify::Result<Event>>,
    /// Canonical file path -> plugin name.
    files: HashMap<PathBuf, String>,
    /// Directory -> number of plugins living in it.
    dirs: HashMap<PathBuf, usize>,
}

impl std::fmt::Debug for PluginWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginWatcher")
            .field("files", &self.files.len())
            .field("dirs", &self.dirs.len())
            .finish_non_exhaustive()
    }
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Whether `kind` can leave new plugin source on disk. Deletions and
/// reads cannot.
fn is_write(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
            | EventKind::Modify(
                ModifyKind::Data(_) | ModifyKind::Name(_) | ModifyKind::Any | ModifyKind::Other
            )
    )
}

impl PluginWatcher {
    /// Create a watcher with no plugins.
    pub fn new() -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })
        .context("Failed to create file watcher")?;

        Ok(Self {
            watcher,
            rx,
            files: HashMap::new(),
            dirs: HashMap::new(),
        })
    }

    /// Start tracking `path` for plugin `name`.
    pub fn add(&mut self, name: &str, path: &Path) -> Result<()> {
        let file = canonical(path);
        let dir = file
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

        if !self.dirs.contains_key(&dir) {
            self.watcher
                .watch(&dir, RecursiveMode::NonRecursive)
                .with_context(|| format!("Failed to watch: {}", dir.display()))?;
            log::debug!("Watching plugin directory {}", dir.display());
        }
        *self.dirs.entry(dir).or_default() += 1;
        self.files.insert(file, name.to_string());
        Ok(())
    }

    /// Stop tracking plugin `name`.
    pub fn remove(&mut self, name: &str) {
        let Some(file) = self
            .files
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(f, _)| f.clone())
        else {
            return;
        };
        self.files.remove(&file);

        if let Some(dir) = file.parent() {
            if let Some(count) = self.dirs.get_mut(dir) {
                *count -= 1;
                if *count == 0 {
                    self.dirs.remove(dir);
                    let _ = self.watcher.unwatch(dir);
                }
            }
        }
    }

    /// Names of plugins whose file was written, created or renamed into
    /// place since the last call. Deletions are ignored.
    #[must_use]
    pub fn poll_changes(&self) -> BTreeSet<String> {
        let mut changed = BTreeSet::new();
        while let Ok(result) = self.rx.try_recv() {
            let event = match result {
                Ok(event) => event,
                Err(e) => {
                    log::warn!("File watcher error: {e}");
                    continue;
                }
            };
            if !is_write(&event.kind) {
                continue;
            }
            changed.extend(
                event
                    .paths
                    .iter()
                    .filter_map(|path| self.plugin_for(path))
                    .map(str::to_string),
            );
        }
        changed
    }

    fn plugin_for(&self, path: &Path) -> Option<&str> {
        self.files
            .get(path)
            .or_else(|| self.files.get(&canonical(path)))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind, RenameMode};
    use std::time::{Duration, Instant};

    #[test]
    fn test_is_write() {
        assert!(is_write(&EventKind::Create(CreateKind::File)));
        assert!(is_write(&EventKind::Modify(ModifyKind::Data(
            DataChange::Content
        ))));
        assert!(is_write(&EventKind::Modify(ModifyKind::Name(
            RenameMode::To
        ))));
        assert!(!is_write(&EventKind::Modify(ModifyKind::Metadata(
            MetadataKind::Permissions
        ))));
        assert!(!is_write(&EventKind::Remove(RemoveKind::File)));
        assert!(is_write(&EventKind::Access(AccessKind::Close(
            AccessMode::Write
        ))));
        assert!(!is_write(&EventKind::Access(AccessKind::Read)));
    }

    #[test]
    fn test_add_missing_directory_fails() {
        let mut watcher = PluginWatcher::new().unwrap();
        assert!(watcher
            .add("ghost", Path::new("/nonexistent/dir/ghost.lua"))
            .is_err());
    }

    #[test]
    fn test_change_reports_plugin_name() {
        let dir = tempfile::tempdir().unwrap();
        let hello = dir.path().join("hello.lua");
        let other = dir.path().join("notes.txt");
        std::fs::write(&hello, "-- v1").unwrap();

        let mut watcher = PluginWatcher::new().unwrap();
        watcher.add("hello", &hello).unwrap();

        std::fs::write(&other, "ignored").unwrap();
        std::fs::write(&hello, "-- v2").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut changed = BTreeSet::new();
        while Instant::now() < deadline && changed.is_empty() {
            changed = watcher.poll_changes();
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(changed.into_iter().collect::<Vec<_>>(), vec!["hello"]);
    }

    #[test]
    fn test_remove_stops_tracking() {
        let dir = tempfile::tempdir().unwrap();
        let hello = dir.path().join("hello.lua");
        std::fs::write(&hello, "").unwrap();

        let mut watcher = PluginWatcher::new().unwrap();
        watcher.add("hello", &hello).unwrap();
        watcher.remove("hello");
        watcher.remove("hello");
        assert!(watcher.files.is_empty());
        assert!(watcher.dirs.is_empty());
    }
}
