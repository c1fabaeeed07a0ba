//! Whitelist store: Signal identities allowed to use the bridge, one per line in a text file.
//!
//! The file is read fresh on every check so manual edits take effect without a restart.
//! Additions are appended, never rewritten. The check-then-append sequence is serialized by an
//! in-process mutex, and the append itself holds an exclusive file lock so a concurrent
//! `sbdlink allow` in another process cannot interleave lines.

use crate::config::MissingWhitelistPolicy;
use fs2::FileExt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// File-backed set of authorized identities.
pub struct WhitelistStore {
    path: PathBuf,
    missing_policy: MissingWhitelistPolicy,
    write_lock: Mutex<()>,
}

impl WhitelistStore {
    pub fn new(path: impl AsRef<Path>, missing_policy: MissingWhitelistPolicy) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            missing_policy,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the file. `Ok(None)` when it does not exist.
    async fn read_entries(&self) -> io::Result<Option<Vec<String>>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(s) => Ok(Some(parse_entries(&s))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Entries currently on disk (empty when the file is missing or unreadable).
    pub async fn list(&self) -> Vec<String> {
        match self.read_entries().await {
            Ok(entries) => entries.unwrap_or_default(),
            Err(e) => {
                log::error!("reading whitelist {}: {}", self.path.display(), e);
                Vec::new()
            }
        }
    }

    /// Membership check. A missing file answers per the configured policy; any other read error denies.
    pub async fn is_allowed(&self, identity: &str) -> bool {
        let identity = identity.trim();
        match self.read_entries().await {
            Ok(Some(entries)) => entries.iter().any(|e| e == identity),
            Ok(None) => match self.missing_policy {
                MissingWhitelistPolicy::AllowAll => {
                    log::warn!(
                        "whitelist {} not found - allowing all numbers",
                        self.path.display()
                    );
                    true
                }
                MissingWhitelistPolicy::DenyAll => {
                    log::warn!(
                        "whitelist {} not found - denying {}",
                        self.path.display(),
                        identity
                    );
                    false
                }
            },
            Err(e) => {
                log::error!("reading whitelist {}: {}", self.path.display(), e);
                false
            }
        }
    }

    /// Add `identity` unless it is already listed. Returns false only on I/O failure.
    ///
    /// Membership here is judged on the file contents alone, so the first add creates the
    /// file even while the missing-file policy allows everyone.
    pub async fn add(&self, identity: &str) -> bool {
        let identity = identity.trim().to_string();
        let _guard = self.write_lock.lock().await;
        let existing = match tokio::fs::read_to_string(&self.path).await {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                log::error!("adding {} to whitelist {}: {}", identity, self.path.display(), e);
                return false;
            }
        };
        if parse_entries(&existing).iter().any(|e| *e == identity) {
            return true;
        }
        let mut line = String::new();
        if !existing.is_empty() && !existing.ends_with('\n') {
            line.push('\n');
        }
        line.push_str(&identity);
        line.push('\n');
        match append_locked(self.path.clone(), line).await {
            Ok(()) => {
                log::info!("auto-authorized phone number: {}", identity);
                true
            }
            Err(e) => {
                log::error!("adding {} to whitelist {}: {}", identity, self.path.display(), e);
                false
            }
        }
    }
}

fn parse_entries(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

/// Append under an exclusive advisory lock (blocking I/O runs off the async workers).
async fn append_locked(path: PathBuf, line: String) -> io::Result<()> {
    tokio::task::spawn_blocking(move || {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        file.lock_exclusive()?;
        let res = file.write_all(line.as_bytes()).and_then(|_| file.sync_data());
        let _ = FileExt::unlock(&file);
        res
    })
    .await
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn temp_path() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sbdlink-whitelist-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir.join("signal.allowed")
    }

    #[tokio::test]
    async fn missing_file_follows_policy() {
        let path = temp_path();
        let open = WhitelistStore::new(&path, MissingWhitelistPolicy::AllowAll);
        assert!(open.is_allowed("+31612345678").await);
        let closed = WhitelistStore::new(&path, MissingWhitelistPolicy::DenyAll);
        assert!(!closed.is_allowed("+31612345678").await);
    }

    #[tokio::test]
    async fn existing_empty_file_denies() {
        let path = temp_path();
        std::fs::write(&path, "").unwrap();
        let store = WhitelistStore::new(&path, MissingWhitelistPolicy::AllowAll);
        assert!(!store.is_allowed("+31612345678").await);
    }

    #[tokio::test]
    async fn add_creates_file_and_is_idempotent() {
        let path = temp_path();
        let store = WhitelistStore::new(&path, MissingWhitelistPolicy::AllowAll);
        assert!(store.add("+31612345678").await);
        assert!(store.add("+31612345678").await);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "+31612345678\n");
        assert!(store.is_allowed("+31612345678").await);
        assert!(!store.is_allowed("+31699999999").await);
    }

    #[tokio::test]
    async fn entries_survive_a_new_store() {
        let path = temp_path();
        {
            let store = WhitelistStore::new(&path, MissingWhitelistPolicy::DenyAll);
            assert!(store.add("+31612345678").await);
        }
        let reopened = WhitelistStore::new(&path, MissingWhitelistPolicy::DenyAll);
        assert!(reopened.is_allowed("+31612345678").await);
        assert_eq!(reopened.list().await, vec!["+31612345678".to_string()]);
    }

    #[tokio::test]
    async fn hand_edited_file_without_trailing_newline() {
        let path = temp_path();
        std::fs::write(&path, "  +31600000001 \n\n+31600000002").unwrap();
        let store = WhitelistStore::new(&path, MissingWhitelistPolicy::DenyAll);
        assert!(store.is_allowed("+31600000001").await);
        assert!(store.add("+31600000003").await);
        assert_eq!(
            store.list().await,
            vec!["+31600000001", "+31600000002", "+31600000003"]
        );
    }

    #[tokio::test]
    async fn concurrent_adds_do_not_duplicate_or_interleave() {
        let path = temp_path();
        let store = Arc::new(WhitelistStore::new(&path, MissingWhitelistPolicy::DenyAll));
        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                // Every identity is added twice from racing tasks.
                store.add(&format!("+3160000{:04}", i % 10)).await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap());
        }
        let mut entries = store.list().await;
        entries.sort();
        let expected: Vec<String> = (0..10).map(|i| format!("+3160000{:04}", i)).collect();
        assert_eq!(entries, expected);
    }

    #[tokio::test]
    async fn unreadable_path_denies_and_fails_add() {
        // A directory where the file should be: reads and appends both fail.
        let path = temp_path();
        std::fs::create_dir_all(&path).unwrap();
        let store = WhitelistStore::new(&path, MissingWhitelistPolicy::AllowAll);
        assert!(!store.is_allowed("+31612345678").await);
        assert!(!store.add("+31612345678").await);
    }
}
