use std::collections::HashMap;
use std::path::Component;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::LockError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Default)]
struct PathHolders {
    shared: usize,
    exclusive: bool,
}

#[derive(Default)]
struct LockTable {
    holders: HashMap<String, PathHolders>,
}

struct LockInner {
    table: Mutex<LockTable>,
    released: Notify,
}

/// Reader/writer locks over normalized workspace paths. Exclusive access to
/// a path also excludes holders on any ancestor or descendant path, so a
/// directory delete cannot race a write inside it.
#[derive(Clone)]
pub struct WorkspaceLockManager {
    inner: Arc<LockInner>,
}

impl WorkspaceLockManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LockInner {
                table: Mutex::new(LockTable::default()),
                released: Notify::new(),
            }),
        }
    }

    /// Acquire all `paths` atomically in the given mode. Blocks only the
    /// requesting step; the wait honors cancellation and the timeout.
    pub async fn acquire(
        &self,
        paths: &[String],
        mode: LockMode,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<LockGuard, LockError> {
        let mut normalized: Vec<String> = paths.iter().map(|p| normalize_lock_path(p)).collect();
        normalized.sort();
        normalized.dedup();

        if normalized.is_empty() {
            return Ok(LockGuard {
                inner: self.inner.clone(),
                paths: Vec::new(),
                mode,
            });
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let released = self.inner.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            {
                let mut table = lock_table(&self.inner.table);
                if grantable(&table, &normalized, mode) {
                    grant(&mut table, &normalized, mode);
                    return Ok(LockGuard {
                        inner: self.inner.clone(),
                        paths: normalized,
                        mode,
                    });
                }
            }

            tokio::select! {
                _ = &mut released => {}
                _ = cancel.cancelled() => return Err(LockError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Err(LockError::Timeout),
            }
        }
    }

    #[cfg(test)]
    fn held_paths(&self) -> Vec<String> {
        let table = lock_table(&self.inner.table);
        let mut paths: Vec<String> = table.holders.keys().cloned().collect();
        paths.sort();
        paths
    }
}

impl Default for WorkspaceLockManager {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LockGuard {
    inner: Arc<LockInner>,
    paths: Vec<String>,
    mode: LockMode,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("paths", &self.paths)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.paths.is_empty() {
            return;
        }
        {
            let mut table = lock_table(&self.inner.table);
            for path in &self.paths {
                let remove = match table.holders.get_mut(path) {
                    Some(holders) => {
                        match self.mode {
                            LockMode::Shared => holders.shared = holders.shared.saturating_sub(1),
                            LockMode::Exclusive => holders.exclusive = false,
                        }
                        holders.shared == 0 && !holders.exclusive
                    }
                    None => false,
                };
                if remove {
                    table.holders.remove(path);
                }
            }
        }
        self.inner.released.notify_waiters();
    }
}

fn lock_table(table: &Mutex<LockTable>) -> MutexGuard<'_, LockTable> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Empty string is the workspace root, an ancestor of every path.
pub fn normalize_lock_path(raw: &str) -> String {
    let cleaned = raw.trim().replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for component in std::path::Path::new(&cleaned).components() {
        match component {
            Component::Normal(part) => {
                if let Some(part) = part.to_str() {
                    parts.push(part);
                }
            }
            Component::ParentDir => {
                parts.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    parts.join("/")
}

fn paths_related(a: &str, b: &str) -> bool {
    if a == b || a.is_empty() || b.is_empty() {
        return true;
    }
    a.len() > b.len() && a.as_bytes()[b.len()] == b'/' && a.starts_with(b)
        || b.len() > a.len() && b.as_bytes()[a.len()] == b'/' && b.starts_with(a)
}

fn grantable(table: &LockTable, paths: &[String], mode: LockMode) -> bool {
    for requested in paths {
        for (held, holders) in &table.holders {
            if !paths_related(requested, held) {
                continue;
            }
            match mode {
                LockMode::Exclusive => {
                    if holders.exclusive || holders.shared > 0 {
                        return false;
                    }
                }
                LockMode::Shared => {
                    if holders.exclusive {
                        return false;
                    }
                }
            }
        }
    }
    true
}

fn grant(table: &mut LockTable, paths: &[String], mode: LockMode) {
    for path in paths {
        let holders = table.holders.entry(path.clone()).or_default();
        match mode {
            LockMode::Shared => holders.shared += 1,
            LockMode::Exclusive => holders.exclusive = true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(100);

    fn paths(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn normalization_collapses_dots_and_separators() {
        assert_eq!(normalize_lock_path("./src/main.rs"), "src/main.rs");
        assert_eq!(normalize_lock_path("src//lib.rs"), "src/lib.rs");
        assert_eq!(normalize_lock_path("a/b/../c"), "a/c");
        assert_eq!(normalize_lock_path("."), "");
    }

    #[test]
    fn relatedness_covers_ancestors_and_descendants() {
        assert!(paths_related("a/b", "a/b"));
        assert!(paths_related("a", "a/b/c"));
        assert!(paths_related("a/b/c", "a"));
        assert!(paths_related("", "a/b"));
        assert!(!paths_related("a/b", "a/bc"));
        assert!(!paths_related("a/b", "c/d"));
    }

    #[tokio::test]
    async fn shared_holders_coexist_on_the_same_path() {
        let locks = WorkspaceLockManager::new();
        let cancel = CancellationToken::new();
        let a = locks
            .acquire(&paths(&["src/lib.rs"]), LockMode::Shared, &cancel, WAIT)
            .await
            .expect("first shared");
        let b = locks
            .acquire(&paths(&["src/lib.rs"]), LockMode::Shared, &cancel, WAIT)
            .await
            .expect("second shared");
        drop(a);
        drop(b);
        assert!(locks.held_paths().is_empty());
    }

    #[tokio::test]
    async fn exclusive_excludes_shared_on_same_path() {
        let locks = WorkspaceLockManager::new();
        let cancel = CancellationToken::new();
        let _shared = locks
            .acquire(&paths(&["src/lib.rs"]), LockMode::Shared, &cancel, WAIT)
            .await
            .expect("shared");
        let err = locks
            .acquire(&paths(&["src/lib.rs"]), LockMode::Exclusive, &cancel, WAIT)
            .await
            .expect_err("exclusive while shared held");
        assert_eq!(err, LockError::Timeout);
    }

    #[tokio::test]
    async fn directory_lock_conflicts_with_file_inside_it() {
        let locks = WorkspaceLockManager::new();
        let cancel = CancellationToken::new();
        let _file = locks
            .acquire(&paths(&["build/out.txt"]), LockMode::Exclusive, &cancel, WAIT)
            .await
            .expect("file lock");
        let err = locks
            .acquire(&paths(&["build"]), LockMode::Exclusive, &cancel, WAIT)
            .await
            .expect_err("ancestor while descendant held");
        assert_eq!(err, LockError::Timeout);
    }

    #[tokio::test]
    async fn disjoint_paths_do_not_conflict() {
        let locks = WorkspaceLockManager::new();
        let cancel = CancellationToken::new();
        let _a = locks
            .acquire(&paths(&["a/one.txt"]), LockMode::Exclusive, &cancel, WAIT)
            .await
            .expect("a");
        let _b = locks
            .acquire(&paths(&["b/two.txt"]), LockMode::Exclusive, &cancel, WAIT)
            .await
            .expect("b");
    }

    #[tokio::test]
    async fn release_wakes_a_waiting_acquirer() {
        let locks = WorkspaceLockManager::new();
        let cancel = CancellationToken::new();
        let guard = locks
            .acquire(&paths(&["shared.txt"]), LockMode::Exclusive, &cancel, WAIT)
            .await
            .expect("holder");

        let waiter_locks = locks.clone();
        let waiter_cancel = cancel.clone();
        let waiter = tokio::spawn(async move {
            waiter_locks
                .acquire(
                    &paths(&["shared.txt"]),
                    LockMode::Exclusive,
                    &waiter_cancel,
                    Duration::from_secs(2),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(guard);
        let acquired = waiter.await.expect("join");
        assert!(acquired.is_ok());
    }

    #[tokio::test]
    async fn cancellation_aborts_a_lock_wait() {
        let locks = WorkspaceLockManager::new();
        let cancel = CancellationToken::new();
        let _holder = locks
            .acquire(&paths(&["x.txt"]), LockMode::Exclusive, &cancel, WAIT)
            .await
            .expect("holder");

        let waiter_cancel = CancellationToken::new();
        let aborter = waiter_cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            aborter.cancel();
        });

        let err = locks
            .acquire(
                &paths(&["x.txt"]),
                LockMode::Exclusive,
                &waiter_cancel,
                Duration::from_secs(5),
            )
            .await
            .expect_err("cancelled wait");
        assert_eq!(err, LockError::Cancelled);
    }

    #[tokio::test]
    async fn empty_path_set_is_a_no_op_guard() {
        let locks = WorkspaceLockManager::new();
        let cancel = CancellationToken::new();
        let guard = locks
            .acquire(&[], LockMode::Exclusive, &cancel, WAIT)
            .await
            .expect("no-op");
        drop(guard);
        assert!(locks.held_paths().is_empty());
    }
}
