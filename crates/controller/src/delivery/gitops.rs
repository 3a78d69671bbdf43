//! # GitOps Writer
//!
//! Serializes writes to a GitOps repository behind a per-repository lock. The
//! lock is taken with an atomic set-if-absent carrying a TTL. A second writer
//! for the same repository fails immediately with [`Error::LockHeld`] instead
//! of waiting. The lock is held by a [`LockGuard`] and released after the
//! write whether or not it succeeded. A caller that drops the write future
//! mid-flight still releases the lock from the guard's `Drop`; the TTL only
//! covers a holder that crashed.
//!
//! Repository I/O sits behind [`GitRepository`] so the locking contract can
//! be exercised without a real remote.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};

pub const LOCK_PREFIX: &str = "gitops:lock:";
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);
pub const STUB_COMMIT_SHA: &str = "stub-sha-pending-git-integration";

#[must_use]
pub fn lock_key(repo_url: &str) -> String {
    format!("{LOCK_PREFIX}{repo_url}")
}

/// Atomic presence-only lock primitive.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Set `key` if absent, expiring after `ttl`. Returns whether it was set.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn release(&self, key: &str) -> Result<()>;
}

/// Redis `SET key locked NX EX ttl` / `DEL key`.
#[derive(Clone)]
pub struct RedisLockStore {
    conn: ConnectionManager,
}

impl RedisLockStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: redis::Value = redis::cmd("SET")
            .arg(key)
            .arg("locked")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(!matches!(reply, redis::Value::Nil))
    }

    async fn release(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

/// Single-process lock store with TTL expiry.
#[derive(Default)]
pub struct MemoryLockStore {
    held: Mutex<HashMap<String, Instant>>,
}

impl MemoryLockStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_held(&self, key: &str) -> bool {
        self.held
            .lock()
            .await
            .get(key)
            .is_some_and(|expires| *expires > Instant::now())
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut held = self.held.lock().await;
        let now = Instant::now();
        if held.get(key).is_some_and(|expires| *expires > now) {
            return Ok(false);
        }
        held.insert(key.to_string(), now + ttl);
        Ok(true)
    }

    async fn release(&self, key: &str) -> Result<()> {
        self.held.lock().await.remove(key);
        Ok(())
    }
}

/// Held repository lock. Release it with [`LockGuard::release`]; dropping an
/// unreleased guard schedules the release on the current runtime.
pub struct LockGuard {
    locks: Arc<dyn LockStore>,
    key: String,
    released: bool,
}

impl LockGuard {
    /// Take `key` for `ttl`, or `None` when another holder has it.
    pub async fn acquire(
        locks: Arc<dyn LockStore>,
        key: String,
        ttl: Duration,
    ) -> Result<Option<Self>> {
        if !locks.try_acquire(&key, ttl).await? {
            return Ok(None);
        }
        Ok(Some(Self {
            locks,
            key,
            released: false,
        }))
    }

    pub async fn release(mut self) {
        if let Err(e) = self.locks.release(&self.key).await {
            warn!(key = %self.key, error = %e, "Failed to release GitOps lock, it will expire with its TTL");
        }
        self.released = true;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let locks = self.locks.clone();
        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = locks.release(&key).await {
                        warn!(key = %key, error = %e, "Failed to release abandoned GitOps lock");
                    } else {
                        debug!(key = %key, "Released abandoned GitOps lock");
                    }
                });
            }
            Err(_) => warn!(key = %key, "No runtime to release GitOps lock, it will expire with its TTL"),
        }
    }
}

/// Clone, modify, commit, and push a values file. Returns the commit SHA.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GitRepository: Send + Sync {
    async fn write_values(
        &self,
        repo_url: &str,
        branch: &str,
        path: &str,
        values: &BTreeMap<String, Value>,
    ) -> Result<String>;
}

/// Placeholder until git credentials are wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct StubRepository;

#[async_trait]
impl GitRepository for StubRepository {
    async fn write_values(
        &self,
        repo_url: &str,
        branch: &str,
        path: &str,
        values: &BTreeMap<String, Value>,
    ) -> Result<String> {
        info!(
            repo_url = %repo_url,
            branch = %branch,
            path = %path,
            overrides = values.len(),
            "Git integration not configured, skipping clone/commit/push"
        );
        Ok(STUB_COMMIT_SHA.to_string())
    }
}

pub struct GitOpsWriter {
    locks: Arc<dyn LockStore>,
    repository: Arc<dyn GitRepository>,
    lock_ttl: Duration,
}

impl GitOpsWriter {
    pub fn new(locks: Arc<dyn LockStore>, repository: Arc<dyn GitRepository>) -> Self {
        Self {
            locks,
            repository,
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }

    #[must_use]
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Write `values` to `path` on `branch` under the repository lock.
    #[instrument(skip(self, values), fields(overrides = values.len()))]
    pub async fn update_values(
        &self,
        repo_url: &str,
        branch: &str,
        path: &str,
        values: &BTreeMap<String, Value>,
    ) -> Result<String> {
        let Some(guard) =
            LockGuard::acquire(self.locks.clone(), lock_key(repo_url), self.lock_ttl).await?
        else {
            debug!("GitOps lock busy");
            return Err(Error::LockHeld {
                repo_url: repo_url.to_string(),
            });
        };

        let outcome = self
            .repository
            .write_values(repo_url, branch, path, values)
            .await;
        guard.release().await;

        match &outcome {
            Ok(sha) => info!(commit = %sha, "GitOps values written"),
            Err(e) => warn!(error = %e, "GitOps write failed"),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const REPO: &str = "https://git.example.com/org/deploy.git";

    fn values() -> BTreeMap<String, Value> {
        BTreeMap::from([("image.tag".to_string(), json!("main-abcdef12"))])
    }

    #[tokio::test]
    async fn stub_write_returns_placeholder_and_releases() {
        let locks = Arc::new(MemoryLockStore::new());
        let writer = GitOpsWriter::new(locks.clone(), Arc::new(StubRepository));
        let sha = writer
            .update_values(REPO, "main", "values.yaml", &values())
            .await
            .unwrap();
        assert_eq!(sha, STUB_COMMIT_SHA);
        assert!(!locks.is_held(&lock_key(REPO)).await);
    }

    #[tokio::test]
    async fn held_lock_fails_fast_without_touching_repository() {
        let locks = Arc::new(MemoryLockStore::new());
        locks
            .try_acquire(&lock_key(REPO), DEFAULT_LOCK_TTL)
            .await
            .unwrap();

        let mut repo = MockGitRepository::new();
        repo.expect_write_values().never();
        let writer = GitOpsWriter::new(locks.clone(), Arc::new(repo));

        let err = writer
            .update_values(REPO, "main", "values.yaml", &values())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockHeld { .. }));
        assert!(err.is_retryable());
        assert!(locks.is_held(&lock_key(REPO)).await);
    }

    #[tokio::test]
    async fn lock_released_after_failed_write() {
        let locks = Arc::new(MemoryLockStore::new());
        let mut repo = MockGitRepository::new();
        repo.expect_write_values()
            .times(1)
            .returning(|_, _, _, _| Err(Error::Internal("push rejected".into())));
        let writer = GitOpsWriter::new(locks.clone(), Arc::new(repo));

        assert!(writer
            .update_values(REPO, "main", "values.yaml", &values())
            .await
            .is_err());
        assert!(!locks.is_held(&lock_key(REPO)).await);
    }

    #[tokio::test]
    async fn different_repositories_do_not_contend() {
        let locks = Arc::new(MemoryLockStore::new());
        locks
            .try_acquire(&lock_key(REPO), DEFAULT_LOCK_TTL)
            .await
            .unwrap();
        let writer = GitOpsWriter::new(locks, Arc::new(StubRepository));
        assert!(writer
            .update_values("https://git.example.com/org/other.git", "main", "v.yaml", &values())
            .await
            .is_ok());
    }

    struct SlowRepository;

    #[async_trait]
    impl GitRepository for SlowRepository {
        async fn write_values(
            &self,
            _repo_url: &str,
            _branch: &str,
            _path: &str,
            _values: &BTreeMap<String, Value>,
        ) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("late".into())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_write_releases_lock() {
        let locks = Arc::new(MemoryLockStore::new());
        let writer = GitOpsWriter::new(locks.clone(), Arc::new(SlowRepository));
        let values = values();

        let abandoned = tokio::time::timeout(
            Duration::from_secs(1),
            writer.update_values(REPO, "main", "values.yaml", &values),
        )
        .await;
        assert!(abandoned.is_err());

        // Let the release scheduled by the dropped guard run.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!locks.is_held(&lock_key(REPO)).await);

        let mut repo = MockGitRepository::new();
        repo.expect_write_values()
            .times(1)
            .returning(|_, _, _, _| Ok("next".into()));
        let next = GitOpsWriter::new(locks.clone(), Arc::new(repo));
        assert_eq!(
            next.update_values(REPO, "main", "values.yaml", &values)
                .await
                .unwrap(),
            "next"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lock_can_be_retaken() {
        let locks = MemoryLockStore::new();
        let key = lock_key(REPO);
        assert!(locks.try_acquire(&key, Duration::from_secs(60)).await.unwrap());
        assert!(!locks.try_acquire(&key, Duration::from_secs(60)).await.unwrap());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(locks.try_acquire(&key, Duration::from_secs(60)).await.unwrap());
    }
}
