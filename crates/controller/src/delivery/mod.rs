//! Delivery engine: Argo CD applications, sync, rollouts, health, and GitOps writes.
pub mod apps;
pub mod gitops;
pub mod health;
pub mod rollout;
pub mod sync;

pub use apps::AppManager;
pub use gitops::{
    GitOpsWriter, GitRepository, LockGuard, LockStore, MemoryLockStore, RedisLockStore,
    StubRepository,
};
pub use health::{AppHealth, HealthCallback, HealthMonitor};
pub use rollout::RolloutController;
pub use sync::SyncController;
