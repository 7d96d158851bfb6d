//! Space allocation
//!
//! Decides, for a requested spec, between reusing a matching space,
//! rebuilding an idle one, or creating a new one.
//!
//! # Locking discipline
//!
//! Enumeration and classification ([`Allocator::plan`]) run without locks.
//! Every destructive step ([`Allocator::execute`] rebuilding or creating,
//! [`Allocator::repair`], [`Allocator::prune`]) happens while holding the
//! space's [`LockGuard`], and the lock-free classification is re-checked
//! after the lock is taken. Two processes racing to rebuild the same space
//! therefore converge: the second finds the first one's result and reuses it.
//!
//! Creation and maintenance sweeps additionally serialize on the pool lock
//! so the space count cannot overshoot `max_spaces`.
//!
//! # Space States
//!
//! | State | Classified | Description |
//! |-------|------------|-------------|
//! | Created | no | Directory allocated, build not requested |
//! | EnvRequested | no | Build running, failed or interrupted |
//! | EnvReady | yes | Built, identity files present |

pub mod policy;

pub use policy::{ClassifiedSpace, Classification};

use crate::audit::{AuditEvent, AuditLog};
use crate::builder::{BuildOutput, SpaceBuilder};
use crate::config::{schema::PoolConfig, Config, ConfigManager};
use crate::error::{SpaceError, SpaceResult};
use crate::identity::IdentityComparator;
use crate::lock::LockGuard;
use crate::space::{
    CapturedEnv, EnvironmentSpec, SpaceName, SpaceRecord, SpaceRegistry, SpaceStatus,
    TOOLCHAIN_ROOT_KEY,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lock serializing space creation with maintenance sweeps
///
/// Space names cannot start with '.', so this never collides with a space lock.
pub const POOL_LOCK_NAME: &str = ".pool";

/// Tunables of the allocation policy
#[derive(Debug, Clone)]
pub struct AllocatorOptions {
    /// Maximum number of spaces in the pool
    pub max_spaces: usize,
    /// Idle time before a non-matching space may be rebuilt
    pub reuse_timeout: Duration,
    /// Bound on waiting for any lock
    pub lock_timeout: Duration,
}

impl Default for AllocatorOptions {
    fn default() -> Self {
        Self::from(&PoolConfig::default())
    }
}

impl From<&PoolConfig> for AllocatorOptions {
    fn from(pool: &PoolConfig) -> Self {
        Self {
            max_spaces: pool.max_spaces,
            reuse_timeout: pool.reuse_timeout(),
            lock_timeout: pool.lock_timeout(),
        }
    }
}

/// How an allocation was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationOutcome {
    /// An existing space already matched
    Reused,
    /// An idle space was evicted and rebuilt
    Rebuilt,
    /// A new space was created
    Created,
}

impl fmt::Display for AllocationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reused => write!(f, "reused"),
            Self::Rebuilt => write!(f, "rebuilt"),
            Self::Created => write!(f, "created"),
        }
    }
}

/// A space ready for use
#[derive(Debug, Clone, Serialize)]
pub struct Allocation {
    pub name: SpaceName,
    pub path: PathBuf,
    pub outcome: AllocationOutcome,
    /// Environment variables to run inside the space
    pub captured_env: CapturedEnv,
    pub last_usage: DateTime<Utc>,
}

/// Lock-free classification of every space for one spec
#[derive(Debug, Clone)]
pub struct AllocationPlan {
    pub spec: EnvironmentSpec,
    pub spaces: Vec<ClassifiedSpace>,
}

impl AllocationPlan {
    /// Classification of the named space, if it was seen
    pub fn classification_of(&self, name: &str) -> Option<Classification> {
        self.spaces
            .iter()
            .find(|s| s.record.name.as_str() == name)
            .map(|s| s.classification)
    }

    pub fn count(&self, class: Classification) -> usize {
        self.spaces
            .iter()
            .filter(|s| s.classification == class)
            .count()
    }
}

/// Allocates spaces from a pool shared with other processes
pub struct Allocator {
    registry: SpaceRegistry,
    comparator: IdentityComparator,
    builder: Arc<dyn SpaceBuilder>,
    options: AllocatorOptions,
    audit: AuditLog,
}

impl Allocator {
    pub fn new(
        registry: SpaceRegistry,
        builder: Arc<dyn SpaceBuilder>,
        comparator: IdentityComparator,
        options: AllocatorOptions,
    ) -> Self {
        Self {
            registry,
            comparator,
            builder,
            options,
            audit: AuditLog::disabled(),
        }
    }

    /// Allocator wired from configuration
    pub fn from_config(config: &Config, builder: Arc<dyn SpaceBuilder>) -> Self {
        let comparator = IdentityComparator::with_capacity(
            builder.clone(),
            config.identity.volatile_directives.clone(),
            config.identity.cache_capacity,
        );
        Self::new(
            SpaceRegistry::new(ConfigManager::spaces_dir(config)),
            builder,
            comparator,
            AllocatorOptions::from(&config.pool),
        )
        .with_audit(AuditLog::new(config))
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    pub fn registry(&self) -> &SpaceRegistry {
        &self.registry
    }

    pub fn options(&self) -> &AllocatorOptions {
        &self.options
    }

    fn base_dir(&self) -> &Path {
        self.registry.base_dir()
    }

    /// Find or build a space for `spec`
    pub async fn allocate(
        &self,
        spec: &EnvironmentSpec,
        cancel: &CancellationToken,
    ) -> SpaceResult<Allocation> {
        let plan = self.plan(spec).await?;
        self.execute(plan, cancel).await
    }

    /// Classify every space against `spec` without taking locks
    pub async fn plan(&self, spec: &EnvironmentSpec) -> SpaceResult<AllocationPlan> {
        let now = Utc::now();
        let mut spaces = vec![];

        for mut record in self.registry.list_spaces()? {
            let classification = self.classify(&mut record, spec, now).await;
            debug!("Space {} classified {}", record.name, classification);
            spaces.push(ClassifiedSpace {
                record,
                classification,
            });
        }

        Ok(AllocationPlan {
            spec: spec.clone(),
            spaces,
        })
    }

    /// Act on a plan: reuse, rebuild, or create
    pub async fn execute(
        &self,
        plan: AllocationPlan,
        cancel: &CancellationToken,
    ) -> SpaceResult<Allocation> {
        let spec = &plan.spec;

        for mut record in policy::most_recent_first(&plan.spaces, Classification::CanUse) {
            if let Some(allocation) = self.reuse(&mut record).await? {
                return Ok(allocation);
            }
        }

        for record in policy::least_recent_first(&plan.spaces, Classification::ReuseTarget) {
            if let Some(allocation) = self.rebuild(&record.name, spec, cancel).await? {
                return Ok(allocation);
            }
        }

        if let Some(allocation) = self.create(spec, cancel).await? {
            return Ok(allocation);
        }

        Err(SpaceError::ResourceExhausted {
            max_spaces: self.options.max_spaces,
        })
    }

    /// Classify one space; corrupt metadata yields `NotAvailable`
    async fn classify(
        &self,
        record: &mut SpaceRecord,
        spec: &EnvironmentSpec,
        now: DateTime<Utc>,
    ) -> Classification {
        if !record.is_usable() {
            return Classification::NotAvailable;
        }

        let last_usage = match self.registry.load_last_usage(record, false) {
            Ok(Some(ts)) if !record.damaged => ts,
            Ok(_) => return Classification::NotAvailable,
            Err(e) => {
                warn!("Could not read usage of space {}: {}", record.name, e);
                record.damaged = true;
                return Classification::NotAvailable;
            }
        };

        let stored = match self.registry.read_identity(record) {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                warn!("Space {} is ready but has no identity files", record.name);
                record.damaged = true;
                return Classification::NotAvailable;
            }
            Err(e) => {
                warn!("Could not read identity of space {}: {}", record.name, e);
                record.damaged = true;
                return Classification::NotAvailable;
            }
        };

        let matches = self
            .comparator
            .matches(&spec.text, &spec.path, &stored.text, &stored.path)
            .await;

        policy::classify(matches, last_usage, now, self.options.reuse_timeout)
    }

    /// Touch a matching space and hand it out
    ///
    /// Returns `None` if its captured environment turns out to be unusable,
    /// in which case the space is marked damaged.
    async fn reuse(&self, record: &mut SpaceRecord) -> SpaceResult<Option<Allocation>> {
        let captured_env = match self.verified_env(record) {
            Ok(env) => env,
            Err(reason) => {
                warn!("Space {} cannot be reused: {}", record.name, reason);
                self.damage(record, &reason).await;
                return Ok(None);
            }
        };

        let last_usage = self.registry.update_last_usage(record)?;

        // A peer may have started rebuilding it since classification.
        match self.registry.load(&record.name) {
            Ok(current) if current.is_usable() => {}
            Ok(current) => {
                debug!(
                    "Space {} became {} while being reused, skipping",
                    record.name, current.status
                );
                return Ok(None);
            }
            Err(SpaceError::SpaceNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        }
        info!("Reusing space {}", record.name);

        Ok(Some(Allocation {
            name: record.name.clone(),
            path: record.path.clone(),
            outcome: AllocationOutcome::Reused,
            captured_env,
            last_usage,
        }))
    }

    /// Captured environment whose toolchain root exists
    fn verified_env(&self, record: &SpaceRecord) -> Result<CapturedEnv, String> {
        let env = match self.registry.read_captured_env(record) {
            Ok(Some(env)) => env,
            Ok(None) => return Err("captured environment missing".to_string()),
            Err(e) => return Err(format!("captured environment unreadable: {}", e)),
        };

        match env.get(TOOLCHAIN_ROOT_KEY) {
            Some(root) if Path::new(root).is_dir() => Ok(env),
            Some(root) => Err(format!("toolchain root {} does not exist", root)),
            None => Err(format!("captured environment has no {}", TOOLCHAIN_ROOT_KEY)),
        }
    }

    /// Evict and rebuild an idle space under its lock
    ///
    /// Returns `None` when re-validation shows the space is no longer a
    /// rebuild target.
    async fn rebuild(
        &self,
        name: &SpaceName,
        spec: &EnvironmentSpec,
        cancel: &CancellationToken,
    ) -> SpaceResult<Option<Allocation>> {
        let _guard =
            LockGuard::acquire(name.as_str(), self.options.lock_timeout, self.base_dir(), cancel)
                .await?;

        let mut record = match self.registry.load(name) {
            Ok(record) => record,
            Err(SpaceError::SpaceNotFound(_)) => {
                debug!("Space {} disappeared before rebuild", name);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match self.classify(&mut record, spec, Utc::now()).await {
            Classification::ReuseTarget => {}
            Classification::CanUse => {
                info!("Space {} was already rebuilt for this spec by another process", name);
                return self.reuse(&mut record).await;
            }
            class => {
                debug!("Space {} is now {}, skipping rebuild", name, class);
                return Ok(None);
            }
        }

        info!(
            "Evicting space {} (last used {:?}) to rebuild it",
            name, record.last_usage
        );
        self.registry
            .write_status(&mut record, SpaceStatus::EnvRequested)?;
        self.registry.clear_identity(&mut record)?;
        self.registry.write_requested_pid(&mut record);

        let allocation = self
            .build_into(&mut record, spec, AllocationOutcome::Rebuilt, cancel)
            .await?;
        self.audit
            .log(
                AuditEvent::SpaceRebuilt,
                &serde_json::json!({"name": name.as_str(), "spec": spec.path}),
            )
            .await;
        Ok(Some(allocation))
    }

    /// Create and build a new space, if the pool has room
    async fn create(
        &self,
        spec: &EnvironmentSpec,
        cancel: &CancellationToken,
    ) -> SpaceResult<Option<Allocation>> {
        let pool_guard =
            LockGuard::acquire(POOL_LOCK_NAME, self.options.lock_timeout, self.base_dir(), cancel)
                .await?;

        let existing = self.registry.list_spaces()?.len();
        if existing >= self.options.max_spaces {
            debug!(
                "Pool holds {} spaces (max {}), not creating",
                existing, self.options.max_spaces
            );
            return Ok(None);
        }

        let (mut record, _guard) = self.claim_new_space(cancel)?;
        drop(pool_guard);

        info!("Creating space {}", record.name);
        self.audit
            .log(
                AuditEvent::SpaceCreated,
                &serde_json::json!({"name": record.name.as_str(), "spec": spec.path}),
            )
            .await;

        self.registry
            .write_status(&mut record, SpaceStatus::EnvRequested)?;
        self.registry.write_requested_pid(&mut record);

        let allocation = self
            .build_into(&mut record, spec, AllocationOutcome::Created, cancel)
            .await?;
        Ok(Some(allocation))
    }

    /// Create a space directory and lock it; caller holds the pool lock
    ///
    /// Nobody else knows the fresh name, so the lock is taken without
    /// waiting. On cancellation the directory is removed again.
    fn claim_new_space(&self, cancel: &CancellationToken) -> SpaceResult<(SpaceRecord, LockGuard)> {
        let record = self.registry.create_space()?;

        let failure = match LockGuard::try_acquire(record.name.as_str(), self.base_dir()) {
            Ok(Some(guard)) if !cancel.is_cancelled() => return Ok((record, guard)),
            Ok(Some(_)) => SpaceError::Cancelled,
            Ok(None) => SpaceError::Internal(format!(
                "new space {} is locked by another process",
                record.name
            )),
            Err(e) => e,
        };

        debug!("Discarding new space {}: {}", record.name, failure);
        self.registry.remove_space(&record)?;
        Err(failure)
    }

    /// Run the builder and commit the result; caller holds the space lock
    async fn build_into(
        &self,
        record: &mut SpaceRecord,
        spec: &EnvironmentSpec,
        outcome: AllocationOutcome,
        cancel: &CancellationToken,
    ) -> SpaceResult<Allocation> {
        info!(
            "Building space {} from {} with {} builder",
            record.name,
            spec.path.display(),
            self.builder.builder_name()
        );

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                self.damage(record, "build cancelled").await;
                return Err(SpaceError::Cancelled);
            }
            result = self.builder.build(&spec.path, &record.path) => result,
        };

        let output = match result {
            Ok(output) if output.success => output,
            Ok(output) => {
                return Err(self
                    .fail_build(record, "builder reported failure".to_string(), output)
                    .await)
            }
            Err(e) => {
                return Err(self
                    .fail_build(record, e.to_string(), BuildOutput::default())
                    .await)
            }
        };

        if !output.captured_env.contains_key(TOOLCHAIN_ROOT_KEY) {
            let reason = format!("captured environment has no {}", TOOLCHAIN_ROOT_KEY);
            return Err(self.fail_build(record, reason, output).await);
        }

        if let Err(e) = self.commit(record, spec, &output.captured_env) {
            self.damage(record, &format!("commit failed: {}", e)).await;
            return Err(e);
        }

        info!("Space {} is ready", record.name);
        Ok(Allocation {
            name: record.name.clone(),
            path: record.path.clone(),
            outcome,
            captured_env: output.captured_env,
            last_usage: record.last_usage.unwrap_or_else(Utc::now),
        })
    }

    /// Persist a successful build; the ready state is written last
    fn commit(
        &self,
        record: &mut SpaceRecord,
        spec: &EnvironmentSpec,
        env: &CapturedEnv,
    ) -> SpaceResult<()> {
        self.registry.write_captured_env(record, env)?;
        self.registry.write_identity(record, spec)?;
        self.registry.update_last_usage(record)?;
        self.registry.clear_damaged(record)?;
        self.registry.write_status(record, SpaceStatus::EnvReady)
    }

    async fn fail_build(
        &self,
        record: &mut SpaceRecord,
        reason: String,
        output: BuildOutput,
    ) -> SpaceError {
        warn!("Build of space {} failed: {}", record.name, reason);
        self.damage(record, &reason).await;
        SpaceError::BuildFailed {
            name: record.name.to_string(),
            reason,
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }

    /// Persist the damaged marker; failures are logged, not raised
    async fn damage(&self, record: &mut SpaceRecord, reason: &str) {
        if let Err(e) = self.registry.mark_damaged(record, reason) {
            warn!("Could not mark space {} damaged: {}", record.name, e);
            record.damaged = true;
        }
        self.audit
            .log(
                AuditEvent::SpaceDamaged,
                &serde_json::json!({"name": record.name.as_str(), "reason": reason}),
            )
            .await;
    }

    /// Delete a damaged or incomplete space so it can be replaced
    pub async fn repair(&self, name: &SpaceName, cancel: &CancellationToken) -> SpaceResult<()> {
        let _pool =
            LockGuard::acquire(POOL_LOCK_NAME, self.options.lock_timeout, self.base_dir(), cancel)
                .await?;
        let _guard =
            LockGuard::acquire(name.as_str(), self.options.lock_timeout, self.base_dir(), cancel)
                .await?;

        let record = self.registry.load(name)?;
        if record.is_usable() {
            return Err(SpaceError::NotDamaged(name.to_string()));
        }

        self.remove(&record, "repair").await
    }

    /// Repair every damaged or incomplete space that is not in use
    pub async fn repair_all(&self, cancel: &CancellationToken) -> SpaceResult<Vec<SpaceName>> {
        let _pool =
            LockGuard::acquire(POOL_LOCK_NAME, self.options.lock_timeout, self.base_dir(), cancel)
                .await?;

        let mut repaired = vec![];
        for record in self.registry.list_spaces()? {
            if record.is_usable() {
                continue;
            }
            let Some(_guard) = LockGuard::try_acquire(record.name.as_str(), self.base_dir())?
            else {
                debug!("Space {} is busy, not repairing", record.name);
                continue;
            };

            let record = self.registry.load(&record.name)?;
            if record.is_usable() {
                continue;
            }
            self.remove(&record, "repair").await?;
            repaired.push(record.name);
        }

        Ok(repaired)
    }

    /// Delete least recently used idle spaces until at most `max_retained` remain
    ///
    /// Spaces used within the reuse timeout and spaces locked by another
    /// process are kept. With `dry_run` nothing is deleted.
    pub async fn prune(
        &self,
        max_retained: usize,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> SpaceResult<Vec<SpaceName>> {
        let _pool =
            LockGuard::acquire(POOL_LOCK_NAME, self.options.lock_timeout, self.base_dir(), cancel)
                .await?;

        let mut spaces = self.registry.list_spaces()?;
        for record in spaces.iter_mut().filter(|r| r.is_usable()) {
            if let Err(e) = self.registry.load_last_usage(record, true) {
                warn!("Could not read usage of space {}: {}", record.name, e);
                record.damaged = true;
            }
        }

        let now = Utc::now();
        let candidates =
            policy::prune_candidates(&spaces, max_retained, now, self.options.reuse_timeout);

        let mut pruned = vec![];
        for candidate in candidates {
            if dry_run {
                pruned.push(candidate.name);
                continue;
            }

            let Some(_guard) = LockGuard::try_acquire(candidate.name.as_str(), self.base_dir())?
            else {
                debug!("Space {} is busy, not pruning", candidate.name);
                continue;
            };

            // Re-check under the lock: a peer may have touched it meanwhile.
            let mut record = self.registry.load(&candidate.name)?;
            let still_idle = match self.registry.load_last_usage(&mut record, true) {
                Ok(Some(ts)) => policy::is_idle(ts, Utc::now(), self.options.reuse_timeout),
                Ok(None) => true,
                Err(e) => {
                    warn!("Could not read usage of space {}: {}", record.name, e);
                    false
                }
            };
            if !record.is_usable() || !still_idle {
                continue;
            }

            self.remove(&record, "prune").await?;
            pruned.push(record.name);
        }

        Ok(pruned)
    }

    async fn remove(&self, record: &SpaceRecord, reason: &str) -> SpaceResult<()> {
        self.registry.remove_space(record)?;
        info!("Removed space {} ({})", record.name, reason);
        self.audit
            .log(
                AuditEvent::SpaceRemoved,
                &serde_json::json!({"name": record.name.as_str(), "reason": reason}),
            )
            .await;
        Ok(())
    }
}
