//! In-process builder used by tests and dry runs
//!
//! Hashes are SHA256 of the raw spec text. A successful build creates a
//! `toolchain/` directory in the target and reports it as `TOOLCHAIN_ROOT`.

use crate::builder::{BuildOutput, SpaceBuilder};
use crate::error::{SpaceError, SpaceResult};
use crate::space::{CapturedEnv, TOOLCHAIN_ROOT_KEY};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Deterministic builder that never leaves the process
#[derive(Debug, Default)]
pub struct InMemoryBuilder {
    hashing_unavailable: AtomicBool,
    fail_builds: AtomicBool,
    build_delay: Duration,
    hash_calls: AtomicUsize,
    build_calls: AtomicUsize,
    builds: Mutex<Vec<(PathBuf, PathBuf)>>,
}

impl InMemoryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `hash` call fails, forcing the normalization fallback
    pub fn without_hashing(self) -> Self {
        self.hashing_unavailable.store(true, Ordering::SeqCst);
        self
    }

    /// Every build reports failure
    pub fn failing_builds(self) -> Self {
        self.fail_builds.store(true, Ordering::SeqCst);
        self
    }

    /// Sleep this long inside every build
    pub fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = delay;
        self
    }

    pub fn set_fail_builds(&self, fail: bool) {
        self.fail_builds.store(fail, Ordering::SeqCst);
    }

    pub fn hash_calls(&self) -> usize {
        self.hash_calls.load(Ordering::SeqCst)
    }

    pub fn build_calls(&self) -> usize {
        self.build_calls.load(Ordering::SeqCst)
    }

    /// `(spec_path, target_dir)` of every build started so far
    pub fn builds(&self) -> Vec<(PathBuf, PathBuf)> {
        self.builds
            .lock()
            .map(|b| b.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SpaceBuilder for InMemoryBuilder {
    async fn hash(&self, spec_text: &str, _spec_path: &Path) -> SpaceResult<String> {
        self.hash_calls.fetch_add(1, Ordering::SeqCst);
        if self.hashing_unavailable.load(Ordering::SeqCst) {
            return Err(SpaceError::Hash("hashing unavailable".to_string()));
        }
        Ok(hex::encode(Sha256::digest(spec_text.as_bytes())))
    }

    async fn build(&self, spec_path: &Path, target_dir: &Path) -> SpaceResult<BuildOutput> {
        self.build_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut builds) = self.builds.lock() {
            builds.push((spec_path.to_path_buf(), target_dir.to_path_buf()));
        }

        if !self.build_delay.is_zero() {
            tokio::time::sleep(self.build_delay).await;
        }

        if self.fail_builds.load(Ordering::SeqCst) {
            return Ok(BuildOutput {
                success: false,
                captured_env: CapturedEnv::new(),
                stdout: format!("resolving {}", spec_path.display()),
                stderr: "simulated build failure".to_string(),
            });
        }

        let root = target_dir.join("toolchain");
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| SpaceError::io(format!("creating {}", root.display()), e))?;

        let mut captured_env = CapturedEnv::new();
        captured_env.insert(
            TOOLCHAIN_ROOT_KEY.to_string(),
            root.to_string_lossy().into_owned(),
        );
        captured_env.insert(
            "PATH".to_string(),
            root.join("bin").to_string_lossy().into_owned(),
        );

        Ok(BuildOutput {
            success: true,
            captured_env,
            stdout: format!("built {}", spec_path.display()),
            stderr: String::new(),
        })
    }

    fn builder_name(&self) -> &'static str {
        "in-memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn hash_is_content_based() {
        let builder = InMemoryBuilder::new();
        let a = builder.hash("x", Path::new("/a.yaml")).await.unwrap();
        let b = builder.hash("x", Path::new("/b.yaml")).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(builder.hash_calls(), 2);
    }

    #[tokio::test]
    async fn hashing_can_be_disabled() {
        let builder = InMemoryBuilder::new().without_hashing();
        assert!(builder.hash("x", Path::new("/a.yaml")).await.is_err());
    }

    #[tokio::test]
    async fn build_creates_toolchain_root() {
        let temp = TempDir::new().unwrap();
        let builder = InMemoryBuilder::new();

        let output = builder
            .build(Path::new("/env.yaml"), temp.path())
            .await
            .unwrap();

        assert!(output.success);
        let root = PathBuf::from(&output.captured_env[TOOLCHAIN_ROOT_KEY]);
        assert!(root.is_dir());
        assert_eq!(builder.build_calls(), 1);
    }

    #[tokio::test]
    async fn failing_build_reports_output() {
        let temp = TempDir::new().unwrap();
        let builder = InMemoryBuilder::new().failing_builds();

        let output = builder
            .build(Path::new("/env.yaml"), temp.path())
            .await
            .unwrap();

        assert!(!output.success);
        assert!(output.stderr.contains("simulated"));
    }
}
