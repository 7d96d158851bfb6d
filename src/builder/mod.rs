//! Environment builder abstraction
//!
//! The builder is the external tool that materializes a spec into a space
//! directory and computes spec hashes. Only the allocator and the identity
//! comparator talk to it.
//!
//! - [`CommandBuilder`]: runs the configured builder executable
//! - [`InMemoryBuilder`]: deterministic stand-in for tests and dry runs

mod command;
mod memory;

pub use command::CommandBuilder;
pub use memory::InMemoryBuilder;

use crate::error::SpaceResult;
use crate::space::CapturedEnv;
use async_trait::async_trait;
use std::path::Path;

/// Result of running a build to completion
#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    /// Whether the tool reported success
    pub success: bool,
    /// Environment variables of the built space
    pub captured_env: CapturedEnv,
    pub stdout: String,
    pub stderr: String,
}

/// Abstract builder interface
#[async_trait]
pub trait SpaceBuilder: Send + Sync {
    /// Hash a spec text; `spec_path` gives the tool context for relative
    /// references inside the spec
    async fn hash(&self, spec_text: &str, spec_path: &Path) -> SpaceResult<String>;

    /// Materialize the spec at `spec_path` into `target_dir`
    ///
    /// `Err` means the tool could not run or timed out; a tool that ran and
    /// failed returns `Ok` with `success == false`.
    async fn build(&self, spec_path: &Path, target_dir: &Path) -> SpaceResult<BuildOutput>;

    /// Human-readable name for logs
    fn builder_name(&self) -> &'static str;
}
