//! CLI command implementations

pub mod allocate;
pub mod config;
pub mod list;
pub mod prune;
pub mod repair;

pub use allocate::execute as allocate;
pub use config::execute as config;
pub use list::execute as list;
pub use prune::execute as prune;
pub use repair::execute as repair;

use crate::allocator::Allocator;
use crate::builder::CommandBuilder;
use crate::config::Config;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Allocator backed by the configured builder program
pub(crate) fn allocator(config: &Config) -> Allocator {
    let builder = Arc::new(CommandBuilder::from_config(&config.builder));
    Allocator::from_config(config, builder)
}

/// Token cancelled on Ctrl-C
pub(crate) fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("Interrupt received, cancelling");
            child.cancel();
        }
    });
    token
}
