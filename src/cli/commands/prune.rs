//! Prune command - shrink the pool

use crate::cli::args::PruneArgs;
use crate::config::Config;
use crate::error::SpaceResult;
use console::style;

/// Execute the prune command
pub async fn execute(args: PruneArgs, config: &Config) -> SpaceResult<()> {
    let keep = args.keep.unwrap_or(config.pool.max_retained);
    let allocator = super::allocator(config);
    let cancel = super::interrupt_token();

    let pruned = allocator.prune(keep, args.dry_run, &cancel).await?;

    if pruned.is_empty() {
        println!("Nothing to prune.");
        return Ok(());
    }

    let verb = if args.dry_run { "Would remove" } else { "Removed" };
    for name in &pruned {
        println!("{} {} {}", style("•").cyan(), verb, name);
    }
    println!();
    if args.dry_run {
        println!("{} space(s) would be removed (dry run)", pruned.len());
    } else {
        println!("Removed {} space(s)", pruned.len());
    }
    Ok(())
}
