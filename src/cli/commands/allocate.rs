//! Allocate command - get a space for a spec

use crate::allocator::{Allocation, AllocationOutcome};
use crate::cli::args::{AllocateArgs, OutputFormat};
use crate::config::Config;
use crate::error::SpaceResult;
use crate::space::EnvironmentSpec;
use console::style;

/// Execute the allocate command
pub async fn execute(args: AllocateArgs, config: &Config) -> SpaceResult<()> {
    let mut config = config.clone();
    if let Some(secs) = args.reuse_timeout {
        config.pool.reuse_timeout_secs = secs;
    }

    let spec = EnvironmentSpec::from_file(&args.spec)?;
    let allocator = super::allocator(&config);
    let cancel = super::interrupt_token();

    let allocation = allocator.allocate(&spec, &cancel).await?;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&allocation)?),
        OutputFormat::Plain => println!("{}", allocation.path.display()),
        OutputFormat::Table => print_summary(&allocation),
    }

    Ok(())
}

fn print_summary(allocation: &Allocation) {
    let outcome = match allocation.outcome {
        AllocationOutcome::Reused => style("reused").green(),
        AllocationOutcome::Rebuilt => style("rebuilt").yellow(),
        AllocationOutcome::Created => style("created").cyan(),
    };

    println!("{:<12} {}", style("Space").bold(), allocation.name);
    println!("{:<12} {}", style("Path").bold(), allocation.path.display());
    println!("{:<12} {}", style("Outcome").bold(), outcome);
    println!();
    for (key, value) in &allocation.captured_env {
        println!("{}={}", key, value);
    }
}
