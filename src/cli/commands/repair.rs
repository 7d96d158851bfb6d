//! Repair command - delete damaged spaces

use crate::cli::args::RepairArgs;
use crate::config::Config;
use crate::error::SpaceResult;
use crate::space::SpaceName;
use console::style;

/// Execute the repair command
pub async fn execute(args: RepairArgs, config: &Config) -> SpaceResult<()> {
    let allocator = super::allocator(config);
    let cancel = super::interrupt_token();

    if let Some(name) = args.name {
        let name = SpaceName::new(name)?;
        allocator.repair(&name, &cancel).await?;
        println!("{} Removed {}", style("✓").green(), name);
        return Ok(());
    }

    let repaired = allocator.repair_all(&cancel).await?;
    if repaired.is_empty() {
        println!("No damaged spaces found.");
        return Ok(());
    }

    for name in &repaired {
        println!("{} Removed {}", style("✓").green(), name);
    }
    println!();
    println!("Repaired {} space(s)", repaired.len());
    Ok(())
}
