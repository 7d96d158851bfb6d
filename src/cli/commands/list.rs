//! List command - show spaces in the pool

use crate::cli::args::{ListArgs, OutputFormat};
use crate::config::{Config, ConfigManager};
use crate::error::SpaceResult;
use crate::space::{SpaceRecord, SpaceRegistry, SpaceStatus};
use console::style;
use tracing::warn;

/// Execute the list command
pub async fn execute(args: ListArgs, config: &Config) -> SpaceResult<()> {
    let registry = SpaceRegistry::new(ConfigManager::spaces_dir(config));
    let mut spaces = registry.list_spaces()?;
    for record in spaces.iter_mut() {
        // Read-only view: damage is only noted in memory.
        if let Err(e) = registry.load_last_usage(record, true) {
            warn!("Could not read usage of space {}: {}", record.name, e);
            record.damaged = true;
        }
    }

    if spaces.is_empty() {
        match args.format {
            OutputFormat::Json => println!("[]"),
            OutputFormat::Plain => {}
            OutputFormat::Table => println!("No spaces in {}", registry.base_dir().display()),
        }
        return Ok(());
    }

    match args.format {
        OutputFormat::Table => print_table(&spaces),
        OutputFormat::Json => print_json(&spaces)?,
        OutputFormat::Plain => print_plain(&spaces),
    }

    Ok(())
}

fn print_table(spaces: &[SpaceRecord]) {
    println!(
        "{:<20} {:<12} {:<20} {:<30}",
        style("NAME").bold(),
        style("STATUS").bold(),
        style("LAST USED").bold(),
        style("PATH").bold()
    );
    println!("{}", "-".repeat(82));

    for space in spaces {
        let status_styled = match (space.status, space.damaged) {
            (_, true) => style("damaged").red(),
            (SpaceStatus::EnvReady, false) => style("ready").green(),
            (SpaceStatus::EnvRequested, false) => style("requested").yellow(),
            (SpaceStatus::Created, false) => style("created").dim(),
        };

        let last_used = space
            .last_usage
            .map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());

        println!(
            "{:<20} {:<12} {:<20} {:<30}",
            space.name,
            status_styled,
            last_used,
            space.path.display()
        );
    }

    println!();
    println!("{} space(s)", spaces.len());
}

fn print_json(spaces: &[SpaceRecord]) -> SpaceResult<()> {
    let json = serde_json::to_string_pretty(spaces)?;
    println!("{}", json);
    Ok(())
}

fn print_plain(spaces: &[SpaceRecord]) {
    for space in spaces {
        println!("{}", space.name);
    }
}
