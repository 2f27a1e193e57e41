use anyhow::{Context, Result};
use console::style;
use serde_json::Value;

use crate::config::Config;
use crate::minister::COMBINED_INDEX_FILE;

pub async fn run() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    let index_path = config.data_root.join(COMBINED_INDEX_FILE);
    if !index_path.exists() {
        println!("{}", style("No combined index yet. Ingest some books first.").yellow());
        return Ok(());
    }

    let index: Value = serde_json::from_str(&std::fs::read_to_string(&index_path)?)
        .context("Combined index is not valid JSON")?;

    println!();
    println!("{}", style(" Combined Index ").bold().reverse());
    println!();
    println!(
        "Domains with data: {}",
        style(index["metadata"]["total_domains"].as_u64().unwrap_or(0)).green().bold()
    );
    println!(
        "Total entries:     {}",
        style(index["metadata"]["total_entries"].as_u64().unwrap_or(0)).green().bold()
    );
    println!();

    if let Some(stats) = index["domain_statistics"].as_object() {
        for (domain, info) in stats {
            println!(
                "  {} {:<12} {:>6} entries  (updated {})",
                style("•").cyan(),
                domain,
                info["total_entries"].as_u64().unwrap_or(0),
                info["last_updated"].as_str().unwrap_or("never"),
            );
        }
    }

    Ok(())
}
