use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use console::{style, Emoji};
use indicatif::{HumanDuration, ProgressBar, ProgressStyle};

use crate::config::Config;
use crate::pipeline::driver::IngestContext;

static BOOK: Emoji<'_, '_> = Emoji("📚 ", "");
static BRAIN: Emoji<'_, '_> = Emoji("🧠 ", "");
static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK] ");
static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");

pub async fn run(path: PathBuf, fresh: bool, workers: Option<usize>) -> Result<()> {
    let started = Instant::now();

    println!();
    println!("{}", style(" Doctrina - Doctrine Ingestion ").bold().reverse());
    println!();

    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(workers) = workers {
        config.embed_workers = workers.max(1);
    }

    println!("{}Source: {}", BOOK, style(path.display()).cyan());
    println!(
        "{}Models: extract={} doctrine={} embed={}",
        BRAIN,
        style(&config.models.extract).cyan(),
        style(&config.models.doctrine).cyan(),
        style(&config.models.embed).cyan(),
    );
    if fresh {
        println!("{}Mode: {}", BOOK, style("fresh (ignoring existing artifacts)").yellow());
    }
    println!();

    let ctx = IngestContext::from_config(config)?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message("ingesting (tail progress.json for phase detail)");
    spinner.enable_steady_tick(std::time::Duration::from_millis(100));

    let result = if path.is_dir() {
        ctx.ingest_folder(&path, fresh).await
    } else {
        ctx.ingest(&path, !fresh).await
    };
    spinner.finish_and_clear();
    result?;

    println!();
    println!("{}Artifacts written to {}", CHECK, style(ctx.config.storage_root.display()).cyan());
    println!(
        "{}Done in {}",
        SPARKLE,
        style(HumanDuration(started.elapsed())).green().bold()
    );

    Ok(())
}
