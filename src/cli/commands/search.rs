use std::time::Duration;

use anyhow::{Context, Result};
use console::style;

use crate::config::Config;
use crate::domain::Domain;
use crate::llm::{ollama::OllamaClient, LlmService};
use crate::store::{file::FileVectorStore, VectorStore};

const EMBED_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn run(query: String, domain: Option<String>, topk: usize) -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    let domain = domain
        .map(|d| Domain::parse(&d))
        .transpose()
        .context("Unknown domain (see the whitelist in the docs)")?;

    println!("Searching for: {}", style(&query).cyan());

    let embedder = OllamaClient::new(&config.models.base_url, &config.models.embed);
    let embedding = embedder
        .embed(&query, EMBED_TIMEOUT)
        .await
        .context("Failed to embed query. Is Ollama running?")?;

    let store = FileVectorStore::open(&config.data_root)?;
    let hits = match domain {
        Some(domain) => store.search_domain(domain, &embedding, topk).await?,
        None => store.search_combined(&embedding, topk).await?,
    };

    if hits.is_empty() {
        println!("{}", style("No results. Ingest some books first.").yellow());
        return Ok(());
    }

    println!();
    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{:>2}. [{:.3}] {} {}",
            i + 1,
            hit.score,
            style(format!("{}/{}", hit.record.domain, hit.record.category)).dim(),
            hit.record.text,
        );
        if let Some(book) = &hit.record.source_book {
            let chapter = hit
                .record
                .source_chapter
                .map(|c| format!(", chapter {c}"))
                .unwrap_or_default();
            println!("    {}", style(format!("source: {book}{chapter}")).dim());
        }
    }

    Ok(())
}
