pub mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "doctrina")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Doctrine knowledge-base ingestion pipeline for PDF corpora using local LLMs", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ingest one PDF or every PDF in a folder
    #[command(long_about = "Ingest one PDF or every PDF in a folder.\n\n\
        Each book gets its own storage directory under the storage root,\n\
        holding the canonical text, chapter split, extracted doctrine,\n\
        embeddings, and progress marker. Completed books are skipped unless\n\
        --fresh is given.\n\n\
        Models are selected via OLLAMA_EXTRACT_MODEL, OLLAMA_DEEPSEEK_MODEL,\n\
        OLLAMA_EMBED_MODEL, and OLLAMA_GLYPH_REPAIR_MODEL.")]
    Ingest {
        /// Path to a PDF file or a folder containing PDFs
        #[arg(required = true)]
        path: PathBuf,

        /// Ignore existing artifacts and re-ingest from scratch
        #[arg(long, default_value = "false")]
        fresh: bool,

        /// Number of concurrent embedding workers
        #[arg(short = 'j', long, env = "DOCTRINA_EMBED_WORKERS")]
        workers: Option<usize>,
    },

    /// Search the vector indices for doctrine similar to a query
    Search {
        /// Natural language query
        query: String,

        /// Restrict the search to one domain index
        #[arg(short, long)]
        domain: Option<String>,

        /// Number of results
        #[arg(short = 'k', long, default_value = "10")]
        topk: usize,
    },

    /// Show the combined index statistics
    Stats,
}
