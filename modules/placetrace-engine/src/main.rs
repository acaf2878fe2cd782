use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use placetrace_common::GeocodeConfig;
use placetrace_engine::{
    materialize, overrides::OverrideStore, reconcile, GeocodeResolver, JobDir, JobRunner,
    NominatimClient,
};

#[derive(Parser)]
#[command(name = "placetrace", about = "Toponym reconciliation and geocoding engine")]
struct Cli {
    /// Job working directory.
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Recompute the resolved model and rewrite the active term list.
    Reconcile,
    /// Exclude a term everywhere, or one occurrence with --page.
    Exclude {
        term: String,
        #[arg(long)]
        page: Option<u32>,
    },
    /// Re-include a term globally, or force-include one occurrence with --page.
    Include {
        term: String,
        #[arg(long)]
        page: Option<u32>,
    },
    /// Run the batch geocoding for the active term list.
    Geocode,
    /// Print the current geocoding progress record.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("placetrace=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let job = JobDir::new(&cli.dir);

    match cli.command {
        Command::Reconcile => {
            reconcile_and_materialize(&job)?;
        }
        Command::Exclude { term, page } => {
            let store = OverrideStore::new(&job);
            match page {
                Some(page) => store.exclude_page(&term, page)?,
                None => store.exclude_global(&term)?,
            };
            reconcile_and_materialize(&job)?;
        }
        Command::Include { term, page } => {
            let store = OverrideStore::new(&job);
            match page {
                Some(page) => store.include_page(&term, page)?,
                None => store.include_global(&term)?,
            };
            reconcile_and_materialize(&job)?;
        }
        Command::Geocode => {
            reconcile_and_materialize(&job)?;
            let config = GeocodeConfig::from_env();
            let client = NominatimClient::new(config.clone(), &job)?;
            let resolver = GeocodeResolver::new(client, config);
            let runner = JobRunner::new(job);
            let handle = runner.start(resolver)?;
            handle.await?;
            if let Some(progress) = runner.progress() {
                println!("{}", serde_json::to_string_pretty(&progress)?);
            }
        }
        Command::Status => {
            let runner = JobRunner::new(job);
            match runner.progress() {
                Some(progress) => println!("{}", serde_json::to_string_pretty(&progress)?),
                None => println!("{{\"status\": \"idle\"}}"),
            }
        }
    }

    Ok(())
}

/// Recompute the model from the artifacts and overrides, print the
/// curator-facing summary, and rewrite the active term list.
fn reconcile_and_materialize(job: &JobDir) -> Result<()> {
    let raw = job.read_raw_rows()?;
    let rejected = job.read_rejected_rows()?;
    let state = OverrideStore::new(job).load();

    let model = reconcile::resolve_model(&raw, &rejected, &state);
    let meta = reconcile::page_meta(&raw, &rejected);
    materialize::write_active(job, &model, &meta)?;

    for (display, count) in reconcile::included_summary(&model) {
        println!("{display}  ({count} pages)");
    }
    for (key, term) in &model.excluded {
        if term.is_global {
            println!("excluded everywhere: {} [{key}]", term.display);
        } else {
            let pages: Vec<String> = term.pages.iter().map(u32::to_string).collect();
            println!("excluded: {} on pages {}", term.display, pages.join(","));
        }
    }

    info!(
        included = model.included.len(),
        excluded = model.excluded.len(),
        "Reconciliation complete"
    );
    Ok(())
}
