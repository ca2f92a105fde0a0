use clap::{Parser, Subcommand};
use pydex::repository::ProjectRepository;
use pydex::types::{ProjectName, SymbolTable};
use pydex::{Crawler, Settings, indexing, logging};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Parser)]
#[command(name = "pydex")]
#[command(about = "Crawl a package registry and statically index Python projects")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl projects (and their dependencies) into the cache
    Index {
        /// Project names to index
        #[arg(required = true)]
        projects: Vec<String>,

        /// Cache directory (overrides config)
        #[arg(short, long)]
        directory: Option<PathBuf>,

        /// Re-index even when a cached copy exists
        #[arg(short, long)]
        force: bool,

        /// Skip the cached-copy shortcut inside the pipeline
        #[arg(long)]
        skip_existing: bool,

        /// Print each indexed project as JSON
        #[arg(long)]
        pretty: bool,
    },

    /// Index a single Python file and print the module as JSON
    IndexFile {
        /// Path to the .py file
        file: PathBuf,
    },

    /// Index every Python file under a directory and print the modules
    IndexDir {
        /// Directory containing the module tree
        dir: PathBuf,
    },

    /// Generate the manifest from the cache contents
    GenerateIndex {
        /// Cache directory (overrides config)
        #[arg(short, long)]
        directory: Option<PathBuf>,

        /// Merge over the previously published manifest
        #[arg(short, long)]
        update: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;
    logging::init_with_config(&settings.logging);
    let cli = Cli::parse();

    match cli.command {
        Commands::Index {
            projects,
            directory,
            force,
            skip_existing,
            pretty,
        } => {
            let mut settings = settings;
            if force || skip_existing {
                settings.crawl.skip_existing = true;
            }
            let cache_dir = directory.unwrap_or(settings.cache_dir.clone());
            let repo = Arc::new(ProjectRepository::new(cache_dir));
            let crawler = Crawler::new(
                Arc::clone(&repo),
                &settings.registry_url,
                &settings.crawl,
            );

            let mut failures = 0;
            for name in projects {
                let name = ProjectName::new(name);
                if force {
                    // Drop the stale document so the crawl isn't satisfied
                    // from disk.
                    let _ = tokio::fs::remove_file(repo.document_path(&name)).await;
                }
                match crawler.crawl(&name).await {
                    Ok(project) => {
                        if pretty {
                            println!("{}", serde_json::to_string_pretty(&*project)?);
                        } else {
                            println!(
                                "{}=={}: {} modules",
                                project.name,
                                project.metadata.version,
                                project.modules.len()
                            );
                        }
                    }
                    Err(e) => {
                        eprintln!("Failed to index {name}: {e}");
                        failures += 1;
                    }
                }
            }
            repo.update_index().await?;
            if failures > 0 {
                std::process::exit(1);
            }
        }

        Commands::IndexFile { file } => {
            let base = file.parent().unwrap_or(std::path::Path::new("."));
            let module = indexing::index_file(base, &file, &SymbolTable::new());
            println!("{}", serde_json::to_string_pretty(&module)?);
        }

        Commands::IndexDir { dir } => {
            let modules = indexing::index_dir(
                &dir,
                Arc::new(SymbolTable::new()),
                Arc::new(Semaphore::new(settings.crawl.parse_threads.max(1))),
            )
            .await;
            println!("{}", serde_json::to_string_pretty(&modules)?);
        }

        Commands::GenerateIndex { directory, update } => {
            let cache_dir = directory.unwrap_or(settings.cache_dir.clone());
            let repo = ProjectRepository::new(cache_dir);
            let index = if update {
                repo.load_all().await?;
                repo.update_index().await?
            } else {
                repo.load_all().await?;
                repo.write_index(chrono::Utc::now().timestamp()).await?
            };
            println!(
                "Wrote manifest with {} projects to {}",
                index.all_project_names.len(),
                repo.directory().join("index.json").display()
            );
        }
    }

    Ok(())
}
