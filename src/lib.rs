//! Registry crawler and static Python indexer with an incremental
//! on-disk cache.
//!
//! The pipeline: fetch a project's metadata from the package registry, pick
//! a suitable release artifact, extract its `.py` sources, recursively
//! resolve its dependencies through the shared [`ProjectRepository`] cache,
//! and statically index every module into a typed [`Project`] document.
//!
//! # Quick start
//!
//! ```no_run
//! use pydex::{Crawler, ProjectRepository, Settings};
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let settings = Settings::load()?;
//! let repo = Arc::new(ProjectRepository::new(&settings.cache_dir));
//! let crawler = Crawler::new(repo, &settings.registry_url, &settings.crawl);
//! let project = crawler.crawl(&"black".into()).await?;
//! println!("{} modules", project.modules.len());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crawler;
pub mod indexing;
pub mod logging;
pub mod repository;
pub mod types;

pub use config::Settings;
pub use crawler::{CrawlError, Crawler};
pub use repository::{
    ProjectFactory, ProjectRepository, ProjectSink, RepoError, RepoResult,
};
pub use types::{
    Class, Documentation, Export, FQName, Function, Index, Module, Parameter, Project,
    ProjectMetadata, ProjectName, SymbolTable, Type, Variable, XRef,
};
