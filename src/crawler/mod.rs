//! Recursive registry crawler: fetch metadata, pick an artifact, extract
//! sources, resolve dependencies through the shared cache, then index.

pub mod archive;
pub mod graph;
pub mod registry;

pub use graph::DepGraph;
pub use registry::{Artifact, RegistryClient, RegistryRelease};

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::CrawlConfig;
use crate::indexing::{self, docs};
use crate::repository::{ProjectFactory, ProjectRepository, ProjectSink, RepoResult};
use crate::types::{Project, ProjectMetadata, ProjectName, SymbolTable};

/// Version string stored for projects the crawler refuses to index.
pub const BLOCKLISTED_VERSION: &str = "BLOCKLISTED";

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("registry returned HTTP {status} for {name}")]
    Registry { name: ProjectName, status: u16 },

    #[error("registry request for {name} failed after {attempts} attempts: {source}")]
    Network {
        name: ProjectName,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid registry document for {name}: {cause}")]
    Metadata { name: ProjectName, cause: String },

    #[error("download of {url} failed: {cause}")]
    Download { url: String, cause: String },

    #[error("archive extraction failed: {cause}")]
    Extract { cause: String },

    #[error("unsupported archive format: {filename}")]
    UnsupportedArchive { filename: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

struct CrawlerInner {
    repo: Arc<ProjectRepository>,
    registry: RegistryClient,
    parse_gate: Arc<Semaphore>,
    graph: DepGraph,
    blocklist: HashSet<ProjectName>,
    skip_existing: bool,
    max_source_bytes: u64,
}

/// The [`ProjectFactory`] of a crawl run. Cheap to clone; all state is
/// shared, including the run-scoped dependency graph.
#[derive(Clone)]
pub struct Crawler {
    inner: Arc<CrawlerInner>,
}

impl Crawler {
    pub fn new(repo: Arc<ProjectRepository>, registry_url: &str, config: &CrawlConfig) -> Self {
        Self {
            inner: Arc::new(CrawlerInner {
                repo,
                registry: RegistryClient::new(
                    registry_url,
                    config.network_concurrency,
                    config.retries,
                ),
                parse_gate: Arc::new(Semaphore::new(config.parse_threads.max(1))),
                graph: DepGraph::new(),
                blocklist: config.blocklist.iter().map(ProjectName::new).collect(),
                skip_existing: config.skip_existing,
                max_source_bytes: config.max_source_bytes,
            }),
        }
    }

    /// Resolve one project through the shared cache, crawling it (and,
    /// recursively, its dependencies) on a miss.
    pub async fn crawl(&self, name: &ProjectName) -> RepoResult<Arc<Project>> {
        self.inner.repo.get(name, Arc::new(self.clone())).await
    }

    async fn index_project(&self, name: ProjectName, sink: ProjectSink) -> anyhow::Result<()> {
        let inner = &*self.inner;
        if inner.blocklist.contains(&name) {
            info!("Not indexing {name} because it's blocklisted");
            sink.send(blocklisted_project(&name)).await;
            return Ok(());
        }

        let (existing, release) = tokio::join!(
            async {
                if inner.skip_existing {
                    None
                } else {
                    inner.repo.cached(&name).await
                }
            },
            inner.registry.fetch(&name),
        );
        let RegistryRelease {
            mut metadata,
            description,
            artifact,
        } = release?;

        if let Some(existing) = existing {
            if artifact.is_none() || existing.metadata.version == metadata.version {
                debug!("Using cached copy of {name}=={}", existing.metadata.version);
                sink.send((*existing).clone()).await;
                return Ok(());
            }
            debug!(
                "Cache has {name}=={} but the registry has {}, re-indexing",
                existing.metadata.version, metadata.version
            );
        }

        let description = docs::describe(&description.text);

        let Some(artifact) = artifact else {
            let note = format!(
                "Couldn't find a suitable artifact for {name}=={}",
                metadata.version
            );
            warn!("{note}");
            metadata.summary = Some(note);
            sink.send(Project {
                name: name.clone(),
                metadata,
                documentation: vec![description],
                modules: Vec::new(),
            })
            .await;
            return Ok(());
        };

        let scratch = tempfile::tempdir()?;
        let src_dir = inner
            .registry
            .download(&name, scratch.path(), &artifact)
            .await?;

        let mut dep_names = Vec::new();
        for dep in &metadata.dependencies {
            let dep = ProjectName::new(dep.clone());
            if !inner.graph.creates_cycle(&name, &dep) {
                dep_names.push(dep);
            } else if inner.repo.contains(&dep).await {
                // The cached copy loads without recursing, so the cycle is
                // broken at a possibly stale snapshot.
                warn!("Dependency cycle! Indexing {name} with a stale copy of {dep}");
                dep_names.push(dep);
            } else {
                warn!("Dependency cycle! Indexing {name} without {dep}");
            }
        }

        let mut tasks = JoinSet::new();
        for dep in dep_names {
            let crawler = self.clone();
            tasks.spawn(async move {
                let result = crawler.crawl(&dep).await;
                (dep, result)
            });
        }
        let mut deps = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(project))) => deps.push(project),
                Ok((dep, Err(e))) => {
                    error!("Indexing {name} without dependency {dep}: {e}")
                }
                Err(e) => error!("Dependency task for {name} failed to join: {e}"),
            }
        }

        let symbols = Arc::new(build_symbol_table(&deps));

        let mut documentation = Vec::new();
        let source_bytes = dir_size(&src_dir);
        let modules = if source_bytes > inner.max_source_bytes {
            let note = format!(
                "Project {name} is too large ({source_bytes} bytes of Python sources), contents were not indexed"
            );
            warn!("{note}");
            documentation.push(note);
            Vec::new()
        } else {
            info!("Indexing sources of {name}=={}", metadata.version);
            indexing::index_dir(&src_dir, symbols, Arc::clone(&inner.parse_gate)).await
        };
        documentation.push(description);

        sink.send(Project {
            name: name.clone(),
            metadata,
            documentation,
            modules,
        })
        .await;
        info!("Done indexing {name}");
        Ok(())
    }
}

#[async_trait]
impl ProjectFactory for Crawler {
    async fn produce(&self, name: ProjectName, sink: ProjectSink) -> anyhow::Result<()> {
        self.index_project(name, sink).await
    }
}

fn blocklisted_project(name: &ProjectName) -> Project {
    Project {
        name: name.clone(),
        metadata: ProjectMetadata {
            name: name.clone(),
            version: BLOCKLISTED_VERSION.to_string(),
            classifiers: None,
            home_page: None,
            license: None,
            documentation_url: None,
            dependencies: Vec::new(),
            summary: Some(BLOCKLISTED_VERSION.to_string()),
            upload_time: 0,
        },
        documentation: Vec::new(),
        modules: Vec::new(),
    }
}

/// Map every externally visible name in `projects` to its owning project,
/// for cross-project reference resolution while indexing a dependent.
pub fn build_symbol_table(projects: &[Arc<Project>]) -> SymbolTable {
    let mut symbols = SymbolTable::new();
    for project in projects {
        let owner = &project.name;
        for module in &project.modules {
            symbols.insert(module.name.clone(), owner.clone());
            for export in &module.exports {
                symbols.insert(export.name.clone(), owner.clone());
            }
            for function in &module.functions {
                symbols.insert(function.name.clone(), owner.clone());
            }
            for variable in &module.variables {
                symbols.insert(variable.name.clone(), owner.clone());
            }
            for class in &module.classes {
                insert_class(&mut symbols, class, owner);
            }
        }
    }
    symbols
}

fn insert_class(symbols: &mut SymbolTable, class: &crate::types::Class, owner: &ProjectName) {
    symbols.insert(class.name.clone(), owner.clone());
    for method in &class.methods {
        symbols.insert(method.name.clone(), owner.clone());
    }
    for variable in &class.class_variables {
        symbols.insert(variable.name.clone(), owner.clone());
    }
    for inner in &class.inner_classes {
        insert_class(symbols, inner, owner);
    }
}

fn dir_size(dir: &std::path::Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Class, Export, FQName, Function, Module, Variable, XRef};

    fn function(name: &str) -> Function {
        Function {
            name: FQName::from(name),
            asynchronous: false,
            params: Vec::new(),
            returns: None,
            documentation: Vec::new(),
        }
    }

    #[test]
    fn symbol_table_covers_nested_definitions() {
        let project = Arc::new(Project {
            name: ProjectName::from("pkg"),
            metadata: ProjectMetadata {
                name: ProjectName::from("pkg"),
                version: "1.0".to_string(),
                classifiers: None,
                home_page: None,
                license: None,
                documentation_url: None,
                dependencies: Vec::new(),
                summary: None,
                upload_time: 0,
            },
            documentation: Vec::new(),
            modules: vec![Module {
                name: FQName::from("pkg.mod"),
                documentation: Vec::new(),
                functions: vec![function("pkg.mod.run")],
                variables: vec![Variable {
                    name: FQName::from("pkg.mod.LEVEL"),
                    ty: None,
                    documentation: Vec::new(),
                }],
                classes: vec![Class {
                    name: FQName::from("pkg.mod.Outer"),
                    bases: Vec::new(),
                    methods: vec![function("pkg.mod.Outer.method")],
                    class_variables: Vec::new(),
                    inner_classes: vec![Class {
                        name: FQName::from("pkg.mod.Outer.Inner"),
                        bases: Vec::new(),
                        methods: Vec::new(),
                        class_variables: Vec::new(),
                        inner_classes: Vec::new(),
                        documentation: Vec::new(),
                    }],
                    documentation: Vec::new(),
                }],
                exports: vec![Export {
                    name: FQName::from("pkg.run"),
                    xref: XRef::new(FQName::from("pkg.mod.run"), None),
                }],
            }],
        });

        let symbols = build_symbol_table(&[project]);
        let owner = ProjectName::from("pkg");
        for fq in [
            "pkg.mod",
            "pkg.mod.run",
            "pkg.mod.LEVEL",
            "pkg.mod.Outer",
            "pkg.mod.Outer.method",
            "pkg.mod.Outer.Inner",
            "pkg.run",
        ] {
            assert_eq!(symbols.lookup(&FQName::from(fq)), Some(owner.clone()), "{fq}");
        }
        assert_eq!(symbols.lookup(&FQName::from("pkg.other")), None);
    }

    #[test]
    fn blocklisted_placeholder_shape() {
        let project = blocklisted_project(&ProjectName::from("Evil-Pkg"));
        assert_eq!(project.metadata.version, BLOCKLISTED_VERSION);
        assert!(project.modules.is_empty());
        assert_eq!(project.name, ProjectName::from("evil.pkg"));
    }
}
