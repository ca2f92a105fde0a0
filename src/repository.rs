//! Disk-backed, request-coalescing project cache.
//!
//! `get` guarantees at most one factory invocation per distinct normalized
//! name for the lifetime of the process, with correct fan-in for concurrent
//! callers: every caller of an in-flight key awaits the same
//! single-assignment slot. Resolved entries are persisted as one JSON
//! document per name and are never overwritten by later writes.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, warn};

use crate::types::{Index, Project, ProjectMetadata, ProjectName};

/// Fixed manifest filename inside the cache directory.
pub const INDEX_FILENAME: &str = "index.json";

/// Errors are `Clone` (string causes) so that every waiter coalesced onto
/// one factory run can observe the identical failure.
#[derive(Error, Debug, Clone)]
pub enum RepoError {
    #[error("factory for {name} failed: {cause}")]
    Factory { name: ProjectName, cause: String },

    #[error("factory completed without yielding a project named {0}")]
    FactoryContract(ProjectName),

    #[error("I/O error on {path}: {cause}")]
    Io { path: PathBuf, cause: String },

    #[error("invalid cache document {path}: {cause}")]
    Corrupt { path: PathBuf, cause: String },
}

pub type RepoResult<T> = Result<T, RepoError>;

/// An async producer driven by [`ProjectRepository::get`]: it pushes zero or
/// more projects through the sink and then completes. It must yield a
/// project for the requested name, but may also yield projects under other
/// names (the crawler yields placeholders this way).
#[async_trait]
pub trait ProjectFactory: Send + Sync {
    async fn produce(&self, name: ProjectName, sink: ProjectSink) -> anyhow::Result<()>;
}

/// Transactional outlet for factory results; each sent project is committed
/// (persisted and published) by the repository as it arrives.
pub struct ProjectSink {
    tx: mpsc::Sender<Project>,
}

impl ProjectSink {
    pub async fn send(&self, project: Project) {
        // The receiver lives for the whole factory run; a closed channel
        // only means the consumer is shutting down.
        let _ = self.tx.send(project).await;
    }
}

type SlotValue = RepoResult<Arc<Project>>;

/// Single-assignment cell per normalized name: `None` while in flight, then
/// exactly one resolution that every subscriber observes.
#[derive(Clone)]
struct Slot {
    tx: watch::Sender<Option<SlotValue>>,
}

impl Slot {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// First resolution wins. Returns whether this call resolved the slot.
    fn resolve(&self, value: SlotValue) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(value);
                true
            } else {
                false
            }
        })
    }

    fn resolved(&self) -> Option<SlotValue> {
        self.tx.borrow().clone()
    }

    fn resolved_ok(&self) -> Option<Arc<Project>> {
        match self.tx.borrow().as_ref() {
            Some(Ok(project)) => Some(project.clone()),
            _ => None,
        }
    }

    async fn wait(&self, name: &ProjectName) -> RepoResult<Arc<Project>> {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(guard) => guard.clone().expect("checked by wait_for"),
            Err(_) => Err(RepoError::Factory {
                name: name.clone(),
                cause: "cache slot closed".to_string(),
            }),
        }
    }
}

pub struct ProjectRepository {
    directory: PathBuf,
    cache: Mutex<HashMap<String, Slot>>,
}

impl ProjectRepository {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn document_path(&self, name: &ProjectName) -> PathBuf {
        self.directory.join(format!("{}.json", name.normalized()))
    }

    /// Look up or crawl a project.
    ///
    /// Exactly one caller becomes the leader for a given name: it hydrates
    /// from disk or drives `factory`, committing each yielded project as it
    /// arrives. All other concurrent callers await the same outcome,
    /// including failures. A factory that completes without yielding the
    /// requested name is a contract violation. Failed slots are cleared so
    /// a later `get` can retry with a fresh factory run.
    pub async fn get(
        &self,
        name: &ProjectName,
        factory: Arc<dyn ProjectFactory>,
    ) -> RepoResult<Arc<Project>> {
        let key = name.normalized();
        let (slot, leader) = {
            let mut cache = self.cache.lock().await;
            match cache.get(&key) {
                Some(slot) => (slot.clone(), false),
                None => {
                    let slot = Slot::new();
                    cache.insert(key.clone(), slot.clone());
                    (slot, true)
                }
            }
        };

        if !leader {
            return slot.wait(name).await;
        }

        match self.load_from_disk(name).await {
            Ok(Some(project)) => {
                debug!("Using cached copy of {name}");
                let project = Arc::new(project);
                slot.resolve(Ok(project.clone()));
                return Ok(project);
            }
            Ok(None) => {}
            Err(e) => {
                slot.resolve(Err(e.clone()));
                self.clear_failed(&key).await;
                return Err(e);
            }
        }

        debug!("Invoking factory for {name}");
        let (tx, mut rx) = mpsc::channel(8);
        let producer = {
            let factory = Arc::clone(&factory);
            let name = name.clone();
            tokio::spawn(async move { factory.produce(name, ProjectSink { tx }).await })
        };
        while let Some(project) = rx.recv().await {
            self.commit(project, true).await;
        }
        let failure = match producer.await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(RepoError::Factory {
                name: name.clone(),
                cause: format!("{e:#}"),
            }),
            Err(e) => Some(RepoError::Factory {
                name: name.clone(),
                cause: e.to_string(),
            }),
        };

        match slot.resolved() {
            Some(value) => value,
            None => {
                let err = failure.unwrap_or_else(|| RepoError::FactoryContract(name.clone()));
                slot.resolve(Err(err.clone()));
                self.clear_failed(&key).await;
                Err(err)
            }
        }
    }

    /// True if the project is cached-and-resolved or loadable from disk;
    /// never forces a factory call.
    pub async fn contains(&self, name: &ProjectName) -> bool {
        {
            let cache = self.cache.lock().await;
            if let Some(slot) = cache.get(&name.normalized()) {
                if slot.resolved_ok().is_some() {
                    return true;
                }
            }
        }
        tokio::fs::try_exists(self.document_path(name))
            .await
            .unwrap_or(false)
    }

    /// The cached copy from memory or disk, without invoking any factory.
    pub async fn cached(&self, name: &ProjectName) -> Option<Arc<Project>> {
        {
            let cache = self.cache.lock().await;
            if let Some(slot) = cache.get(&name.normalized()) {
                if let Some(project) = slot.resolved_ok() {
                    return Some(project);
                }
            }
        }
        match self.load_from_disk(name).await {
            Ok(Some(project)) => Some(Arc::new(project)),
            Ok(None) => None,
            Err(e) => {
                warn!("Ignoring unreadable cache entry for {name}: {e}");
                None
            }
        }
    }

    /// Publish a project into the in-memory cache and, if `persist`, to
    /// disk. The write is an idempotent upsert: a resolved entry is never
    /// overwritten by a later commit for the same name.
    async fn commit(&self, project: Project, persist: bool) {
        let name = project.name.clone();
        let key = name.normalized();
        let slot = {
            let mut cache = self.cache.lock().await;
            cache.entry(key).or_insert_with(Slot::new).clone()
        };
        let project = Arc::new(project);
        if !slot.resolve(Ok(project.clone())) {
            debug!("Ignoring duplicate save of {name}");
            return;
        }
        if persist {
            if let Err(e) = self.persist(&project).await {
                // Keep the in-memory result; partial progress beats
                // aborting the crawl.
                warn!("Failed to persist {name}: {e}");
            }
        }
    }

    async fn persist(&self, project: &Project) -> RepoResult<()> {
        let path = self.document_path(&project.name);
        let bytes = serde_json::to_vec(project).map_err(|e| RepoError::Corrupt {
            path: path.clone(),
            cause: e.to_string(),
        })?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| io_error(&self.directory, e))?;
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error(&path, e))?;
        Ok(())
    }

    async fn load_from_disk(&self, name: &ProjectName) -> RepoResult<Option<Project>> {
        let path = self.document_path(name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            // Plain absence is an ordinary cache miss.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| RepoError::Corrupt {
                path,
                cause: e.to_string(),
            })
    }

    async fn clear_failed(&self, key: &str) {
        let mut cache = self.cache.lock().await;
        if let Some(slot) = cache.get(key) {
            if matches!(slot.tx.borrow().as_ref(), Some(Err(_))) {
                cache.remove(key);
            }
        }
    }

    /// Hydrate every on-disk document into the in-memory cache. Unreadable
    /// documents are skipped with a warning.
    pub async fn load_all(&self) -> RepoResult<usize> {
        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_error(&self.directory, e)),
        };
        let mut loaded = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error(&self.directory, e))?
        {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            if path.file_name().is_some_and(|f| f == INDEX_FILENAME) {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<Project>(&bytes) {
                    Ok(project) => {
                        self.commit(project, false).await;
                        loaded += 1;
                    }
                    Err(e) => warn!("Skipping invalid cache document {}: {e}", path.display()),
                },
                Err(e) => warn!("Skipping unreadable cache document {}: {e}", path.display()),
            }
        }
        Ok(loaded)
    }

    fn index_path(&self) -> PathBuf {
        self.directory.join(INDEX_FILENAME)
    }

    async fn resolved_projects(&self) -> Vec<Arc<Project>> {
        let cache = self.cache.lock().await;
        cache.values().filter_map(Slot::resolved_ok).collect()
    }

    /// Derive the summary manifest from the cache contents. With `hydrate`,
    /// every on-disk entry is loaded into memory first.
    pub async fn generate_index(&self, generated_at: i64, hydrate: bool) -> RepoResult<Index> {
        if hydrate {
            self.load_all().await?;
        }
        let projects = self.resolved_projects().await;
        Ok(build_index(&projects, generated_at))
    }

    /// Generate and publish the manifest.
    pub async fn write_index(&self, generated_at: i64) -> RepoResult<Index> {
        let index = self.generate_index(generated_at, false).await?;
        self.persist_index(&index).await?;
        Ok(index)
    }

    /// Merge a freshly computed index over the previously published one
    /// without rescanning already-published entries.
    pub async fn update_index(&self) -> RepoResult<Index> {
        let fresh = self
            .generate_index(chrono::Utc::now().timestamp(), false)
            .await?;
        let merged = match self.read_index().await? {
            Some(previous) => merge_index(previous, fresh),
            None => fresh,
        };
        self.persist_index(&merged).await?;
        Ok(merged)
    }

    pub async fn read_index(&self) -> RepoResult<Option<Index>> {
        let path = self.index_path();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| RepoError::Corrupt {
                path,
                cause: e.to_string(),
            })
    }

    async fn persist_index(&self, index: &Index) -> RepoResult<()> {
        let path = self.index_path();
        let bytes = serde_json::to_vec(index).map_err(|e| RepoError::Corrupt {
            path: path.clone(),
            cause: e.to_string(),
        })?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| io_error(&self.directory, e))?;
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error(&path, e))?;
        Ok(())
    }
}

fn io_error(path: &Path, e: std::io::Error) -> RepoError {
    RepoError::Io {
        path: path.to_path_buf(),
        cause: e.to_string(),
    }
}

fn build_index(projects: &[Arc<Project>], generated_at: i64) -> Index {
    let mut latest: Vec<ProjectMetadata> =
        projects.iter().map(|p| p.metadata.clone()).collect();
    latest.sort_by(|a, b| {
        b.upload_time
            .cmp(&a.upload_time)
            .then_with(|| a.name.cmp(&b.name))
    });
    latest.truncate(5);

    // Inbound dependency counts over every cached project's declared deps.
    let mut inbound: HashMap<ProjectName, usize> = HashMap::new();
    for project in projects {
        for dep in &project.metadata.dependencies {
            *inbound.entry(ProjectName::new(dep.clone())).or_default() += 1;
        }
    }
    let mut top: Vec<(usize, ProjectMetadata)> = projects
        .iter()
        .map(|p| {
            let count = inbound.get(&p.name).copied().unwrap_or(0);
            (count, p.metadata.clone())
        })
        .collect();
    top.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.name.cmp(&b.1.name)));
    let top_projects: Vec<ProjectMetadata> =
        top.into_iter().take(5).map(|(_, meta)| meta).collect();

    let mut all_project_names: Vec<ProjectName> =
        projects.iter().map(|p| p.name.clone()).collect();
    all_project_names.sort();

    Index {
        generated_at,
        latest_projects: latest,
        top_projects,
        all_project_names,
    }
}

/// Entries only present in the previous manifest are carried over
/// as-published; the fresh computation wins on conflicts.
fn merge_index(previous: Index, fresh: Index) -> Index {
    let mut latest = fresh.latest_projects.clone();
    for meta in previous.latest_projects {
        if !latest.iter().any(|m| m.name == meta.name) {
            latest.push(meta);
        }
    }
    latest.sort_by(|a, b| {
        b.upload_time
            .cmp(&a.upload_time)
            .then_with(|| a.name.cmp(&b.name))
    });
    latest.truncate(5);

    let mut top = fresh.top_projects.clone();
    for meta in previous.top_projects {
        if !top.iter().any(|m| m.name == meta.name) {
            top.push(meta);
        }
    }
    top.truncate(5);

    let mut all_project_names = fresh.all_project_names.clone();
    for name in previous.all_project_names {
        if !all_project_names.contains(&name) {
            all_project_names.push(name);
        }
    }
    all_project_names.sort();

    Index {
        generated_at: fresh.generated_at,
        latest_projects: latest,
        top_projects: top,
        all_project_names,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Module, FQName};

    fn project(name: &str, upload_time: i64, deps: &[&str]) -> Arc<Project> {
        let name = ProjectName::from(name);
        Arc::new(Project {
            name: name.clone(),
            metadata: ProjectMetadata {
                name,
                version: "1.0".to_string(),
                classifiers: None,
                home_page: None,
                license: None,
                documentation_url: None,
                dependencies: deps.iter().map(|d| d.to_string()).collect(),
                summary: None,
                upload_time,
            },
            documentation: Vec::new(),
            modules: vec![Module::empty(FQName::from("m"))],
        })
    }

    #[test]
    fn index_ranks_latest_and_top() {
        let projects = vec![
            project("alpha", 10, &["core"]),
            project("beta", 30, &["core", "alpha"]),
            project("core", 20, &[]),
        ];
        let index = build_index(&projects, 99);
        assert_eq!(index.generated_at, 99);

        let latest: Vec<&str> = index
            .latest_projects
            .iter()
            .map(|m| m.name.as_str())
            .collect();
        assert_eq!(latest, vec!["beta", "core", "alpha"]);

        let top: Vec<&str> = index
            .top_projects
            .iter()
            .map(|m| m.name.as_str())
            .collect();
        assert_eq!(top, vec!["core", "alpha", "beta"]);

        let names: Vec<&str> = index
            .all_project_names
            .iter()
            .map(|n| n.as_str())
            .collect();
        assert_eq!(names, vec!["alpha", "beta", "core"]);
    }

    #[test]
    fn merge_prefers_fresh_entries() {
        let previous = build_index(&[project("old", 5, &[])], 1);
        let fresh = build_index(&[project("new", 50, &[])], 2);
        let merged = merge_index(previous, fresh);
        assert_eq!(merged.generated_at, 2);
        let latest: Vec<&str> = merged
            .latest_projects
            .iter()
            .map(|m| m.name.as_str())
            .collect();
        assert_eq!(latest, vec!["new", "old"]);
        assert_eq!(merged.all_project_names.len(), 2);
    }
}
