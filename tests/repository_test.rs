//! Cache behavior: request coalescing, disk hydration, write-once commits,
//! factory contract enforcement, and manifest updates.

use async_trait::async_trait;
use pydex::repository::{ProjectFactory, ProjectRepository, ProjectSink, RepoError};
use pydex::types::{Project, ProjectMetadata, ProjectName};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn project(name: &str, version: &str, upload_time: i64) -> Project {
    let name = ProjectName::from(name);
    Project {
        name: name.clone(),
        metadata: ProjectMetadata {
            name,
            version: version.to_string(),
            classifiers: None,
            home_page: None,
            license: None,
            documentation_url: None,
            dependencies: Vec::new(),
            summary: None,
            upload_time,
        },
        documentation: Vec::new(),
        modules: Vec::new(),
    }
}

/// Yields a fixed set of projects and counts invocations.
struct CountingFactory {
    calls: AtomicUsize,
    yields: Vec<Project>,
}

impl CountingFactory {
    fn new(yields: Vec<Project>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            yields,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProjectFactory for CountingFactory {
    async fn produce(&self, _name: ProjectName, sink: ProjectSink) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        for project in self.yields.clone() {
            sink.send(project).await;
        }
        Ok(())
    }
}

struct FailingFactory;

#[async_trait]
impl ProjectFactory for FailingFactory {
    async fn produce(&self, _name: ProjectName, _sink: ProjectSink) -> anyhow::Result<()> {
        anyhow::bail!("registry is on fire")
    }
}

#[tokio::test]
async fn factory_runs_once_per_name() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = ProjectRepository::new(tmp.path());
    let factory = CountingFactory::new(vec![project("foo", "1.0", 0)]);
    let name = ProjectName::from("foo");

    let first = repo.get(&name, factory.clone()).await.unwrap();
    let second = repo.get(&name, factory.clone()).await.unwrap();
    assert_eq!(first.metadata.version, "1.0");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(factory.calls(), 1);

    // Different spellings of the same name share the entry.
    let aliased = repo.get(&ProjectName::from("FOO"), factory.clone()).await.unwrap();
    assert!(Arc::ptr_eq(&first, &aliased));
    assert_eq!(factory.calls(), 1);
}

#[tokio::test]
async fn concurrent_callers_coalesce_onto_one_factory_run() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = Arc::new(ProjectRepository::new(tmp.path()));
    let factory = CountingFactory::new(vec![project("foo", "1.0", 0)]);
    let name = ProjectName::from("foo");

    let mut handles = Vec::new();
    for _ in 0..16 {
        let repo = Arc::clone(&repo);
        let factory = factory.clone();
        let name = name.clone();
        handles.push(tokio::spawn(
            async move { repo.get(&name, factory).await },
        ));
    }
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.metadata.version, "1.0");
    }
    assert_eq!(factory.calls(), 1);
}

#[tokio::test]
async fn disk_entries_load_without_invoking_the_factory() {
    let tmp = tempfile::tempdir().unwrap();
    let name = ProjectName::from("foo");
    {
        let repo = ProjectRepository::new(tmp.path());
        let factory = CountingFactory::new(vec![project("foo", "2.0", 0)]);
        repo.get(&name, factory).await.unwrap();
    }

    // Fresh repository over the same directory.
    let repo = ProjectRepository::new(tmp.path());
    let factory = CountingFactory::new(vec![project("foo", "9.9", 0)]);
    let loaded = repo.get(&name, factory.clone()).await.unwrap();
    assert_eq!(loaded.metadata.version, "2.0");
    assert_eq!(factory.calls(), 0);
}

#[tokio::test]
async fn first_commit_for_a_name_wins() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = ProjectRepository::new(tmp.path());
    let factory = CountingFactory::new(vec![
        project("foo", "1.0", 0),
        project("foo", "2.0", 0),
    ]);

    let result = repo.get(&ProjectName::from("foo"), factory).await.unwrap();
    assert_eq!(result.metadata.version, "1.0");
    let cached = repo.cached(&ProjectName::from("foo")).await.unwrap();
    assert_eq!(cached.metadata.version, "1.0");
}

#[tokio::test]
async fn factory_may_yield_extra_projects() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = ProjectRepository::new(tmp.path());
    let factory = CountingFactory::new(vec![
        project("side-effect", "0.1", 0),
        project("foo", "1.0", 0),
    ]);

    let result = repo.get(&ProjectName::from("foo"), factory.clone()).await.unwrap();
    assert_eq!(result.name, ProjectName::from("foo"));

    // The extra yield is cached too, without another factory run.
    let side = repo
        .get(&ProjectName::from("side-effect"), factory.clone())
        .await
        .unwrap();
    assert_eq!(side.metadata.version, "0.1");
    assert_eq!(factory.calls(), 1);
}

#[tokio::test]
async fn factory_without_the_requested_name_is_a_contract_violation() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = ProjectRepository::new(tmp.path());
    let factory = CountingFactory::new(vec![project("unrelated", "1.0", 0)]);

    let err = repo
        .get(&ProjectName::from("foo"), factory)
        .await
        .unwrap_err();
    assert!(matches!(err, RepoError::FactoryContract(_)), "{err}");
}

#[tokio::test]
async fn failures_propagate_and_do_not_poison_the_slot() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = ProjectRepository::new(tmp.path());
    let name = ProjectName::from("foo");

    let err = repo.get(&name, Arc::new(FailingFactory)).await.unwrap_err();
    match &err {
        RepoError::Factory { cause, .. } => assert!(cause.contains("registry is on fire")),
        other => panic!("unexpected error: {other}"),
    }

    // A later get retries with a fresh factory run.
    let factory = CountingFactory::new(vec![project("foo", "1.0", 0)]);
    let recovered = repo.get(&name, factory.clone()).await.unwrap();
    assert_eq!(recovered.metadata.version, "1.0");
    assert_eq!(factory.calls(), 1);
}

#[tokio::test]
async fn update_index_merges_over_the_published_manifest() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = ProjectRepository::new(tmp.path());

    let factory = CountingFactory::new(vec![project("foo", "1.0", 100)]);
    repo.get(&ProjectName::from("foo"), factory).await.unwrap();
    let first = repo.write_index(1).await.unwrap();
    assert_eq!(first.generated_at, 1);
    assert_eq!(first.all_project_names.len(), 1);

    let factory = CountingFactory::new(vec![project("other", "1.0", 200)]);
    repo.get(&ProjectName::from("other"), factory).await.unwrap();
    let updated = repo.update_index().await.unwrap();

    assert!(updated.generated_at > first.generated_at);
    assert_eq!(
        updated.latest_projects[0].name,
        ProjectName::from("other"),
        "newest upload sorts first"
    );
    let names: Vec<&str> = updated
        .all_project_names
        .iter()
        .map(|n| n.as_str())
        .collect();
    assert_eq!(names, vec!["foo", "other"]);

    let reread = repo.read_index().await.unwrap().unwrap();
    assert_eq!(reread, updated);
}
