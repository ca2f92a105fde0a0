//! Static indexing of Python sources into typed [`Module`]s.

pub mod annotation;
pub mod docs;
pub mod source;

pub use annotation::{Bindings, resolve, resolve_source};
pub use source::{index_file, index_source};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::error;
use walkdir::WalkDir;

use crate::types::{Module, SymbolTable};

/// All `.py` files under `dir`, in walk order.
pub fn python_files(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "py"))
        .collect()
}

/// Index every `.py` file under `dir` concurrently.
///
/// Parsing is synchronous CPU work, so each file runs on the blocking pool,
/// bounded by `parse_gate`. Individual failures are already captured inside
/// the resulting modules; the output is sorted by module name.
pub async fn index_dir(
    dir: &Path,
    symbols: Arc<SymbolTable>,
    parse_gate: Arc<Semaphore>,
) -> Vec<Module> {
    let mut tasks = JoinSet::new();
    for path in python_files(dir) {
        let base = dir.to_path_buf();
        let symbols = Arc::clone(&symbols);
        let gate = Arc::clone(&parse_gate);
        tasks.spawn(async move {
            // Closed only if the semaphore is dropped, which we never do.
            let _permit = gate.acquire_owned().await.expect("parse gate open");
            tokio::task::spawn_blocking(move || index_file(&base, &path, &symbols)).await
        });
    }

    let mut modules = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(module)) => modules.push(module),
            Ok(Err(e)) => error!("Indexing task panicked: {e}"),
            Err(e) => error!("Indexing task failed to join: {e}"),
        }
    }
    modules.sort_by(|a, b| a.name.cmp(&b.name));
    modules
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FQName;
    use std::fs;

    #[tokio::test]
    async fn index_dir_finds_nested_modules() {
        let tmp = tempfile::tempdir().unwrap();
        let pkg = tmp.path().join("alpha");
        fs::create_dir_all(&pkg).unwrap();
        fs::write(pkg.join("__init__.py"), "\"\"\"Alpha.\"\"\"\n").unwrap();
        fs::write(pkg.join("core.py"), "def run():\n    pass\n").unwrap();
        fs::write(tmp.path().join("notes.txt"), "not python").unwrap();

        let modules = index_dir(
            tmp.path(),
            Arc::new(SymbolTable::new()),
            Arc::new(Semaphore::new(2)),
        )
        .await;

        let names: Vec<&FQName> = modules.iter().map(|m| &m.name).collect();
        assert_eq!(names, vec![&FQName::from("alpha"), &FQName::from("alpha.core")]);
        assert_eq!(modules[0].documentation, vec!["Alpha."]);
        assert_eq!(modules[1].functions[0].name, FQName::from("alpha.core.run"));
    }
}
