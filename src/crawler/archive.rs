//! Archive extraction. Only `.py` members are unpacked; everything else in
//! the artifact (data files, native extensions, metadata) is ignored.

use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use crate::crawler::CrawlError;

/// Unpack the Python sources of `archive_path` into `dest`. The format is
/// picked from the filename suffix. Returns `dest`.
pub async fn extract(archive_path: &Path, dest: &Path) -> Result<PathBuf, CrawlError> {
    let archive_path = archive_path.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || {
        fs::create_dir_all(&dest)?;
        extract_sync(&archive_path, &dest)?;
        Ok(dest)
    })
    .await
    .map_err(|e| CrawlError::Extract {
        cause: format!("extraction task failed: {e}"),
    })?
}

fn extract_sync(archive_path: &Path, dest: &Path) -> Result<(), CrawlError> {
    let filename = archive_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if filename.ends_with(".zip") || filename.ends_with(".whl") {
        extract_zip(archive_path, dest)
    } else if filename.ends_with(".tar.gz") || filename.ends_with(".tgz") {
        extract_tar(GzDecoder::new(File::open(archive_path)?), dest)
    } else if filename.ends_with(".tar") {
        extract_tar(File::open(archive_path)?, dest)
    } else {
        Err(CrawlError::UnsupportedArchive { filename })
    }
}

fn extract_zip(archive_path: &Path, dest: &Path) -> Result<(), CrawlError> {
    let mut archive = zip::ZipArchive::new(File::open(archive_path)?)
        .map_err(|e| CrawlError::Extract { cause: e.to_string() })?;
    for i in 0..archive.len() {
        let mut member = archive
            .by_index(i)
            .map_err(|e| CrawlError::Extract { cause: e.to_string() })?;
        if !member.name().ends_with(".py") {
            continue;
        }
        // enclosed_name rejects paths that escape the extraction root.
        let Some(relative) = member.enclosed_name() else {
            continue;
        };
        let target = dest.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        io::copy(&mut member, &mut File::create(&target)?)?;
    }
    Ok(())
}

fn extract_tar<R: io::Read>(reader: R, dest: &Path) -> Result<(), CrawlError> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let is_python = entry
            .path()?
            .extension()
            .is_some_and(|ext| ext == "py");
        if !is_python {
            continue;
        }
        // unpack_in refuses members with paths outside dest.
        entry.unpack_in(dest)?;
    }
    Ok(())
}

/// Sdists wrap everything in a `{name}-{version}/` directory, and modern
/// layouts nest the importable packages one level deeper under `src/`.
/// Pick the directory the module tree actually starts at.
pub fn pick_project_dir(dir: &Path) -> PathBuf {
    let first_subdir = fs::read_dir(dir)
        .ok()
        .into_iter()
        .flatten()
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .find(|path| path.is_dir());
    let root = first_subdir.unwrap_or_else(|| dir.to_path_buf());
    let src = root.join("src");
    if src.is_dir() { src } else { root }
}
