//! Registry (PyPI) metadata endpoint: fetching with bounded retries,
//! artifact selection, and dependency-spec parsing.

use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::crawler::CrawlError;
use crate::crawler::archive;
use crate::types::{ProjectMetadata, ProjectName};

/// A single downloadable release file for a package version.
#[derive(Debug, Clone, Deserialize)]
pub struct Artifact {
    pub filename: String,
    pub url: String,
    #[serde(default)]
    pub yanked: bool,
    pub packagetype: String,
    #[serde(default)]
    pub upload_time: String,
}

impl Artifact {
    pub fn is_sdist(&self) -> bool {
        self.packagetype == "sdist"
    }

    /// A built artifact with no platform/ABI dependency.
    pub fn is_pure_wheel(&self) -> bool {
        self.packagetype == "bdist_wheel" && self.filename.ends_with("-none-any.whl")
    }
}

/// Raw long-form description and its declared content type.
#[derive(Debug, Clone, Default)]
pub struct ProjectDescription {
    pub text: String,
    pub content_type: Option<String>,
}

/// Everything the pipeline needs from one registry round trip.
#[derive(Debug, Clone)]
pub struct RegistryRelease {
    pub metadata: ProjectMetadata,
    pub description: ProjectDescription,
    pub artifact: Option<Artifact>,
}

#[derive(Debug, Deserialize)]
struct RegistryDocument {
    info: RegistryInfo,
    #[serde(default)]
    releases: HashMap<String, Vec<Artifact>>,
}

#[derive(Debug, Deserialize)]
struct RegistryInfo {
    name: Option<String>,
    version: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    home_page: Option<String>,
    #[serde(default)]
    license: Option<String>,
    #[serde(default)]
    project_urls: Option<HashMap<String, String>>,
    #[serde(default)]
    classifiers: Option<Vec<String>>,
    #[serde(default)]
    requires_dist: Option<Vec<String>>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    description_content_type: Option<String>,
}

/// Registry access shared by one crawl: one HTTP client and one bounded
/// concurrency gate for every outbound fetch.
pub struct RegistryClient {
    http: reqwest::Client,
    base_url: String,
    gate: Arc<Semaphore>,
    retries: u32,
}

impl RegistryClient {
    pub fn new(base_url: impl Into<String>, network_concurrency: usize, retries: u32) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            gate: Arc::new(Semaphore::new(network_concurrency.max(1))),
            retries: retries.max(1),
        }
    }

    /// `GET {base}/pypi/{name}/json`, retrying transient network errors.
    /// Non-2xx responses fail immediately without retry.
    pub async fn fetch(&self, name: &ProjectName) -> Result<RegistryRelease, CrawlError> {
        let url = format!("{}/pypi/{name}/json", self.base_url);
        let doc = self.fetch_document(name, &url).await?;
        let info = doc.info;

        let artifact = doc
            .releases
            .get(&info.version)
            .and_then(|artifacts| pick_artifact(artifacts))
            .cloned();
        let upload_time = artifact
            .as_ref()
            .map(|a| parse_upload_time(&a.upload_time))
            .unwrap_or(0);

        let project_urls = info.project_urls.unwrap_or_default();
        let metadata = ProjectMetadata {
            name: info
                .name
                .map(ProjectName::new)
                .unwrap_or_else(|| name.clone()),
            version: info.version,
            classifiers: info.classifiers,
            home_page: info.home_page,
            license: info.license,
            documentation_url: project_urls.get("Documentation").cloned(),
            dependencies: parse_deps(info.requires_dist.as_deref()),
            summary: info.summary,
            upload_time,
        };
        Ok(RegistryRelease {
            metadata,
            description: ProjectDescription {
                text: info.description.unwrap_or_default(),
                content_type: info.description_content_type,
            },
            artifact,
        })
    }

    async fn fetch_document(
        &self,
        name: &ProjectName,
        url: &str,
    ) -> Result<RegistryDocument, CrawlError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = {
                let _permit = self.gate.acquire().await.expect("network gate open");
                self.try_fetch(url).await
            };
            match result {
                Ok(doc) => return Ok(doc),
                Err(e) if e.status().is_some() => {
                    let status = e.status().map(|s| s.as_u16()).unwrap_or_default();
                    return Err(CrawlError::Registry {
                        name: name.clone(),
                        status,
                    });
                }
                Err(e) if e.is_decode() => {
                    return Err(CrawlError::Metadata {
                        name: name.clone(),
                        cause: e.to_string(),
                    });
                }
                Err(e) if attempt < self.retries => {
                    warn!("Transient registry error for {name} (attempt {attempt}): {e}");
                }
                Err(e) => {
                    return Err(CrawlError::Network {
                        name: name.clone(),
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }

    async fn try_fetch(&self, url: &str) -> Result<RegistryDocument, reqwest::Error> {
        let response = self.http.get(url).send().await?.error_for_status()?;
        response.json().await
    }

    /// Download the artifact into `scratch` and extract its Python sources.
    /// Returns the directory holding the extracted module tree.
    pub async fn download(
        &self,
        name: &ProjectName,
        scratch: &Path,
        artifact: &Artifact,
    ) -> Result<PathBuf, CrawlError> {
        debug!("Fetching {name} sources from {}", artifact.url);
        let archive_path = scratch.join(&artifact.filename);
        {
            let _permit = self.gate.acquire().await.expect("network gate open");
            let mut response = self
                .http
                .get(&artifact.url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| CrawlError::Download {
                    url: artifact.url.clone(),
                    cause: e.to_string(),
                })?;
            let mut file = tokio::fs::File::create(&archive_path).await?;
            while let Some(chunk) = response.chunk().await.map_err(|e| CrawlError::Download {
                url: artifact.url.clone(),
                cause: e.to_string(),
            })? {
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
        }

        let out_dir = scratch.join("source");
        let extracted = archive::extract(&archive_path, &out_dir).await?;
        let _ = tokio::fs::remove_file(&archive_path).await;

        Ok(if artifact.is_sdist() {
            archive::pick_project_dir(&extracted)
        } else {
            extracted
        })
    }
}

/// Skip yanked releases; prefer a pure wheel, fall back to an sdist.
pub fn pick_artifact(artifacts: &[Artifact]) -> Option<&Artifact> {
    let mut sdist = None;
    for artifact in artifacts {
        if artifact.yanked {
            continue;
        }
        if artifact.is_sdist() {
            sdist = Some(artifact);
        }
        if artifact.is_pure_wheel() {
            return Some(artifact);
        }
    }
    sdist
}

fn requirement_name() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*([A-Za-z0-9](?:[A-Za-z0-9._-]*[A-Za-z0-9])?)\s*(.*)$")
            .expect("requirement pattern is valid")
    })
}

/// Bare package names from `requires_dist` entries. Entries that request an
/// extra or carry an environment marker are dropped.
pub fn parse_deps(maybe_deps: Option<&[String]>) -> Vec<String> {
    let Some(deps) = maybe_deps else {
        return Vec::new();
    };
    let mut names = Vec::new();
    for dep in deps {
        if dep.contains(';') {
            continue;
        }
        let Some(captures) = requirement_name().captures(dep) else {
            continue;
        };
        let rest = captures.get(2).map_or("", |m| m.as_str());
        if rest.starts_with('[') {
            continue;
        }
        names.push(captures[1].to_string());
    }
    names
}

/// Registry upload timestamps (`2022-01-01T12:00:00`) as Unix seconds;
/// malformed input maps to 0.
pub fn parse_upload_time(time: &str) -> i64 {
    chrono::NaiveDateTime::parse_from_str(time, "%Y-%m-%dT%H:%M:%S")
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(packagetype: &str, filename: &str, yanked: bool) -> Artifact {
        Artifact {
            filename: filename.to_string(),
            url: format!("https://files.example/{filename}"),
            yanked,
            packagetype: packagetype.to_string(),
            upload_time: String::new(),
        }
    }

    #[test]
    fn prefers_pure_wheel_over_sdist() {
        let artifacts = vec![
            artifact("sdist", "foo-1.0.tar.gz", false),
            artifact("bdist_wheel", "foo-1.0-py3-none-any.whl", false),
        ];
        assert_eq!(
            pick_artifact(&artifacts).unwrap().filename,
            "foo-1.0-py3-none-any.whl"
        );
    }

    #[test]
    fn falls_back_to_sdist_when_wheel_is_yanked() {
        let artifacts = vec![
            artifact("bdist_wheel", "foo-1.0-py3-none-any.whl", true),
            artifact("sdist", "foo-1.0.tar.gz", false),
            artifact("ivenoidea", "foo-1.0.exe", false),
        ];
        assert_eq!(pick_artifact(&artifacts).unwrap().filename, "foo-1.0.tar.gz");
    }

    #[test]
    fn no_artifact_when_everything_is_yanked_or_unknown() {
        let artifacts = vec![
            artifact("bdist_wheel", "foo-1.0-py3-none-any.whl", true),
            artifact("sdist", "foo-1.0.tar.gz", true),
            artifact("ivenoidea", "foo-1.0.exe", false),
        ];
        assert!(pick_artifact(&artifacts).is_none());
    }

    #[test]
    fn platform_wheel_is_not_pure() {
        let artifacts = vec![artifact(
            "bdist_wheel",
            "foo-1.0-cp311-cp311-manylinux_x86_64.whl",
            false,
        )];
        assert!(pick_artifact(&artifacts).is_none());
    }

    #[test]
    fn deps_drop_extras_and_markers() {
        let deps = vec![
            "click (>=8.0.0)".to_string(),
            "aiohttp (>=3.7.4) ; extra == 'd'".to_string(),
            "requests[security] (>=2.0)".to_string(),
            "tomli (>=1.1.0) ; python_version < \"3.11\"".to_string(),
            "zope.interface".to_string(),
        ];
        assert_eq!(parse_deps(Some(&deps)), vec!["click", "zope.interface"]);
        assert!(parse_deps(None).is_empty());
    }

    #[test]
    fn upload_time_parsing() {
        assert_eq!(parse_upload_time("1970-01-01T00:01:40"), 100);
        assert_eq!(parse_upload_time("not a date"), 0);
        assert_eq!(parse_upload_time(""), 0);
    }
}
