//! Template sources: where Nexon documents are fetched from.

use async_trait::async_trait;
use std::path::PathBuf;

use crate::templates::{FetchOptions, SourceKind, TemplateDocument, TemplateError};

/// A document returned by a source, with where it came from.
#[derive(Debug, Clone)]
pub struct FetchedTemplate {
    pub document: TemplateDocument,
    pub locator: String,
}

#[async_trait]
pub trait TemplateSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// `Ok(None)` means this source does not have the template.
    async fn fetch(
        &self,
        id: &str,
        version: Option<&str>,
        options: &FetchOptions,
    ) -> Result<Option<FetchedTemplate>, TemplateError>;
}

/// Ids and versions become path segments and URL segments.
fn is_safe_segment(s: &str) -> bool {
    !s.is_empty()
        && s != "."
        && s != ".."
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+'))
}

/// Local directory source: `<root>/<id>/<version>.json`.
pub struct LocalSource {
    root: PathBuf,
}

impl LocalSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn latest_version(&self, id: &str) -> Result<Option<semver::Version>, TemplateError> {
        let dir = self.root.join(id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut best: Option<semver::Version> = None;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(false, |e| e == "json") {
                let parsed = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| semver::Version::parse(s).ok());
                if let Some(v) = parsed {
                    if best.as_ref().map_or(true, |b| v > *b) {
                        best = Some(v);
                    }
                }
            }
        }
        Ok(best)
    }
}

#[async_trait]
impl TemplateSource for LocalSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Local
    }

    async fn fetch(
        &self,
        id: &str,
        version: Option<&str>,
        _options: &FetchOptions,
    ) -> Result<Option<FetchedTemplate>, TemplateError> {
        if !is_safe_segment(id) || version.map_or(false, |v| !is_safe_segment(v)) {
            return Ok(None);
        }

        let version = match version {
            Some(v) => v.to_string(),
            None => match self.latest_version(id).await? {
                Some(v) => v.to_string(),
                None => return Ok(None),
            },
        };

        let path = self.root.join(id).join(format!("{}.json", version));
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let locator = path.display().to_string();
        let document = serde_json::from_str::<TemplateDocument>(&content).map_err(|e| {
            TemplateError::Parse {
                locator: locator.clone(),
                message: e.to_string(),
            }
        })?;

        Ok(Some(FetchedTemplate { document, locator }))
    }
}

/// Remote registry source: `GET <base>/nexons/<id>/<version|latest>`.
pub struct RemoteSource {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl RemoteSource {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TemplateSource for RemoteSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Remote
    }

    async fn fetch(
        &self,
        id: &str,
        version: Option<&str>,
        options: &FetchOptions,
    ) -> Result<Option<FetchedTemplate>, TemplateError> {
        if !is_safe_segment(id) || version.map_or(false, |v| !is_safe_segment(v)) {
            return Ok(None);
        }

        let url = format!("{}/nexons/{}/{}", self.base_url, id, version.unwrap_or("latest"));
        let mut request = self.client.get(&url);
        if let Some(t) = options.timeout {
            request = request.timeout(t);
        }
        if let Some(token) = options.auth_token.as_ref().or(self.token.as_ref()) {
            request = request.bearer_auth(token);
        }

        let fetch_err = |message: String| TemplateError::Fetch {
            source_kind: SourceKind::Remote,
            message,
        };

        let response = request.send().await.map_err(|e| fetch_err(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(fetch_err(format!("{} returned {}", url, response.status())));
        }

        let document = response
            .json::<TemplateDocument>()
            .await
            .map_err(|e| TemplateError::Parse {
                locator: url.clone(),
                message: e.to_string(),
            })?;

        Ok(Some(FetchedTemplate {
            document,
            locator: url,
        }))
    }
}
