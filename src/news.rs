//! News articles and the per-run news cache file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum NewsError {
    #[error("no news articles with content for '{0}'")]
    Empty(String),
    #[error("invalid news keyword '{0}'")]
    InvalidKeyword(String),
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed article file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// One article as delivered by a news source. Only `content` feeds analysis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Article {
    pub title: Option<String>,
    pub url: Option<String>,
    pub source: Option<String>,
    pub published: Option<String>,
    pub content: Option<String>,
}

impl Article {
    pub fn with_content(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            content: Some(content.into()),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait NewsCorpusProvider: Send + Sync {
    async fn fetch_articles(&self, keyword: &str) -> Result<Vec<Article>, NewsError>;
}

/// Reads `<dir>/<keyword>.json`, a JSON array of articles. A missing file is
/// an empty corpus, not an error.
#[derive(Debug, Clone)]
pub struct JsonFileNewsProvider {
    dir: PathBuf,
}

impl JsonFileNewsProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl NewsCorpusProvider for JsonFileNewsProvider {
    async fn fetch_articles(&self, keyword: &str) -> Result<Vec<Article>, NewsError> {
        let path = self.dir.join(format!("{}.json", file_stem(keyword)?));
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw).map_err(|source| NewsError::Parse { path, source }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(source) => Err(NewsError::Io { path, source }),
        }
    }
}

/// Keyword reduced to a safe file-name stem.
pub fn file_stem(keyword: &str) -> Result<String, NewsError> {
    let stem: String = keyword
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    if stem.trim_matches('_').is_empty() {
        return Err(NewsError::InvalidKeyword(keyword.to_string()));
    }
    Ok(stem)
}

/// Used when no article source is configured; every keyword has no news.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoNewsProvider;

#[async_trait]
impl NewsCorpusProvider for NoNewsProvider {
    async fn fetch_articles(&self, _keyword: &str) -> Result<Vec<Article>, NewsError> {
        Ok(Vec::new())
    }
}

/// `<cache_dir>/<keyword>_news.json`
pub fn cache_path(cache_dir: &Path, keyword: &str) -> Result<PathBuf, NewsError> {
    Ok(cache_dir.join(format!("{}_news.json", file_stem(keyword)?)))
}

pub async fn write_cache(path: &Path, articles: &[Article]) -> Result<(), NewsError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| NewsError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
    }
    let body = serde_json::to_string_pretty(articles).map_err(|source| NewsError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    tokio::fs::write(path, body)
        .await
        .map_err(|source| NewsError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Article contents from a cache file, in file order. Null and blank contents
/// are skipped.
pub async fn read_contents(path: &Path) -> Result<Vec<String>, NewsError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| NewsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    let articles: Vec<Article> = serde_json::from_str(&raw).map_err(|source| NewsError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let contents: Vec<String> = articles
        .into_iter()
        .filter_map(|a| a.content)
        .filter(|c| !c.trim().is_empty())
        .collect();
    debug!(path = %path.display(), articles = contents.len(), "read news cache");
    Ok(contents)
}
