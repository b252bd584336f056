//! SQLite-backed cache for chat completions.
//!
//! [`CachedGateway`] wraps any [`ChatGateway`] and serves repeated requests
//! (same model, sampling parameters and messages) from the cache. Cache
//! failures are logged and never fail the call.

use async_trait::async_trait;
use fs2::FileExt;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::gateway::{ChatGateway, ChatRequest, ChatResponse, FinishReason, ProviderError};

pub const CACHE_PATH_ENV: &str = "VALUATE_CACHE_PATH";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionCacheKey {
    pub model: String,
    pub caller: String,
    pub key_hash: String,
}

impl CompletionCacheKey {
    pub fn for_request(req: &ChatRequest) -> Self {
        let temperature = format!("{:.3}", req.temperature);
        let max_tokens = req.max_tokens.map(|m| m.to_string()).unwrap_or_default();
        let mut fields: Vec<&str> = vec![&req.model, &temperature, &max_tokens];
        for m in &req.messages {
            fields.push(m.role.as_str());
            fields.push(&m.content);
        }
        Self {
            model: req.model.clone(),
            caller: req.attribution.caller.to_string(),
            key_hash: hash_fields(&fields),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedCompletion {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
}

impl CachedCompletion {
    fn into_response(self) -> ChatResponse {
        ChatResponse {
            content: self.content,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            // Served locally; nothing was spent.
            cost_nanodollars: 0,
            latency: Duration::ZERO,
            finish_reason: FinishReason::Stop,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("serialization error: {0}")]
    Serde(String),
}

#[async_trait]
pub trait CompletionCache: Send + Sync {
    async fn get(&self, key: &CompletionCacheKey) -> Result<Option<CachedCompletion>, CacheError>;
    async fn put(&self, key: &CompletionCacheKey, value: &CachedCompletion) -> Result<(), CacheError>;
}

#[derive(Clone)]
pub struct SqliteCompletionCache {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCompletionCache {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             CREATE TABLE IF NOT EXISTS completion_cache (\
               key_hash TEXT PRIMARY KEY,\
               model TEXT NOT NULL,\
               caller TEXT NOT NULL,\
               content TEXT NOT NULL,\
               input_tokens INTEGER NOT NULL,\
               output_tokens INTEGER NOT NULL,\
               cost_nanodollars INTEGER NOT NULL,\
               created_at INTEGER NOT NULL,\
               updated_at INTEGER NOT NULL,\
               hit_count INTEGER NOT NULL DEFAULT 0\
             );",
        )?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var(CACHE_PATH_ENV) {
            return PathBuf::from(path);
        }
        PathBuf::from(".valuate/completions.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_exclusive(&self) -> Result<CacheLock, CacheError> {
        CacheLock::new(&self.path)
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Connection) -> Result<R, CacheError>,
    {
        let guard = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
        f(&guard)
    }
}

#[async_trait]
impl CompletionCache for SqliteCompletionCache {
    async fn get(&self, key: &CompletionCacheKey) -> Result<Option<CachedCompletion>, CacheError> {
        let key_hash = key.key_hash.clone();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT content, input_tokens, output_tokens, cost_nanodollars \
                     FROM completion_cache WHERE key_hash = ?1",
                )?;
                let mut rows = stmt.query(params![key_hash])?;
                if let Some(row) = rows.next()? {
                    let entry = CachedCompletion {
                        content: row.get(0)?,
                        input_tokens: row.get::<_, i64>(1)? as u32,
                        output_tokens: row.get::<_, i64>(2)? as u32,
                        cost_nanodollars: row.get(3)?,
                    };
                    conn.execute(
                        "UPDATE completion_cache \
                         SET hit_count = hit_count + 1, updated_at = ?1 \
                         WHERE key_hash = ?2",
                        params![now_epoch(), key_hash],
                    )?;
                    Ok(Some(entry))
                } else {
                    Ok(None)
                }
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }

    async fn put(&self, key: &CompletionCacheKey, value: &CachedCompletion) -> Result<(), CacheError> {
        let key = key.clone();
        let value = value.clone();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let now = now_epoch();
                conn.execute(
                    "INSERT INTO completion_cache (\
                        key_hash, model, caller, content,\
                        input_tokens, output_tokens, cost_nanodollars,\
                        created_at, updated_at\
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)\
                     ON CONFLICT(key_hash) DO UPDATE SET \
                        content = excluded.content,\
                        input_tokens = excluded.input_tokens,\
                        output_tokens = excluded.output_tokens,\
                        cost_nanodollars = excluded.cost_nanodollars,\
                        updated_at = excluded.updated_at",
                    params![
                        key.key_hash,
                        key.model,
                        key.caller,
                        value.content,
                        value.input_tokens as i64,
                        value.output_tokens as i64,
                        value.cost_nanodollars,
                        now,
                        now,
                    ],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

/// Advisory file lock held while maintenance commands rewrite the cache.
#[derive(Debug)]
pub struct CacheLock {
    _file: std::fs::File,
}

impl CacheLock {
    fn new(db_path: &Path) -> Result<Self, CacheError> {
        let mut lock_path = db_path.to_path_buf();
        lock_path.set_extension("lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

#[derive(Debug, Serialize)]
pub struct CacheExportRow {
    pub key_hash: String,
    pub model: String,
    pub caller: String,
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub hit_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CachePruneStats {
    pub deleted: usize,
    pub remaining: usize,
}

impl SqliteCompletionCache {
    /// Write every entry as one JSON line, most recently used first. Returns
    /// the number of rows written.
    pub async fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<usize, CacheError> {
        let path = path.as_ref().to_path_buf();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT key_hash, model, caller, content, input_tokens, output_tokens,\
                            cost_nanodollars, created_at, updated_at, hit_count \
                     FROM completion_cache ORDER BY updated_at DESC, key_hash",
                )?;
                let mut rows = stmt.query([])?;
                let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
                let mut written = 0;
                while let Some(row) = rows.next()? {
                    let record = CacheExportRow {
                        key_hash: row.get(0)?,
                        model: row.get(1)?,
                        caller: row.get(2)?,
                        content: row.get(3)?,
                        input_tokens: row.get::<_, i64>(4)? as u32,
                        output_tokens: row.get::<_, i64>(5)? as u32,
                        cost_nanodollars: row.get(6)?,
                        created_at: row.get(7)?,
                        updated_at: row.get(8)?,
                        hit_count: row.get(9)?,
                    };
                    let line = serde_json::to_string(&record)
                        .map_err(|e| CacheError::Serde(e.to_string()))?;
                    writeln!(file, "{line}")?;
                    written += 1;
                }
                file.flush()?;
                Ok(written)
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }

    /// Delete entries older than `max_age_days`, then keep only the
    /// `max_rows` most recently used.
    pub async fn prune(
        &self,
        max_age_days: Option<u64>,
        max_rows: Option<usize>,
    ) -> Result<CachePruneStats, CacheError> {
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut deleted: usize = 0;
                if let Some(days) = max_age_days {
                    let cutoff = now_epoch().saturating_sub((days as i64).saturating_mul(86_400));
                    deleted += conn.execute(
                        "DELETE FROM completion_cache WHERE updated_at < ?1",
                        params![cutoff],
                    )?;
                }

                if let Some(max_rows) = max_rows {
                    deleted += conn.execute(
                        "DELETE FROM completion_cache WHERE key_hash IN (\
                            SELECT key_hash FROM completion_cache \
                            ORDER BY updated_at DESC, key_hash LIMIT -1 OFFSET ?1\
                         )",
                        params![max_rows as i64],
                    )?;
                }

                let remaining: i64 =
                    conn.query_row("SELECT COUNT(*) FROM completion_cache", [], |row| row.get(0))?;
                Ok(CachePruneStats {
                    deleted,
                    remaining: remaining.max(0) as usize,
                })
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

/// A gateway that consults a [`CompletionCache`] before calling `inner`.
pub struct CachedGateway<G: ChatGateway> {
    inner: G,
    cache: Arc<dyn CompletionCache>,
}

impl<G: ChatGateway> CachedGateway<G> {
    pub fn new(inner: G, cache: Arc<dyn CompletionCache>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl<G: ChatGateway> ChatGateway for CachedGateway<G> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let key = CompletionCacheKey::for_request(&req);
        match self.cache.get(&key).await {
            Ok(Some(hit)) => {
                debug!(caller = %key.caller, key = %key.key_hash, "completion cache hit");
                return Ok(hit.into_response());
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "completion cache read failed"),
        }

        let resp = self.inner.chat(req).await?;
        let entry = CachedCompletion {
            content: resp.content.clone(),
            input_tokens: resp.input_tokens,
            output_tokens: resp.output_tokens,
            cost_nanodollars: resp.cost_nanodollars,
        };
        if let Err(e) = self.cache.put(&key, &entry).await {
            warn!(error = %e, "completion cache write failed");
        }
        Ok(resp)
    }
}

/// Length-prefixed so that field boundaries cannot be forged by content.
fn hash_fields(fields: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for field in fields {
        hasher.update(&(field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Attribution, Message};

    fn request(content: &str, temperature: f32) -> ChatRequest {
        ChatRequest::new("gpt-4", vec![Message::user(content)], Attribution::new("test"))
            .temperature(temperature)
    }

    #[test]
    fn key_depends_on_messages_and_sampling() {
        let a = CompletionCacheKey::for_request(&request("hello", 0.0));
        let b = CompletionCacheKey::for_request(&request("hello", 0.0));
        let c = CompletionCacheKey::for_request(&request("hello!", 0.0));
        let d = CompletionCacheKey::for_request(&request("hello", 0.7));
        assert_eq!(a, b);
        assert_ne!(a.key_hash, c.key_hash);
        assert_ne!(a.key_hash, d.key_hash);
    }

    #[test]
    fn field_boundaries_matter() {
        assert_ne!(hash_fields(&["ab", "c"]), hash_fields(&["a", "bc"]));
    }
}
