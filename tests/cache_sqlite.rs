use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use valuate::cache::{
    CachedCompletion, CachedGateway, CompletionCache, CompletionCacheKey, SqliteCompletionCache,
};
use valuate::gateway::{
    Attribution, ChatGateway, ChatRequest, ChatResponse, Message, ProviderError,
};

fn request(content: &str) -> ChatRequest {
    ChatRequest::new("gpt-4", vec![Message::user(content)], Attribution::new("peers::tickers"))
}

fn entry(content: &str) -> CachedCompletion {
    CachedCompletion {
        content: content.to_string(),
        input_tokens: 12,
        output_tokens: 3,
        cost_nanodollars: 540_000,
    }
}

struct Counting {
    calls: AtomicUsize,
}

#[async_trait]
impl ChatGateway for Counting {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let mut resp = ChatResponse::text(format!("reply {n} to {}", req.messages[0].content));
        resp.input_tokens = 7;
        resp.cost_nanodollars = 1_000;
        Ok(resp)
    }
}

#[tokio::test]
async fn put_then_get_and_export_hit_counts() {
    let dir = tempfile::tempdir().unwrap();
    let cache = SqliteCompletionCache::new(dir.path().join("nested/cache.sqlite")).unwrap();
    let key = CompletionCacheKey::for_request(&request("ACME"));

    assert!(cache.get(&key).await.unwrap().is_none());
    cache.put(&key, &entry("MSFT AAPL ACME")).await.unwrap();
    assert_eq!(cache.get(&key).await.unwrap(), Some(entry("MSFT AAPL ACME")));

    cache.put(&key, &entry("MSFT ACME")).await.unwrap();
    assert_eq!(
        cache.get(&key).await.unwrap().map(|e| e.content),
        Some("MSFT ACME".to_string())
    );

    let out = dir.path().join("export.jsonl");
    assert_eq!(cache.export_jsonl(&out).await.unwrap(), 1);
    let row: serde_json::Value =
        serde_json::from_str(std::fs::read_to_string(&out).unwrap().trim()).unwrap();
    assert_eq!(row["caller"], "peers::tickers");
    assert_eq!(row["model"], "gpt-4");
    assert_eq!(row["hit_count"], 2);
}

#[tokio::test]
async fn prune_keeps_most_recent_rows() {
    let dir = tempfile::tempdir().unwrap();
    let cache = SqliteCompletionCache::new(dir.path().join("cache.sqlite")).unwrap();
    for company in ["A", "B", "C", "D"] {
        let key = CompletionCacheKey::for_request(&request(company));
        cache.put(&key, &entry(company)).await.unwrap();
    }

    let _lock = cache.lock_exclusive().unwrap();
    let stats = cache.prune(Some(30), None).await.unwrap();
    assert_eq!((stats.deleted, stats.remaining), (0, 4));

    let stats = cache.prune(None, Some(3)).await.unwrap();
    assert_eq!((stats.deleted, stats.remaining), (1, 3));

    let stats = cache.prune(None, Some(0)).await.unwrap();
    assert_eq!((stats.deleted, stats.remaining), (3, 0));
}

#[tokio::test]
async fn cached_gateway_calls_inner_once_per_request() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(SqliteCompletionCache::new(dir.path().join("cache.sqlite")).unwrap());
    let inner = Arc::new(Counting {
        calls: AtomicUsize::new(0),
    });
    let gateway = CachedGateway::new(inner.clone(), cache);

    let first = gateway.chat(request("ACME")).await.unwrap();
    let second = gateway.chat(request("ACME")).await.unwrap();
    assert_eq!(first.content, "reply 0 to ACME");
    assert_eq!(second.content, first.content);
    assert_eq!(second.input_tokens, 7);
    assert_eq!(second.cost_nanodollars, 0);
    assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

    let other = gateway.chat(request("INIT")).await.unwrap();
    assert_eq!(other.content, "reply 1 to INIT");
    assert_eq!(inner.calls.load(Ordering::SeqCst), 2);

    let hotter = request("ACME").temperature(0.7);
    gateway.chat(hotter).await.unwrap();
    assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
}
