//! Timer-driven refresh of a cache entry.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::key::CacheKey;
use super::store::QueryCache;

/// Keeps a poll loop alive. Dropping it stops the loop.
#[must_use = "dropping the handle stops polling"]
pub struct PollHandle {
    key: CacheKey,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PollHandle {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stops the loop and waits for it to wind down.
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl fmt::Debug for PollHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollHandle")
            .field("key", &self.key.to_string())
            .field("running", &self.is_running())
            .finish()
    }
}

impl QueryCache {
    /// Refreshes `key` immediately and then every `interval` until the
    /// returned handle is dropped. Failures are logged and the previous value
    /// is kept.
    pub fn poll<F, Fut, E>(&self, key: CacheKey, interval: Duration, fetcher: F) -> PollHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let token = CancellationToken::new();
        let cache = self.clone();
        let loop_key = key.clone();
        let loop_token = token.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::debug!("Polling {} every {:?}", loop_key, interval);

            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let refresh = cache.refresh(loop_key.clone(), fetcher());
                        tokio::select! {
                            _ = loop_token.cancelled() => break,
                            result = refresh => {
                                if let Err(e) = result {
                                    tracing::warn!("Poll of {} failed: {}", loop_key, e);
                                }
                            }
                        }
                    }
                }
            }
            tracing::debug!("Stopped polling {}", loop_key);
        });

        PollHandle {
            key,
            token,
            task: Some(task),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{EntityKind, QueryParams};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_poll_refreshes_until_dropped() {
        let cache = QueryCache::new();
        let key = CacheKey::collection(EntityKind::Jobs, QueryParams::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let handle = cache.poll(key.clone(), Duration::from_secs(5), move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok::<_, String>(json!({ "items": [], "poll": n })) }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get(&key).unwrap().value["poll"], 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        drop(handle);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stop_waits_for_loop() {
        let cache = QueryCache::new();
        let key = CacheKey::singleton(EntityKind::System, "stats");
        let handle = cache.poll(key, Duration::from_secs(60), || async {
            Err::<Value, _>("offline")
        });
        assert!(handle.is_running());
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stop_mid_request_allows_revalidation() {
        let cache = QueryCache::new();
        let key = CacheKey::collection(EntityKind::Jobs, QueryParams::new());
        cache.set(key.clone(), json!({ "items": [] }));

        let handle = cache.poll(key.clone(), Duration::from_secs(60), || {
            std::future::pending::<Result<Value, String>>()
        });
        while !cache.is_fetching(&key) {
            tokio::task::yield_now().await;
        }
        handle.stop().await;
        assert!(!cache.is_fetching(&key));

        cache.invalidate(&key);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut changes = cache.subscribe();
        let stale = cache
            .fetch(key.clone(), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>(json!({ "items": [{ "id": "j1" }] })) }
            })
            .await
            .unwrap();
        assert_eq!(stale["items"], json!([]));

        assert_eq!(changes.recv().await.unwrap(), crate::cache::CacheChange::Updated(key.clone()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!cache.get(&key).unwrap().stale);
    }
}
