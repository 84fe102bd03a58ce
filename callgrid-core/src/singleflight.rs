//! Singleflight guard for idempotent async creation.
//!
//! Wraps the `async_singleflight` crate so that concurrent requests for the
//! same key share a single execution instead of racing to create duplicate
//! engine-side resources.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

pub(crate) struct SingleFlight<K, V, E>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    group: Arc<async_singleflight::Group<K, V, E>>,
}

impl<K, V, E> SingleFlight<K, V, E>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            group: Arc::new(async_singleflight::Group::new()),
        }
    }

    /// Execute `f` at most once per in-flight `key`; waiters share the
    /// leader's result. `on_leader_lost` supplies the error when the leader
    /// is dropped before producing one.
    ///
    /// `Group::work` returns `Result<V, Option<E>>`: `Err(Some(e))` is the
    /// function's own error, `Err(None)` means the leader vanished.
    pub(crate) async fn run<Fut, Lf>(&self, key: K, f: Fut, on_leader_lost: Lf) -> Result<V, E>
    where
        Fut: std::future::Future<Output = Result<V, E>> + Send,
        Lf: FnOnce() -> E,
    {
        self.group
            .work(&key, f)
            .await
            .map_err(|inner| inner.map_or_else(on_leader_lost, |e| e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let flight = Arc::new(SingleFlight::<String, usize, String>::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flight = Arc::clone(&flight);
            let executions = Arc::clone(&executions);
            handles.push(tokio::spawn(async move {
                flight
                    .run(
                        "key".to_string(),
                        async move {
                            executions.fetch_add(1, Ordering::AcqRel);
                            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                            Ok::<_, String>(42)
                        },
                        || "lost".to_string(),
                    )
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.expect("join").expect("run"), 42);
        }
        // All callers raced on one key; at most a couple of leaders may have
        // run if some finished before others arrived, but a full stampede
        // (one execution per caller) must not happen.
        assert!(executions.load(Ordering::Acquire) < 8);
    }
}
