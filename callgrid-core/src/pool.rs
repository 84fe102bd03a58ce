//! Worker pool: owns the engine workers and hands one out per new room.
//!
//! Workers are spawned once at process start. A worker dying afterwards is
//! fatal: every room bound to it is unrecoverable, so the process logs and
//! exits after a short grace delay instead of restarting the worker in
//! place.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::config::EngineConfig;
use crate::engine::{MediaEngine, MediaWorker, WorkerSettings};
use crate::error::{Error, Result};

/// Invoked once the grace delay after a worker death elapses.
pub type FatalHandler = Box<dyn Fn(u32) + Send + Sync + 'static>;

pub struct WorkerPool {
    workers: Vec<Arc<dyn MediaWorker>>,
    next: AtomicUsize,
}

impl WorkerPool {
    /// Spawn the configured number of workers. Worker death exits the
    /// process after `death_grace_seconds`.
    pub async fn spawn(engine: &dyn MediaEngine, config: &EngineConfig) -> Result<Arc<Self>> {
        Self::spawn_with_fatal_handler(engine, config, Box::new(|_pid| std::process::exit(1))).await
    }

    /// Like [`WorkerPool::spawn`] with an injectable death reaction, so the
    /// fatal path stays observable in tests.
    pub async fn spawn_with_fatal_handler(
        engine: &dyn MediaEngine,
        config: &EngineConfig,
        on_fatal: FatalHandler,
    ) -> Result<Arc<Self>> {
        let count = config.num_workers.max(1);
        let grace = Duration::from_secs(config.death_grace_seconds);
        let on_fatal = Arc::new(on_fatal);
        let mut workers: Vec<Arc<dyn MediaWorker>> = Vec::with_capacity(count);

        for _ in 0..count {
            let worker = engine
                .create_worker(WorkerSettings {
                    rtc_min_port: config.rtc_min_port,
                    rtc_max_port: config.rtc_max_port,
                    log_level: config.worker_log_level.clone(),
                })
                .await?;
            let on_fatal = Arc::clone(&on_fatal);
            worker.on_died(Box::new(move |pid| {
                error!(pid, "media worker died, process will exit after grace delay");
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    on_fatal(pid);
                });
            }));
            info!(pid = worker.pid(), "media worker started");
            workers.push(worker);
        }

        Ok(Arc::new(Self {
            workers,
            next: AtomicUsize::new(0),
        }))
    }

    /// Next worker in round-robin order. Never blocks; errs instead of
    /// touching an empty pool.
    pub fn next_worker(&self) -> Result<Arc<dyn MediaWorker>> {
        if self.workers.is_empty() {
            return Err(Error::Engine("no media workers available".to_string()));
        }
        let index = self.next.fetch_add(1, Ordering::AcqRel) % self.workers.len();
        Ok(Arc::clone(&self.workers[index]))
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockMediaEngine;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_spawn_creates_configured_count() {
        let engine = MockMediaEngine::new();
        let config = EngineConfig {
            num_workers: 3,
            ..Default::default()
        };
        let pool = WorkerPool::spawn_with_fatal_handler(engine.as_ref(), &config, Box::new(|_| {}))
            .await
            .expect("spawn");
        assert_eq!(pool.worker_count(), 3);
        assert_eq!(engine.workers().len(), 3);
    }

    #[tokio::test]
    async fn test_round_robin_cycles_all_workers() {
        let engine = MockMediaEngine::new();
        let config = EngineConfig {
            num_workers: 3,
            ..Default::default()
        };
        let pool = WorkerPool::spawn_with_fatal_handler(engine.as_ref(), &config, Box::new(|_| {}))
            .await
            .expect("spawn");

        let pids: Vec<u32> = (0..6)
            .map(|_| pool.next_worker().expect("worker").pid())
            .collect();
        assert_eq!(pids[0..3], pids[3..6]);
        let mut first_cycle = pids[0..3].to_vec();
        first_cycle.sort_unstable();
        first_cycle.dedup();
        assert_eq!(first_cycle.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_death_invokes_fatal_handler_after_grace() {
        let engine = MockMediaEngine::new();
        let config = EngineConfig {
            num_workers: 1,
            death_grace_seconds: 2,
            ..Default::default()
        };
        let died = Arc::new(AtomicU32::new(0));
        let observed = Arc::clone(&died);
        let _pool = WorkerPool::spawn_with_fatal_handler(
            engine.as_ref(),
            &config,
            Box::new(move |pid| observed.store(pid, Ordering::Release)),
        )
        .await
        .expect("spawn");

        engine.workers()[0].kill();
        // Not yet: the grace delay is still pending.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(died.load(Ordering::Acquire), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_ne!(died.load(Ordering::Acquire), 0);
    }
}
