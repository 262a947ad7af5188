//! Process-wide counters, shared across the listener tasks and read
//! back by the control channel's STATS command.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dns_resolver::Metrics;

#[derive(Debug, Default)]
pub struct Stats {
    pub udp_queries: AtomicU64,
    pub tcp_queries: AtomicU64,
    /// Workers spawned for client queries.
    pub spawned: AtomicU64,
    /// Queries dropped because the worker budget was exhausted.
    pub dropped: AtomicU64,
    /// Workers currently alive.
    pub live_workers: AtomicUsize,

    pub local_hits: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub negative_hits: AtomicU64,
    pub upstream_hits: AtomicU64,
    pub upstream_failures: AtomicU64,
    pub rejected: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one query's resolver metrics in.
    pub fn merge(&self, metrics: &Metrics) {
        self.local_hits.fetch_add(metrics.local_hits, Ordering::Relaxed);
        self.cache_hits.fetch_add(metrics.cache_hits, Ordering::Relaxed);
        self.cache_misses
            .fetch_add(metrics.cache_misses, Ordering::Relaxed);
        self.negative_hits
            .fetch_add(metrics.negative_hits, Ordering::Relaxed);
        self.upstream_hits
            .fetch_add(metrics.upstream_hits, Ordering::Relaxed);
        self.upstream_failures
            .fetch_add(metrics.upstream_failures, Ordering::Relaxed);
        self.rejected.fetch_add(metrics.rejected, Ordering::Relaxed);
    }

    /// Try to claim a worker slot.  The combined active and queued
    /// budget is one gauge here: tokio queues the tasks for us.
    pub fn try_spawn_worker(&self, limit: usize) -> bool {
        let live = self.live_workers.fetch_add(1, Ordering::AcqRel);
        if live >= limit {
            self.live_workers.fetch_sub(1, Ordering::AcqRel);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            false
        } else {
            self.spawned.fetch_add(1, Ordering::Relaxed);
            true
        }
    }

    pub fn worker_done(&self) {
        self.live_workers.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn report(&self) -> String {
        format!(
            "udp queries:       {}\n\
             tcp queries:       {}\n\
             workers spawned:   {}\n\
             queries dropped:   {}\n\
             workers live:      {}\n\
             local hits:        {}\n\
             cache hits:        {}\n\
             cache misses:      {}\n\
             negative hits:     {}\n\
             upstream hits:     {}\n\
             upstream failures: {}\n\
             rejected replies:  {}\n",
            self.udp_queries.load(Ordering::Relaxed),
            self.tcp_queries.load(Ordering::Relaxed),
            self.spawned.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
            self.live_workers.load(Ordering::Relaxed),
            self.local_hits.load(Ordering::Relaxed),
            self.cache_hits.load(Ordering::Relaxed),
            self.cache_misses.load(Ordering::Relaxed),
            self.negative_hits.load(Ordering::Relaxed),
            self.upstream_hits.load(Ordering::Relaxed),
            self.upstream_failures.load(Ordering::Relaxed),
            self.rejected.load(Ordering::Relaxed),
        )
    }
}
