/// Counters from one resolution attempt.  The resolver fills this
/// structure in; the daemon folds it into its global statistics after
/// the query finishes.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Answered from locally configured data.
    pub local_hits: u64,
    /// Answered from cached remote data.
    pub cache_hits: u64,
    /// Cached data was present but stale, or absent.
    pub cache_misses: u64,
    /// Answered negatively (NXDOMAIN or no data of the type).
    pub negative_hits: u64,
    /// Upstream exchanges which produced a usable reply.
    pub upstream_hits: u64,
    /// Upstream exchanges which failed or were rejected.
    pub upstream_failures: u64,
    /// Replies discarded by a reject list.
    pub rejected: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_hit(&mut self) {
        self.local_hits += 1;
    }

    pub fn cache_hit(&mut self) {
        self.cache_hits += 1;
    }

    pub fn cache_miss(&mut self) {
        self.cache_misses += 1;
    }

    pub fn negative_hit(&mut self) {
        self.negative_hits += 1;
    }

    pub fn upstream_hit(&mut self) {
        self.upstream_hits += 1;
    }

    pub fn upstream_failure(&mut self) {
        self.upstream_failures += 1;
    }

    pub fn reject(&mut self) {
        self.rejected += 1;
    }
}
