use std::time::Duration;

use dns_cache::SharedCache;
use dns_types::protocol::types::{DomainName, Question};

use crate::metrics::Metrics;
use crate::query::QueryOptions;
use crate::servers::{ServerSection, SharedServers};

/// Whether (and when) negative answers are cached.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum NegPolicy {
    On,
    Off,
    /// Only when the reply had the AA bit.
    Auth,
    /// On for proxy servers (which we asked to recurse), Auth
    /// otherwise.
    Default,
}

/// Everything the resolver needs to know which does not change
/// between queries.
#[derive(Debug, Clone)]
pub struct ResolverOpts {
    pub query: QueryOptions,

    /// How many upstream exchanges may be in flight at once for a
    /// single resolution step.
    pub par_queries: usize,

    /// Port delegated nameservers are queried on.  53 everywhere but
    /// the test bench.
    pub upstream_port: u16,

    /// Wall-clock budget for one round of upstream queries.
    pub global_timeout: Duration,

    /// Negative caching of missing RR types.
    pub neg_rrs_pol: NegPolicy,

    /// Negative caching of whole names (NXDOMAIN).
    pub neg_domain_pol: NegPolicy,

    /// Distrust records from servers which are not authoritative for
    /// them.
    pub paranoid: bool,

    /// Zones which must only ever delegate: an in-zone answer without
    /// a delegation is treated as NXDOMAIN, one delegating outside
    /// the zone as a failure.
    pub delegation_only: Vec<DomainName>,
}

impl Default for ResolverOpts {
    fn default() -> Self {
        Self {
            query: QueryOptions::default(),
            par_queries: 2,
            upstream_port: 53,
            global_timeout: Duration::from_secs(30),
            neg_rrs_pol: NegPolicy::Default,
            neg_domain_pol: NegPolicy::Auth,
            paranoid: false,
            delegation_only: Vec::new(),
        }
    }
}

/// Per-query state threaded through a resolution: the shared handles,
/// the stack of questions being resolved (for loop detection), and
/// the metrics being gathered.
pub struct ResolverContext<'a> {
    pub opts: &'a ResolverOpts,
    pub sections: &'a [ServerSection],
    pub servers: &'a SharedServers,
    pub cache: &'a SharedCache,
    question_stack: Vec<Question>,
    metrics: Metrics,
}

impl<'a> ResolverContext<'a> {
    pub fn new(
        opts: &'a ResolverOpts,
        sections: &'a [ServerSection],
        servers: &'a SharedServers,
        cache: &'a SharedCache,
        recursion_limit: usize,
    ) -> Self {
        Self {
            opts,
            sections,
            servers,
            cache,
            question_stack: Vec::with_capacity(recursion_limit),
            metrics: Metrics::new(),
        }
    }

    pub fn metrics(&mut self) -> &mut Metrics {
        &mut self.metrics
    }

    pub fn done(self) -> Metrics {
        self.metrics
    }

    pub fn at_recursion_limit(&self) -> bool {
        self.question_stack.len() == self.question_stack.capacity()
    }

    pub fn is_duplicate_question(&self, question: &Question) -> bool {
        self.question_stack.contains(question)
    }

    pub fn push_question(&mut self, question: &Question) {
        self.question_stack.push(question.clone());
    }

    pub fn pop_question(&mut self) {
        self.question_stack.pop();
    }
}
