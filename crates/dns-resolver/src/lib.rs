#![warn(clippy::pedantic)]
// Sometimes a redundant else is clearer
#![allow(clippy::redundant_else)]
// Don't care enough to fix
#![allow(clippy::match_same_arms)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::similar_names)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::wildcard_imports)]

pub mod context;
pub mod metrics;
pub mod net;
pub mod query;
pub mod recursive;
pub mod servers;

pub use context::{ResolverContext, ResolverOpts};
pub use metrics::Metrics;
pub use recursive::{resolve, ResolutionError};

/// Maximum number of CNAME hops a single resolution will chase.
///
/// This protects against maliciously long (or circular) alias chains
/// from upstream nameservers; a longer chain answers with what was
/// collected so far and SERVFAIL.
pub const CNAME_HOP_LIMIT: usize = 20;
