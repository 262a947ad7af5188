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
#![allow(clippy::too_many_lines)]
#![allow(clippy::wildcard_imports)]

pub mod entry;
pub mod persist;
pub mod store;

pub use entry::{Cent, RrSet};
pub use store::{Cache, SharedCache};

use std::time::{SystemTime, UNIX_EPOCH};

/// The current wall-clock time as unix seconds.  Timestamps are kept
/// in wall-clock form so the cache survives a restart via the disk
/// file.
pub fn unix_now() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs(),
        // clock is before 1970: everything is as fresh as can be
        Err(_) => 0,
    }
}
