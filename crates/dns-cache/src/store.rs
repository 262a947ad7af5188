//! The cache store: a hash table of entries keyed by owner name, plus
//! a timestamp-ordered queue that fixes the purge order.  Data is
//! replaced RR-set by RR-set, following precedence rules that keep
//! local data authoritative and answer-section data ahead of
//! additional-section data.

use priority_queue::PriorityQueue;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::sleep;
use std::time::Duration;

use dns_types::protocol::rrinfo::{conflicts, rr_info};
use dns_types::protocol::types::{DomainName, RecordType, RecordTypeWithData};

use crate::entry::*;

/// How far the in-memory cache may exceed the configured permanent
/// cache size before an insertion triggers a purge.
pub const MCSZ: usize = 10240;

/// TTL bounds applied to everything entering the cache.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TtlLimits {
    pub min_ttl: u32,
    pub max_ttl: u32,
    pub neg_ttl: u32,
}

impl Default for TtlLimits {
    fn default() -> Self {
        Self {
            min_ttl: 120,
            max_ttl: 604_800,
            neg_ttl: 900,
        }
    }
}

/// How a lookup found its entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum LookupOutcome {
    /// The name itself is cached (possibly negatively).
    Exact,
    /// An ancestor has wildcard records: the returned entry is the
    /// synthetic `*.<ancestor>` one.
    Wildcard,
    /// An ancestor is negatively cached from an upstream NXDOMAIN:
    /// the whole subtree is gone for as long as the negation lasts.
    NegativeAncestor,
    /// An ancestor negates the whole subtree by local configuration.
    LocalNegativeAncestor,
    /// An ancestor is locally defined (and carries no wildcard for
    /// this name): local configuration shadows the subtree, so the
    /// name authoritatively does not exist.
    LocalAncestor,
}

/// What one purge pass did.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct PurgeStats {
    pub sets_removed: usize,
    pub entries_removed: usize,
}

/// Purge-order key: one RR set, or a whole negatively cached name.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
enum LruKey {
    RrSet(DomainName, RecordType),
    Negative(DomainName),
}

/// Caching for DNS data.  You probably want to use `SharedCache`
/// instead.
#[derive(Debug, Clone)]
pub struct Cache {
    entries: HashMap<DomainName, Cent>,

    /// Queue of purge candidates ordered by insertion timestamp,
    /// oldest first.  Local items never enter it.  Keys may be stale
    /// (pointing at replaced or deleted data); the purge validates
    /// each key against the store before acting on it.
    purge_order: PriorityQueue<LruKey, Reverse<u64>>,

    /// Accounted bytes.
    ///
    /// INVARIANT: equal to the sum of `byte_size()` over all entries.
    cache_size: usize,

    /// The configured permanent cache size, in bytes.
    permitted_size: usize,

    limits: TtlLimits,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new(2048, TtlLimits::default())
    }
}

impl Cache {
    /// Create a cache permitted to hold `perm_cache_kb` kilobytes
    /// (plus a small insertion slack).
    pub fn new(perm_cache_kb: usize, limits: TtlLimits) -> Self {
        Self {
            entries: HashMap::new(),
            purge_order: PriorityQueue::new(),
            cache_size: 0,
            permitted_size: perm_cache_kb * 1024,
            limits,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn byte_size(&self) -> usize {
        self.cache_size
    }

    pub fn limits(&self) -> TtlLimits {
        self.limits
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cent> {
        self.entries.values()
    }

    /// Find the entry which answers for a name: the name's own entry
    /// if cached, else the closest ancestor which speaks for the
    /// subtree - a negatively cached name (the subtree is gone with
    /// it), a wildcard marker (serve the synthetic `*.<ancestor>`
    /// entry), or a plain locally defined name (local configuration
    /// shadows everything below it).  The entry is cloned so the
    /// caller is free of the lock.
    pub fn lookup(&self, name: &DomainName) -> Option<(Cent, LookupOutcome)> {
        if let Some(cent) = self.entries.get(name) {
            return Some((cent.clone(), LookupOutcome::Exact));
        }

        let mut ancestor = name.parent();
        while let Some(candidate) = ancestor {
            if let Some(cent) = self.entries.get(&candidate) {
                if cent.flags & DF_NEGATIVE != 0 {
                    let outcome = if cent.flags & DF_LOCAL != 0 {
                        LookupOutcome::LocalNegativeAncestor
                    } else {
                        LookupOutcome::NegativeAncestor
                    };
                    return Some((cent.clone(), outcome));
                }
                if cent.flags & DF_WILD != 0 {
                    if let Some(wild_name) = candidate.make_wildcard() {
                        if let Some(wild) = self.entries.get(&wild_name) {
                            return Some((wild.clone(), LookupOutcome::Wildcard));
                        }
                    }
                }
                if cent.flags & DF_LOCAL != 0 {
                    return Some((cent.clone(), LookupOutcome::LocalAncestor));
                }
            }
            ancestor = candidate.parent();
        }

        None
    }

    /// Clone one RR set.
    pub fn lookup_rrset(&self, name: &DomainName, rtype: RecordType) -> Option<RrSet> {
        self.entries.get(name)?.rrset(rtype).cloned()
    }

    /// Clone one RR set, but only if it is locally configured.  Fast
    /// path for delegation overrides.
    pub fn lookup_local_rrset(&self, name: &DomainName, rtype: RecordType) -> Option<RrSet> {
        let rrs = self.entries.get(name)?.rrset(rtype)?;
        if rrs.is_local() {
            Some(rrs.clone())
        } else {
            None
        }
    }

    /// Merge a new entry into the store.  See the flag documentation
    /// in `entry` for the precedence rules; in short: local beats
    /// remote, answer-section data beats additional-section data,
    /// root-server data beats other additional data, and conflicting
    /// types are arbitrated by remaining TTL.
    pub fn add_cache(&mut self, new: Cent, now: u64) {
        if self.entries.contains_key(&new.name) {
            self.merge_into_existing(new, now);
        } else {
            self.insert_fresh(new, now);
        }

        if self.cache_size > self.permitted_size + MCSZ {
            self.purge(now, true);
        }
    }

    /// Remove an entry outright.
    pub fn del_cache(&mut self, name: &DomainName) -> bool {
        self.remove_entry(name).is_some()
    }

    /// Zero the timestamps (and TTLs) of everything stored for a
    /// name, so it counts as stale but remains servable until newer
    /// data arrives or a purge claims it.
    pub fn invalidate(&mut self, name: &DomainName) -> bool {
        let Some(cent) = self.entries.get_mut(name) else {
            return false;
        };

        for rtype in cent.rrset_types() {
            let rrs = cent.rrset_mut(rtype).unwrap();
            rrs.ts = 0;
            rrs.ttl = 0;
            if !rrs.is_local() {
                self.purge_order
                    .push(LruKey::RrSet(name.clone(), rtype), Reverse(0));
            }
        }
        if let Some(neg) = &mut cent.neg {
            neg.ts = 0;
            neg.ttl = 0;
            if cent.flags & DF_LOCAL == 0 {
                self.purge_order
                    .push(LruKey::Negative(name.clone()), Reverse(0));
            }
        }

        true
    }

    /// OR extra flags onto an entry.
    pub fn set_cent_flags(&mut self, name: &DomainName, flags: Flags) -> bool {
        if let Some(cent) = self.entries.get_mut(name) {
            cent.flags |= flags;
            true
        } else {
            false
        }
    }

    /// Drop every non-local entry, except those under one of the
    /// names in `keep`.  Returns the number of entries removed.
    pub fn empty_cache(&mut self, keep: &[DomainName]) -> usize {
        let doomed: Vec<DomainName> = self
            .entries
            .values()
            .filter(|cent| {
                !cent.is_local()
                    && !cent.rrsets().any(|(_, rrs)| rrs.is_local())
                    && !keep.iter().any(|k| cent.name.is_subdomain_of(k))
            })
            .map(|cent| cent.name.clone())
            .collect();

        let count = doomed.len();
        for name in doomed {
            self.remove_entry(&name);
        }
        count
    }

    /// Bring the cache back under its size budget.  Pass one walks
    /// the purge queue oldest-first deleting timed-out sets; pass two
    /// deletes oldest-first regardless of NOPURGE.  Local data is
    /// never touched.  With `lazy` set, both passes stop as soon as
    /// the size is acceptable.
    pub fn purge(&mut self, now: u64, lazy: bool) -> PurgeStats {
        let mut stats = PurgeStats::default();
        let mut survivors: Vec<(LruKey, u64)> = Vec::with_capacity(self.purge_order.len());

        // a lazy purge (triggered by an insertion) tolerates the
        // memory slack; a full one brings the cache down to the
        // configured size and sweeps all timed-out sets
        let target = if lazy {
            self.permitted_size + MCSZ
        } else {
            self.permitted_size
        };

        // pass 1: timed-out sets, oldest first
        while let Some((key, Reverse(ts))) = self.purge_order.pop() {
            if lazy && self.cache_size <= target {
                self.purge_order.push(key, Reverse(ts));
                break;
            }
            match self.validate_key(&key, ts, now) {
                KeyState::Stale => (),
                KeyState::Fresh { timed_out } => {
                    if timed_out && self.purge_key(&key, now, false, &mut stats) {
                        continue;
                    }
                    survivors.push((key, ts));
                }
            }
        }

        // pass 2: still over budget, delete oldest regardless of
        // NOPURGE
        let mut survivors = survivors.into_iter();
        if self.cache_size > target {
            for (key, ts) in survivors.by_ref() {
                if self.cache_size <= target {
                    self.purge_order.push(key, Reverse(ts));
                    break;
                }
                if !self.purge_key(&key, now, true, &mut stats) {
                    self.purge_order.push(key, Reverse(ts));
                }
            }
        }

        for (key, ts) in survivors {
            self.purge_order.push(key, Reverse(ts));
        }

        if stats.sets_removed > 0 || stats.entries_removed > 0 {
            tracing::debug!(
                sets = %stats.sets_removed,
                entries = %stats.entries_removed,
                size = %self.cache_size,
                "purged cache"
            );
        }

        stats
    }

    /// Write a textual dump of one entry, or of everything, to `w`.
    /// With `exact` unset, `name` selects a whole subtree.
    pub fn dump(
        &self,
        w: &mut dyn io::Write,
        name: Option<&DomainName>,
        exact: bool,
        now: u64,
    ) -> io::Result<()> {
        let mut names: Vec<&DomainName> = self
            .entries
            .keys()
            .filter(|n| match name {
                None => true,
                Some(wanted) if exact => *n == wanted,
                Some(wanted) => n.is_subdomain_of(wanted),
            })
            .collect();
        names.sort();

        for n in names {
            let cent = &self.entries[n];
            writeln!(w, "; {} (flags {:#x})", n, cent.flags)?;
            if let Some(neg) = cent.neg {
                writeln!(w, "{} {} IN ; negated domain", n, neg.remaining_ttl(now))?;
                continue;
            }
            for (rtype, rrs) in cent.rrsets() {
                if rrs.is_negative() {
                    writeln!(w, "{} {} IN {} ; negated type", n, rrs.remaining_ttl(now), rtype)?;
                    continue;
                }
                for record in &rrs.records {
                    writeln!(
                        w,
                        "{} {} IN {} {}",
                        n,
                        rrs.remaining_ttl(now),
                        rtype,
                        rdata_text(record)
                    )?;
                }
            }
        }

        Ok(())
    }

    fn insert_fresh(&mut self, mut new: Cent, now: u64) {
        // an entry with no information cannot be purged, so don't
        // let it in - except for local entries, which can carry pure
        // flag information (a wildcard marker on a parent name)
        if new.is_empty() && new.flags & DF_LOCAL == 0 {
            return;
        }

        let name = new.name.clone();
        if new.is_negative() {
            adjust_dom_ttl(self.limits, &mut new);
            if new.flags & DF_LOCAL == 0 {
                let ts = new.neg.map_or(now, |neg| neg.ts);
                self.purge_order.push(LruKey::Negative(name.clone()), Reverse(ts));
            }
        } else {
            for rtype in new.rrset_types() {
                let limits = self.limits;
                let rrs = new.rrset_mut(rtype).unwrap();
                adjust_ttl(limits, rrs);
                if !rrs.is_local() {
                    self.purge_order
                        .push(LruKey::RrSet(name.clone(), rtype), Reverse(rrs.ts));
                }
            }
        }

        self.cache_size += new.byte_size();
        self.entries.insert(name, new);
    }

    fn merge_into_existing(&mut self, new: Cent, now: u64) {
        let name = new.name.clone();

        if new.is_negative() {
            // a local record is never clobbered by a remote negation
            let existing = &self.entries[&name];
            if existing.is_local() || existing.rrsets().any(|(_, rrs)| rrs.is_local()) {
                return;
            }
            self.remove_entry(&name);
            self.insert_fresh(new, now);
            return;
        }

        let mut existing = self.remove_entry(&name).unwrap();

        if existing.is_negative() {
            if existing.is_local() {
                // local negation wins; put it back untouched
                self.cache_size += existing.byte_size();
                self.relink(&existing);
                self.entries.insert(name, existing);
                return;
            }
            // fresh data displaces the expired-or-not negation
            self.insert_fresh(new, now);
            return;
        }

        self.purge_cent(&mut existing, now);

        for rtype in new.rrset_types() {
            let newrrs = new.rrset(rtype).unwrap();

            // Local records have precedence.  Records from answer
            // sections have precedence over additional records, and
            // additional records from root servers over additional
            // records from other servers - as long as the old set is
            // still fresh.
            let keep_old = existing.rrset(rtype).map_or(false, |cerrs| {
                (!newrrs.is_local() && cerrs.is_local())
                    || (newrrs.flags & CF_ADDITIONAL != 0
                        && (cerrs.flags & CF_ADDITIONAL == 0
                            || (newrrs.flags & CF_ROOTSERV == 0
                                && cerrs.flags & CF_ROOTSERV != 0))
                        && !cerrs.timed_out(now))
            });
            if keep_old {
                continue;
            }

            existing.remove_rrset(rtype);

            if !conflict_check(&mut existing, rtype, newrrs.ttl, newrrs.flags, now) {
                // the new set lost the conflict resolution
                continue;
            }

            let mut set = newrrs.clone();
            adjust_ttl(self.limits, &mut set);
            // infallible: the type was cacheable in `new`
            let _ = existing.insert_rrset(rtype, set);
        }

        existing.flags |= new.flags & (DF_AUTH | DF_WILD);
        if let Some(c_ns) = new.c_ns {
            if existing.c_ns.map_or(true, |old| old < c_ns) {
                existing.c_ns = Some(c_ns);
            }
        }
        if let Some(c_soa) = new.c_soa {
            if existing.c_soa.map_or(true, |old| old < c_soa) {
                existing.c_soa = Some(c_soa);
            }
        }

        self.cache_size += existing.byte_size();
        self.relink(&existing);
        self.entries.insert(name, existing);
    }

    /// Remove timed-out sets from one entry (honouring LOCAL and
    /// NOPURGE) and drop stale `c_ns`/`c_soa` hints.
    fn purge_cent(&mut self, cent: &mut Cent, now: u64) -> usize {
        let mut removed = 0;
        for rtype in cent.rrset_types() {
            let rrs = cent.rrset(rtype).unwrap();
            if !rrs.is_local() && rrs.flags & CF_NOPURGE == 0 && rrs.timed_out(now) {
                cent.remove_rrset(rtype);
                removed += 1;
            }
        }

        if cent.flags & DF_LOCAL == 0 {
            if let Some(k) = cent.c_ns {
                if !self.hint_still_good(cent, k, RecordType::NS, now) {
                    cent.c_ns = None;
                }
            }
            if let Some(k) = cent.c_soa {
                if !self.hint_still_good(cent, k, RecordType::SOA, now) {
                    cent.c_soa = None;
                }
            }
        }

        removed
    }

    /// Whether the NS (or SOA) set referenced by a `c_ns`/`c_soa`
    /// hint still exists and is fresh.
    fn hint_still_good(&self, cent: &Cent, k: u8, rtype: RecordType, now: u64) -> bool {
        let own_labels = cent.name.content_label_count();
        let rrs = if usize::from(k) == own_labels {
            cent.rrset(rtype)
        } else {
            match cent.name.ancestor_with_labels(usize::from(k)) {
                Some(ancestor) => self
                    .entries
                    .get(&ancestor)
                    .and_then(|ancestor_cent| ancestor_cent.rrset(rtype)),
                None => None,
            }
        };

        match rrs {
            Some(rrs) if !rrs.records.is_empty() => rrs.is_local() || !rrs.timed_out(now),
            _ => false,
        }
    }

    /// Delete what a purge key points at.  In forced mode NOPURGE no
    /// longer protects.  Returns whether anything was deleted.
    fn purge_key(&mut self, key: &LruKey, now: u64, force: bool, stats: &mut PurgeStats) -> bool {
        match key {
            LruKey::Negative(name) => {
                let Some(cent) = self.entries.get(name) else {
                    return false;
                };
                if cent.flags & DF_LOCAL != 0 {
                    return false;
                }
                if !force && !cent.neg.map_or(true, |neg| neg.timed_out(now)) {
                    return false;
                }
                self.remove_entry(name);
                stats.entries_removed += 1;
                true
            }
            LruKey::RrSet(name, rtype) => {
                let Some(cent) = self.entries.get_mut(name) else {
                    return false;
                };
                let Some(rrs) = cent.rrset(*rtype) else {
                    return false;
                };
                if rrs.is_local() {
                    return false;
                }
                if !force && (rrs.flags & CF_NOPURGE != 0 || !rrs.timed_out(now)) {
                    return false;
                }

                let before = cent.byte_size();
                cent.remove_rrset(*rtype);
                let after = cent.byte_size();
                self.cache_size -= before - after;
                stats.sets_removed += 1;

                if cent.is_empty() {
                    self.remove_entry(name);
                    stats.entries_removed += 1;
                }
                true
            }
        }
    }

    /// Check a purge key against the store.  `Stale` keys point at
    /// data that has been replaced or removed and are simply dropped.
    fn validate_key(&self, key: &LruKey, ts: u64, now: u64) -> KeyState {
        match key {
            LruKey::Negative(name) => match self.entries.get(name).and_then(|cent| cent.neg) {
                Some(neg) if neg.ts == ts => KeyState::Fresh {
                    timed_out: neg.timed_out(now),
                },
                _ => KeyState::Stale,
            },
            LruKey::RrSet(name, rtype) => {
                match self.entries.get(name).and_then(|cent| cent.rrset(*rtype)) {
                    Some(rrs) if rrs.ts == ts => KeyState::Fresh {
                        timed_out: rrs.timed_out(now),
                    },
                    _ => KeyState::Stale,
                }
            }
        }
    }

    /// Take an entry out of the store, keeping the accounting
    /// straight and removing its purge keys.
    fn remove_entry(&mut self, name: &DomainName) -> Option<Cent> {
        let cent = self.entries.remove(name)?;
        self.cache_size -= cent.byte_size();
        for rtype in cent.rrset_types() {
            self.purge_order.remove(&LruKey::RrSet(name.clone(), rtype));
        }
        if cent.is_negative() {
            self.purge_order.remove(&LruKey::Negative(name.clone()));
        }
        Some(cent)
    }

    /// (Re-)insert purge keys for everything in an entry.
    fn relink(&mut self, cent: &Cent) {
        if cent.is_negative() {
            if cent.flags & DF_LOCAL == 0 {
                if let Some(neg) = cent.neg {
                    self.purge_order
                        .push(LruKey::Negative(cent.name.clone()), Reverse(neg.ts));
                }
            }
            return;
        }
        for (rtype, rrs) in cent.rrsets() {
            if !rrs.is_local() {
                self.purge_order
                    .push(LruKey::RrSet(cent.name.clone(), rtype), Reverse(rrs.ts));
            }
        }
    }
}

enum KeyState {
    Stale,
    Fresh { timed_out: bool },
}

/// Clamp an RR set's TTL into the configured bounds.  Negative sets
/// may use the (usually lower) negative-TTL floor; NOCACHE sets are
/// marked for the next purge by zeroing the TTL.
fn adjust_ttl(limits: TtlLimits, set: &mut RrSet) {
    if set.flags & CF_NOCACHE != 0 {
        set.flags &= !CF_NOCACHE;
        set.ttl = 0;
    } else {
        let mut min_ttl = limits.min_ttl;
        if set.is_negative() && limits.neg_ttl < min_ttl {
            min_ttl = limits.neg_ttl;
        }
        if set.ttl < min_ttl {
            set.ttl = min_ttl;
        } else if set.ttl > limits.max_ttl {
            set.ttl = limits.max_ttl;
        }
    }
}

/// As `adjust_ttl`, for the whole-name negation of an NXDOMAIN entry.
fn adjust_dom_ttl(limits: TtlLimits, cent: &mut Cent) {
    let nocache = cent.flags & DF_NOCACHE != 0;
    cent.flags &= !DF_NOCACHE;

    if let Some(neg) = &mut cent.neg {
        if nocache {
            neg.ttl = 0;
        } else {
            let min_ttl = limits.neg_ttl.min(limits.min_ttl);
            if neg.ttl < min_ttl {
                neg.ttl = min_ttl;
            } else if neg.ttl > limits.max_ttl {
                neg.ttl = limits.max_ttl;
            }
        }
    }
}

/// Conflict resolution, applied before installing a new RR set on an
/// existing entry.  Types declare exclusion classes (a CNAME excludes
/// data records and vice versa); when the new set conflicts with
/// cached ones, local data wins outright and otherwise the new set
/// must outlive the mean remaining TTL of the conflicting sets, which
/// are then deleted.
///
/// Returns whether the new set may be added.
fn conflict_check(cent: &mut Cent, rtype: RecordType, ttl: u32, flags: Flags, now: u64) -> bool {
    if flags & CF_NEGATIVE != 0 {
        return true;
    }

    let Some(info) = rr_info(rtype) else {
        return false;
    };

    if flags & CF_LOCAL == 0 {
        if cent.flags & DF_LOCAL != 0 {
            return false;
        }

        let mut ncf = 0u64;
        let mut nttl = 0u64;
        for (other, rrs) in cent.rrsets() {
            // every iterated type has an entry in the table
            let other_info = rr_info(other).unwrap();
            if !rrs.is_negative() && conflicts(info, other_info) {
                if rrs.is_local() {
                    return false;
                }
                ncf += 1;
                nttl += u64::from(rrs.remaining_ttl(now));
            }
        }

        if ncf == 0 {
            return true;
        }
        if u64::from(ttl) <= nttl / ncf {
            // the old records outlive the newcomer
            return false;
        }
    }

    let conflicting: Vec<RecordType> = cent
        .rrsets()
        .filter(|(other, rrs)| {
            !rrs.is_negative() && conflicts(info, rr_info(*other).unwrap())
        })
        .map(|(other, _)| other)
        .collect();
    for other in conflicting {
        cent.remove_rrset(other);
    }

    true
}

/// A compact textual rendering of RDATA, for dumps.
fn rdata_text(record: &RecordTypeWithData) -> String {
    match record {
        RecordTypeWithData::A { address } => address.to_string(),
        RecordTypeWithData::AAAA { address } => address.to_string(),
        RecordTypeWithData::NS { nsdname } => nsdname.to_string(),
        RecordTypeWithData::CNAME { cname } => cname.to_string(),
        RecordTypeWithData::PTR { ptrdname } => ptrdname.to_string(),
        RecordTypeWithData::MX {
            preference,
            exchange,
        } => format!("{preference} {exchange}"),
        RecordTypeWithData::SOA {
            mname,
            rname,
            serial,
            refresh,
            retry,
            expire,
            minimum,
        } => format!("{mname} {rname} {serial} {refresh} {retry} {expire} {minimum}"),
        RecordTypeWithData::SRV {
            priority,
            weight,
            port,
            target,
        } => format!("{priority} {weight} {port} {target}"),
        RecordTypeWithData::TXT { octets } | RecordTypeWithData::SPF { octets } => {
            format!("\\# {} octets", octets.len())
        }
        other => format!("\\# {} octets", other.rdata_wire_len()),
    }
}

/// A convenience wrapper around a `Cache` which lets it be shared
/// between threads.
///
/// Invoking `clone` on a `SharedCache` gives a new instance which
/// refers to the same underlying `Cache` object.
#[derive(Debug, Clone)]
pub struct SharedCache {
    cache: Arc<RwLock<Cache>>,
}

const LOCK_POISON_MESSAGE: &str =
    "[INTERNAL ERROR] cache lock poisoned, cannot recover from this - aborting";

impl SharedCache {
    pub fn new(cache: Cache) -> Self {
        Self {
            cache: Arc::new(RwLock::new(cache)),
        }
    }

    /// Get a read guard, for bulk operations like persistence.
    ///
    /// # Panics
    ///
    /// If the lock has been poisoned.
    pub fn read(&self) -> RwLockReadGuard<'_, Cache> {
        self.cache.read().expect(LOCK_POISON_MESSAGE)
    }

    /// Get a write guard.
    ///
    /// # Panics
    ///
    /// If the lock has been poisoned.
    pub fn write(&self) -> RwLockWriteGuard<'_, Cache> {
        self.cache.write().expect(LOCK_POISON_MESSAGE)
    }

    /// Try to get the write lock, politely: spin for at most 1000 x
    /// 1ms and give up rather than blocking forever.  Used on the
    /// shutdown path, where a hung reader must not prevent the
    /// process from exiting.
    pub fn try_write_softly(&self) -> Option<RwLockWriteGuard<'_, Cache>> {
        for _ in 0..1000 {
            match self.cache.try_write() {
                Ok(guard) => return Some(guard),
                Err(std::sync::TryLockError::Poisoned(_)) => {
                    panic!("{}", LOCK_POISON_MESSAGE)
                }
                Err(std::sync::TryLockError::WouldBlock) => sleep(Duration::from_millis(1)),
            }
        }
        None
    }

    /// # Panics
    ///
    /// If the lock has been poisoned.
    pub fn lookup(&self, name: &DomainName) -> Option<(Cent, LookupOutcome)> {
        self.read().lookup(name)
    }

    /// # Panics
    ///
    /// If the lock has been poisoned.
    pub fn lookup_rrset(&self, name: &DomainName, rtype: RecordType) -> Option<RrSet> {
        self.read().lookup_rrset(name, rtype)
    }

    /// # Panics
    ///
    /// If the lock has been poisoned.
    pub fn lookup_local_rrset(&self, name: &DomainName, rtype: RecordType) -> Option<RrSet> {
        self.read().lookup_local_rrset(name, rtype)
    }

    /// # Panics
    ///
    /// If the lock has been poisoned.
    pub fn add_cache(&self, cent: Cent, now: u64) {
        self.write().add_cache(cent, now);
    }

    /// # Panics
    ///
    /// If the lock has been poisoned.
    pub fn del_cache(&self, name: &DomainName) -> bool {
        self.write().del_cache(name)
    }

    /// # Panics
    ///
    /// If the lock has been poisoned.
    pub fn invalidate(&self, name: &DomainName) -> bool {
        self.write().invalidate(name)
    }

    /// # Panics
    ///
    /// If the lock has been poisoned.
    pub fn set_cent_flags(&self, name: &DomainName, flags: Flags) -> bool {
        self.write().set_cent_flags(name, flags)
    }

    /// Empty the cache in chunks, so readers get a look-in between
    /// chunks even while a big flush is running.
    ///
    /// # Panics
    ///
    /// If the lock has been poisoned.
    pub fn empty_cache(&self, keep: &[DomainName]) -> usize {
        let doomed: Vec<DomainName> = {
            let cache = self.read();
            cache
                .iter()
                .filter(|cent| {
                    !cent.is_local()
                        && !cent.rrsets().any(|(_, rrs)| rrs.is_local())
                        && !keep.iter().any(|k| cent.name.is_subdomain_of(k))
                })
                .map(|cent| cent.name.clone())
                .collect()
        };

        let mut count = 0;
        for chunk in doomed.chunks(256) {
            let mut cache = self.write();
            for name in chunk {
                if cache.del_cache(name) {
                    count += 1;
                }
            }
        }
        count
    }

    /// # Panics
    ///
    /// If the lock has been poisoned.
    pub fn purge(&self, now: u64, lazy: bool) -> PurgeStats {
        self.write().purge(now, lazy)
    }
}

impl Default for SharedCache {
    fn default() -> Self {
        Self::new(Cache::default())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use dns_types::protocol::types::test_util::*;

    use super::*;

    fn a_data(a: u8) -> RecordTypeWithData {
        RecordTypeWithData::A {
            address: Ipv4Addr::new(a, 0, 0, 1),
        }
    }

    fn cent_with_a(name: &str, ttl: u32, ts: u64, flags: Flags, a: u8) -> Cent {
        let mut cent = Cent::new(domain(name), 0);
        cent.add_record(ttl, ts, flags, a_data(a)).unwrap();
        cent
    }

    fn assert_size_invariant(cache: &Cache) {
        assert_eq!(
            cache.byte_size(),
            cache.iter().map(Cent::byte_size).sum::<usize>()
        );
    }

    #[test]
    fn add_then_lookup_returns_clone() {
        let mut cache = Cache::default();
        cache.add_cache(cent_with_a("www.example.com.", 300, 1000, 0, 1), 1000);

        let (cent, outcome) = cache.lookup(&domain("www.example.com.")).unwrap();
        assert_eq!(LookupOutcome::Exact, outcome);
        assert_eq!(domain("www.example.com."), cent.name);
        assert!(cent.has_rr(RecordType::A));
        assert_size_invariant(&cache);
    }

    #[test]
    fn add_is_idempotent() {
        let mut cache = Cache::default();
        let cent = cent_with_a("www.example.com.", 300, 1000, 0, 1);
        cache.add_cache(cent.clone(), 1000);
        let size = cache.byte_size();

        cache.add_cache(cent, 1000);
        assert_eq!(size, cache.byte_size());
        assert_eq!(1, cache.len());

        let (got, _) = cache.lookup(&domain("www.example.com.")).unwrap();
        assert_eq!(1, got.rrset(RecordType::A).unwrap().records.len());
        assert_size_invariant(&cache);
    }

    #[test]
    fn add_then_delete_restores_size() {
        let mut cache = Cache::default();
        let empty = cache.byte_size();

        cache.add_cache(cent_with_a("www.example.com.", 300, 1000, 0, 1), 1000);
        assert!(cache.byte_size() > empty);

        assert!(cache.del_cache(&domain("www.example.com.")));
        assert_eq!(empty, cache.byte_size());
        assert_size_invariant(&cache);
    }

    #[test]
    fn ttls_are_clamped_on_insertion() {
        let limits = TtlLimits {
            min_ttl: 60,
            max_ttl: 3600,
            neg_ttl: 30,
        };
        let mut cache = Cache::new(64, limits);

        cache.add_cache(cent_with_a("low.example.com.", 1, 1000, 0, 1), 1000);
        cache.add_cache(cent_with_a("high.example.com.", 1_000_000, 1000, 0, 1), 1000);

        let low = cache
            .lookup_rrset(&domain("low.example.com."), RecordType::A)
            .unwrap();
        let high = cache
            .lookup_rrset(&domain("high.example.com."), RecordType::A)
            .unwrap();
        assert_eq!(60, low.ttl);
        assert_eq!(3600, high.ttl);
    }

    #[test]
    fn negative_domains_use_neg_ttl_floor() {
        let limits = TtlLimits {
            min_ttl: 60,
            max_ttl: 3600,
            neg_ttl: 30,
        };
        let mut cache = Cache::new(64, limits);
        cache.add_cache(Cent::new_negative(domain("nosuch.example."), 1, 1000, 0), 1000);

        let (cent, _) = cache.lookup(&domain("nosuch.example.")).unwrap();
        assert_eq!(Some(30), cent.neg.map(|neg| neg.ttl));
    }

    #[test]
    fn local_records_are_not_replaced_by_remote() {
        let mut cache = Cache::default();
        cache.add_cache(cent_with_a("www.example.com.", 300, 1000, CF_LOCAL, 1), 1000);
        cache.add_cache(cent_with_a("www.example.com.", 300, 2000, 0, 2), 2000);

        let rrs = cache
            .lookup_rrset(&domain("www.example.com."), RecordType::A)
            .unwrap();
        assert!(rrs.is_local());
        assert_eq!(vec![a_data(1)], rrs.records);
        assert_size_invariant(&cache);
    }

    #[test]
    fn answer_replaces_additional_but_not_vice_versa() {
        let mut cache = Cache::default();
        cache.add_cache(
            cent_with_a("ns.example.com.", 300, 1000, CF_ADDITIONAL, 1),
            1000,
        );

        // answer-section data displaces the additional-section data
        cache.add_cache(cent_with_a("ns.example.com.", 300, 1001, 0, 2), 1001);
        let rrs = cache
            .lookup_rrset(&domain("ns.example.com."), RecordType::A)
            .unwrap();
        assert_eq!(vec![a_data(2)], rrs.records);

        // but fresh answer data is not displaced by additional data
        cache.add_cache(
            cent_with_a("ns.example.com.", 300, 1002, CF_ADDITIONAL, 3),
            1002,
        );
        let rrs = cache
            .lookup_rrset(&domain("ns.example.com."), RecordType::A)
            .unwrap();
        assert_eq!(vec![a_data(2)], rrs.records);
        assert_size_invariant(&cache);
    }

    #[test]
    fn negation_does_not_clobber_local_data() {
        let mut cache = Cache::default();
        cache.add_cache(cent_with_a("www.example.com.", 300, 1000, CF_LOCAL, 1), 1000);
        cache.add_cache(
            Cent::new_negative(domain("www.example.com."), 900, 2000, 0),
            2000,
        );

        let (cent, _) = cache.lookup(&domain("www.example.com.")).unwrap();
        assert!(!cent.is_negative());
        assert!(cent.has_rr(RecordType::A));
    }

    #[test]
    fn negation_replaces_remote_data() {
        let mut cache = Cache::default();
        cache.add_cache(cent_with_a("www.example.com.", 300, 1000, 0, 1), 1000);
        cache.add_cache(
            Cent::new_negative(domain("www.example.com."), 900, 2000, 0),
            2000,
        );

        let (cent, _) = cache.lookup(&domain("www.example.com.")).unwrap();
        assert!(cent.is_negative());
        assert_size_invariant(&cache);
    }

    #[test]
    fn cname_conflict_is_arbitrated_by_ttl() {
        let mut cache = Cache::default();
        cache.add_cache(cent_with_a("www.example.com.", 600, 1000, 0, 1), 1000);

        // a CNAME with a shorter remaining TTL loses
        let mut loser = Cent::new(domain("www.example.com."), 0);
        loser
            .add_record(
                150,
                1000,
                0,
                RecordTypeWithData::CNAME {
                    cname: domain("target.example.com."),
                },
            )
            .unwrap();
        cache.add_cache(loser, 1000);
        let (cent, _) = cache.lookup(&domain("www.example.com.")).unwrap();
        assert!(cent.has_rr(RecordType::A));
        assert!(!cent.has_rr(RecordType::CNAME));

        // a CNAME with a longer remaining TTL wins and evicts the A
        let mut winner = Cent::new(domain("www.example.com."), 0);
        winner
            .add_record(
                6000,
                1000,
                0,
                RecordTypeWithData::CNAME {
                    cname: domain("target.example.com."),
                },
            )
            .unwrap();
        cache.add_cache(winner, 1000);
        let (cent, _) = cache.lookup(&domain("www.example.com.")).unwrap();
        assert!(!cent.has_rr(RecordType::A));
        assert!(cent.has_rr(RecordType::CNAME));
        assert_size_invariant(&cache);
    }

    #[test]
    fn wildcard_ancestor_is_found() {
        let mut cache = Cache::default();

        let mut parent = Cent::new(domain("example.com."), DF_WILD);
        parent
            .add_record(300, 1000, 0, a_data(9))
            .unwrap();
        cache.add_cache(parent, 1000);
        cache.add_cache(cent_with_a("*.example.com.", 300, 1000, 0, 7), 1000);

        let (cent, outcome) = cache.lookup(&domain("anything.example.com.")).unwrap();
        assert_eq!(LookupOutcome::Wildcard, outcome);
        assert_eq!(domain("*.example.com."), cent.name);
    }

    #[test]
    fn local_negative_ancestor_negates_subtree() {
        let mut cache = Cache::default();
        cache.add_cache(
            Cent::new_negative(domain("blocked.example."), 900, 1000, DF_LOCAL),
            1000,
        );

        let (cent, outcome) = cache.lookup(&domain("deep.under.blocked.example.")).unwrap();
        assert_eq!(LookupOutcome::LocalNegativeAncestor, outcome);
        assert!(cent.is_negative());
    }

    #[test]
    fn plain_negative_ancestor_negates_subtree() {
        let mut cache = Cache::default();

        // an upstream NXDOMAIN, cached without any local flag
        cache.add_cache(
            Cent::new_negative(domain("ads.example.com."), 900, 1000, 0),
            1000,
        );

        let (cent, outcome) = cache.lookup(&domain("x.ads.example.com.")).unwrap();
        assert_eq!(LookupOutcome::NegativeAncestor, outcome);
        assert!(cent.is_negative());
        assert!(!cent.is_local());
    }

    #[test]
    fn local_ancestor_shadows_subtree() {
        let mut cache = Cache::default();

        let mut zone_root = cent_with_a("lan.", 300, 1000, CF_LOCAL, 1);
        zone_root.flags |= DF_LOCAL | DF_AUTH;
        cache.add_cache(zone_root, 1000);

        // nothing more specific is defined, so the name does not
        // exist as far as local configuration is concerned
        let (cent, outcome) = cache.lookup(&domain("bogus.lan.")).unwrap();
        assert_eq!(LookupOutcome::LocalAncestor, outcome);
        assert!(!cent.is_negative());
        assert_eq!(domain("lan."), cent.name);
    }

    #[test]
    fn remote_ancestor_does_not_shadow_subtree() {
        let mut cache = Cache::default();
        cache.add_cache(cent_with_a("example.com.", 300, 1000, 0, 1), 1000);

        // a cached remote answer for the parent says nothing about
        // its children
        assert_eq!(None, cache.lookup(&domain("www.example.com.")));
    }

    #[test]
    fn wildcard_wins_over_local_ancestor() {
        let mut cache = Cache::default();

        let mut parent = cent_with_a("apps.lan.", 300, 1000, CF_LOCAL, 1);
        parent.flags |= DF_LOCAL | DF_WILD;
        cache.add_cache(parent, 1000);
        cache.add_cache(cent_with_a("*.apps.lan.", 300, 1000, CF_LOCAL, 7), 1000);

        let (cent, outcome) = cache.lookup(&domain("grafana.apps.lan.")).unwrap();
        assert_eq!(LookupOutcome::Wildcard, outcome);
        assert_eq!(domain("*.apps.lan."), cent.name);
    }

    #[test]
    fn purge_removes_timed_out_sets_oldest_first() {
        let mut cache = Cache::new(0, TtlLimits::default());

        cache.add_cache(cent_with_a("old.example.com.", 120, 1000, 0, 1), 1000);
        cache.add_cache(cent_with_a("new.example.com.", 120, 5000, 0, 2), 5000);

        // both are timed out by now; a full purge sweeps them
        let stats = cache.purge(10_000, false);
        assert_eq!(2, stats.entries_removed);
        assert_eq!(0, cache.len());
        assert_eq!(0, cache.byte_size());
    }

    #[test]
    fn forced_purge_ignores_nopurge_but_spares_local() {
        let mut cache = Cache::new(0, TtlLimits::default());

        cache.add_cache(
            cent_with_a("keep.example.com.", 300, 1000, CF_LOCAL, 1),
            1000,
        );
        cache.add_cache(
            cent_with_a("nopurge.example.com.", 300, 1000, CF_NOPURGE, 2),
            1000,
        );

        // neither has timed out; pass 2 must still claim the
        // NOPURGE one because the cache is over budget
        cache.purge(1001, false);
        assert!(cache.lookup(&domain("keep.example.com.")).is_some());
        assert!(cache.lookup(&domain("nopurge.example.com.")).is_none());
        assert_size_invariant(&cache);
    }

    #[test]
    fn lazy_purge_stops_at_budget() {
        let mut cache = Cache::new(1024, TtlLimits::default());
        for i in 0..10 {
            cache.add_cache(
                cent_with_a(&format!("host{i}.example.com."), 300, 1000 + i, 0, 1),
                1000 + i,
            );
        }

        // well under budget: a lazy purge removes nothing
        let stats = cache.purge(1010, true);
        assert_eq!(0, stats.entries_removed);
        assert_eq!(10, cache.len());
    }

    #[test]
    fn invalidate_makes_sets_stale_but_keeps_them() {
        let mut cache = Cache::default();
        cache.add_cache(cent_with_a("www.example.com.", 300, 1000, 0, 1), 1000);

        assert!(cache.invalidate(&domain("www.example.com.")));
        let rrs = cache
            .lookup_rrset(&domain("www.example.com."), RecordType::A)
            .unwrap();
        assert_eq!(0, rrs.ttl);
        assert!(rrs.timed_out(1000));
    }

    #[test]
    fn empty_cache_honours_keep_list() {
        let mut cache = Cache::default();
        cache.add_cache(cent_with_a("a.example.com.", 300, 1000, 0, 1), 1000);
        cache.add_cache(cent_with_a("b.example.net.", 300, 1000, 0, 2), 1000);
        cache.add_cache(cent_with_a("local.example.org.", 300, 1000, CF_LOCAL, 3), 1000);

        let removed = cache.empty_cache(&[domain("example.com.")]);
        assert_eq!(1, removed);
        assert!(cache.lookup(&domain("a.example.com.")).is_some());
        assert!(cache.lookup(&domain("b.example.net.")).is_none());
        assert!(cache.lookup(&domain("local.example.org.")).is_some());
        assert_size_invariant(&cache);
    }

    #[test]
    fn lookup_local_rrset_ignores_remote_data() {
        let mut cache = Cache::default();
        cache.add_cache(cent_with_a("remote.example.com.", 300, 1000, 0, 1), 1000);
        cache.add_cache(cent_with_a("local.example.com.", 300, 1000, CF_LOCAL, 2), 1000);

        assert_eq!(
            None,
            cache.lookup_local_rrset(&domain("remote.example.com."), RecordType::A)
        );
        assert!(cache
            .lookup_local_rrset(&domain("local.example.com."), RecordType::A)
            .is_some());
    }

    fn cent_with_ns(name: &str, ns: &str, ts: u64) -> Cent {
        let mut cent = Cent::new(domain(name), 0);
        cent.add_record(
            3600,
            ts,
            0,
            RecordTypeWithData::NS {
                nsdname: domain(ns),
            },
        )
        .unwrap();
        cent
    }

    #[test]
    fn c_ns_hint_takes_the_larger_value() {
        let mut cache = Cache::default();

        // the delegations the hints will refer to
        cache.add_cache(cent_with_ns("com.", "a.gtld-servers.net.", 1000), 1000);
        cache.add_cache(cent_with_ns("example.com.", "ns1.example.com.", 1000), 1000);

        let mut first = cent_with_a("www.example.com.", 300, 1000, 0, 1);
        first.c_ns = Some(1);
        cache.add_cache(first, 1000);

        let mut second = cent_with_a("www.example.com.", 300, 1001, 0, 1);
        second.c_ns = Some(2);
        cache.add_cache(second, 1001);

        let (cent, _) = cache.lookup(&domain("www.example.com.")).unwrap();
        assert_eq!(Some(2), cent.c_ns);

        // a smaller (worse) hint does not regress the stored one
        let mut third = cent_with_a("www.example.com.", 300, 1002, 0, 1);
        third.c_ns = Some(1);
        cache.add_cache(third, 1002);

        let (cent, _) = cache.lookup(&domain("www.example.com.")).unwrap();
        assert_eq!(Some(2), cent.c_ns);
    }

    #[test]
    fn stale_c_ns_hint_is_dropped_on_requery() {
        let mut cache = Cache::default();

        // a hint referring to a delegation the cache does not hold is
        // dropped when the entry is touched again
        let mut first = cent_with_a("www.example.com.", 300, 1000, 0, 1);
        first.c_ns = Some(2);
        cache.add_cache(first, 1000);

        let second = cent_with_a("www.example.com.", 300, 1001, 0, 2);
        cache.add_cache(second, 1001);

        let (cent, _) = cache.lookup(&domain("www.example.com.")).unwrap();
        assert_eq!(None, cent.c_ns);
    }
}
