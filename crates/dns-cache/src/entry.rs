//! Cache entries.  One `Cent` ("cache entry") holds everything known
//! about a single owner name: a table of RR sets, flags, and - for
//! negatively cached names - the negation's TTL and timestamp.

use dns_types::protocol::rrinfo::{rr_info, Slot, NUM_COMMON_SLOTS, NUM_EXT_SLOTS, RR_INFO};
use dns_types::protocol::types::{DomainName, RecordType, RecordTypeWithData};

/// Flag word for RR sets and cache entries.
pub type Flags = u16;

/// The name exists, but there are no records of this type (cached
/// authoritatively).  An RR set with this flag has no records.
pub const CF_NEGATIVE: Flags = 1;
/// Defined by local configuration: never purged, never displaced by
/// remote data.
pub const CF_LOCAL: Flags = 2;
/// Came from an authoritative source.
pub const CF_AUTH: Flags = 4;
/// Transient: serve once, then store with TTL 0 so the next purge
/// evicts it.
pub const CF_NOCACHE: Flags = 8;
/// Was in the additional section of a reply, so weaker than answer
/// data.
pub const CF_ADDITIONAL: Flags = 16;
/// Keep past its TTL if nothing newer arrives.
pub const CF_NOPURGE: Flags = 32;
/// Obtained directly from a root server.
pub const CF_ROOTSERV: Flags = 64;

/// Set flags that a requery must not inherit from the old data.
pub const CFF_NOINHERIT: Flags = CF_LOCAL | CF_AUTH | CF_ADDITIONAL | CF_ROOTSERV;

/// The whole name is negatively cached (NXDOMAIN).
pub const DF_NEGATIVE: Flags = 1;
/// The whole name is locally configured.
pub const DF_LOCAL: Flags = 2;
/// The name's data came from an authoritative source.
pub const DF_AUTH: Flags = 4;
/// Transient whole-name negation.
pub const DF_NOCACHE: Flags = 8;
/// Subdomains of this name have wildcard records: look up the
/// synthetic `*.<name>` entry.
pub const DF_WILD: Flags = 16;

/// The time in seconds any record remains in the cache at least,
/// even if its TTL is shorter.  Protects short-TTL records from
/// purge churn.
pub const CACHE_LATENCY: u64 = 120;

/// A TTL adjusted by the cache-latency floor, for purge decisions.
pub fn clat_adjusted(ttl: u32) -> u64 {
    u64::from(ttl).max(CACHE_LATENCY)
}

/// The set of records sharing an owner name and type.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RrSet {
    /// TTL as it will be served, already clamped.
    pub ttl: u32,
    /// Unix time of insertion.
    pub ts: u64,
    pub flags: Flags,
    /// INVARIANT: empty if and only if `CF_NEGATIVE` is set.
    pub records: Vec<RecordTypeWithData>,
}

impl RrSet {
    pub fn new(ttl: u32, ts: u64, flags: Flags) -> Self {
        Self {
            ttl,
            ts,
            flags,
            records: Vec::new(),
        }
    }

    pub fn negative(ttl: u32, ts: u64, flags: Flags) -> Self {
        Self::new(ttl, ts, flags | CF_NEGATIVE)
    }

    pub fn is_negative(&self) -> bool {
        self.flags & CF_NEGATIVE != 0
    }

    pub fn is_local(&self) -> bool {
        self.flags & CF_LOCAL != 0
    }

    /// Add one record, deduplicating.  Returns whether it was new.
    pub fn add_record(&mut self, data: RecordTypeWithData) -> bool {
        if self.records.contains(&data) {
            false
        } else {
            self.records.push(data);
            true
        }
    }

    /// Whether the set is past its (latency-floored) lifetime.
    pub fn timed_out(&self, now: u64) -> bool {
        self.ts + clat_adjusted(self.ttl) < now
    }

    /// The TTL to serve right now: the stored TTL minus the set's
    /// age.  Zero once expired.
    pub fn remaining_ttl(&self, now: u64) -> u32 {
        let expiry = self.ts + u64::from(self.ttl);
        u32::try_from(expiry.saturating_sub(now)).unwrap_or(u32::MAX)
    }

    /// Bytes this set accounts for: a fixed header plus each record's
    /// pointer-free RDATA encoding.
    pub fn byte_size(&self) -> usize {
        let mut size = RRSET_OVERHEAD;
        for record in &self.records {
            size += RR_OVERHEAD + record.rdata_wire_len();
        }
        size
    }
}

/// Accounting constants: rough per-object overheads, in the spirit of
/// the in-memory footprint rather than exact allocator numbers.
pub const RRSET_OVERHEAD: usize = 24;
pub const RR_OVERHEAD: usize = 8;
pub const CENT_OVERHEAD: usize = 32;
/// Accounted when the secondary RR-set array has been allocated.
pub const EXT_TABLE_OVERHEAD: usize = NUM_EXT_SLOTS * 8;

/// TTL and timestamp for a negatively cached name.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NegInfo {
    pub ttl: u32,
    pub ts: u64,
}

impl NegInfo {
    pub fn timed_out(&self, now: u64) -> bool {
        self.ts + clat_adjusted(self.ttl) < now
    }

    pub fn remaining_ttl(&self, now: u64) -> u32 {
        let expiry = self.ts + u64::from(self.ttl);
        u32::try_from(expiry.saturating_sub(now)).unwrap_or(u32::MAX)
    }
}

/// A cache entry: one owner name and all its RR sets.
///
/// RR sets live in a two-tier table: a dense array for the common
/// types, and a secondary array - allocated the first time it is
/// needed - for the rest.  The `rrinfo` descriptor table maps each
/// cacheable type to its tier and index.
///
/// INVARIANT: `neg` is `Some` if and only if `DF_NEGATIVE` is set, in
/// which case there are no RR sets.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Cent {
    pub name: DomainName,
    pub flags: Flags,
    pub neg: Option<NegInfo>,
    /// Trailing label count of the nearest name known to carry NS
    /// records enclosing this one.
    pub c_ns: Option<u8>,
    /// As `c_ns`, for SOA records.
    pub c_soa: Option<u8>,
    common: [Option<Box<RrSet>>; NUM_COMMON_SLOTS],
    ext: Option<Box<[Option<Box<RrSet>>; NUM_EXT_SLOTS]>>,
}

/// Error from inserting a record type the cache does not hold.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct NotCacheable(pub RecordType);

impl std::fmt::Display for NotCacheable {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "RR type {} is not cacheable", self.0)
    }
}

impl std::error::Error for NotCacheable {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl Cent {
    pub fn new(name: DomainName, flags: Flags) -> Self {
        Self {
            name,
            flags,
            neg: None,
            c_ns: None,
            c_soa: None,
            common: Default::default(),
            ext: None,
        }
    }

    /// A negatively cached name: no RR sets at all.
    pub fn new_negative(name: DomainName, ttl: u32, ts: u64, flags: Flags) -> Self {
        let mut cent = Self::new(name, flags | DF_NEGATIVE);
        cent.neg = Some(NegInfo { ttl, ts });
        cent
    }

    pub fn is_negative(&self) -> bool {
        self.flags & DF_NEGATIVE != 0
    }

    pub fn is_local(&self) -> bool {
        self.flags & DF_LOCAL != 0
    }

    /// Turn an existing entry into a negatively cached name,
    /// dropping all its RR sets.
    pub fn negate(&mut self, ttl: u32, ts: u64) {
        self.common = Default::default();
        self.ext = None;
        self.flags |= DF_NEGATIVE;
        self.neg = Some(NegInfo { ttl, ts });
    }

    pub fn rrset(&self, rtype: RecordType) -> Option<&RrSet> {
        if self.is_negative() {
            return None;
        }
        match rr_info(rtype)?.slot {
            Slot::Common(i) => self.common[i].as_deref(),
            Slot::Ext(i) => self.ext.as_ref().and_then(|ext| ext[i].as_deref()),
        }
    }

    pub fn rrset_mut(&mut self, rtype: RecordType) -> Option<&mut RrSet> {
        if self.is_negative() {
            return None;
        }
        match rr_info(rtype)?.slot {
            Slot::Common(i) => self.common[i].as_deref_mut(),
            Slot::Ext(i) => self.ext.as_mut().and_then(|ext| ext[i].as_deref_mut()),
        }
    }

    /// Whether there is at least one record of the given type.
    pub fn has_rr(&self, rtype: RecordType) -> bool {
        self.rrset(rtype).map_or(false, |rrs| !rrs.records.is_empty())
    }

    /// Install an RR set, replacing any previous set of the type.
    ///
    /// # Errors
    ///
    /// If the type is not cacheable, or the entry is negative.
    pub fn insert_rrset(&mut self, rtype: RecordType, set: RrSet) -> Result<(), NotCacheable> {
        if self.is_negative() {
            return Err(NotCacheable(rtype));
        }
        match rr_info(rtype).ok_or(NotCacheable(rtype))?.slot {
            Slot::Common(i) => self.common[i] = Some(Box::new(set)),
            Slot::Ext(i) => {
                let ext = self.ext.get_or_insert_with(|| Box::new(Default::default()));
                ext[i] = Some(Box::new(set));
            }
        }
        Ok(())
    }

    pub fn remove_rrset(&mut self, rtype: RecordType) -> Option<RrSet> {
        let removed = match rr_info(rtype)?.slot {
            Slot::Common(i) => self.common[i].take().map(|b| *b),
            Slot::Ext(i) => self.ext.as_mut().and_then(|ext| ext[i].take()).map(|b| *b),
        };

        // drop the secondary array once it holds nothing
        if let Some(ext) = &self.ext {
            if ext.iter().all(Option::is_none) {
                self.ext = None;
            }
        }

        removed
    }

    /// Add a single record, creating the type's RR set if there was
    /// none.  The set keeps its existing TTL and timestamp if it
    /// already existed.
    ///
    /// # Errors
    ///
    /// If the type is not cacheable, or the entry is negative.
    pub fn add_record(
        &mut self,
        ttl: u32,
        ts: u64,
        flags: Flags,
        data: RecordTypeWithData,
    ) -> Result<bool, NotCacheable> {
        let rtype = data.rtype();
        if self.rrset(rtype).is_none() {
            self.insert_rrset(rtype, RrSet::new(ttl, ts, flags))?;
        }
        // just inserted, so the unwrap is safe
        Ok(self.rrset_mut(rtype).unwrap().add_record(data))
    }

    /// Record a negatively cached type on this name.
    ///
    /// # Errors
    ///
    /// If the type is not cacheable, or the entry is negative.
    pub fn add_negated_rrset(
        &mut self,
        rtype: RecordType,
        ttl: u32,
        ts: u64,
        flags: Flags,
    ) -> Result<(), NotCacheable> {
        self.insert_rrset(rtype, RrSet::negative(ttl, ts, flags))
    }

    /// Iterate the RR sets in ascending type order.
    pub fn rrsets(&self) -> impl Iterator<Item = (RecordType, &RrSet)> {
        RR_INFO
            .iter()
            .filter_map(move |info| self.rrset(info.rtype).map(|rrs| (info.rtype, rrs)))
    }

    /// The RR types present, in ascending type order.
    pub fn rrset_types(&self) -> Vec<RecordType> {
        self.rrsets().map(|(rtype, _)| rtype).collect()
    }

    pub fn num_rrsets(&self) -> usize {
        self.rrsets().count()
    }

    /// An entry with no RR sets and no negation carries no
    /// information and can be dropped.
    pub fn is_empty(&self) -> bool {
        !self.is_negative() && self.num_rrsets() == 0
    }

    /// Bytes this entry accounts for in the cache total.
    pub fn byte_size(&self) -> usize {
        let mut size = CENT_OVERHEAD + self.name.len;
        if self.ext.is_some() {
            size += EXT_TABLE_OVERHEAD;
        }
        for (_, rrs) in self.rrsets() {
            size += rrs.byte_size();
        }
        size
    }
}
