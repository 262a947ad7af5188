//! A descriptor table for the RR types this proxy caches.  The wire
//! codec uses it to decide which RDATA formats embed domain names, the
//! cache uses it for slot allocation and conflict checking.

use crate::protocol::types::RecordType;

/// Number of slots in the dense ("common") tier of a cache entry's
/// RR-set table.  These are the types seen on virtually every run.
pub const NUM_COMMON_SLOTS: usize = 12;

/// Number of slots in the lazily-allocated secondary tier.
pub const NUM_EXT_SLOTS: usize = 18;

/// Total number of cacheable RR types.
pub const NUM_SLOTS: usize = NUM_COMMON_SLOTS + NUM_EXT_SLOTS;

/// Where an RR type's set lives inside a cache entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Slot {
    /// Index into the dense array every entry carries.
    Common(usize),
    /// Index into the secondary array, allocated on first use.
    Ext(usize),
}

/// Conflict class: a CNAME at a name excludes data records and vice
/// versa.  DNSSEC material coexists with anything.
pub const CLASS_CNAME: u8 = 1;
pub const CLASS_DATA: u8 = 2;
pub const CLASS_DNSSEC: u8 = 4;

/// Static information about one cacheable RR type.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct RrInfo {
    pub rtype: RecordType,
    pub slot: Slot,
    /// Whether the RDATA embeds domain names which take part in
    /// message compression.
    pub compressible: bool,
    /// Conflict class of this type.
    pub class: u8,
    /// Classes this type cannot coexist with at one owner name.
    pub excludes: u8,
}

/// All cacheable types, in ascending type-number order.  This order is
/// also the iteration and persistence order for RR sets in a cache
/// entry.
pub static RR_INFO: [RrInfo; NUM_SLOTS] = [
    rr(RecordType::A, Slot::Common(0), false, CLASS_DATA, CLASS_CNAME),
    rr(RecordType::NS, Slot::Common(1), true, CLASS_DATA, CLASS_CNAME),
    rr(RecordType::MD, Slot::Ext(0), true, CLASS_DATA, CLASS_CNAME),
    rr(RecordType::MF, Slot::Ext(1), true, CLASS_DATA, CLASS_CNAME),
    rr(RecordType::CNAME, Slot::Common(2), true, CLASS_CNAME, CLASS_DATA),
    rr(RecordType::SOA, Slot::Common(3), true, CLASS_DATA, CLASS_CNAME),
    rr(RecordType::MB, Slot::Ext(2), true, CLASS_DATA, CLASS_CNAME),
    rr(RecordType::MG, Slot::Ext(3), true, CLASS_DATA, CLASS_CNAME),
    rr(RecordType::MR, Slot::Ext(4), true, CLASS_DATA, CLASS_CNAME),
    rr(RecordType::NULL, Slot::Ext(5), false, CLASS_DATA, CLASS_CNAME),
    rr(RecordType::WKS, Slot::Ext(6), false, CLASS_DATA, CLASS_CNAME),
    rr(RecordType::PTR, Slot::Common(4), true, CLASS_DATA, CLASS_CNAME),
    rr(RecordType::HINFO, Slot::Common(5), false, CLASS_DATA, CLASS_CNAME),
    rr(RecordType::MINFO, Slot::Ext(7), true, CLASS_DATA, CLASS_CNAME),
    rr(RecordType::MX, Slot::Common(6), true, CLASS_DATA, CLASS_CNAME),
    rr(RecordType::TXT, Slot::Common(7), false, CLASS_DATA, CLASS_CNAME),
    rr(RecordType::RP, Slot::Ext(8), true, CLASS_DATA, CLASS_CNAME),
    rr(RecordType::AFSDB, Slot::Ext(9), true, CLASS_DATA, CLASS_CNAME),
    rr(RecordType::RT, Slot::Ext(10), true, CLASS_DATA, CLASS_CNAME),
    rr(RecordType::PX, Slot::Ext(11), true, CLASS_DATA, CLASS_CNAME),
    rr(RecordType::AAAA, Slot::Common(8), false, CLASS_DATA, CLASS_CNAME),
    rr(RecordType::LOC, Slot::Ext(12), false, CLASS_DATA, CLASS_CNAME),
    rr(RecordType::NXT, Slot::Ext(13), true, CLASS_DNSSEC, 0),
    rr(RecordType::SRV, Slot::Common(9), true, CLASS_DATA, CLASS_CNAME),
    rr(RecordType::NAPTR, Slot::Ext(14), true, CLASS_DATA, CLASS_CNAME),
    rr(RecordType::KX, Slot::Ext(15), true, CLASS_DATA, CLASS_CNAME),
    rr(RecordType::IPSECKEY, Slot::Ext(16), true, CLASS_DATA, CLASS_CNAME),
    rr(RecordType::RRSIG, Slot::Common(10), true, CLASS_DNSSEC, 0),
    rr(RecordType::NSEC, Slot::Ext(17), true, CLASS_DNSSEC, 0),
    rr(RecordType::SPF, Slot::Common(11), false, CLASS_DATA, CLASS_CNAME),
];

const fn rr(rtype: RecordType, slot: Slot, compressible: bool, class: u8, excludes: u8) -> RrInfo {
    RrInfo {
        rtype,
        slot,
        compressible,
        class,
        excludes,
    }
}

/// Look up the descriptor for an RR type.  `None` means the type is
/// not cacheable (it is still proxied opaquely in answers).
pub fn rr_info(rtype: RecordType) -> Option<&'static RrInfo> {
    RR_INFO.iter().find(|info| info.rtype == rtype)
}

/// Whether the cache will accept RR sets of this type.
pub fn is_cacheable(rtype: RecordType) -> bool {
    rr_info(rtype).is_some()
}

/// Whether two descriptors exclude each other at one owner name.
pub fn conflicts(a: &RrInfo, b: &RrInfo) -> bool {
    // should be symmetric; check both ways anyway
    (a.class & b.excludes) != 0 || (a.excludes & b.class) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_unique_and_dense() {
        let mut common_seen = [false; NUM_COMMON_SLOTS];
        let mut ext_seen = [false; NUM_EXT_SLOTS];

        for info in &RR_INFO {
            match info.slot {
                Slot::Common(i) => {
                    assert!(!common_seen[i], "duplicate common slot {i}");
                    common_seen[i] = true;
                }
                Slot::Ext(i) => {
                    assert!(!ext_seen[i], "duplicate ext slot {i}");
                    ext_seen[i] = true;
                }
            }
        }

        assert!(common_seen.iter().all(|b| *b));
        assert!(ext_seen.iter().all(|b| *b));
    }

    #[test]
    fn table_is_in_ascending_type_order() {
        for pair in RR_INFO.windows(2) {
            assert!(u16::from(pair[0].rtype) < u16::from(pair[1].rtype));
        }
    }

    #[test]
    fn cname_excludes_data_but_not_dnssec() {
        let cname = rr_info(RecordType::CNAME).unwrap();
        let a = rr_info(RecordType::A).unwrap();
        let ns = rr_info(RecordType::NS).unwrap();
        let rrsig = rr_info(RecordType::RRSIG).unwrap();
        let nsec = rr_info(RecordType::NSEC).unwrap();

        assert!(conflicts(cname, a));
        assert!(conflicts(a, cname));
        assert!(conflicts(cname, ns));
        assert!(!conflicts(cname, rrsig));
        assert!(!conflicts(cname, nsec));
        assert!(!conflicts(a, ns));
    }

    #[test]
    fn opt_is_not_cacheable() {
        assert!(!is_cacheable(RecordType::OPT));
        assert!(!is_cacheable(RecordType::from(65000)));
    }
}
