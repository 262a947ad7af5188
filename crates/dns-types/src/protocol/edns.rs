//! EDNS0 (RFC 6891).  The OPT pseudo-RR repurposes the CLASS field as
//! the requestor's maximum UDP payload size and the TTL field as an
//! extended rcode, a version number, and a flags word.  Only version 0
//! exists; anything else must be answered BADVERS.

use bytes::Bytes;

use crate::protocol::types::*;

/// The lowest UDP payload size every implementation must support.
pub const MIN_UDP_PAYLOAD_SIZE: u16 = 512;

/// The largest UDP payload size representable in a datagram.
pub const MAX_UDP_PAYLOAD_SIZE: u16 = 65507;

/// The only EDNS version in existence.
pub const EDNS_VERSION: u8 = 0;

/// The extended rcode signalling an unsupported EDNS version.  Its low
/// four bits go in the message header, the high eight in the OPT TTL
/// field.
pub const EXTENDED_RCODE_BADVERS: u16 = 16;

/// The decoded interesting parts of an OPT pseudo-RR.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct EdnsInfo {
    /// The requestor's maximum UDP payload size, already clamped to
    /// `[MIN_UDP_PAYLOAD_SIZE, MAX_UDP_PAYLOAD_SIZE]`.
    pub udp_payload_size: u16,

    /// The high 8 bits of the extended rcode.
    pub extended_rcode_high: u8,

    /// The EDNS version the peer speaks.
    pub version: u8,

    /// The DO bit: the requestor can cope with DNSSEC RRs.
    pub dnssec_ok: bool,
}

impl EdnsInfo {
    /// An OPT advertising the given payload size on a plain
    /// well-formed message.
    pub fn advertising(udp_payload_size: u16) -> Self {
        Self {
            udp_payload_size: clamp_payload_size(udp_payload_size),
            extended_rcode_high: 0,
            version: EDNS_VERSION,
            dnssec_ok: false,
        }
    }

    /// Decode from a resource record, if it is an OPT.
    pub fn from_record(rr: &ResourceRecord) -> Option<Self> {
        if rr.rtype_with_data.rtype() != RecordType::OPT {
            return None;
        }

        let [extended_rcode_high, version, flags_high, _] = rr.ttl.to_be_bytes();
        Some(Self {
            udp_payload_size: clamp_payload_size(u16::from(rr.rclass)),
            extended_rcode_high,
            version,
            dnssec_ok: flags_high & 0b1000_0000 != 0,
        })
    }

    /// Encode as a resource record for the additional section.  This
    /// carries no options, so the RDATA is empty.
    pub fn to_record(self) -> ResourceRecord {
        let flags_high = if self.dnssec_ok { 0b1000_0000 } else { 0 };
        ResourceRecord {
            name: DomainName::root_domain(),
            rtype_with_data: RecordTypeWithData::OPT {
                octets: Bytes::new(),
            },
            rclass: RecordClass::from(self.udp_payload_size),
            ttl: u32::from_be_bytes([self.extended_rcode_high, self.version, flags_high, 0]),
        }
    }

    /// Whether the peer's EDNS version is one we speak.
    pub fn is_supported_version(&self) -> bool {
        self.version == EDNS_VERSION
    }
}

/// Remove the OPT pseudo-RR (if any) from a message's additional
/// section and decode it.  Only the first OPT is honoured; a message
/// with more than one is broken, and the extras are dropped too.
pub fn strip_opt(message: &mut Message) -> Option<EdnsInfo> {
    let mut info = None;
    let mut found = false;

    message.additional.retain(|rr| {
        if rr.rtype_with_data.rtype() == RecordType::OPT {
            if !found {
                info = EdnsInfo::from_record(rr);
                found = true;
            }
            false
        } else {
            true
        }
    });

    info
}

/// Append an OPT pseudo-RR to a message's additional section.
pub fn append_opt(message: &mut Message, info: EdnsInfo) {
    message.additional.push(info.to_record());
}

/// Split an extended rcode into the low four bits (for the message
/// header) and the high eight (for the OPT TTL field).
pub fn split_extended_rcode(extended_rcode: u16) -> (Rcode, u8) {
    let rcode = Rcode::from((extended_rcode & 0b1111) as u8);
    let high = (extended_rcode >> 4) as u8;
    (rcode, high)
}

fn clamp_payload_size(size: u16) -> u16 {
    size.clamp(MIN_UDP_PAYLOAD_SIZE, MAX_UDP_PAYLOAD_SIZE)
}
