//! Serialisation of DNS messages to the wire format.  See the `types`
//! module for details of the format.

use bytes::{BufMut, BytesMut};
use std::collections::HashMap;

use crate::protocol::rrinfo::rr_info;
use crate::protocol::types::*;

impl Message {
    /// # Errors
    ///
    /// If the message is invalid (the `Message` type permits more
    /// states than strictly allowed).
    pub fn to_octets(&self) -> Result<BytesMut, Error> {
        let mut buffer = WritableBuffer::default();
        self.serialise(&mut buffer)?;
        Ok(buffer.octets)
    }

    /// Serialise within a length budget, for UDP responses.  If the
    /// full message does not fit, records are shed in order of
    /// expendability: the additional section first (keeping any OPT
    /// record), then the authority section, and finally the answers -
    /// at which point the TC flag is set so the client knows to retry
    /// over TCP.
    ///
    /// # Errors
    ///
    /// If the message is invalid.
    pub fn to_octets_bounded(&self, limit: usize) -> Result<BytesMut, Error> {
        let bytes = self.to_octets()?;
        if bytes.len() <= limit {
            return Ok(bytes);
        }

        let mut trimmed = self.clone();
        trimmed
            .additional
            .retain(|rr| rr.rtype_with_data.rtype() == RecordType::OPT);
        let bytes = trimmed.to_octets()?;
        if bytes.len() <= limit {
            return Ok(bytes);
        }

        trimmed.authority.clear();
        let bytes = trimmed.to_octets()?;
        if bytes.len() <= limit {
            return Ok(bytes);
        }

        trimmed.answers.clear();
        trimmed.header.is_truncated = true;
        let bytes = trimmed.to_octets()?;
        if bytes.len() <= limit {
            return Ok(bytes);
        }

        trimmed.additional.clear();
        trimmed.to_octets()
    }

    /// # Errors
    ///
    /// If the message is invalid (the `Message` type permits more
    /// states than strictly allowed).
    pub fn serialise(&self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        let qdcount = usize_to_u16(self.questions.len())?;
        let ancount = usize_to_u16(self.answers.len())?;
        let nscount = usize_to_u16(self.authority.len())?;
        let arcount = usize_to_u16(self.additional.len())?;

        self.header.serialise(buffer);
        buffer.write_u16(qdcount);
        buffer.write_u16(ancount);
        buffer.write_u16(nscount);
        buffer.write_u16(arcount);

        for question in &self.questions {
            question.serialise(buffer);
        }
        for rr in &self.answers {
            rr.serialise(buffer)?;
        }
        for rr in &self.authority {
            rr.serialise(buffer)?;
        }
        for rr in &self.additional {
            rr.serialise(buffer)?;
        }

        Ok(())
    }
}

impl Header {
    pub fn serialise(&self, buffer: &mut WritableBuffer) {
        // octet 1
        let flag_qr = if self.is_response { HEADER_MASK_QR } else { 0 };
        let field_opcode = HEADER_MASK_OPCODE & (u8::from(self.opcode) << HEADER_OFFSET_OPCODE);
        let flag_aa = if self.is_authoritative {
            HEADER_MASK_AA
        } else {
            0
        };
        let flag_tc = if self.is_truncated { HEADER_MASK_TC } else { 0 };
        let flag_rd = if self.recursion_desired {
            HEADER_MASK_RD
        } else {
            0
        };
        // octet 2
        let flag_ra = if self.recursion_available {
            HEADER_MASK_RA
        } else {
            0
        };
        let field_rcode = HEADER_MASK_RCODE & (u8::from(self.rcode) << HEADER_OFFSET_RCODE);

        buffer.write_u16(self.id);
        buffer.write_u8(flag_qr | field_opcode | flag_aa | flag_tc | flag_rd);
        buffer.write_u8(flag_ra | field_rcode);
    }
}

impl Question {
    pub fn serialise(&self, buffer: &mut WritableBuffer) {
        self.name.serialise(buffer, true);
        self.qtype.serialise(buffer);
        self.qclass.serialise(buffer);
    }
}

impl ResourceRecord {
    /// # Errors
    ///
    /// If the RDATA is too long.
    pub fn serialise(&self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        // names inside RDATA only take part in compression for the
        // types which are defined to embed them
        let compress_rdata = rr_info(self.rtype_with_data.rtype())
            .map_or(false, |info| info.compressible);

        self.name.serialise(buffer, true);
        self.rtype_with_data.rtype().serialise(buffer);
        self.rclass.serialise(buffer);
        buffer.write_u32(self.ttl);

        // filled in below
        let rdlength_index = buffer.index();
        buffer.write_u16(0);

        self.rtype_with_data.serialise(buffer, compress_rdata);

        // -2 so we don't also include the 2 octets for the rdlength
        let rdlength = usize_to_u16(buffer.index() - rdlength_index - 2)?;
        let [hi, lo] = rdlength.to_be_bytes();
        buffer.octets[rdlength_index] = hi;
        buffer.octets[rdlength_index + 1] = lo;

        Ok(())
    }
}

impl RecordTypeWithData {
    /// Write just the RDATA.  If `compress` is set, embedded names are
    /// added to (and may refer back into) the buffer's compression
    /// table.
    pub fn serialise(&self, buffer: &mut WritableBuffer, compress: bool) {
        match self {
            RecordTypeWithData::A { address } => buffer.write_octets(&address.octets()),
            RecordTypeWithData::NS { nsdname } => nsdname.serialise(buffer, compress),
            RecordTypeWithData::MD { madname } => madname.serialise(buffer, compress),
            RecordTypeWithData::MF { madname } => madname.serialise(buffer, compress),
            RecordTypeWithData::CNAME { cname } => cname.serialise(buffer, compress),
            RecordTypeWithData::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                mname.serialise(buffer, compress);
                rname.serialise(buffer, compress);
                buffer.write_u32(*serial);
                buffer.write_u32(*refresh);
                buffer.write_u32(*retry);
                buffer.write_u32(*expire);
                buffer.write_u32(*minimum);
            }
            RecordTypeWithData::MB { madname } => madname.serialise(buffer, compress),
            RecordTypeWithData::MG { mgmname } => mgmname.serialise(buffer, compress),
            RecordTypeWithData::MR { newname } => newname.serialise(buffer, compress),
            RecordTypeWithData::NULL { octets } => buffer.write_octets(octets),
            RecordTypeWithData::WKS { octets } => buffer.write_octets(octets),
            RecordTypeWithData::PTR { ptrdname } => ptrdname.serialise(buffer, compress),
            RecordTypeWithData::HINFO { octets } => buffer.write_octets(octets),
            RecordTypeWithData::MINFO { rmailbx, emailbx } => {
                rmailbx.serialise(buffer, compress);
                emailbx.serialise(buffer, compress);
            }
            RecordTypeWithData::MX {
                preference,
                exchange,
            } => {
                buffer.write_u16(*preference);
                exchange.serialise(buffer, compress);
            }
            RecordTypeWithData::TXT { octets } => buffer.write_octets(octets),
            RecordTypeWithData::RP { mbox, txt } => {
                mbox.serialise(buffer, compress);
                txt.serialise(buffer, compress);
            }
            RecordTypeWithData::AFSDB { subtype, hostname } => {
                buffer.write_u16(*subtype);
                hostname.serialise(buffer, compress);
            }
            RecordTypeWithData::RT {
                preference,
                intermediate,
            } => {
                buffer.write_u16(*preference);
                intermediate.serialise(buffer, compress);
            }
            RecordTypeWithData::PX {
                preference,
                map822,
                mapx400,
            } => {
                buffer.write_u16(*preference);
                map822.serialise(buffer, compress);
                mapx400.serialise(buffer, compress);
            }
            RecordTypeWithData::AAAA { address } => buffer.write_octets(&address.octets()),
            RecordTypeWithData::LOC { octets } => buffer.write_octets(octets),
            RecordTypeWithData::NXT { next, bitmap } => {
                next.serialise(buffer, compress);
                buffer.write_octets(bitmap);
            }
            RecordTypeWithData::SRV {
                priority,
                weight,
                port,
                target,
            } => {
                buffer.write_u16(*priority);
                buffer.write_u16(*weight);
                buffer.write_u16(*port);
                target.serialise(buffer, compress);
            }
            RecordTypeWithData::NAPTR {
                order,
                preference,
                flags,
                services,
                regexp,
                replacement,
            } => {
                buffer.write_u16(*order);
                buffer.write_u16(*preference);
                buffer.write_character_string(flags);
                buffer.write_character_string(services);
                buffer.write_character_string(regexp);
                replacement.serialise(buffer, compress);
            }
            RecordTypeWithData::KX {
                preference,
                exchanger,
            } => {
                buffer.write_u16(*preference);
                exchanger.serialise(buffer, compress);
            }
            RecordTypeWithData::OPT { octets } => buffer.write_octets(octets),
            RecordTypeWithData::IPSECKEY {
                precedence,
                gateway_type,
                algorithm,
                gateway,
                public_key,
            } => {
                buffer.write_u8(*precedence);
                buffer.write_u8(*gateway_type);
                buffer.write_u8(*algorithm);
                match gateway {
                    IpseckeyGateway::None => (),
                    IpseckeyGateway::V4(address) => buffer.write_octets(&address.octets()),
                    IpseckeyGateway::V6(address) => buffer.write_octets(&address.octets()),
                    IpseckeyGateway::Name(name) => name.serialise(buffer, compress),
                }
                buffer.write_octets(public_key);
            }
            RecordTypeWithData::RRSIG {
                type_covered,
                algorithm,
                labels,
                original_ttl,
                expiration,
                inception,
                key_tag,
                signer,
                signature,
            } => {
                buffer.write_u16(*type_covered);
                buffer.write_u8(*algorithm);
                buffer.write_u8(*labels);
                buffer.write_u32(*original_ttl);
                buffer.write_u32(*expiration);
                buffer.write_u32(*inception);
                buffer.write_u16(*key_tag);
                signer.serialise(buffer, compress);
                buffer.write_octets(signature);
            }
            RecordTypeWithData::NSEC { next, type_bitmaps } => {
                next.serialise(buffer, compress);
                buffer.write_octets(type_bitmaps);
            }
            RecordTypeWithData::SPF { octets } => buffer.write_octets(octets),
            RecordTypeWithData::Unknown { octets, .. } => buffer.write_octets(octets),
        }
    }

    /// Serialise just the RDATA, pointer-free, into a fresh buffer:
    /// the form stored in the cache and in the cache file.
    pub fn to_standalone_rdata(&self) -> BytesMut {
        let mut buffer = WritableBuffer::default();
        self.serialise(&mut buffer, false);
        buffer.octets
    }

    /// The length of the pointer-free RDATA encoding, used for cache
    /// accounting.
    pub fn rdata_wire_len(&self) -> usize {
        self.to_standalone_rdata().len()
    }
}

impl DomainName {
    /// Write a name.  If `compress` is set and a suffix of this name
    /// has been written before, only the unmatched leading labels are
    /// emitted, followed by a pointer.  The longest matching suffix
    /// (in whole labels) wins.
    pub fn serialise(&self, buffer: &mut WritableBuffer, compress: bool) {
        let split = if compress {
            buffer.longest_suffix_match(self)
        } else {
            None
        };

        let emit_upto = split.map_or(self.labels.len(), |(i, _)| i);

        // memoise the suffixes starting at each label we are about to
        // physically emit
        let mut offset = buffer.index();
        for i in 0..emit_upto {
            if !self.labels[i].is_empty() {
                if let Some(suffix) = DomainName::from_labels(self.labels[i..].to_vec()) {
                    buffer.memoise_name(&suffix, offset);
                }
            }
            offset += 1 + self.labels[i].len() as usize;
        }

        for label in &self.labels[..emit_upto] {
            buffer.write_u8(label.len());
            buffer.write_octets(label.octets());
        }

        if let Some((_, ptr)) = split {
            buffer.write_u16(ptr);
        }
    }
}

impl QueryType {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

impl QueryClass {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

impl RecordType {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

impl RecordClass {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

/// Errors encountered when serialising a message.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// A counter does not fit in the desired width.
    CounterTooLarge { counter: usize, bits: u32 },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::CounterTooLarge { counter, bits } => {
                write!(f, "'{counter}' cannot be converted to a u{bits}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// A buffer which can be written to, for serialisation purposes.
pub struct WritableBuffer {
    pub octets: BytesMut,
    name_pointers: HashMap<DomainName, u16>,
}

impl Default for WritableBuffer {
    fn default() -> Self {
        Self {
            octets: BytesMut::with_capacity(512),
            name_pointers: HashMap::new(),
        }
    }
}

impl WritableBuffer {
    pub fn index(&self) -> usize {
        self.octets.len()
    }

    /// Record that the given name (or name suffix) is encoded at the
    /// given offset.  First occurrence wins; offsets a 14 bit pointer
    /// cannot reach are not recorded.
    pub fn memoise_name(&mut self, name: &DomainName, offset: usize) {
        if name.is_root() || self.name_pointers.contains_key(name) {
            return;
        }
        if let Ok(index) = u16::try_from(offset) {
            if index <= 0b0011_1111_1111_1111 {
                let [hi, lo] = index.to_be_bytes();
                self.name_pointers
                    .insert(name.clone(), u16::from_be_bytes([hi | 0b1100_0000, lo]));
            }
        }
    }

    /// Find the longest previously-written suffix of this name.
    /// Returns the index of the first matched label and the pointer
    /// value to write.
    pub fn longest_suffix_match(&self, name: &DomainName) -> Option<(usize, u16)> {
        for i in 0..name.labels.len().saturating_sub(1) {
            if let Some(suffix) = DomainName::from_labels(name.labels[i..].to_vec()) {
                if let Some(ptr) = self.name_pointers.get(&suffix) {
                    return Some((i, *ptr));
                }
            }
        }
        None
    }

    pub fn write_u8(&mut self, octet: u8) {
        self.octets.put_u8(octet);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_octets(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_octets(&value.to_be_bytes());
    }

    pub fn write_octets(&mut self, octets: &[u8]) {
        self.octets.put_slice(octets);
    }

    /// Write a `<character-string>`: length octet then data.  Data
    /// longer than 255 octets is silently capped; the validated types
    /// never produce that.
    pub fn write_character_string(&mut self, octets: &[u8]) {
        let len = octets.len().min(255);
        self.write_u8(len as u8);
        self.write_octets(&octets[..len]);
    }
}

/// Helper function to convert a `usize` into a `u16` (or return an error).
///
/// # Errors
///
/// If the value cannot be converted.
fn usize_to_u16(counter: usize) -> Result<u16, Error> {
    if let Ok(t) = u16::try_from(counter) {
        Ok(t)
    } else {
        Err(Error::CounterTooLarge {
            counter,
            bits: u16::BITS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::test_util::*;

    #[test]
    #[rustfmt::skip]
    fn test_name_compression_whole_name() {
        let mut buf = WritableBuffer::default();
        buf.write_u8(1);
        buf.write_u8(2);
        buf.write_u8(3);
        buf.write_u8(4);
        domain("www.example.com.").serialise(&mut buf, true);
        domain("www.example.com.").serialise(&mut buf, true);

        assert_eq!(
            vec![
                1, 2, 3, 4,
                // domain 1
                3, 119, 119, 119, // "www"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
                // domain 2
                0b1100_0000, 0b0000_0100 // pointer
            ],
            buf.octets,
        );
    }

    #[test]
    #[rustfmt::skip]
    fn test_name_compression_suffix_match() {
        let mut buf = WritableBuffer::default();
        buf.write_u8(1);
        buf.write_u8(2);
        buf.write_u8(3);
        buf.write_u8(4);
        domain("www.example.com.").serialise(&mut buf, true);
        domain("mail.example.com.").serialise(&mut buf, true);

        assert_eq!(
            vec![
                1, 2, 3, 4,
                // domain 1
                3, 119, 119, 119, // "www"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
                // domain 2: "mail" + pointer to "example.com."
                4, 109, 97, 105, 108,
                0b1100_0000, 0b0000_1000,
            ],
            buf.octets,
        );
    }

    #[test]
    #[rustfmt::skip]
    fn test_name_compression_opt_out() {
        let mut buf = WritableBuffer::default();
        buf.write_u8(1);
        buf.write_u8(2);
        buf.write_u8(3);
        buf.write_u8(4);
        domain("www.example.com.").serialise(&mut buf, true);
        domain("www.example.com.").serialise(&mut buf, false);

        assert_eq!(
            vec![
                1, 2, 3, 4,
                // domain 1
                3, 119, 119, 119, // "www"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
                // domain 2
                3, 119, 119, 119, // "www"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
            ],
            buf.octets,
        );
    }

    #[test]
    #[rustfmt::skip]
    fn test_rdata_names_are_compressed() {
        let mut buf = WritableBuffer::default();

        Question {
            name: domain("www.example.com."),
            qtype: QueryType::Wildcard,
            qclass: QueryClass::Wildcard,
        }.serialise(&mut buf);

        let _ = ResourceRecord {
            name: domain("www.example.com."),
            rtype_with_data: RecordTypeWithData::CNAME {
                cname: domain("www.example.com."),
            },
            rclass: RecordClass::IN,
            ttl: 300,
        }.serialise(&mut buf);

        assert_eq!(
            vec![
                // QNAME
                3, 119, 119, 119, // "www"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
                // QTYPE
                0, 255,
                // QCLASS
                0, 255,
                // NAME: pointer to offset 0
                0b1100_0000, 0b0000_0000,
                // TYPE
                0, 5, // CNAME
                // CLASS
                0, 1, // IN
                // TTL
                0, 0, 1, 0b0010_1100, // 300
                // RDLENGTH
                0, 2,
                // RDATA: pointer to offset 0
                0b1100_0000, 0b0000_0000,
            ],
            buf.octets,
        );
    }

    #[test]
    #[rustfmt::skip]
    fn test_sets_rdlength() {
        let mut buf = WritableBuffer::default();
        buf.write_u8(1);
        buf.write_u8(2);
        buf.write_u8(3);
        buf.write_u8(4);

        let rr = ResourceRecord {
            name: domain("www.example.com."),
            rtype_with_data: RecordTypeWithData::MX {
                preference: 32,
                exchange: domain("mx.example.org."),
            },
            rclass: RecordClass::IN,
            ttl: 300,
        };
        let _ = rr.serialise(&mut buf);

        assert_eq!(
            vec![
                1, 2, 3, 4,
                // NAME
                3, 119, 119, 119, // "www"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
                // TYPE
                0b0000_0000, 0b0000_1111, // MX
                // CLASS
                0b0000_0000, 0b0000_0001, // IN
                // TTL
                0b0000_0000, 0b0000_0000, 0b0000_0001, 0b0010_1100, // 300
                // RDLENGTH
                0b0000_0000, 0b0001_0010, // 18 octets
                // RDATA
                0, 32, // preference
                2, 109, 120, // "mx"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 111, 114, 103, 0, // "org"
            ],
            buf.octets,
        );
    }

    #[test]
    fn test_standalone_rdata_is_pointer_free() {
        let rdata = RecordTypeWithData::CNAME {
            cname: domain("www.example.com."),
        };

        let first = rdata.to_standalone_rdata();
        let second = rdata.to_standalone_rdata();
        assert_eq!(first, second);
        assert_eq!(17, rdata.rdata_wire_len());
    }

    #[test]
    fn test_to_octets_bounded_drops_additional_then_authority() {
        let mut message = Message::from_question(
            1234,
            Question {
                name: domain("www.example.com."),
                qtype: QueryType::Record(RecordType::A),
                qclass: QueryClass::Record(RecordClass::IN),
            },
        );
        message.answers = vec![a_record("www.example.com.", std::net::Ipv4Addr::LOCALHOST)];
        message.authority = vec![ns_record("example.com.", "ns1.example.com.")];
        message.additional = vec![a_record("ns1.example.com.", std::net::Ipv4Addr::LOCALHOST)];

        let full = message.to_octets().unwrap();
        let bounded = message.to_octets_bounded(full.len() - 1).unwrap();
        assert!(bounded.len() < full.len());

        // shedding the additional section must not set TC
        let trimmed = Message::from_octets(&bounded).unwrap();
        assert!(!trimmed.header.is_truncated);
        assert_eq!(1, trimmed.answers.len());
        assert_eq!(0, trimmed.additional.len());

        // a tiny budget sheds answers and sets TC
        let tiny = message.to_octets_bounded(40).unwrap();
        let truncated = Message::from_octets(&tiny).unwrap();
        assert!(truncated.header.is_truncated);
        assert_eq!(0, truncated.answers.len());
    }
}
