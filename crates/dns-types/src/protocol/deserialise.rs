//! Deserialisation of DNS messages from the network.  See the `types`
//! module for details of the format.

use bytes::Bytes;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::protocol::types::*;

impl Message {
    /// # Errors
    ///
    /// If the message cannot be parsed.
    pub fn from_octets(octets: &[u8]) -> Result<Self, Error> {
        Self::deserialise(&mut ConsumableBuffer::new(octets))
    }

    /// # Errors
    ///
    /// If the message cannot be parsed.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let wire_header = WireHeader::deserialise(buffer)?;
        let mut questions = Vec::with_capacity(wire_header.qdcount.into());
        let mut answers = Vec::with_capacity(wire_header.ancount.into());
        let mut authority = Vec::with_capacity(wire_header.nscount.into());
        let mut additional = Vec::with_capacity(wire_header.arcount.into());

        for _ in 0..wire_header.qdcount {
            questions.push(Question::deserialise(wire_header.header.id, buffer)?);
        }
        for _ in 0..wire_header.ancount {
            answers.push(ResourceRecord::deserialise(wire_header.header.id, buffer)?);
        }
        for _ in 0..wire_header.nscount {
            authority.push(ResourceRecord::deserialise(wire_header.header.id, buffer)?);
        }
        for _ in 0..wire_header.arcount {
            additional.push(ResourceRecord::deserialise(wire_header.header.id, buffer)?);
        }

        Ok(Self {
            header: wire_header.header,
            questions,
            answers,
            authority,
            additional,
        })
    }
}

/// The header plus the section counts, which are only needed while
/// parsing.
pub struct WireHeader {
    pub header: Header,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl WireHeader {
    /// # Errors
    ///
    /// If the header is too short.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let id = buffer.next_u16().ok_or(Error::CompletelyBusted)?;
        let flags1 = buffer.next_u8().ok_or(Error::HeaderTooShort(id))?;
        let flags2 = buffer.next_u8().ok_or(Error::HeaderTooShort(id))?;
        let qdcount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;
        let ancount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;
        let nscount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;
        let arcount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;

        Ok(Self {
            header: Header {
                id,
                is_response: flags1 & HEADER_MASK_QR != 0,
                opcode: Opcode::from((flags1 & HEADER_MASK_OPCODE) >> HEADER_OFFSET_OPCODE),
                is_authoritative: flags1 & HEADER_MASK_AA != 0,
                is_truncated: flags1 & HEADER_MASK_TC != 0,
                recursion_desired: flags1 & HEADER_MASK_RD != 0,
                recursion_available: flags2 & HEADER_MASK_RA != 0,
                rcode: Rcode::from((flags2 & HEADER_MASK_RCODE) >> HEADER_OFFSET_RCODE),
            },
            qdcount,
            ancount,
            nscount,
            arcount,
        })
    }
}

impl Question {
    /// # Errors
    ///
    /// If the question cannot be parsed.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let name = DomainName::deserialise(id, buffer)?;
        let qtype = QueryType::deserialise(id, buffer)?;
        let qclass = QueryClass::deserialise(id, buffer)?;

        Ok(Self {
            name,
            qtype,
            qclass,
        })
    }
}

impl ResourceRecord {
    /// # Errors
    ///
    /// If the record cannot be parsed.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let name = DomainName::deserialise(id, buffer)?;
        let rtype = RecordType::deserialise(id, buffer)?;
        let rclass = RecordClass::deserialise(id, buffer)?;
        let ttl = buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?;
        let rdlength = buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?;

        let rdata_start = buffer.position;
        let rtype_with_data = RecordTypeWithData::deserialise_rdata(id, rtype, rdlength, buffer)?;
        let rdata_stop = buffer.position;

        if rdata_stop == rdata_start + (rdlength as usize) {
            Ok(Self {
                name,
                rtype_with_data,
                rclass,
                ttl,
            })
        } else {
            Err(Error::ResourceRecordInvalid(id))
        }
    }
}

impl RecordTypeWithData {
    /// Parse RDATA which is not embedded in a message, e.g. from the
    /// disk cache.  Names in such RDATA cannot contain compression
    /// pointers.
    ///
    /// # Errors
    ///
    /// If the RDATA cannot be parsed, or does not have exactly the
    /// given length.
    pub fn from_standalone_rdata(rtype: RecordType, octets: &[u8]) -> Result<Self, Error> {
        let rdlength =
            u16::try_from(octets.len()).map_err(|_| Error::ResourceRecordInvalid(0))?;
        let mut buffer = ConsumableBuffer::new(octets);
        let rtype_with_data = Self::deserialise_rdata(0, rtype, rdlength, &mut buffer)?;
        if buffer.position == octets.len() {
            Ok(rtype_with_data)
        } else {
            Err(Error::ResourceRecordInvalid(0))
        }
    }

    /// Parse the RDATA of a record of the given type.
    ///
    /// # Errors
    ///
    /// If the RDATA cannot be parsed.
    pub fn deserialise_rdata(
        id: u16,
        rtype: RecordType,
        rdlength: u16,
        buffer: &mut ConsumableBuffer,
    ) -> Result<Self, Error> {
        let rdata_start = buffer.position;

        let raw_rdata = |buffer: &mut ConsumableBuffer<'_>| {
            if let Some(octets) = buffer.take(rdlength as usize) {
                Ok(Bytes::copy_from_slice(octets))
            } else {
                Err(Error::ResourceRecordTooShort(id))
            }
        };

        // the remainder of the RDATA, for formats which end with a
        // variable-length field
        let rest = |buffer: &mut ConsumableBuffer<'_>| {
            let consumed = buffer.position - rdata_start;
            if let Some(remaining) = (rdlength as usize).checked_sub(consumed) {
                if let Some(octets) = buffer.take(remaining) {
                    return Ok(Bytes::copy_from_slice(octets));
                }
                return Err(Error::ResourceRecordTooShort(id));
            }
            Err(Error::ResourceRecordInvalid(id))
        };

        // for records which include domain names, deserialise them to
        // expand pointers.
        let rtype_with_data = match rtype {
            RecordType::A => RecordTypeWithData::A {
                address: Ipv4Addr::from(
                    buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?,
                ),
            },
            RecordType::NS => RecordTypeWithData::NS {
                nsdname: DomainName::deserialise(id, buffer)?,
            },
            RecordType::MD => RecordTypeWithData::MD {
                madname: DomainName::deserialise(id, buffer)?,
            },
            RecordType::MF => RecordTypeWithData::MF {
                madname: DomainName::deserialise(id, buffer)?,
            },
            RecordType::CNAME => RecordTypeWithData::CNAME {
                cname: DomainName::deserialise(id, buffer)?,
            },
            RecordType::SOA => RecordTypeWithData::SOA {
                mname: DomainName::deserialise(id, buffer)?,
                rname: DomainName::deserialise(id, buffer)?,
                serial: buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?,
                refresh: buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?,
                retry: buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?,
                expire: buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?,
                minimum: buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?,
            },
            RecordType::MB => RecordTypeWithData::MB {
                madname: DomainName::deserialise(id, buffer)?,
            },
            RecordType::MG => RecordTypeWithData::MG {
                mgmname: DomainName::deserialise(id, buffer)?,
            },
            RecordType::MR => RecordTypeWithData::MR {
                newname: DomainName::deserialise(id, buffer)?,
            },
            RecordType::NULL => RecordTypeWithData::NULL {
                octets: raw_rdata(buffer)?,
            },
            RecordType::WKS => RecordTypeWithData::WKS {
                octets: raw_rdata(buffer)?,
            },
            RecordType::PTR => RecordTypeWithData::PTR {
                ptrdname: DomainName::deserialise(id, buffer)?,
            },
            RecordType::HINFO => RecordTypeWithData::HINFO {
                octets: raw_rdata(buffer)?,
            },
            RecordType::MINFO => RecordTypeWithData::MINFO {
                rmailbx: DomainName::deserialise(id, buffer)?,
                emailbx: DomainName::deserialise(id, buffer)?,
            },
            RecordType::MX => RecordTypeWithData::MX {
                preference: buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                exchange: DomainName::deserialise(id, buffer)?,
            },
            RecordType::TXT => RecordTypeWithData::TXT {
                octets: raw_rdata(buffer)?,
            },
            RecordType::RP => RecordTypeWithData::RP {
                mbox: DomainName::deserialise(id, buffer)?,
                txt: DomainName::deserialise(id, buffer)?,
            },
            RecordType::AFSDB => RecordTypeWithData::AFSDB {
                subtype: buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                hostname: DomainName::deserialise(id, buffer)?,
            },
            RecordType::RT => RecordTypeWithData::RT {
                preference: buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                intermediate: DomainName::deserialise(id, buffer)?,
            },
            RecordType::PX => RecordTypeWithData::PX {
                preference: buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                map822: DomainName::deserialise(id, buffer)?,
                mapx400: DomainName::deserialise(id, buffer)?,
            },
            RecordType::AAAA => RecordTypeWithData::AAAA {
                address: Ipv6Addr::new(
                    buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                    buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                    buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                    buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                    buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                    buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                    buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                    buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                ),
            },
            RecordType::LOC => RecordTypeWithData::LOC {
                octets: raw_rdata(buffer)?,
            },
            RecordType::NXT => RecordTypeWithData::NXT {
                next: DomainName::deserialise(id, buffer)?,
                bitmap: rest(buffer)?,
            },
            RecordType::SRV => RecordTypeWithData::SRV {
                priority: buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                weight: buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                port: buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                target: DomainName::deserialise(id, buffer)?,
            },
            RecordType::NAPTR => RecordTypeWithData::NAPTR {
                order: buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                preference: buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                flags: character_string(id, buffer)?,
                services: character_string(id, buffer)?,
                regexp: character_string(id, buffer)?,
                replacement: DomainName::deserialise(id, buffer)?,
            },
            RecordType::KX => RecordTypeWithData::KX {
                preference: buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                exchanger: DomainName::deserialise(id, buffer)?,
            },
            RecordType::OPT => RecordTypeWithData::OPT {
                octets: raw_rdata(buffer)?,
            },
            RecordType::IPSECKEY => {
                let precedence = buffer.next_u8().ok_or(Error::ResourceRecordTooShort(id))?;
                let gateway_type = buffer.next_u8().ok_or(Error::ResourceRecordTooShort(id))?;
                let algorithm = buffer.next_u8().ok_or(Error::ResourceRecordTooShort(id))?;
                let gateway = match gateway_type {
                    0 => IpseckeyGateway::None,
                    1 => IpseckeyGateway::V4(Ipv4Addr::from(
                        buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?,
                    )),
                    2 => IpseckeyGateway::V6(Ipv6Addr::new(
                        buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                        buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                        buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                        buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                        buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                        buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                        buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                        buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                    )),
                    3 => IpseckeyGateway::Name(DomainName::deserialise(id, buffer)?),
                    _ => return Err(Error::ResourceRecordInvalid(id)),
                };
                RecordTypeWithData::IPSECKEY {
                    precedence,
                    gateway_type,
                    algorithm,
                    gateway,
                    public_key: rest(buffer)?,
                }
            }
            RecordType::RRSIG => RecordTypeWithData::RRSIG {
                type_covered: buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                algorithm: buffer.next_u8().ok_or(Error::ResourceRecordTooShort(id))?,
                labels: buffer.next_u8().ok_or(Error::ResourceRecordTooShort(id))?,
                original_ttl: buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?,
                expiration: buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?,
                inception: buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?,
                key_tag: buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                signer: DomainName::deserialise(id, buffer)?,
                signature: rest(buffer)?,
            },
            RecordType::NSEC => RecordTypeWithData::NSEC {
                next: DomainName::deserialise(id, buffer)?,
                type_bitmaps: rest(buffer)?,
            },
            RecordType::SPF => RecordTypeWithData::SPF {
                octets: raw_rdata(buffer)?,
            },
            RecordType::Unknown(tag) => RecordTypeWithData::Unknown {
                tag,
                octets: raw_rdata(buffer)?,
            },
        };

        Ok(rtype_with_data)
    }
}

/// Parse a `<character-string>`: one length octet followed by that
/// many octets.
fn character_string(id: u16, buffer: &mut ConsumableBuffer) -> Result<Bytes, Error> {
    let len = buffer.next_u8().ok_or(Error::ResourceRecordTooShort(id))?;
    if let Some(octets) = buffer.take(len as usize) {
        Ok(Bytes::copy_from_slice(octets))
    } else {
        Err(Error::ResourceRecordTooShort(id))
    }
}

impl DomainName {
    /// Decode a (possibly compressed) name.  A label length octet with
    /// top bits `00` introduces a literal label, top bits `11` a 14
    /// bit pointer back into the message; the other prefixes
    /// (bit-string and extended labels) are not supported.  A chain of
    /// pointers may take at most `POINTER_HOP_LIMIT` hops.
    ///
    /// # Errors
    ///
    /// If the domain cannot be parsed.
    #[allow(clippy::missing_panics_doc)]
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let mut labels = Vec::<Label>::with_capacity(5);
        let mut wire_len = 0;
        let mut hops = 0;
        let mut jumped = false;
        let mut pos = buffer.position;

        loop {
            // running out of data before the first pointer means the
            // message was cut short; a bad pointer target is
            // malformed.
            let out_of_data = if jumped {
                Error::DomainPointerInvalid(id)
            } else {
                Error::DomainTooShort(id)
            };

            let size = *buffer.octets.get(pos).ok_or(out_of_data)?;
            pos += 1;

            if usize::from(size) <= LABEL_MAX_LEN {
                wire_len += 1 + usize::from(size);
                if wire_len > DOMAINNAME_MAX_LEN {
                    return Err(Error::DomainTooLong(id));
                }

                if size == 0 {
                    labels.push(Label::new());
                    break;
                }

                let os = buffer
                    .octets
                    .get(pos..pos + size as usize)
                    .ok_or(out_of_data)?;
                // safe because of the bounds check above
                labels.push(Label::try_from(os).unwrap());
                pos += size as usize;
            } else if size >= 192 {
                let lo = *buffer.octets.get(pos).ok_or(out_of_data)?;
                pos += 1;

                if !jumped {
                    // the bytes after the pointer belong to the next
                    // field, so commit the cursor now.
                    buffer.position = pos;
                    jumped = true;
                }

                hops += 1;
                if hops > POINTER_HOP_LIMIT {
                    return Err(Error::TooManyPointers(id));
                }

                let ptr = usize::from(u16::from_be_bytes([size & 0b0011_1111, lo]));
                if ptr >= buffer.octets.len() {
                    return Err(Error::DomainPointerInvalid(id));
                }
                pos = ptr;
            } else {
                return Err(Error::DomainLabelInvalid(id));
            }
        }

        if !jumped {
            buffer.position = pos;
        }

        DomainName::from_labels(labels).ok_or(Error::DomainTooLong(id))
    }
}

impl QueryType {
    /// # Errors
    ///
    /// If the query type is too short.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let value = buffer.next_u16().ok_or(Error::QuestionTooShort(id))?;
        Ok(Self::from(value))
    }
}

impl QueryClass {
    /// # Errors
    ///
    /// If the query class is too short.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let value = buffer.next_u16().ok_or(Error::QuestionTooShort(id))?;
        Ok(Self::from(value))
    }
}

impl RecordType {
    /// # Errors
    ///
    /// If the record type is too short.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let value = buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?;
        Ok(Self::from(value))
    }
}

impl RecordClass {
    /// # Errors
    ///
    /// If the record class is too short.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let value = buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?;
        Ok(Self::from(value))
    }
}

/// Errors encountered when parsing a datagram.  In all the errors
/// which have a `u16` parameter, that is the ID from the header - so
/// that an error response can be sent.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// The datagram is not even 2 octets long, so it doesn't even
    /// contain a valid ID.  An error cannot even be sent back to the
    /// client in this case as, without an ID, it cannot be linked
    /// with the correct query.
    CompletelyBusted,

    /// The header is missing one or more required fields.
    HeaderTooShort(u16),

    /// A question ends with an incomplete field.
    QuestionTooShort(u16),

    /// A resource record ends with an incomplete field.
    ResourceRecordTooShort(u16),

    /// A resource record is the wrong format.
    ResourceRecordInvalid(u16),

    /// A domain is incomplete.
    DomainTooShort(u16),

    /// A domain is over 255 octets in size.
    DomainTooLong(u16),

    /// A domain pointer points outside the message.
    DomainPointerInvalid(u16),

    /// A domain name chains through too many pointers.
    TooManyPointers(u16),

    /// A domain label is longer than 63 octets, but not a pointer.
    DomainLabelInvalid(u16),
}

impl Error {
    pub fn id(self) -> Option<u16> {
        match self {
            Error::CompletelyBusted => None,
            Error::HeaderTooShort(id) => Some(id),
            Error::QuestionTooShort(id) => Some(id),
            Error::ResourceRecordTooShort(id) => Some(id),
            Error::ResourceRecordInvalid(id) => Some(id),
            Error::DomainTooShort(id) => Some(id),
            Error::DomainTooLong(id) => Some(id),
            Error::DomainPointerInvalid(id) => Some(id),
            Error::TooManyPointers(id) => Some(id),
            Error::DomainLabelInvalid(id) => Some(id),
        }
    }

    /// Whether this error means the message was cut short in transit
    /// (as opposed to being malformed).  Truncated upstream replies
    /// are retried over TCP rather than discarded.
    pub fn is_truncation(self) -> bool {
        matches!(
            self,
            Error::CompletelyBusted
                | Error::HeaderTooShort(_)
                | Error::QuestionTooShort(_)
                | Error::ResourceRecordTooShort(_)
                | Error::DomainTooShort(_)
        )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::CompletelyBusted => write!(f, "message too short to even have an ID"),
            Error::HeaderTooShort(_) => write!(f, "header too short"),
            Error::QuestionTooShort(_) => write!(f, "question too short"),
            Error::ResourceRecordTooShort(_) => write!(f, "resource record too short"),
            Error::ResourceRecordInvalid(_) => write!(f, "resource record malformed"),
            Error::DomainTooShort(_) => write!(f, "domain name cut short"),
            Error::DomainTooLong(_) => write!(f, "domain name over 255 octets"),
            Error::DomainPointerInvalid(_) => write!(f, "compression pointer outside message"),
            Error::TooManyPointers(_) => write!(f, "compression pointer chain too long"),
            Error::DomainLabelInvalid(_) => write!(f, "unsupported label type"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// A buffer which will be consumed by the parsing process.
pub struct ConsumableBuffer<'a> {
    octets: &'a [u8],
    position: usize,
}

impl<'a> ConsumableBuffer<'a> {
    pub fn new(octets: &'a [u8]) -> Self {
        Self {
            octets,
            position: 0,
        }
    }

    pub fn next_u8(&mut self) -> Option<u8> {
        if self.octets.len() > self.position {
            let a = self.octets[self.position];
            self.position += 1;
            Some(a)
        } else {
            None
        }
    }

    pub fn next_u16(&mut self) -> Option<u16> {
        if self.octets.len() > self.position + 1 {
            let a = self.octets[self.position];
            let b = self.octets[self.position + 1];
            self.position += 2;
            Some(u16::from_be_bytes([a, b]))
        } else {
            None
        }
    }

    pub fn next_u32(&mut self) -> Option<u32> {
        if self.octets.len() > self.position + 3 {
            let a = self.octets[self.position];
            let b = self.octets[self.position + 1];
            let c = self.octets[self.position + 2];
            let d = self.octets[self.position + 3];
            self.position += 4;
            Some(u32::from_be_bytes([a, b, c, d]))
        } else {
            None
        }
    }

    pub fn take(&mut self, size: usize) -> Option<&'a [u8]> {
        if self.octets.len() >= self.position + size {
            let slice = &self.octets[self.position..self.position + size];
            self.position += size;
            Some(slice)
        } else {
            None
        }
    }
}
