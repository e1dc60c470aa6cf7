//! Deserialisation of DNS messages from the network.  See the `types`
//! module for details of the format.

use bytes::Bytes;
use std::fmt;
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
        let id = wire_header.header.id;

        // don't trust the counts for preallocation: a 12 octet
        // datagram can claim 65535 records in every section.
        let mut questions = Vec::with_capacity(1);
        let mut answers = Vec::new();
        let mut authorities = Vec::new();
        let mut additionals = Vec::new();

        for _ in 0..wire_header.qdcount {
            questions.push(Question::deserialise(id, buffer)?);
        }
        for _ in 0..wire_header.ancount {
            answers.push(ResourceRecord::deserialise(id, buffer)?);
        }
        for _ in 0..wire_header.nscount {
            authorities.push(ResourceRecord::deserialise(id, buffer)?);
        }
        for _ in 0..wire_header.arcount {
            additionals.push(ResourceRecord::deserialise(id, buffer)?);
        }

        Ok(Self {
            header: wire_header.header,
            questions,
            answers,
            authorities,
            additionals,
        })
    }
}

/// The header as it appears on the wire: with the section counts
/// which drive the rest of the parse.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
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
        let id = buffer
            .next_u16()
            .ok_or(Error::without_id(Malformation::HeaderTooShort))?;
        let too_short = || Error::new(id, Malformation::HeaderTooShort);

        let flags1 = buffer.next_u8().ok_or_else(too_short)?;
        let flags2 = buffer.next_u8().ok_or_else(too_short)?;
        let qdcount = buffer.next_u16().ok_or_else(too_short)?;
        let ancount = buffer.next_u16().ok_or_else(too_short)?;
        let nscount = buffer.next_u16().ok_or_else(too_short)?;
        let arcount = buffer.next_u16().ok_or_else(too_short)?;

        Ok(Self {
            header: Header {
                id,
                is_response: flags1 & HEADER_MASK_QR != 0,
                opcode: Opcode::from((flags1 & HEADER_MASK_OPCODE) >> HEADER_OFFSET_OPCODE),
                is_authoritative: flags1 & HEADER_MASK_AA != 0,
                is_truncated: flags1 & HEADER_MASK_TC != 0,
                recursion_desired: flags1 & HEADER_MASK_RD != 0,
                recursion_available: flags2 & HEADER_MASK_RA != 0,
                rcode: Rcode::from(flags2 & HEADER_MASK_RCODE),
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
        let too_short = || Error::new(id, Malformation::QuestionTooShort);

        let name = DomainName::deserialise(id, buffer)?;
        let qtype = QueryType::from(buffer.next_u16().ok_or_else(too_short)?);
        let qclass = QueryClass::from(buffer.next_u16().ok_or_else(too_short)?);

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
        let too_short = || Error::new(id, Malformation::ResourceRecordTooShort);

        let name = DomainName::deserialise(id, buffer)?;
        let rtype = RecordType::from(buffer.next_u16().ok_or_else(too_short)?);
        let rclass = RecordClass::from(buffer.next_u16().ok_or_else(too_short)?);
        let ttl = buffer.next_u32().ok_or_else(too_short)?;
        let rdlength = buffer.next_u16().ok_or_else(too_short)?;

        let rdata_start = buffer.position;

        let mut raw_rdata = || {
            buffer
                .take(rdlength as usize)
                .map(Bytes::copy_from_slice)
                .ok_or_else(too_short)
        };

        // for records which include domain names, deserialise them to
        // expand pointers.
        let rtype_with_data = match rtype {
            RecordType::A => RecordTypeWithData::A {
                address: Ipv4Addr::from(buffer.next_u32().ok_or_else(too_short)?),
            },
            RecordType::NS => RecordTypeWithData::NS {
                nsdname: DomainName::deserialise(id, buffer)?,
            },
            RecordType::CNAME => RecordTypeWithData::CNAME {
                cname: DomainName::deserialise(id, buffer)?,
            },
            RecordType::SOA => RecordTypeWithData::SOA {
                mname: DomainName::deserialise(id, buffer)?,
                rname: DomainName::deserialise(id, buffer)?,
                serial: buffer.next_u32().ok_or_else(too_short)?,
                refresh: buffer.next_u32().ok_or_else(too_short)?,
                retry: buffer.next_u32().ok_or_else(too_short)?,
                expire: buffer.next_u32().ok_or_else(too_short)?,
                minimum: buffer.next_u32().ok_or_else(too_short)?,
            },
            RecordType::PTR => RecordTypeWithData::PTR {
                ptrdname: DomainName::deserialise(id, buffer)?,
            },
            RecordType::MX => RecordTypeWithData::MX {
                preference: buffer.next_u16().ok_or_else(too_short)?,
                exchange: DomainName::deserialise(id, buffer)?,
            },
            RecordType::TXT => RecordTypeWithData::TXT {
                octets: raw_rdata()?,
            },
            RecordType::AAAA => {
                let octets = buffer.take(16).ok_or_else(too_short)?;
                let mut address = [0; 16];
                address.copy_from_slice(octets);
                RecordTypeWithData::AAAA {
                    address: Ipv6Addr::from(address),
                }
            }
            RecordType::SRV => RecordTypeWithData::SRV {
                priority: buffer.next_u16().ok_or_else(too_short)?,
                weight: buffer.next_u16().ok_or_else(too_short)?,
                port: buffer.next_u16().ok_or_else(too_short)?,
                target: DomainName::deserialise(id, buffer)?,
            },
            RecordType::Unknown(tag) => RecordTypeWithData::Unknown {
                tag,
                octets: raw_rdata()?,
            },
        };

        if buffer.position == rdata_start + (rdlength as usize) {
            Ok(Self {
                name,
                rtype_with_data,
                rclass,
                ttl,
            })
        } else {
            Err(Error::new(id, Malformation::ResourceRecordInvalid))
        }
    }
}

impl DomainName {
    /// Names may end in a compression pointer, which must point to an
    /// offset strictly before the start of the labels read so far.
    /// Pointers are followed in a loop, at most `POINTER_JUMPS_MAX`
    /// times, so a chain of pointers cannot exhaust the stack.
    ///
    /// # Errors
    ///
    /// If the domain cannot be parsed.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let mut labels = Vec::<Label>::with_capacity(5);
        let mut len = 0;
        let mut start = buffer.position;
        let mut jumps = 0;
        // once a pointer has been followed the rest of the name is read
        // from here, and `buffer` stays just after the first pointer
        let mut jumped: Option<ConsumableBuffer> = None;

        loop {
            let cursor = match jumped.as_mut() {
                Some(cursor) => cursor,
                None => &mut *buffer,
            };

            let size = cursor
                .next_u8()
                .ok_or(Error::new(id, Malformation::DomainTooShort))?;

            if usize::from(size) <= LABEL_MAX_LEN {
                len += 1 + usize::from(size);
                if len > DOMAINNAME_MAX_LEN {
                    return Err(Error::new(id, Malformation::DomainTooLong));
                }

                if size == 0 {
                    labels.push(Label::new());
                    break;
                }

                let os = cursor
                    .take(size as usize)
                    .ok_or(Error::new(id, Malformation::DomainTooShort))?;
                let label = Label::try_from(os)
                    .map_err(|_| Error::new(id, Malformation::DomainLabelInvalid))?;
                labels.push(label);
            } else if size >= 0b1100_0000 {
                let hi = size & 0b0011_1111;
                let lo = cursor
                    .next_u8()
                    .ok_or(Error::new(id, Malformation::DomainTooShort))?;
                let ptr = usize::from(u16::from_be_bytes([hi, lo]));

                jumps += 1;
                if ptr >= start || jumps > POINTER_JUMPS_MAX {
                    return Err(Error::new(id, Malformation::DomainPointerInvalid));
                }

                start = ptr;
                jumped = Some(cursor.at_offset(ptr));
            } else {
                return Err(Error::new(id, Malformation::DomainLabelInvalid));
            }
        }

        Ok(DomainName { labels, len })
    }
}

/// Most compression pointers followed while reading one name.  Every
/// label takes at least two octets, so a valid name never needs more.
pub const POINTER_JUMPS_MAX: usize = DOMAINNAME_MAX_LEN / 2;

/// A message could not be parsed.  If the header ID could be read it
/// is included, but the message is never answered.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Error {
    pub id: Option<u16>,
    pub reason: Malformation,
}

impl Error {
    pub fn new(id: u16, reason: Malformation) -> Self {
        Self {
            id: Some(id),
            reason,
        }
    }

    pub fn without_id(reason: Malformation) -> Self {
        Self { id: None, reason }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "malformed message (id {id}): {}", self.reason),
            None => write!(f, "malformed message: {}", self.reason),
        }
    }
}

impl std::error::Error for Error {}

/// What was wrong with a malformed message.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Malformation {
    /// The header is missing one or more required fields.
    HeaderTooShort,

    /// A question ends with an incomplete field.
    QuestionTooShort,

    /// A resource record ends with an incomplete field.
    ResourceRecordTooShort,

    /// The RDATA does not match the RDLENGTH.
    ResourceRecordInvalid,

    /// A domain runs past the end of the buffer.
    DomainTooShort,

    /// A domain is over 255 octets in size.
    DomainTooLong,

    /// A domain pointer points to or after the current name.
    DomainPointerInvalid,

    /// A label length octet is neither a length nor a pointer.
    DomainLabelInvalid,
}

impl Malformation {
    pub fn as_str(self) -> &'static str {
        match self {
            Malformation::HeaderTooShort => "header_too_short",
            Malformation::QuestionTooShort => "question_too_short",
            Malformation::ResourceRecordTooShort => "rr_too_short",
            Malformation::ResourceRecordInvalid => "rr_invalid",
            Malformation::DomainTooShort => "domain_too_short",
            Malformation::DomainTooLong => "domain_too_long",
            Malformation::DomainPointerInvalid => "domain_pointer_invalid",
            Malformation::DomainLabelInvalid => "domain_label_invalid",
        }
    }
}

impl fmt::Display for Malformation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
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

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn next_u8(&mut self) -> Option<u8> {
        let octet = *self.octets.get(self.position)?;
        self.position += 1;
        Some(octet)
    }

    pub fn next_u16(&mut self) -> Option<u16> {
        let octets = self.take(2)?;
        Some(u16::from_be_bytes([octets[0], octets[1]]))
    }

    pub fn next_u32(&mut self) -> Option<u32> {
        let octets = self.take(4)?;
        Some(u32::from_be_bytes([
            octets[0], octets[1], octets[2], octets[3],
        ]))
    }

    pub fn take(&mut self, size: usize) -> Option<&'a [u8]> {
        let end = self.position.checked_add(size)?;
        let slice = self.octets.get(self.position..end)?;
        self.position = end;
        Some(slice)
    }

    /// A new buffer over the same octets, starting at `position`.
    pub fn at_offset(&self, position: usize) -> ConsumableBuffer<'a> {
        Self {
            octets: self.octets,
            position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::test_util::*;

    #[test]
    #[rustfmt::skip]
    fn decodes_query() {
        let octets = [
            // HEADER
            0x12, 0x34, // ID
            0b0000_0001, 0, // RD
            0, 1, 0, 0, 0, 0, 0, 0,
            // QNAME
            4, 103, 111, 111, 100, // "good"
            7, 101, 120, 97, 109, 112, 108, 101, 0, // "example"
            // QTYPE, QCLASS
            0, 1, 0, 1,
        ];

        let message = Message::from_octets(&octets).unwrap();
        assert_eq!(0x1234, message.header.id);
        assert!(!message.header.is_response);
        assert!(message.header.recursion_desired);
        assert_eq!(Opcode::Standard, message.header.opcode);
        assert_eq!(vec![question("good.example.", RecordType::A)], message.questions);
    }

    #[test]
    #[rustfmt::skip]
    fn follows_backward_pointer() {
        let octets = [
            3, 99, 111, 109, 0, // "com"
            7, 101, 120, 97, 109, 112, 108, 101, // "example"
            0b1100_0000, 0, // pointer to "com"
        ];

        let mut buffer = ConsumableBuffer::new(&octets).at_offset(5);
        assert_eq!(
            Ok(domain("example.com.")),
            DomainName::deserialise(0, &mut buffer)
        );
        assert_eq!(octets.len(), buffer.position());
    }

    #[test]
    #[rustfmt::skip]
    fn rejects_forward_pointer() {
        let octets = [
            0b1100_0000, 2, // pointer to after itself
            3, 99, 111, 109, 0, // "com"
        ];

        assert_eq!(
            Err(Error::new(0, Malformation::DomainPointerInvalid)),
            DomainName::deserialise(0, &mut ConsumableBuffer::new(&octets))
        );
    }

    #[test]
    fn rejects_self_pointer() {
        let octets = [0b1100_0000, 0];

        assert_eq!(
            Err(Error::new(0, Malformation::DomainPointerInvalid)),
            DomainName::deserialise(0, &mut ConsumableBuffer::new(&octets))
        );
    }

    #[test]
    #[rustfmt::skip]
    fn rejects_pointer_into_own_labels() {
        let octets = [
            3, 99, 111, 109, // "com"
            0b1100_0000, 0, // pointer back to the start of this same name
        ];

        assert_eq!(
            Err(Error::new(0, Malformation::DomainPointerInvalid)),
            DomainName::deserialise(0, &mut ConsumableBuffer::new(&octets))
        );
    }

    #[test]
    #[rustfmt::skip]
    fn follows_pointer_to_pointer() {
        let octets = [
            3, 99, 111, 109, 0, // "com"
            7, 101, 120, 97, 109, 112, 108, 101, // "example"
            0b1100_0000, 0, // pointer to "com"
            3, 119, 119, 119, // "www"
            0b1100_0000, 5, // pointer to "example"
        ];

        let mut buffer = ConsumableBuffer::new(&octets).at_offset(15);
        assert_eq!(
            Ok(domain("www.example.com.")),
            DomainName::deserialise(0, &mut buffer)
        );
        assert_eq!(octets.len(), buffer.position());
    }

    /// "a." followed by `count` pointers, each to the one before.
    fn pointer_chain(count: usize) -> Vec<u8> {
        let mut octets = vec![1, b'a', 0];
        let mut previous = 0;
        for _ in 0..count {
            let here = octets.len();
            octets.extend_from_slice(&(0xc000 | u16::try_from(previous).unwrap()).to_be_bytes());
            previous = here;
        }
        octets
    }

    #[test]
    fn follows_short_pointer_chain() {
        let octets = pointer_chain(10);

        let mut buffer = ConsumableBuffer::new(&octets).at_offset(octets.len() - 2);
        assert_eq!(Ok(domain("a.")), DomainName::deserialise(0, &mut buffer));
        assert_eq!(octets.len(), buffer.position());
    }

    #[test]
    fn rejects_long_pointer_chain() {
        let octets = pointer_chain(8000);

        let mut buffer = ConsumableBuffer::new(&octets).at_offset(octets.len() - 2);
        assert_eq!(
            Err(Error::new(0, Malformation::DomainPointerInvalid)),
            DomainName::deserialise(0, &mut buffer)
        );
    }

    #[test]
    fn rejects_label_past_end_of_buffer() {
        let octets = [10, 97, 98, 99];

        assert_eq!(
            Err(Error::new(7, Malformation::DomainTooShort)),
            DomainName::deserialise(7, &mut ConsumableBuffer::new(&octets))
        );
    }

    #[test]
    fn rejects_reserved_label_type() {
        let octets = [0b0100_0000, 0];

        assert_eq!(
            Err(Error::new(0, Malformation::DomainLabelInvalid)),
            DomainName::deserialise(0, &mut ConsumableBuffer::new(&octets))
        );
    }

    #[test]
    fn rejects_overlong_name() {
        let mut octets = Vec::new();
        for _ in 0..5 {
            octets.push(60);
            octets.extend_from_slice(&[b'a'; 60]);
        }
        octets.push(0);

        assert_eq!(
            Err(Error::new(0, Malformation::DomainTooLong)),
            DomainName::deserialise(0, &mut ConsumableBuffer::new(&octets))
        );
    }

    #[test]
    fn accepts_255_octet_name() {
        // 4 * (1 + 62) + 1 + 1 + 1 = 255
        let mut octets = Vec::new();
        for _ in 0..4 {
            octets.push(62);
            octets.extend_from_slice(&[b'a'; 62]);
        }
        octets.push(1);
        octets.push(b'b');
        octets.push(0);

        let name = DomainName::deserialise(0, &mut ConsumableBuffer::new(&octets)).unwrap();
        assert_eq!(DOMAINNAME_MAX_LEN, name.len);
    }

    #[test]
    fn rejects_truncated_header() {
        assert_eq!(
            Err(Error::without_id(Malformation::HeaderTooShort)),
            Message::from_octets(&[1])
        );
        assert_eq!(
            Err(Error::new(0x0102, Malformation::HeaderTooShort)),
            Message::from_octets(&[1, 2, 0, 0, 0])
        );
    }

    #[test]
    #[rustfmt::skip]
    fn rejects_truncated_question() {
        let octets = [
            0, 1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0,
            3, 99, 111, 109, 0, // "com"
            0, 1, // QTYPE, but no QCLASS
        ];

        assert_eq!(
            Err(Error::new(1, Malformation::QuestionTooShort)),
            Message::from_octets(&octets)
        );
    }

    #[test]
    #[rustfmt::skip]
    fn rejects_rdlength_mismatch() {
        let octets = [
            0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0,
            0, // root
            0, 5, 0, 1, // CNAME IN
            0, 0, 0, 0, // TTL
            0, 3, // RDLENGTH, but the name is 5 octets
            3, 99, 111, 109, 0, // "com"
        ];

        assert_eq!(
            Err(Error::new(0, Malformation::ResourceRecordInvalid)),
            Message::from_octets(&octets)
        );
    }

    #[test]
    fn lying_counts_do_not_allocate_or_panic() {
        let octets = [0, 0, 0, 0, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff];

        assert_eq!(
            Err(Error::new(0, Malformation::DomainTooShort)),
            Message::from_octets(&octets)
        );
    }
}
