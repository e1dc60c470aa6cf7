//! Serialisation of DNS messages to the wire format.  See the `types`
//! module for details of the format.

use bytes::{BufMut, BytesMut};
use std::collections::HashMap;

use crate::protocol::types::*;

/// Largest message which can be sent over UDP without EDNS.
pub const UDP_MESSAGE_MAX_LEN: usize = 512;

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

    /// Serialise, dropping records from the end of the message until
    /// it fits into `limit` octets.  If anything had to be dropped
    /// the TC flag is set.  The header and question section are never
    /// dropped.
    ///
    /// # Errors
    ///
    /// If the message is invalid, or if the header and question alone
    /// do not fit.
    pub fn to_octets_within(&self, limit: usize) -> Result<BytesMut, Error> {
        let octets = self.to_octets()?;
        if octets.len() <= limit {
            return Ok(octets);
        }

        let mut truncated = self.clone();
        truncated.header.is_truncated = true;
        loop {
            if truncated.additionals.pop().is_none()
                && truncated.authorities.pop().is_none()
                && truncated.answers.pop().is_none()
            {
                return Err(Error::TooLong { limit });
            }

            let octets = truncated.to_octets()?;
            if octets.len() <= limit {
                return Ok(octets);
            }
        }
    }

    /// # Errors
    ///
    /// If the message is invalid (the `Message` type permits more
    /// states than strictly allowed).
    pub fn serialise(&self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        let qdcount = usize_to_u16(self.questions.len())?;
        let ancount = usize_to_u16(self.answers.len())?;
        let nscount = usize_to_u16(self.authorities.len())?;
        let arcount = usize_to_u16(self.additionals.len())?;

        self.header.serialise(buffer);
        buffer.write_u16(qdcount);
        buffer.write_u16(ancount);
        buffer.write_u16(nscount);
        buffer.write_u16(arcount);

        for question in &self.questions {
            question.serialise(buffer);
        }
        for rr in self
            .answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.additionals)
        {
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
        let field_rcode = HEADER_MASK_RCODE & u8::from(self.rcode);

        buffer.write_u16(self.id);
        buffer.write_u8(flag_qr | field_opcode | flag_aa | flag_tc | flag_rd);
        buffer.write_u8(flag_ra | field_rcode);
    }
}

impl Question {
    pub fn serialise(&self, buffer: &mut WritableBuffer) {
        self.name.serialise(buffer, true);
        buffer.write_u16(self.qtype.into());
        buffer.write_u16(self.qclass.into());
    }
}

impl ResourceRecord {
    /// # Errors
    ///
    /// If the RDATA is too long.
    pub fn serialise(&self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        self.name.serialise(buffer, true);
        buffer.write_u16(self.rtype_with_data.rtype().into());
        buffer.write_u16(self.rclass.into());
        buffer.write_u32(self.ttl);

        // filled in below
        let rdlength_index = buffer.index();
        buffer.write_u16(0);

        match &self.rtype_with_data {
            RecordTypeWithData::A { address } => buffer.write_octets(&address.octets()),
            RecordTypeWithData::NS { nsdname } => nsdname.serialise(buffer, false),
            RecordTypeWithData::CNAME { cname } => cname.serialise(buffer, false),
            RecordTypeWithData::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                mname.serialise(buffer, false);
                rname.serialise(buffer, false);
                buffer.write_u32(*serial);
                buffer.write_u32(*refresh);
                buffer.write_u32(*retry);
                buffer.write_u32(*expire);
                buffer.write_u32(*minimum);
            }
            RecordTypeWithData::PTR { ptrdname } => ptrdname.serialise(buffer, false),
            RecordTypeWithData::MX {
                preference,
                exchange,
            } => {
                buffer.write_u16(*preference);
                exchange.serialise(buffer, false);
            }
            RecordTypeWithData::TXT { octets } => buffer.write_octets(octets),
            RecordTypeWithData::AAAA { address } => buffer.write_octets(&address.octets()),
            RecordTypeWithData::SRV {
                priority,
                weight,
                port,
                target,
            } => {
                buffer.write_u16(*priority);
                buffer.write_u16(*weight);
                buffer.write_u16(*port);
                target.serialise(buffer, false);
            }
            RecordTypeWithData::Unknown { octets, .. } => buffer.write_octets(octets),
        };

        // -2 so we don't also include the 2 octets for the rdlength
        let rdlength = usize_to_u16(buffer.index() - rdlength_index - 2)?;
        let [hi, lo] = rdlength.to_be_bytes();
        buffer.octets[rdlength_index] = hi;
        buffer.octets[rdlength_index + 1] = lo;

        Ok(())
    }
}

impl DomainName {
    /// Names in RDATA are written uncompressed (`compress = false`),
    /// but are still remembered so later owner names can point at
    /// them.
    pub fn serialise(&self, buffer: &mut WritableBuffer, compress: bool) {
        if compress {
            if let Some(ptr) = buffer.name_pointer(self) {
                buffer.write_u16(ptr);
                return;
            }
        }

        buffer.memoise_name(self);
        for label in &self.labels {
            buffer.write_u8(label.len());
            buffer.write_octets(label.octets());
        }
    }
}

/// Errors encountered when serialising a message.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// A counter does not fit in the desired width.
    CounterTooLarge { counter: usize, bits: u32 },

    /// The message cannot be made to fit the size limit, even with
    /// every record dropped.
    TooLong { limit: usize },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::CounterTooLarge { counter, bits } => {
                write!(f, "'{counter}' cannot be converted to a u{bits}")
            }
            Error::TooLong { limit } => {
                write!(f, "message does not fit in {limit} octets")
            }
        }
    }
}

impl std::error::Error for Error {}

/// A buffer which can be written to, for serialisation purposes.
pub struct WritableBuffer {
    pub octets: BytesMut,
    name_pointers: HashMap<DomainName, u16>,
}

impl Default for WritableBuffer {
    fn default() -> Self {
        Self {
            octets: BytesMut::with_capacity(UDP_MESSAGE_MAX_LEN),
            name_pointers: HashMap::new(),
        }
    }
}

impl WritableBuffer {
    pub fn index(&self) -> usize {
        self.octets.len()
    }

    /// Pointers only have 14 bits of offset, names written past that
    /// point are never compressed against.
    pub fn memoise_name(&mut self, name: &DomainName) {
        if !name.is_root() && !self.name_pointers.contains_key(name) {
            if let Ok(index) = u16::try_from(self.index()) {
                if index <= 0b0011_1111_1111_1111 {
                    let [hi, lo] = index.to_be_bytes();
                    self.name_pointers
                        .insert(name.clone(), u16::from_be_bytes([hi | 0b1100_0000, lo]));
                }
            }
        }
    }

    pub fn name_pointer(&self, name: &DomainName) -> Option<u16> {
        self.name_pointers.get(name).copied()
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
}

/// Helper function to convert a `usize` into a `u16` (or return an error).
///
/// # Errors
///
/// If the value cannot be converted.
fn usize_to_u16(counter: usize) -> Result<u16, Error> {
    u16::try_from(counter).map_err(|_| Error::CounterTooLarge {
        counter,
        bits: u16::BITS,
    })
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::protocol::types::test_util::*;

    #[test]
    #[rustfmt::skip]
    fn name_compression_opt_in() {
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
    fn name_compression_opt_out() {
        let mut buf = WritableBuffer::default();
        buf.write_u8(1);
        buf.write_u8(2);
        domain("example.com.").serialise(&mut buf, true);
        domain("example.com.").serialise(&mut buf, false);

        assert_eq!(
            vec![
                1, 2,
                // domain 1
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
                // domain 2
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
            ],
            buf.octets,
        );
    }

    #[test]
    #[rustfmt::skip]
    fn sinkhole_response() {
        let mut query = Message::from_question(0xabcd, question("evil.test.", RecordType::A));
        query.header.recursion_desired = true;
        let mut response = query.make_response();
        response.answers = vec![a_record("evil.test.", Ipv4Addr::UNSPECIFIED)];

        assert_eq!(
            vec![
                // HEADER
                0xab, 0xcd, // ID
                0b1000_0001, 0b1000_0000, // QR, RD, RA, NOERROR
                0, 1, 0, 1, 0, 0, 0, 0, // counts
                // QNAME
                4, 101, 118, 105, 108, // "evil"
                4, 116, 101, 115, 116, 0, // "test"
                // QTYPE, QCLASS
                0, 1, 0, 1,
                // NAME
                0b1100_0000, 0b0000_1100, // pointer to "evil.test"
                // TYPE, CLASS
                0, 1, 0, 1,
                // TTL
                0, 0, 0b0000_0001, 0b0010_1100, // 300
                // RDLENGTH
                0, 4,
                // RDATA
                0, 0, 0, 0,
            ],
            response.to_octets().unwrap().to_vec(),
        );
    }

    #[test]
    #[rustfmt::skip]
    fn sets_rdlength() {
        let mut buf = WritableBuffer::default();

        let _ = mx_record("www.example.com.", 32, "mx.example.com.").serialise(&mut buf);

        assert_eq!(
            vec![
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
                3, 99, 111, 109, 0, // "com"
            ],
            buf.octets,
        );
    }

    #[test]
    fn to_octets_within_leaves_small_messages_alone() {
        let mut message = Message::from_question(1, question("example.com.", RecordType::A));
        message.answers = vec![a_record("example.com.", Ipv4Addr::new(1, 2, 3, 4))];

        let octets = message.to_octets_within(UDP_MESSAGE_MAX_LEN).unwrap();
        assert_eq!(message.to_octets().unwrap(), octets);
        assert_eq!(0, octets[2] & HEADER_MASK_TC);
    }

    #[test]
    fn to_octets_within_drops_records_and_sets_tc() {
        let mut message = Message::from_question(1, question("example.com.", RecordType::TXT));
        for _ in 0..10 {
            message
                .answers
                .push(unknown_record("example.com.", &[0; 100]));
        }

        let octets = message.to_octets_within(UDP_MESSAGE_MAX_LEN).unwrap();
        assert!(octets.len() <= UDP_MESSAGE_MAX_LEN);
        assert_eq!(HEADER_MASK_TC, octets[2] & HEADER_MASK_TC);
        // ANCOUNT
        assert!(u16::from_be_bytes([octets[6], octets[7]]) < 10);
    }

    #[test]
    fn to_octets_within_fails_if_question_too_big() {
        let message = Message::from_question(1, question("example.com.", RecordType::A));
        assert_eq!(
            Err(Error::TooLong { limit: 12 }),
            message.to_octets_within(12)
        );
    }
}
