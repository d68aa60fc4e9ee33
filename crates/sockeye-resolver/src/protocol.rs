//! DNS wire-format codec.
//!
//! Decodes the IETF message layout: a 12-byte header, question section,
//! then answer/authority/additional resource records. Names accept pointer
//! compression on decode (bounded, backwards-only); the encoder is
//! deterministic and never emits compression, so `decode(encode(m)) == m`
//! for every message and re-encoding a decompressed message yields an
//! equal value rather than identical bytes.

use std::net::{Ipv4Addr, Ipv6Addr};

use sockeye::error::{Error, ErrorKind, Result};

pub const CLASS_IN: u16 = 1;
const HEADER_SIZE: usize = 12;
const MAX_NAME_LENGTH: usize = 255;
const MAX_LABEL_LENGTH: usize = 63;
/// Compression pointers a single name may chase.
const MAX_POINTER_JUMPS: usize = 32;

fn invalid() -> Error {
    Error::new(ErrorKind::InvalidArgument)
}

/// Resource record type. Unknown values are preserved raw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    Aaaa,
    Ns,
    Cname,
    Soa,
    Ptr,
    Mx,
    Txt,
    Opt,
    Other(u16),
}

impl RecordType {
    pub fn to_u16(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Ns => 2,
            RecordType::Cname => 5,
            RecordType::Soa => 6,
            RecordType::Ptr => 12,
            RecordType::Mx => 15,
            RecordType::Txt => 16,
            RecordType::Aaaa => 28,
            RecordType::Opt => 41,
            RecordType::Other(value) => value,
        }
    }

    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => RecordType::A,
            2 => RecordType::Ns,
            5 => RecordType::Cname,
            6 => RecordType::Soa,
            12 => RecordType::Ptr,
            15 => RecordType::Mx,
            16 => RecordType::Txt,
            28 => RecordType::Aaaa,
            41 => RecordType::Opt,
            other => RecordType::Other(other),
        }
    }
}

/// Header opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Query,
    InverseQuery,
    Status,
    Other(u8),
}

impl Opcode {
    fn to_u8(self) -> u8 {
        match self {
            Opcode::Query => 0,
            Opcode::InverseQuery => 1,
            Opcode::Status => 2,
            Opcode::Other(value) => value & 0x0F,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Opcode::Query,
            1 => Opcode::InverseQuery,
            2 => Opcode::Status,
            other => Opcode::Other(other),
        }
    }
}

/// Response code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    NoError,
    FormatError,
    ServerFailure,
    NameError,
    NotImplemented,
    Refused,
    Other(u8),
}

impl ResponseCode {
    fn to_u8(self) -> u8 {
        match self {
            ResponseCode::NoError => 0,
            ResponseCode::FormatError => 1,
            ResponseCode::ServerFailure => 2,
            ResponseCode::NameError => 3,
            ResponseCode::NotImplemented => 4,
            ResponseCode::Refused => 5,
            ResponseCode::Other(value) => value & 0x0F,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ResponseCode::NoError,
            1 => ResponseCode::FormatError,
            2 => ResponseCode::ServerFailure,
            3 => ResponseCode::NameError,
            4 => ResponseCode::NotImplemented,
            5 => ResponseCode::Refused,
            other => ResponseCode::Other(other),
        }
    }
}

/// One question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub rtype: RecordType,
    pub rclass: u16,
}

/// SOA rdata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoaData {
    pub mname: String,
    pub rname: String,
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minimum: u32,
}

/// Typed rdata; unknown record types stay raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ns(String),
    Cname(String),
    Soa(SoaData),
    Ptr(String),
    Mx { preference: u16, exchange: String },
    Txt(Vec<Vec<u8>>),
    Opt(Vec<u8>),
    Raw(Vec<u8>),
}

/// One resource record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub rtype: RecordType,
    pub rclass: u16,
    pub ttl: u32,
    pub data: RecordData,
}

/// A complete DNS message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u16,
    pub response: bool,
    pub opcode: Opcode,
    pub authoritative: bool,
    pub truncated: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    pub authentic_data: bool,
    pub checking_disabled: bool,
    pub rcode: ResponseCode,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    pub authorities: Vec<Record>,
    pub additionals: Vec<Record>,
}

impl Message {
    /// A one-question query.
    pub fn query(id: u16, name: &str, rtype: RecordType, recursion_desired: bool) -> Self {
        Self {
            id,
            response: false,
            opcode: Opcode::Query,
            authoritative: false,
            truncated: false,
            recursion_desired,
            recursion_available: false,
            authentic_data: false,
            checking_disabled: false,
            rcode: ResponseCode::NoError,
            questions: vec![Question { name: name.to_string(), rtype, rclass: CLASS_IN }],
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(HEADER_SIZE + 64);
        out.extend_from_slice(&self.id.to_be_bytes());

        let mut flags: u16 = 0;
        if self.response {
            flags |= 1 << 15;
        }
        flags |= u16::from(self.opcode.to_u8()) << 11;
        if self.authoritative {
            flags |= 1 << 10;
        }
        if self.truncated {
            flags |= 1 << 9;
        }
        if self.recursion_desired {
            flags |= 1 << 8;
        }
        if self.recursion_available {
            flags |= 1 << 7;
        }
        if self.authentic_data {
            flags |= 1 << 5;
        }
        if self.checking_disabled {
            flags |= 1 << 4;
        }
        flags |= u16::from(self.rcode.to_u8());
        out.extend_from_slice(&flags.to_be_bytes());

        for count in [
            self.questions.len(),
            self.answers.len(),
            self.authorities.len(),
            self.additionals.len(),
        ] {
            let count = u16::try_from(count).map_err(|_| invalid())?;
            out.extend_from_slice(&count.to_be_bytes());
        }

        for question in &self.questions {
            encode_name(&mut out, &question.name)?;
            out.extend_from_slice(&question.rtype.to_u16().to_be_bytes());
            out.extend_from_slice(&question.rclass.to_be_bytes());
        }
        for record in
            self.answers.iter().chain(&self.authorities).chain(&self.additionals)
        {
            encode_record(&mut out, record)?;
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor { bytes, position: 0 };
        let id = cursor.read_u16()?;
        let flags = cursor.read_u16()?;
        let question_count = cursor.read_u16()?;
        let answer_count = cursor.read_u16()?;
        let authority_count = cursor.read_u16()?;
        let additional_count = cursor.read_u16()?;

        let mut message = Self {
            id,
            response: flags & (1 << 15) != 0,
            opcode: Opcode::from_u8(((flags >> 11) & 0x0F) as u8),
            authoritative: flags & (1 << 10) != 0,
            truncated: flags & (1 << 9) != 0,
            recursion_desired: flags & (1 << 8) != 0,
            recursion_available: flags & (1 << 7) != 0,
            authentic_data: flags & (1 << 5) != 0,
            checking_disabled: flags & (1 << 4) != 0,
            rcode: ResponseCode::from_u8((flags & 0x0F) as u8),
            questions: Vec::with_capacity(question_count as usize),
            answers: Vec::with_capacity(answer_count as usize),
            authorities: Vec::with_capacity(authority_count as usize),
            additionals: Vec::with_capacity(additional_count as usize),
        };

        for _ in 0..question_count {
            let name = cursor.read_name()?;
            let rtype = RecordType::from_u16(cursor.read_u16()?);
            let rclass = cursor.read_u16()?;
            message.questions.push(Question { name, rtype, rclass });
        }
        for _ in 0..answer_count {
            message.answers.push(decode_record(&mut cursor)?);
        }
        for _ in 0..authority_count {
            message.authorities.push(decode_record(&mut cursor)?);
        }
        for _ in 0..additional_count {
            message.additionals.push(decode_record(&mut cursor)?);
        }
        Ok(message)
    }
}

fn encode_record(out: &mut Vec<u8>, record: &Record) -> Result<()> {
    encode_name(out, &record.name)?;
    out.extend_from_slice(&record.rtype.to_u16().to_be_bytes());
    out.extend_from_slice(&record.rclass.to_be_bytes());
    out.extend_from_slice(&record.ttl.to_be_bytes());

    let mut rdata = Vec::new();
    match &record.data {
        RecordData::A(addr) => rdata.extend_from_slice(&addr.octets()),
        RecordData::Aaaa(addr) => rdata.extend_from_slice(&addr.octets()),
        RecordData::Ns(name) | RecordData::Cname(name) | RecordData::Ptr(name) => {
            encode_name(&mut rdata, name)?;
        }
        RecordData::Soa(soa) => {
            encode_name(&mut rdata, &soa.mname)?;
            encode_name(&mut rdata, &soa.rname)?;
            for word in [soa.serial, soa.refresh, soa.retry, soa.expire, soa.minimum] {
                rdata.extend_from_slice(&word.to_be_bytes());
            }
        }
        RecordData::Mx { preference, exchange } => {
            rdata.extend_from_slice(&preference.to_be_bytes());
            encode_name(&mut rdata, exchange)?;
        }
        RecordData::Txt(strings) => {
            for string in strings {
                let len = u8::try_from(string.len()).map_err(|_| invalid())?;
                rdata.push(len);
                rdata.extend_from_slice(string);
            }
        }
        RecordData::Opt(raw) | RecordData::Raw(raw) => rdata.extend_from_slice(raw),
    }

    let rdlength = u16::try_from(rdata.len()).map_err(|_| invalid())?;
    out.extend_from_slice(&rdlength.to_be_bytes());
    out.extend_from_slice(&rdata);
    Ok(())
}

fn decode_record(cursor: &mut Cursor<'_>) -> Result<Record> {
    let name = cursor.read_name()?;
    let rtype = RecordType::from_u16(cursor.read_u16()?);
    let rclass = cursor.read_u16()?;
    let ttl = cursor.read_u32()?;
    let rdlength = cursor.read_u16()? as usize;
    let rdata_end = cursor
        .position
        .checked_add(rdlength)
        .filter(|end| *end <= cursor.bytes.len())
        .ok_or_else(invalid)?;

    let data = match rtype {
        RecordType::A => {
            if rdlength != 4 {
                return Err(invalid());
            }
            let octets: [u8; 4] = cursor.read_slice(4)?.try_into().expect("sized");
            RecordData::A(Ipv4Addr::from(octets))
        }
        RecordType::Aaaa => {
            if rdlength != 16 {
                return Err(invalid());
            }
            let octets: [u8; 16] = cursor.read_slice(16)?.try_into().expect("sized");
            RecordData::Aaaa(Ipv6Addr::from(octets))
        }
        RecordType::Ns => RecordData::Ns(cursor.read_name()?),
        RecordType::Cname => RecordData::Cname(cursor.read_name()?),
        RecordType::Ptr => RecordData::Ptr(cursor.read_name()?),
        RecordType::Soa => {
            let mname = cursor.read_name()?;
            let rname = cursor.read_name()?;
            RecordData::Soa(SoaData {
                mname,
                rname,
                serial: cursor.read_u32()?,
                refresh: cursor.read_u32()?,
                retry: cursor.read_u32()?,
                expire: cursor.read_u32()?,
                minimum: cursor.read_u32()?,
            })
        }
        RecordType::Mx => RecordData::Mx {
            preference: cursor.read_u16()?,
            exchange: cursor.read_name()?,
        },
        RecordType::Txt => {
            let mut strings = Vec::new();
            while cursor.position < rdata_end {
                let len = cursor.read_u8()? as usize;
                strings.push(cursor.read_slice(len)?.to_vec());
            }
            RecordData::Txt(strings)
        }
        RecordType::Opt => RecordData::Opt(cursor.read_slice(rdlength)?.to_vec()),
        RecordType::Other(_) => RecordData::Raw(cursor.read_slice(rdlength)?.to_vec()),
    };

    if cursor.position != rdata_end {
        return Err(invalid());
    }
    Ok(Record { name, rtype, rclass, ttl, data })
}

fn encode_name(out: &mut Vec<u8>, name: &str) -> Result<()> {
    let trimmed = name.trim_end_matches('.');
    if trimmed.is_empty() {
        out.push(0);
        return Ok(());
    }
    if trimmed.len() + 1 > MAX_NAME_LENGTH {
        return Err(invalid());
    }
    for label in trimmed.split('.') {
        let bytes = label.as_bytes();
        if bytes.is_empty() || bytes.len() > MAX_LABEL_LENGTH {
            return Err(invalid());
        }
        out.push(bytes.len() as u8);
        out.extend_from_slice(bytes);
    }
    out.push(0);
    Ok(())
}

struct Cursor<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl Cursor<'_> {
    fn read_u8(&mut self) -> Result<u8> {
        let byte = *self.bytes.get(self.position).ok_or_else(invalid)?;
        self.position += 1;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let slice = self.read_slice(2)?;
        Ok(u16::from_be_bytes(slice.try_into().expect("sized")))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let slice = self.read_slice(4)?;
        Ok(u32::from_be_bytes(slice.try_into().expect("sized")))
    }

    fn read_slice(&mut self, len: usize) -> Result<&[u8]> {
        let end = self.position.checked_add(len).ok_or_else(invalid)?;
        let slice = self.bytes.get(self.position..end).ok_or_else(invalid)?;
        self.position = end;
        Ok(slice)
    }

    /// Reads a possibly compressed name. Pointers must aim strictly
    /// backwards and are chased at most `MAX_POINTER_JUMPS` times.
    fn read_name(&mut self) -> Result<String> {
        let mut name = String::new();
        let mut position = self.position;
        let mut jumps = 0;
        let mut end_after_first_jump: Option<usize> = None;

        loop {
            let length = *self.bytes.get(position).ok_or_else(invalid)?;
            if length & 0xC0 == 0xC0 {
                let low = *self.bytes.get(position + 1).ok_or_else(invalid)?;
                if end_after_first_jump.is_none() {
                    end_after_first_jump = Some(position + 2);
                }
                let target = (usize::from(length & 0x3F) << 8) | usize::from(low);
                if target >= position {
                    return Err(invalid());
                }
                jumps += 1;
                if jumps > MAX_POINTER_JUMPS {
                    return Err(invalid());
                }
                position = target;
                continue;
            }
            if length & 0xC0 != 0 {
                return Err(invalid());
            }
            if length == 0 {
                position += 1;
                break;
            }
            let length = usize::from(length);
            let start = position + 1;
            let label = self.bytes.get(start..start + length).ok_or_else(invalid)?;
            if !name.is_empty() {
                name.push('.');
            }
            name.push_str(&String::from_utf8_lossy(label));
            if name.len() > MAX_NAME_LENGTH {
                return Err(invalid());
            }
            position = start + length;
        }

        self.position = end_after_first_jump.unwrap_or(position);
        Ok(name)
    }
}
