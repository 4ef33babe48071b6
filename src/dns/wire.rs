//! DNS Wire Codec
//!
//! Hand-rolled parsing of untrusted query packets and encoding of compressed,
//! authoritative responses. The same codec carries the private gossip channel:
//! a packet whose trailing records contain a TXT record is a control message
//! (`{dataname, data}`) rather than a query.
//!
//! ## Input walk
//!
//! ```text
//! header(12) | question name (labels) | qtype | qclass | records ... until end of buffer
//!                                                       ├─ OPT (41) → EDNS / client subnet
//!                                                       └─ TXT (16) → control message
//! ```

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tracing::debug;

use super::{DnsError, RecordData, RecordType, ResourceRecord, ResponseCode};

/// Maximum UDP DNS message size (no EDNS extension of the payload)
pub const MAX_UDP_SIZE: usize = 512;

/// Maximum TCP DNS message size
pub const MAX_TCP_SIZE: usize = 65535;

const HEADER_LEN: usize = 12;

/// Label walk guard against crafted looping/over-long names
const MAX_LABELS: usize = 40;

const LABEL_POINTER: u8 = 0xC0;
const CLASS_IN: u16 = 1;
const ECS_OPTION_CODE: u16 = 8;
const ECS_FAMILY_IPV4: u16 = 1;
const ECS_FAMILY_IPV6: u16 = 2;

/// UDP payload size advertised in our OPT record
const EDNS_UDP_PAYLOAD: u16 = 512;

const FLAG_QR: u16 = 0x8000;
const FLAG_AA: u16 = 0x0400;
const FLAG_TC: u16 = 0x0200;
const FLAG_RD: u16 = 0x0100;

/// EDNS0 client subnet carried by a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSubnet {
    /// Address family (1 = IPv4, 2 = IPv6)
    pub family: u16,
    /// Source prefix length sent by the resolver
    pub source_prefix: u8,
    /// Address bytes as sent (at most `ceil(source_prefix / 8)` are echoed)
    pub address: Vec<u8>,
    /// Network address used for the geo lookup
    pub subnet: IpAddr,
}

/// EDNS0 data of a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edns {
    /// Requestor's UDP payload size
    pub udp_size: u16,
    /// Recognised client subnet, if any
    pub client_subnet: Option<ClientSubnet>,
}

/// A decoded DNS query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub id: u16,
    pub flags: u16,
    /// Question name as received, without trailing dot
    pub name: String,
    pub qtype: RecordType,
    pub qclass: u16,
    pub question_count: u16,
    pub edns: Option<Edns>,
}

impl Query {
    pub fn recursion_desired(&self) -> bool {
        self.flags & FLAG_RD != 0
    }

    pub fn client_subnet(&self) -> Option<&ClientSubnet> {
        self.edns.as_ref().and_then(|e| e.client_subnet.as_ref())
    }
}

/// Private control message multiplexed on the DNS port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub dataname: String,
    pub data: String,
}

/// Result of decoding an incoming packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Query(Query),
    Control(ControlMessage),
}

fn malformed(reason: impl Into<String>) -> DnsError {
    DnsError::MalformedPacket(reason.into())
}

/// Bounds-checked cursor over an untrusted buffer
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DnsError> {
        if self.remaining() < len {
            return Err(malformed(format!(
                "need {} bytes at offset {}, {} left",
                len,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DnsError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DnsError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DnsError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Walk a length-prefixed name. Compression is not followed: a pointer
    /// ends the name.
    fn name(&mut self) -> Result<String, DnsError> {
        let mut labels: Vec<String> = Vec::new();
        for _ in 0..MAX_LABELS {
            let len = self.u8()?;
            if len == 0 {
                return Ok(labels.join("."));
            }
            if len & LABEL_POINTER == LABEL_POINTER {
                self.u8()?;
                return Ok(labels.join("."));
            }
            if len & LABEL_POINTER != 0 {
                return Err(malformed(format!("reserved label type 0x{:02x}", len)));
            }
            let label = self.take(len as usize)?;
            labels.push(String::from_utf8_lossy(label).into_owned());
        }
        Err(malformed(format!("name exceeds {} labels", MAX_LABELS)))
    }
}

/// Decode a raw packet into a query or a control message.
pub fn decode(msg: &[u8]) -> Result<Packet, DnsError> {
    if msg.len() < HEADER_LEN {
        return Err(malformed(format!("header truncated ({} bytes)", msg.len())));
    }
    let mut r = Reader::new(msg);
    let id = r.u16()?;
    let flags = r.u16()?;
    let question_count = r.u16()?;
    // answer/authority/additional counts: trailing records are walked to the end
    r.take(6)?;

    let mut question = None;
    for i in 0..question_count {
        let name = r.name()?;
        let qtype = r.u16()?;
        let qclass = r.u16()?;
        if i == 0 {
            question = Some((name, qtype, qclass));
        }
    }

    let mut edns = None;
    while r.remaining() > 0 {
        let name = r.name()?;
        let rtype = r.u16()?;
        let class = r.u16()?;
        let _ttl = r.u32()?;
        let rdlength = r.u16()? as usize;
        let rdata = r.take(rdlength)?;

        match RecordType::from_code(rtype) {
            RecordType::OPT => {
                edns = Some(Edns {
                    udp_size: class,
                    client_subnet: parse_ecs_option(rdata),
                });
            }
            RecordType::TXT => {
                let data = String::from_utf8(rdata.to_vec())
                    .map_err(|_| malformed("control data is not UTF-8"))?;
                return Ok(Packet::Control(ControlMessage {
                    dataname: name,
                    data,
                }));
            }
            _ => {}
        }
    }

    let (name, qtype, qclass) = question.ok_or_else(|| malformed("no question"))?;
    Ok(Packet::Query(Query {
        id,
        flags,
        name,
        qtype: RecordType::from_code(qtype),
        qclass,
        question_count,
        edns,
    }))
}

/// Extract the client subnet when the first EDNS option is ECS.
fn parse_ecs_option(rdata: &[u8]) -> Option<ClientSubnet> {
    if rdata.len() < 4 {
        return None;
    }
    let code = u16::from_be_bytes([rdata[0], rdata[1]]);
    if code != ECS_OPTION_CODE {
        return None;
    }
    let len = u16::from_be_bytes([rdata[2], rdata[3]]) as usize;
    let data = rdata.get(4..4 + len)?;
    if data.len() < 4 {
        debug!("EDNS: client subnet option too short ({} bytes)", data.len());
        return None;
    }
    let family = u16::from_be_bytes([data[0], data[1]]);
    let source_prefix = data[2];
    let address = &data[4..];
    let subnet = client_subnet_address(family, source_prefix, address)?;
    let echoed = address.len().min((source_prefix as usize).div_ceil(8));

    Some(ClientSubnet {
        family,
        source_prefix,
        address: address[..echoed].to_vec(),
        subnet,
    })
}

/// Map (family, prefix, bytes) to the address used for geolocation.
///
/// IPv4 /17–/24 is truncated to the /24 network, /25 and longer keep all
/// four octets, IPv6 is only understood at /56.
pub fn client_subnet_address(family: u16, source_prefix: u8, address: &[u8]) -> Option<IpAddr> {
    let byte = |i: usize| address.get(i).copied().unwrap_or(0);
    match (family, source_prefix) {
        (ECS_FAMILY_IPV4, 17..=24) => Some(IpAddr::V4(Ipv4Addr::new(byte(0), byte(1), byte(2), 0))),
        (ECS_FAMILY_IPV4, p) if p >= 25 => Some(IpAddr::V4(Ipv4Addr::new(
            byte(0),
            byte(1),
            byte(2),
            byte(3),
        ))),
        (ECS_FAMILY_IPV6, 56) => {
            let mut octets = [0u8; 16];
            for (i, o) in octets.iter_mut().enumerate().take(7) {
                *o = byte(i);
            }
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        (family, prefix) => {
            debug!("EDNS: unknown family {} or prefix {}", family, prefix);
            None
        }
    }
}

/// Answer and authority sections of a response, in encoding order
#[derive(Debug, Clone)]
pub struct Response {
    pub rcode: ResponseCode,
    answers: Vec<ResourceRecord>,
    authority: Vec<ResourceRecord>,
}

impl Default for Response {
    fn default() -> Self {
        Self::new(ResponseCode::NoError)
    }
}

impl Response {
    pub fn new(rcode: ResponseCode) -> Self {
        Self {
            rcode,
            answers: Vec::new(),
            authority: Vec::new(),
        }
    }

    pub fn push_answer(&mut self, rr: ResourceRecord) {
        self.answers.push(rr);
    }

    pub fn push_authority(&mut self, rr: ResourceRecord) {
        self.authority.push(rr);
    }

    pub fn answers(&self) -> &[ResourceRecord] {
        &self.answers
    }

    pub fn authority(&self) -> &[ResourceRecord] {
        &self.authority
    }

    /// Number of records appended so far (answer + authority)
    pub fn anum(&self) -> usize {
        self.answers.len() + self.authority.len()
    }
}

/// Output buffer with label compression and a hard size limit
struct Writer {
    buf: Vec<u8>,
    limit: usize,
    names: HashMap<String, u16>,
}

impl Writer {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(limit.min(MAX_UDP_SIZE)),
            limit,
            names: HashMap::new(),
        }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn patch_u16(&mut self, at: usize, v: u16) {
        self.buf[at..at + 2].copy_from_slice(&v.to_be_bytes());
    }

    /// Write a name, replacing any already-written suffix with a pointer.
    fn name(&mut self, name: &str) -> Result<(), DnsError> {
        let full = name.trim_end_matches('.');
        let mut rest = full;
        while !rest.is_empty() {
            let key = rest.to_ascii_lowercase();
            if let Some(&offset) = self.names.get(&key) {
                self.u16(((LABEL_POINTER as u16) << 8) | offset);
                return Ok(());
            }
            let pos = self.buf.len();
            if pos <= 0x3FFF {
                self.names.insert(key, pos as u16);
            }
            let (label, tail) = match rest.find('.') {
                Some(dot) => (&rest[..dot], &rest[dot + 1..]),
                None => (rest, ""),
            };
            if label.is_empty() || label.len() > 63 {
                return Err(DnsError::Encode(format!("invalid label in {:?}", full)));
            }
            self.u8(label.len() as u8);
            self.buf.extend_from_slice(label.as_bytes());
            rest = tail;
        }
        self.u8(0);
        Ok(())
    }

    /// Drop everything written after `mark`, including compression targets.
    fn rollback(&mut self, mark: usize) {
        self.buf.truncate(mark);
        self.names.retain(|_, offset| (*offset as usize) < mark);
    }

    /// Append a record; returns false (and writes nothing) when it does not fit.
    fn record(&mut self, rr: &ResourceRecord) -> Result<bool, DnsError> {
        let mark = self.buf.len();
        self.name(&rr.name)?;
        self.u16(rr.data.record_type().code());
        self.u16(CLASS_IN);
        self.u32(rr.ttl);
        let rdlength_at = self.buf.len();
        self.u16(0);
        match &rr.data {
            RecordData::A(ip) => self.buf.extend_from_slice(&ip.octets()),
            RecordData::AAAA(ip) => self.buf.extend_from_slice(&ip.octets()),
            RecordData::CNAME(target) | RecordData::NS(target) => self.name(target)?,
            RecordData::SOA(soa) => {
                self.name(&soa.mname)?;
                self.name(&soa.rname)?;
                self.u32(soa.serial);
                self.u32(soa.refresh);
                self.u32(soa.retry);
                self.u32(soa.expire);
                self.u32(soa.minimum);
            }
        }
        let rdlength = self.buf.len() - rdlength_at - 2;
        self.patch_u16(rdlength_at, rdlength as u16);

        if self.buf.len() > self.limit {
            self.rollback(mark);
            return Ok(false);
        }
        Ok(true)
    }

    /// Append the OPT pseudo record, echoing the client subnet with `scope`.
    fn opt(&mut self, ecs: Option<&ClientSubnet>, scope: u8) -> bool {
        let mark = self.buf.len();
        self.u8(0);
        self.u16(RecordType::OPT.code());
        self.u16(EDNS_UDP_PAYLOAD);
        self.u32(0);
        match ecs {
            Some(ecs) => {
                let option_len = 4 + ecs.address.len();
                self.u16((4 + option_len) as u16);
                self.u16(ECS_OPTION_CODE);
                self.u16(option_len as u16);
                self.u16(ecs.family);
                self.u8(ecs.source_prefix);
                self.u8(scope);
                self.buf.extend_from_slice(&ecs.address);
            }
            None => self.u16(0),
        }
        if self.buf.len() > self.limit {
            self.rollback(mark);
            return false;
        }
        true
    }
}

/// Encode a response to `query` into a fresh buffer of at most `limit` bytes.
///
/// Sections are written answer, authority, additional. Records that do not
/// fit set the TC bit and are dropped with everything after them.
pub fn encode_response(
    query: &Query,
    response: &Response,
    limit: usize,
) -> Result<Vec<u8>, DnsError> {
    let mut w = Writer::new(limit);
    let mut flags = FLAG_QR | FLAG_AA | (query.flags & FLAG_RD) | response.rcode.code() as u16;

    w.u16(query.id);
    w.u16(flags);
    w.u16(1);
    w.u16(0);
    w.u16(0);
    w.u16(0);
    w.name(&query.name)?;
    w.u16(query.qtype.code());
    w.u16(query.qclass);

    let mut truncated = false;
    let mut answer_count = 0u16;
    let mut authority_count = 0u16;
    for rr in &response.answers {
        if !w.record(rr)? {
            truncated = true;
            break;
        }
        answer_count += 1;
    }
    if !truncated {
        for rr in &response.authority {
            if !w.record(rr)? {
                truncated = true;
                break;
            }
            authority_count += 1;
        }
    }

    let mut additional_count = 0u16;
    if let Some(edns) = &query.edns {
        let scope = match &edns.client_subnet {
            Some(ecs) if response.rcode.is_success() && !response.answers.is_empty() => {
                ecs.source_prefix
            }
            _ => 0,
        };
        if w.opt(edns.client_subnet.as_ref(), scope) {
            additional_count = 1;
        } else {
            truncated = true;
        }
    }

    if truncated {
        flags |= FLAG_TC;
        w.patch_u16(2, flags);
    }
    w.patch_u16(6, answer_count);
    w.patch_u16(8, authority_count);
    w.patch_u16(10, additional_count);
    Ok(w.buf)
}

impl ControlMessage {
    pub fn new(dataname: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            dataname: dataname.into(),
            data: data.into(),
        }
    }

    /// Encode as a question-less packet carrying a single TXT record.
    pub fn encode(&self, id: u16) -> Result<Vec<u8>, DnsError> {
        if self.data.len() > u16::MAX as usize {
            return Err(DnsError::Encode(format!(
                "control data too large ({} bytes)",
                self.data.len()
            )));
        }
        let mut w = Writer::new(MAX_TCP_SIZE);
        w.u16(id);
        w.u16(0);
        w.u16(0);
        w.u16(0);
        w.u16(0);
        w.u16(1);
        w.name(&self.dataname)?;
        w.u16(RecordType::TXT.code());
        w.u16(CLASS_IN);
        w.u32(0);
        w.u16(self.data.len() as u16);
        w.buf.extend_from_slice(self.data.as_bytes());
        Ok(w.buf)
    }
}

/// Header-only reply carrying `rcode`, for queries whose question cannot be
/// echoed back.
pub fn encode_error(query: &Query, rcode: ResponseCode) -> Vec<u8> {
    let flags = FLAG_QR | (query.flags & FLAG_RD) | rcode.code() as u16;
    let mut buf = Vec::with_capacity(HEADER_LEN);
    buf.extend_from_slice(&query.id.to_be_bytes());
    buf.extend_from_slice(&flags.to_be_bytes());
    buf.extend_from_slice(&[0; 8]);
    buf
}

/// Encode a plain query, optionally tagged with a client subnet.
pub fn encode_query(
    id: u16,
    name: &str,
    qtype: RecordType,
    client_subnet: Option<(IpAddr, u8)>,
) -> Result<Vec<u8>, DnsError> {
    let mut w = Writer::new(MAX_TCP_SIZE);
    w.u16(id);
    w.u16(FLAG_RD);
    w.u16(1);
    w.u16(0);
    w.u16(0);
    w.u16(u16::from(client_subnet.is_some()));
    w.name(name)?;
    w.u16(qtype.code());
    w.u16(CLASS_IN);

    if let Some((ip, prefix)) = client_subnet {
        let (family, octets) = match ip {
            IpAddr::V4(v4) => (ECS_FAMILY_IPV4, v4.octets().to_vec()),
            IpAddr::V6(v6) => (ECS_FAMILY_IPV6, v6.octets().to_vec()),
        };
        let keep = ((prefix as usize).div_ceil(8)).min(octets.len());
        let address = &octets[..keep];
        w.u8(0);
        w.u16(RecordType::OPT.code());
        w.u16(4096);
        w.u32(0);
        w.u16((8 + address.len()) as u16);
        w.u16(ECS_OPTION_CODE);
        w.u16((4 + address.len()) as u16);
        w.u16(family);
        w.u8(prefix);
        w.u8(0);
        w.buf.extend_from_slice(address);
    }
    Ok(w.buf)
}
