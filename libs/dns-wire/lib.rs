#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::fmt;

use domain::{
    base::{
        Message, MessageBuilder, ParsedName, Question, RecordSection,
        message_builder::AnswerBuilder, name::FlattenInto,
    },
    dep::octseq::OctetsInto,
    rdata::AllRecordData,
};

pub type RecordType = domain::base::iana::Rtype;
pub type ResponseCode = domain::base::iana::Rcode;

pub type DomainName = domain::base::Name<Vec<u8>>;
pub type Record<'a> =
    domain::base::Record<ParsedName<&'a [u8]>, AllRecordData<&'a [u8], ParsedName<&'a [u8]>>>;
pub type RecordData<'a> = AllRecordData<&'a [u8], ParsedName<&'a [u8]>>;

pub type OwnedRecord = domain::base::Record<DomainName, AllRecordData<Vec<u8>, DomainName>>;
pub type OwnedRecordData = AllRecordData<Vec<u8>, DomainName>;

/// DoH queries and responses are padded to a multiple of this many bytes.
///
/// Source: <https://datatracker.ietf.org/doc/html/rfc8467#section-4.1>.
pub const PADDING_BLOCK_SIZE: usize = 128;

const DNS_HEADER_LEN: usize = 12;
const OPT_RTYPE: u16 = 41;
const PADDING_OPTION_CODE: u16 = 12;

/// Fixed part of an OPT pseudo-record: root name, TYPE, CLASS, TTL, RDLENGTH.
const OPT_FIXED_LEN: usize = 11;
/// OPTION-CODE plus OPTION-LENGTH.
const OPT_OPTION_HEADER_LEN: usize = 4;

/// The UDP payload size we advertise in a freshly appended OPT record.
const EDNS_UDP_PAYLOAD_SIZE: u16 = 4096;

#[derive(Clone)]
pub struct Query {
    inner: Message<Vec<u8>>,
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("qid", &self.inner.header().id())
            .field("type", &self.qtype())
            .field("domain", &self.domain())
            .finish()
    }
}

impl Query {
    pub fn parse(slice: &[u8]) -> Result<Self, Error> {
        let message = Message::from_octets(slice).map_err(|_| Error::TooShort)?;

        if message.header().qr() {
            return Err(Error::NotAQuery);
        }

        let _ = message.sole_question()?; // Verify that there is exactly one question.

        Ok(Self {
            inner: message.octets_into(),
        })
    }

    pub fn new(domain: DomainName, rtype: RecordType) -> Self {
        let mut inner = MessageBuilder::new_vec().question();
        inner.header_mut().set_qr(false);
        inner.header_mut().set_rd(true); // Default to recursion desired.
        inner.header_mut().set_random_id(); // Default to a random id.

        inner
            .push((domain, rtype))
            .expect("Vec-backed message builder never fails");

        Self {
            inner: inner.into_message(),
        }
    }

    pub fn with_id(mut self, id: u16) -> Self {
        self.inner.header_mut().set_id(id);

        self
    }

    pub fn id(&self) -> u16 {
        self.inner.header().id()
    }

    pub fn domain(&self) -> DomainName {
        self.question().into_qname().flatten_into()
    }

    pub fn qtype(&self) -> RecordType {
        self.question().qtype()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.inner.into_octets()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.inner.as_slice()
    }

    fn question(&self) -> Question<ParsedName<&[u8]>> {
        self.inner.sole_question().expect("verified in ctor")
    }
}

#[derive(Clone)]
pub struct Response {
    inner: Message<Vec<u8>>,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("qid", &self.inner.header().id())
            .field("response_code", &self.response_code())
            .finish_non_exhaustive()
    }
}

impl Response {
    pub fn parse(slice: &[u8]) -> Result<Self, Error> {
        let message = Message::from_octets(slice).map_err(|_| Error::TooShort)?;

        if !message.header().qr() {
            return Err(Error::NotAResponse);
        }

        let _ = message.sole_question()?; // Verify that there is exactly one question.

        // Verify that we can parse the answers + all records.
        for record in message.answer()? {
            record?.into_any_record::<AllRecordData<_, _>>()?;
        }

        Ok(Self {
            inner: message.octets_into(),
        })
    }

    pub fn servfail(query: &Query) -> Self {
        ResponseBuilder::for_query(query, ResponseCode::SERVFAIL).build()
    }

    pub fn with_id(mut self, id: u16) -> Self {
        self.inner.header_mut().set_id(id);

        self
    }

    pub fn id(&self) -> u16 {
        self.inner.header().id()
    }

    pub fn response_code(&self) -> ResponseCode {
        self.inner.header().rcode()
    }

    pub fn records(&self) -> impl Iterator<Item = Record<'_>> {
        self.answer().into_iter().map(|r| {
            r.expect("verified in ctor")
                .into_any_record::<AllRecordData<_, _>>()
                .expect("verified in ctor")
        })
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.inner.into_octets()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.inner.as_slice()
    }

    fn answer(&self) -> RecordSection<'_, Vec<u8>> {
        self.inner.answer().expect("verified in ctor")
    }
}

pub struct ResponseBuilder {
    inner: AnswerBuilder<Vec<u8>>,
}

impl ResponseBuilder {
    pub fn for_query(query: &Query, code: ResponseCode) -> Self {
        let inner = MessageBuilder::new_vec()
            .start_answer(&query.inner, code)
            .expect("Vec-backed message builder never fails");

        Self { inner }
    }

    pub fn with_records(mut self, records: impl IntoIterator<Item: Into<OwnedRecord>>) -> Self {
        for record in records {
            self.inner
                .push(record.into())
                .expect("Vec-backed message builder never fails");
        }

        self
    }

    pub fn build(self) -> Response {
        Response {
            inner: self.inner.into_message(),
        }
    }
}

/// Reads the 16-bit message ID from a raw DNS message.
pub fn query_id(msg: &[u8]) -> Option<u16> {
    let header = msg.first_chunk::<2>()?;

    Some(u16::from_be_bytes(*header))
}

/// Overwrites the 16-bit message ID of a raw DNS message in place.
///
/// Messages shorter than the ID field are left untouched.
pub fn set_query_id(msg: &mut [u8], id: u16) {
    let Some(header) = msg.first_chunk_mut::<2>() else {
        return;
    };

    *header = id.to_be_bytes();
}

/// Synthesizes a SERVFAIL reply for the given raw query.
///
/// The reply carries the query's ID, echoes its question, sets
/// `RecursionAvailable` and carries no EDNS record.
/// Returns `None` if the query cannot be parsed; callers log and drop.
pub fn servfail(query: &[u8]) -> Option<Vec<u8>> {
    let query = match Query::parse(query) {
        Ok(query) => query,
        Err(e) => {
            tracing::debug!("Failed to synthesize SERVFAIL: {e}");

            return None;
        }
    };

    let mut response = Response::servfail(&query);
    response.inner.header_mut().set_ra(true);

    Some(response.into_bytes())
}

/// The well-formed A query used by transport health probes.
pub fn probe_query() -> Vec<u8> {
    let domain = DomainName::vec_from_str("youtube.com").expect("static name is valid");

    Query::new(domain, RecordType::A).with_id(0xbeef).into_bytes()
}

/// Pads a raw DNS message to a multiple of [`PADDING_BLOCK_SIZE`] by
/// attaching an EDNS(0) Padding option.
///
/// The input is preserved byte-for-byte apart from the splice: name
/// compression pointers may only point backwards, so appending a fresh OPT
/// record at the end of the message, or extending the RDATA of an OPT
/// record that is already the final record, cannot invalidate any offset.
/// Everything else is rejected rather than re-serialized.
///
/// A message that already carries a Padding option is returned unchanged.
pub fn add_edns_padding(mut msg: Vec<u8>) -> Result<Vec<u8>, PaddingError> {
    let opt = locate_opt_record(&msg)?;

    match opt {
        None => {
            let pad_len =
                padding_for(msg.len() + OPT_FIXED_LEN + OPT_OPTION_HEADER_LEN, PADDING_BLOCK_SIZE);
            let rdlength = (OPT_OPTION_HEADER_LEN + pad_len) as u16;

            msg.reserve(OPT_FIXED_LEN + OPT_OPTION_HEADER_LEN + pad_len);
            msg.push(0); // Root name.
            msg.extend_from_slice(&OPT_RTYPE.to_be_bytes());
            msg.extend_from_slice(&EDNS_UDP_PAYLOAD_SIZE.to_be_bytes()); // CLASS: requestor's UDP payload size.
            msg.extend_from_slice(&[0, 0, 0, 0]); // TTL: extended RCODE and flags.
            msg.extend_from_slice(&rdlength.to_be_bytes());
            push_padding_option(&mut msg, pad_len);

            let arcount = u16::from_be_bytes([msg[10], msg[11]])
                .checked_add(1)
                .ok_or(PaddingError::TooManyRecords)?;
            msg[10..12].copy_from_slice(&arcount.to_be_bytes());
        }
        Some(opt) => {
            if has_padding_option(&msg[opt.rdata_start..opt.rdata_end])? {
                return Ok(msg);
            }

            if opt.rdata_end != msg.len() {
                // Splicing into the middle of the message could invalidate
                // compression pointers of later records.
                return Err(PaddingError::OptNotLast);
            }

            let pad_len = padding_for(msg.len() + OPT_OPTION_HEADER_LEN, PADDING_BLOCK_SIZE);
            let rdlength = u16::try_from(
                opt.rdata_end - opt.rdata_start + OPT_OPTION_HEADER_LEN + pad_len,
            )
            .map_err(|_| PaddingError::TooManyRecords)?;

            push_padding_option(&mut msg, pad_len);
            msg[opt.rdata_start - 2..opt.rdata_start].copy_from_slice(&rdlength.to_be_bytes());
        }
    }

    debug_assert_eq!(msg.len() % PADDING_BLOCK_SIZE, 0);

    Ok(msg)
}

fn push_padding_option(msg: &mut Vec<u8>, pad_len: usize) {
    msg.extend_from_slice(&PADDING_OPTION_CODE.to_be_bytes());
    msg.extend_from_slice(&(pad_len as u16).to_be_bytes());
    msg.extend(std::iter::repeat_n(0u8, pad_len));
}

fn padding_for(unpadded: usize, block: usize) -> usize {
    (block - unpadded % block) % block
}

struct OptLocation {
    rdata_start: usize,
    rdata_end: usize,
}

/// Walks the raw message and returns the position of its OPT record, if any.
///
/// Walking (rather than parsing into a typed message) is what lets us keep
/// the original bytes: we only ever need offsets.
fn locate_opt_record(msg: &[u8]) -> Result<Option<OptLocation>, PaddingError> {
    if msg.len() < DNS_HEADER_LEN {
        return Err(PaddingError::Truncated);
    }

    let qdcount = u16::from_be_bytes([msg[4], msg[5]]) as usize;
    let ancount = u16::from_be_bytes([msg[6], msg[7]]) as usize;
    let nscount = u16::from_be_bytes([msg[8], msg[9]]) as usize;
    let arcount = u16::from_be_bytes([msg[10], msg[11]]) as usize;

    let mut pos = DNS_HEADER_LEN;

    for _ in 0..qdcount {
        pos = skip_name(msg, pos)?;
        pos = advance(msg, pos, 4)?; // QTYPE + QCLASS.
    }

    for _ in 0..(ancount + nscount) {
        let (_, rdata_start) = skip_record(msg, pos)?;
        pos = skip_rdata(msg, rdata_start)?;
    }

    let mut opt = None;

    for _ in 0..arcount {
        let (rtype, end) = skip_record(msg, pos)?;

        if rtype == OPT_RTYPE {
            if opt.is_some() {
                return Err(PaddingError::MultipleOptRecords);
            }

            let rdata_len = u16::from_be_bytes([msg[end - 2], msg[end - 1]]);

            opt = Some(OptLocation {
                rdata_start: end,
                rdata_end: end + rdata_len as usize,
            });
        }

        pos = skip_rdata(msg, end)?;
    }

    if pos != msg.len() {
        return Err(PaddingError::TrailingBytes);
    }

    Ok(opt)
}

/// Skips one resource record, returning its TYPE and the offset of its RDATA.
fn skip_record(msg: &[u8], pos: usize) -> Result<(u16, usize), PaddingError> {
    let pos = skip_name(msg, pos)?;
    let end = advance(msg, pos, 10)?; // TYPE + CLASS + TTL + RDLENGTH.

    let rtype = u16::from_be_bytes([msg[pos], msg[pos + 1]]);

    Ok((rtype, end))
}

fn skip_rdata(msg: &[u8], rdata_start: usize) -> Result<usize, PaddingError> {
    let rdata_len = u16::from_be_bytes([msg[rdata_start - 2], msg[rdata_start - 1]]) as usize;

    advance(msg, rdata_start, rdata_len)
}

fn skip_name(msg: &[u8], mut pos: usize) -> Result<usize, PaddingError> {
    loop {
        let len = *msg.get(pos).ok_or(PaddingError::Truncated)? as usize;

        match len {
            0 => return Ok(pos + 1),
            l if l & 0xC0 == 0xC0 => return advance(msg, pos, 2), // Compression pointer.
            l if l & 0xC0 != 0 => return Err(PaddingError::BadLabel),
            l => pos = advance(msg, pos, l + 1)?,
        }
    }
}

fn advance(msg: &[u8], pos: usize, by: usize) -> Result<usize, PaddingError> {
    let new = pos.checked_add(by).ok_or(PaddingError::Truncated)?;

    if new > msg.len() {
        return Err(PaddingError::Truncated);
    }

    Ok(new)
}

fn has_padding_option(rdata: &[u8]) -> Result<bool, PaddingError> {
    let mut pos = 0;

    while pos < rdata.len() {
        if pos + OPT_OPTION_HEADER_LEN > rdata.len() {
            return Err(PaddingError::Truncated);
        }

        let code = u16::from_be_bytes([rdata[pos], rdata[pos + 1]]);
        let len = u16::from_be_bytes([rdata[pos + 2], rdata[pos + 3]]) as usize;

        if code == PADDING_OPTION_CODE {
            return Ok(true);
        }

        pos = pos
            .checked_add(OPT_OPTION_HEADER_LEN + len)
            .ok_or(PaddingError::Truncated)?;
    }

    if pos != rdata.len() {
        return Err(PaddingError::Truncated);
    }

    Ok(false)
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Bytes slice is too short to contain a message")]
    TooShort,
    #[error("DNS message is not a query")]
    NotAQuery,
    #[error("DNS message is not a response")]
    NotAResponse,
    #[error(transparent)]
    Parse(#[from] domain::base::wire::ParseError),
}

#[derive(Debug, thiserror::Error)]
pub enum PaddingError {
    #[error("Message ends mid-field")]
    Truncated,
    #[error("Message has bytes after its last record")]
    TrailingBytes,
    #[error("Bad label type in a domain name")]
    BadLabel,
    #[error("Message has more than one OPT record")]
    MultipleOptRecords,
    #[error("OPT record is not the final record")]
    OptNotLast,
    #[error("Record counts exceed the wire format")]
    TooManyRecords,
}

pub mod records {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    use domain::rdata::{A, Aaaa};

    use super::*;

    pub fn a(ip: Ipv4Addr) -> OwnedRecordData {
        OwnedRecordData::A(A::new(ip))
    }

    pub fn aaaa(ip: Ipv6Addr) -> OwnedRecordData {
        OwnedRecordData::Aaaa(Aaaa::new(ip))
    }

    pub fn ip(ip: IpAddr) -> OwnedRecordData {
        match ip {
            IpAddr::V4(ip) => a(ip),
            IpAddr::V6(ip) => aaaa(ip),
        }
    }

    #[expect(
        clippy::wildcard_enum_match_arm,
        reason = "We explicitly only want A and AAAA records."
    )]
    pub fn extract_ip(r: Record<'_>) -> Option<IpAddr> {
        match r.into_data() {
            RecordData::A(a) => Some(a.addr().into()),
            RecordData::Aaaa(aaaa) => Some(aaaa.addr().into()),
            _ => None,
        }
    }
}
