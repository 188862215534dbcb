/*!
FastCGI record layer (protocol version 1).

A record is an 8-byte header, up to 65535 content bytes and 0..7 padding bytes
so the whole record is a multiple of 8. Name-value pairs encode each length in
one byte (< 128) or four bytes with the high bit set.
*/
use std::io::{self, Read, Write};

pub const VERSION_1: u8 = 1;
pub const HEADER_LEN: usize = 8;
pub const MAX_CONTENT_LEN: usize = 0xffff;

/// Request id reserved for management records.
pub const NULL_REQUEST_ID: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    BeginRequest,
    AbortRequest,
    EndRequest,
    Params,
    Stdin,
    Stdout,
    Stderr,
    Data,
    GetValues,
    GetValuesResult,
    UnknownType,
    Other(u8),
}

impl RecordType {
    pub fn from_byte(b: u8) -> Self {
        match b {
            1 => RecordType::BeginRequest,
            2 => RecordType::AbortRequest,
            3 => RecordType::EndRequest,
            4 => RecordType::Params,
            5 => RecordType::Stdin,
            6 => RecordType::Stdout,
            7 => RecordType::Stderr,
            8 => RecordType::Data,
            9 => RecordType::GetValues,
            10 => RecordType::GetValuesResult,
            11 => RecordType::UnknownType,
            other => RecordType::Other(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            RecordType::BeginRequest => 1,
            RecordType::AbortRequest => 2,
            RecordType::EndRequest => 3,
            RecordType::Params => 4,
            RecordType::Stdin => 5,
            RecordType::Stdout => 6,
            RecordType::Stderr => 7,
            RecordType::Data => 8,
            RecordType::GetValues => 9,
            RecordType::GetValuesResult => 10,
            RecordType::UnknownType => 11,
            RecordType::Other(b) => b,
        }
    }
}

/// Role requested in BEGIN_REQUEST; only the responder role is served.
pub const ROLE_RESPONDER: u16 = 1;
pub const FLAG_KEEP_CONN: u8 = 1;

/// protocolStatus values of END_REQUEST.
pub const REQUEST_COMPLETE: u8 = 0;
pub const UNKNOWN_ROLE: u8 = 3;

/// A decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub kind: RecordType,
    pub request_id: u16,
    pub content: Vec<u8>,
}

/// Read one record. `Ok(None)` on a clean EOF between records.
pub fn read_record<R: Read + ?Sized>(r: &mut R) -> io::Result<Option<Record>> {
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        match r.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed inside a record header",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    if header[0] != VERSION_1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported FastCGI version {}", header[0]),
        ));
    }
    let kind = RecordType::from_byte(header[1]);
    let request_id = u16::from_be_bytes([header[2], header[3]]);
    let content_len = u16::from_be_bytes([header[4], header[5]]) as usize;
    let padding_len = header[6] as usize;

    let mut content = vec![0u8; content_len];
    r.read_exact(&mut content)?;
    let mut padding = [0u8; 255];
    r.read_exact(&mut padding[..padding_len])?;

    Ok(Some(Record {
        kind,
        request_id,
        content,
    }))
}

fn padding_for(len: usize) -> usize {
    (8 - len % 8) % 8
}

/// Encode one record into `out`. `content` must fit in a single record.
pub fn encode_record(out: &mut Vec<u8>, kind: RecordType, request_id: u16, content: &[u8]) {
    debug_assert!(content.len() <= MAX_CONTENT_LEN);
    let padding = padding_for(content.len());
    let len = content.len() as u16;
    out.reserve(HEADER_LEN + content.len() + padding);
    out.push(VERSION_1);
    out.push(kind.as_byte());
    out.extend_from_slice(&request_id.to_be_bytes());
    out.extend_from_slice(&len.to_be_bytes());
    out.push(padding as u8);
    out.push(0);
    out.extend_from_slice(content);
    out.resize(out.len() + padding, 0);
}

/// Write one record with a single `write_all`.
pub fn write_record<W: Write + ?Sized>(
    w: &mut W,
    kind: RecordType,
    request_id: u16,
    content: &[u8],
) -> io::Result<()> {
    let mut buf = Vec::new();
    encode_record(&mut buf, kind, request_id, content);
    w.write_all(&buf)
}

/// Write stream data split across as many records as needed. Empty data writes
/// nothing; the end-of-stream marker is a separate empty record.
pub fn write_stream<W: Write + ?Sized>(
    w: &mut W,
    kind: RecordType,
    request_id: u16,
    data: &[u8],
) -> io::Result<()> {
    let mut buf = Vec::new();
    for chunk in data.chunks(MAX_CONTENT_LEN) {
        encode_record(&mut buf, kind, request_id, chunk);
    }
    if buf.is_empty() {
        return Ok(());
    }
    w.write_all(&buf)
}

/// Body of BEGIN_REQUEST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequest {
    pub role: u16,
    pub keep_conn: bool,
}

impl BeginRequest {
    pub fn parse(content: &[u8]) -> io::Result<Self> {
        if content.len() < 8 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "short BEGIN_REQUEST body",
            ));
        }
        Ok(BeginRequest {
            role: u16::from_be_bytes([content[0], content[1]]),
            keep_conn: content[2] & FLAG_KEEP_CONN != 0,
        })
    }

    pub fn encode(&self) -> [u8; 8] {
        let role = self.role.to_be_bytes();
        let flags = if self.keep_conn { FLAG_KEEP_CONN } else { 0 };
        [role[0], role[1], flags, 0, 0, 0, 0, 0]
    }
}

pub fn end_request_body(app_status: u32, protocol_status: u8) -> [u8; 8] {
    let s = app_status.to_be_bytes();
    [s[0], s[1], s[2], s[3], protocol_status, 0, 0, 0]
}

pub fn unknown_type_body(kind: u8) -> [u8; 8] {
    [kind, 0, 0, 0, 0, 0, 0, 0]
}

fn read_length(buf: &[u8], pos: &mut usize) -> io::Result<usize> {
    let first = *buf.get(*pos).ok_or_else(truncated_pairs)?;
    if first >> 7 == 0 {
        *pos += 1;
        return Ok(first as usize);
    }
    let bytes = buf.get(*pos..*pos + 4).ok_or_else(truncated_pairs)?;
    *pos += 4;
    Ok((u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) & 0x7fff_ffff) as usize)
}

fn truncated_pairs() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "truncated name-value pair")
}

/// Decode a complete name-value pair stream.
pub fn decode_pairs(buf: &[u8]) -> io::Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut pairs = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        let name_len = read_length(buf, &mut pos)?;
        let value_len = read_length(buf, &mut pos)?;
        let name = buf.get(pos..pos + name_len).ok_or_else(truncated_pairs)?;
        pos += name_len;
        let value = buf.get(pos..pos + value_len).ok_or_else(truncated_pairs)?;
        pos += value_len;
        pairs.push((name.to_vec(), value.to_vec()));
    }
    Ok(pairs)
}

fn push_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
    } else {
        out.extend_from_slice(&((len as u32) | 0x8000_0000).to_be_bytes());
    }
}

pub fn encode_pair(out: &mut Vec<u8>, name: &[u8], value: &[u8]) {
    push_length(out, name.len());
    push_length(out, value.len());
    out.extend_from_slice(name);
    out.extend_from_slice(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_records_are_padded_to_eight_bytes() {
        let mut buf = Vec::new();
        encode_record(&mut buf, RecordType::Stdout, 7, b"hello");
        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[..8], &[1, 6, 0, 7, 0, 5, 3, 0]);

        let rec = read_record(&mut Cursor::new(buf)).unwrap().unwrap();
        assert_eq!(rec.kind, RecordType::Stdout);
        assert_eq!(rec.request_id, 7);
        assert_eq!(rec.content, b"hello");
    }

    #[test]
    fn test_clean_eof_and_truncated_header() {
        assert!(read_record(&mut Cursor::new(Vec::new())).unwrap().is_none());
        let err = read_record(&mut Cursor::new(vec![1, 6, 0])).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_long_stream_is_split() {
        let data = vec![b'x'; MAX_CONTENT_LEN + 10];
        let mut buf = Vec::new();
        write_stream(&mut buf, RecordType::Stdout, 1, &data).unwrap();
        let mut cur = Cursor::new(buf);
        let a = read_record(&mut cur).unwrap().unwrap();
        let b = read_record(&mut cur).unwrap().unwrap();
        assert_eq!(a.content.len(), MAX_CONTENT_LEN);
        assert_eq!(b.content.len(), 10);
        assert!(read_record(&mut cur).unwrap().is_none());
    }

    #[test]
    fn test_pairs_with_long_lengths() {
        let long = vec![b'v'; 300];
        let mut buf = Vec::new();
        encode_pair(&mut buf, b"SHORT", b"1");
        encode_pair(&mut buf, b"LONG", &long);
        // 300 needs the four-byte form
        assert_eq!(&buf[8..14], &[4, 0x80, 0, 1, 44, b'L']);
        let pairs = decode_pairs(&buf).unwrap();
        assert_eq!(pairs[0], (b"SHORT".to_vec(), b"1".to_vec()));
        assert_eq!(pairs[1].1.len(), 300);

        buf.truncate(buf.len() - 1);
        assert!(decode_pairs(&buf).is_err());
    }

    #[test]
    fn test_begin_request_flags() {
        let body = BeginRequest {
            role: ROLE_RESPONDER,
            keep_conn: true,
        }
        .encode();
        let parsed = BeginRequest::parse(&body).unwrap();
        assert_eq!(parsed.role, ROLE_RESPONDER);
        assert!(parsed.keep_conn);
        assert!(BeginRequest::parse(&body[..3]).is_err());
    }
}
