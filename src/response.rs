/*!
CGI response preamble parsing.

A script's stdout starts with `Name: Value` lines terminated by an empty line
(`\n` or `\r\n`). The header block is parsed incrementally from the live
stream; whatever follows the terminator is the body and is left unread in the
reader so the caller can stream it verbatim.
*/
use std::io::BufRead;

use crate::errors::PreambleError;

/// Header multimap preserving insertion order; repeated names accumulate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHeaders {
    entries: Vec<(String, String)>,
}

impl ResponseHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name` (ASCII case-insensitive).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Read the header block from `reader`, leaving it positioned at the first body byte.
///
/// Fails with `PreambleError::Truncated` if the stream ends before the empty
/// terminator line, and with `PreambleError::InvalidHeader` on a line that is
/// not UTF-8; no body must be emitted in either case.
pub fn read_preamble<R: BufRead + ?Sized>(reader: &mut R) -> Result<ResponseHeaders, PreambleError> {
    let mut headers = ResponseHeaders::new();
    let mut line = Vec::with_capacity(256);
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 || line.last() != Some(&b'\n') {
            return Err(PreambleError::Truncated);
        }
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.is_empty() {
            return Ok(headers);
        }
        let text = std::str::from_utf8(&line)
            .map_err(|_| PreambleError::InvalidHeader(String::from_utf8_lossy(&line).into_owned()))?;
        match text.split_once(':') {
            Some((name, value)) => headers.add(name.trim(), value.trim()),
            None => tracing::debug!(line = %text, "ignoring CGI header line without colon"),
        }
    }
}
