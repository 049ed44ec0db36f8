//! Lazy record parsers, one per format family.
//!
//! Every parser is single-pass over its stream and yields
//! `Result<RawRecord, RecordError>`: a malformed record is an `Err` item that
//! the caller counts and skips. Errors the stream cannot recover from (XML
//! syntax, a broken array, an I/O failure) are yielded once and end the stream.

use crate::archive::LeafEntry;
use crate::config::{FormatChoice, RecordConfig, READ_BUFFER_SIZE};
use crate::models::{Provenance, RawRecord, RecordPayload};
use memchr::memchr2;
use quick_xml::events::Event;
use quick_xml::name::ResolveResult;
use quick_xml::NsReader;
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("{location}: invalid JSON: {source}")]
    Json {
        location: String,
        source: serde_json::Error,
    },

    #[error("{location}: XML error: {reason}")]
    Xml { location: String, reason: String },

    #[error("{location}: malformed stream: {reason}")]
    Structure { location: String, reason: String },

    #[error("{location}: read error: {source}")]
    Io { location: String, source: io::Error },
}

impl RecordError {
    /// The stream itself failed (truncated or corrupt compression), as
    /// opposed to one record being malformed. Always the last item.
    pub fn is_read_failure(&self) -> bool {
        matches!(self, RecordError::Io { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFormat {
    JsonLines,
    JsonArray,
    Xml,
}

impl RecordFormat {
    /// `None` means the leaf isn't a record file (a README inside an archive, say).
    pub fn resolve(choice: FormatChoice, leaf_path: &str) -> Option<Self> {
        match choice {
            FormatChoice::Jsonl => Some(RecordFormat::JsonLines),
            FormatChoice::JsonArray => Some(RecordFormat::JsonArray),
            FormatChoice::Xml => Some(RecordFormat::Xml),
            FormatChoice::Auto => {
                let lower = leaf_path.to_ascii_lowercase();
                if lower.ends_with(".jsonl") || lower.ends_with(".ndjson") {
                    Some(RecordFormat::JsonLines)
                } else if lower.ends_with(".json") {
                    Some(RecordFormat::JsonArray)
                } else if lower.ends_with(".xml") {
                    Some(RecordFormat::Xml)
                } else {
                    None
                }
            }
        }
    }
}

/// Stops a unit whose stream is mostly garbage instead of returning a
/// near-empty result as if it had succeeded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErrorBudget {
    pub max_error_rate: f64,
    /// Attempts required before the rate is trusted mid-stream
    pub min_sample: u64,
}

impl ErrorBudget {
    pub fn exceeded(&self, attempted: u64, errors: u64) -> bool {
        attempted >= self.min_sample.max(1) && self.rate_above(attempted, errors)
    }

    /// End-of-unit check: every attempted record counts, however few.
    pub fn exceeded_final(&self, attempted: u64, errors: u64) -> bool {
        attempted > 0 && self.rate_above(attempted, errors)
    }

    fn rate_above(&self, attempted: u64, errors: u64) -> bool {
        errors as f64 / attempted as f64 > self.max_error_rate
    }
}

/// Provenance shared by every record of one leaf.
#[derive(Debug, Clone)]
pub struct RecordOrigin {
    pub source_name: String,
    pub unit_id: String,
    pub leaf: String,
}

impl RecordOrigin {
    fn at(&self, location: String) -> Provenance {
        Provenance {
            source_name: self.source_name.clone(),
            unit_id: self.unit_id.clone(),
            location,
        }
    }
}

pub type RecordStream = Box<dyn Iterator<Item = Result<RawRecord, RecordError>> + Send>;

pub fn parse(
    format: RecordFormat,
    leaf: LeafEntry,
    source_name: &str,
    unit_id: &str,
    records: &RecordConfig,
) -> RecordStream {
    let origin = RecordOrigin {
        source_name: source_name.to_string(),
        unit_id: unit_id.to_string(),
        leaf: leaf.path,
    };
    let reader = BufReader::with_capacity(READ_BUFFER_SIZE, leaf.reader);
    match format {
        RecordFormat::JsonLines => Box::new(JsonLinesParser::new(reader, origin)),
        RecordFormat::JsonArray => Box::new(JsonArrayParser::new(
            reader,
            origin,
            records.json_array_path.clone(),
        )),
        RecordFormat::Xml => {
            let element = records.xml_record_element.clone().unwrap_or_default();
            Box::new(XmlRecordParser::new(
                reader,
                origin,
                &element,
                records.xml_fields(),
            ))
        }
    }
}

// ---------------------------------------------------------------------------
// Line-delimited JSON
// ---------------------------------------------------------------------------

pub struct JsonLinesParser<R> {
    reader: R,
    origin: RecordOrigin,
    line: Vec<u8>,
    line_no: u64,
    done: bool,
}

impl<R: BufRead> JsonLinesParser<R> {
    pub fn new(reader: R, origin: RecordOrigin) -> Self {
        Self {
            reader,
            origin,
            line: Vec::with_capacity(4096),
            line_no: 0,
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for JsonLinesParser<R> {
    type Item = Result<RawRecord, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            self.line.clear();
            match self.reader.read_until(b'\n', &mut self.line) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => {
                    self.line_no += 1;
                    let trimmed = self.line.trim_ascii();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let location = format!("{}:{}", self.origin.leaf, self.line_no);
                    return Some(match serde_json::from_slice::<Value>(trimmed) {
                        Ok(value) => Ok(RawRecord {
                            provenance: self.origin.at(location),
                            payload: RecordPayload::Json(value),
                        }),
                        Err(source) => Err(RecordError::Json { location, source }),
                    });
                }
                Err(source) => {
                    self.done = true;
                    return Some(Err(RecordError::Io {
                        location: format!("{}:{}", self.origin.leaf, self.line_no + 1),
                        source,
                    }));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Token-streamed JSON array
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum ScanError {
    Io(io::Error),
    Syntax(String),
}

impl From<io::Error> for ScanError {
    fn from(e: io::Error) -> Self {
        ScanError::Io(e)
    }
}

fn eof() -> ScanError {
    ScanError::Syntax("unexpected end of input".to_string())
}

/// Minimal byte-level JSON tokenizer: enough structure to find the target
/// array and cut it into elements, never more than one element in memory.
struct Scanner<R> {
    reader: R,
}

impl<R: BufRead> Scanner<R> {
    fn peek_non_ws(&mut self) -> Result<Option<u8>, ScanError> {
        loop {
            let buf = self.reader.fill_buf()?;
            if buf.is_empty() {
                return Ok(None);
            }
            let ws = buf.iter().take_while(|b| b.is_ascii_whitespace()).count();
            if ws < buf.len() {
                let first = buf[ws];
                self.reader.consume(ws);
                return Ok(Some(first));
            }
            let len = buf.len();
            self.reader.consume(len);
        }
    }

    fn peek(&mut self) -> Result<Option<u8>, ScanError> {
        Ok(self.reader.fill_buf()?.first().copied())
    }

    fn bump(&mut self) {
        self.reader.consume(1);
    }

    fn next_byte(&mut self) -> Result<Option<u8>, ScanError> {
        let b = self.peek()?;
        if b.is_some() {
            self.bump();
        }
        Ok(b)
    }

    fn expect(&mut self, want: u8) -> Result<(), ScanError> {
        match self.peek_non_ws()? {
            Some(b) if b == want => {
                self.bump();
                Ok(())
            }
            Some(b) => Err(ScanError::Syntax(format!(
                "expected `{}`, found `{}`",
                want as char, b as char
            ))),
            None => Err(eof()),
        }
    }

    /// Copies a string body up to and including its closing quote; the
    /// opening quote has already been consumed.
    fn copy_string(&mut self, mut sink: Option<&mut Vec<u8>>) -> Result<(), ScanError> {
        loop {
            let (consumed, closed, escaped) = {
                let buf = self.reader.fill_buf()?;
                if buf.is_empty() {
                    return Err(ScanError::Syntax("unterminated string".to_string()));
                }
                match memchr2(b'"', b'\\', buf) {
                    None => {
                        if let Some(s) = sink.as_deref_mut() {
                            s.extend_from_slice(buf);
                        }
                        (buf.len(), false, false)
                    }
                    Some(i) => {
                        if let Some(s) = sink.as_deref_mut() {
                            s.extend_from_slice(&buf[..=i]);
                        }
                        (i + 1, buf[i] == b'"', buf[i] == b'\\')
                    }
                }
            };
            self.reader.consume(consumed);

            if closed {
                return Ok(());
            }
            if escaped {
                let b = self.next_byte()?.ok_or_else(eof)?;
                if let Some(s) = sink.as_deref_mut() {
                    s.push(b);
                }
            }
        }
    }

    /// Consumes one JSON value, copying its bytes into `sink` when given.
    fn capture_value(&mut self, mut sink: Option<&mut Vec<u8>>) -> Result<(), ScanError> {
        let first = self.peek_non_ws()?.ok_or_else(eof)?;
        match first {
            b'"' => {
                self.bump();
                if let Some(s) = sink.as_deref_mut() {
                    s.push(b'"');
                }
                self.copy_string(sink)
            }
            b'{' | b'[' => {
                let mut depth = 0usize;
                loop {
                    let b = self.next_byte()?.ok_or_else(eof)?;
                    if let Some(s) = sink.as_deref_mut() {
                        s.push(b);
                    }
                    match b {
                        b'"' => self.copy_string(sink.as_deref_mut())?,
                        b'{' | b'[' => depth += 1,
                        b'}' | b']' => {
                            depth -= 1;
                            if depth == 0 {
                                return Ok(());
                            }
                        }
                        _ => {}
                    }
                }
            }
            _ => loop {
                match self.peek()? {
                    Some(b) if !matches!(b, b',' | b']' | b'}') && !b.is_ascii_whitespace() => {
                        if let Some(s) = sink.as_deref_mut() {
                            s.push(b);
                        }
                        self.bump();
                    }
                    _ => return Ok(()),
                }
            },
        }
    }

    fn read_key(&mut self) -> Result<String, ScanError> {
        self.expect(b'"')?;
        let mut raw = vec![b'"'];
        self.copy_string(Some(&mut raw))?;
        serde_json::from_slice(&raw).map_err(|e| ScanError::Syntax(format!("bad object key: {e}")))
    }

    /// Walks `path` through nested objects, skipping sibling values, and
    /// consumes the opening bracket of the target array.
    fn seek_array(&mut self, path: &[String]) -> Result<(), ScanError> {
        for key in path {
            self.expect(b'{')?;
            loop {
                if self.peek_non_ws()? == Some(b'}') {
                    return Err(ScanError::Syntax(format!("key `{key}` not found")));
                }
                let found = self.read_key()?;
                self.expect(b':')?;
                if &found == key {
                    break;
                }
                self.capture_value(None)?;
                match self.peek_non_ws()? {
                    Some(b',') => self.bump(),
                    Some(b'}') => {
                        return Err(ScanError::Syntax(format!("key `{key}` not found")));
                    }
                    Some(b) => {
                        return Err(ScanError::Syntax(format!(
                            "expected `,` or `}}`, found `{}`",
                            b as char
                        )))
                    }
                    None => return Err(eof()),
                }
            }
        }
        self.expect(b'[')
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArrayState {
    Seek,
    First,
    Element,
    Between,
    Done,
}

pub struct JsonArrayParser<R> {
    scanner: Scanner<R>,
    origin: RecordOrigin,
    array_path: Vec<String>,
    element: Vec<u8>,
    index: u64,
    state: ArrayState,
}

impl<R: BufRead> JsonArrayParser<R> {
    /// `array_path` lists object keys from the root; empty means the root is the array.
    pub fn new(reader: R, origin: RecordOrigin, array_path: Vec<String>) -> Self {
        Self {
            scanner: Scanner { reader },
            origin,
            array_path,
            element: Vec::with_capacity(4096),
            index: 0,
            state: ArrayState::Seek,
        }
    }

    fn fail(&mut self, e: ScanError) -> RecordError {
        self.state = ArrayState::Done;
        let location = format!("{}[{}]", self.origin.leaf, self.index);
        match e {
            ScanError::Io(source) => RecordError::Io { location, source },
            ScanError::Syntax(reason) => RecordError::Structure { location, reason },
        }
    }
}

impl<R: BufRead> Iterator for JsonArrayParser<R> {
    type Item = Result<RawRecord, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.state {
                ArrayState::Done => return None,
                ArrayState::Seek => {
                    if let Err(e) = self.scanner.seek_array(&self.array_path) {
                        return Some(Err(self.fail(e)));
                    }
                    self.state = ArrayState::First;
                }
                ArrayState::First => match self.scanner.peek_non_ws() {
                    Ok(Some(b']')) => {
                        self.scanner.bump();
                        self.state = ArrayState::Done;
                        return None;
                    }
                    Ok(Some(_)) => self.state = ArrayState::Element,
                    Ok(None) => return Some(Err(self.fail(eof()))),
                    Err(e) => return Some(Err(self.fail(e))),
                },
                ArrayState::Between => match self.scanner.peek_non_ws() {
                    Ok(Some(b',')) => {
                        self.scanner.bump();
                        self.state = ArrayState::Element;
                    }
                    Ok(Some(b']')) => {
                        self.scanner.bump();
                        self.state = ArrayState::Done;
                        return None;
                    }
                    Ok(Some(b)) => {
                        let e = ScanError::Syntax(format!(
                            "expected `,` or `]`, found `{}`",
                            b as char
                        ));
                        return Some(Err(self.fail(e)));
                    }
                    Ok(None) => return Some(Err(self.fail(eof()))),
                    Err(e) => return Some(Err(self.fail(e))),
                },
                ArrayState::Element => {
                    self.element.clear();
                    if let Err(e) = self.scanner.capture_value(Some(&mut self.element)) {
                        return Some(Err(self.fail(e)));
                    }
                    let location = format!("{}[{}]", self.origin.leaf, self.index);
                    self.index += 1;
                    self.state = ArrayState::Between;
                    return Some(match serde_json::from_slice::<Value>(&self.element) {
                        Ok(value) => Ok(RawRecord {
                            provenance: self.origin.at(location),
                            payload: RecordPayload::Json(value),
                        }),
                        Err(source) => Err(RecordError::Json { location, source }),
                    });
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Namespaced XML
// ---------------------------------------------------------------------------

/// One owned parse step, so the event buffer borrow ends before state changes.
enum Step {
    Start {
        local: Vec<u8>,
        ns: Option<Vec<u8>>,
    },
    Empty {
        local: Vec<u8>,
        ns: Option<Vec<u8>>,
    },
    Text(String),
    End,
    Eof,
    Other,
}

struct PartialRecord {
    ns: Option<Vec<u8>>,
    depth: usize,
    fields: BTreeMap<String, Option<String>>,
    active: Option<(String, usize)>,
    text: String,
}

impl PartialRecord {
    fn accept_text(&mut self, text: &str) {
        let text = text.trim();
        if self.active.is_none() || text.is_empty() {
            return;
        }
        if !self.text.is_empty() {
            self.text.push(' ');
        }
        self.text.push_str(text);
    }
}

/// Extracts named child fields from every `record_element`, whatever namespace
/// prefix or URI the document binds it to.
///
/// Only the record element's own namespace (or no namespace) counts for its
/// fields, so a same-named element from a foreign vocabulary is ignored.
pub struct XmlRecordParser<R> {
    reader: NsReader<R>,
    buf: Vec<u8>,
    origin: RecordOrigin,
    record_element: Vec<u8>,
    /// Empty means every child element is captured by local name
    fields: Vec<String>,
    count: u64,
    done: bool,
}

impl<R: BufRead> XmlRecordParser<R> {
    pub fn new(reader: R, origin: RecordOrigin, record_element: &str, fields: Vec<String>) -> Self {
        Self {
            reader: NsReader::from_reader(reader),
            buf: Vec::with_capacity(8192),
            origin,
            record_element: record_element.as_bytes().to_vec(),
            fields,
            count: 0,
            done: false,
        }
    }

    fn read_step(&mut self) -> Result<Step, quick_xml::Error> {
        self.buf.clear();
        let (resolved, event) = self.reader.read_resolved_event_into(&mut self.buf)?;
        let ns = match resolved {
            ResolveResult::Bound(ns) => Some(ns.as_ref().to_vec()),
            _ => None,
        };
        Ok(match event {
            Event::Start(e) => Step::Start {
                local: e.local_name().as_ref().to_vec(),
                ns,
            },
            Event::Empty(e) => Step::Empty {
                local: e.local_name().as_ref().to_vec(),
                ns,
            },
            Event::Text(t) => Step::Text(t.unescape()?.into_owned()),
            Event::CData(c) => Step::Text(String::from_utf8_lossy(&c).into_owned()),
            Event::End(_) => Step::End,
            Event::Eof => Step::Eof,
            _ => Step::Other,
        })
    }

    fn empty_fields(&self) -> BTreeMap<String, Option<String>> {
        self.fields.iter().map(|f| (f.clone(), None)).collect()
    }

    fn field_for(&self, local: &[u8]) -> Option<String> {
        let name = std::str::from_utf8(local).ok()?;
        if self.fields.is_empty() || self.fields.iter().any(|f| f == name) {
            Some(name.to_string())
        } else {
            None
        }
    }

    fn finish(&mut self, record: PartialRecord) -> RawRecord {
        let location = format!("{}#{}", self.origin.leaf, self.count);
        self.count += 1;
        RawRecord {
            provenance: self.origin.at(location),
            payload: RecordPayload::Xml(record.fields),
        }
    }

    fn error(&mut self, e: quick_xml::Error) -> RecordError {
        self.done = true;
        let location = format!("{}@{}", self.origin.leaf, self.reader.buffer_position());
        match e {
            quick_xml::Error::Io(source) => RecordError::Io {
                location,
                source: io::Error::new(source.kind(), source.to_string()),
            },
            other => RecordError::Xml {
                location,
                reason: other.to_string(),
            },
        }
    }
}

impl<R: BufRead> Iterator for XmlRecordParser<R> {
    type Item = Result<RawRecord, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut current: Option<PartialRecord> = None;

        loop {
            let step = match self.read_step() {
                Ok(step) => step,
                Err(e) => return Some(Err(self.error(e))),
            };

            match step {
                Step::Start { local, ns } => match current.as_mut() {
                    None if local == self.record_element => {
                        current = Some(PartialRecord {
                            ns,
                            depth: 0,
                            fields: self.empty_fields(),
                            active: None,
                            text: String::new(),
                        });
                    }
                    None => {}
                    Some(rec) => {
                        rec.depth += 1;
                        let same_ns = ns.is_none() || ns == rec.ns;
                        if rec.active.is_none() && same_ns {
                            if let Some(name) = self.field_for(&local) {
                                if rec.fields.get(&name).is_none_or(|v| v.is_none()) {
                                    rec.active = Some((name, rec.depth));
                                    rec.text.clear();
                                }
                            }
                        }
                    }
                },
                Step::Empty { local, ns } => {
                    if current.is_none() && local == self.record_element {
                        let record = PartialRecord {
                            ns,
                            depth: 0,
                            fields: self.empty_fields(),
                            active: None,
                            text: String::new(),
                        };
                        return Some(Ok(self.finish(record)));
                    }
                    if let Some(rec) = current.as_mut() {
                        if rec.active.is_none() {
                            if let Some(name) = self.field_for(&local) {
                                rec.fields.entry(name).or_insert(None);
                            }
                        }
                    }
                }
                Step::Text(text) => {
                    if let Some(rec) = current.as_mut() {
                        rec.accept_text(&text);
                    }
                }
                Step::End => {
                    let Some(rec) = current.as_mut() else {
                        continue;
                    };
                    if rec.depth == 0 {
                        if let Some(record) = current.take() {
                            return Some(Ok(self.finish(record)));
                        }
                        continue;
                    }
                    if rec.active.as_ref().is_some_and(|(_, d)| *d == rec.depth) {
                        if let Some((name, _)) = rec.active.take() {
                            let value = std::mem::take(&mut rec.text);
                            rec.fields
                                .insert(name, if value.is_empty() { None } else { Some(value) });
                        }
                    }
                    rec.depth -= 1;
                }
                Step::Eof => {
                    self.done = true;
                    if current.is_some() {
                        return Some(Err(RecordError::Structure {
                            location: format!("{}#{}", self.origin.leaf, self.count),
                            reason: "document ended inside a record".to_string(),
                        }));
                    }
                    return None;
                }
                Step::Other => {}
            }
        }
    }
}
