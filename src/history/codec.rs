//! On-disk document format for history data files.
//!
//! A data file is a single `<history>` root holding `<record timestamp="..">`
//! elements, each with one child element per field:
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <history>
//! <record timestamp="1700000000000"><from>alice</from><body>hi &amp;amp; bye</body></record>
//! </history>
//! ```
//!
//! Field values are XML-escaped once when a record is encoded and escaped
//! again by the serializer, so reading a value back takes one XML parse plus
//! one [`unescape`].

use super::record::HistoryRecord;
use crate::error::{HistoryError, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader as XmlReader, Writer as XmlWriter};
use tracing::{debug, warn};

pub const ROOT_ELEMENT: &str = "history";
pub const RECORD_ELEMENT: &str = "record";
pub const TIMESTAMP_ATTRIBUTE: &str = "timestamp";

const RECORD_START: &str = "<record";
const RECORD_END: &str = "</record>";

/// Human-readable timestamp layout accepted for older files
const LEGACY_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f%z";
const LEGACY_NAIVE_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// One field element inside a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyNode {
    pub name: String,
    /// Element text as stored (escaped once); `None` when the element is empty
    pub text: Option<String>,
}

/// One `<record>` element as it appears in a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordNode {
    pub timestamp: Option<String>,
    pub properties: Vec<PropertyNode>,
}

impl RecordNode {
    /// Parsed value of the timestamp attribute
    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp.as_deref().and_then(parse_timestamp)
    }

    fn property_mut(&mut self, name: &str) -> Option<&mut PropertyNode> {
        self.properties.iter_mut().find(|p| p.name == name)
    }

    /// Stored text of a field, unescaped
    pub fn property_value(&self, name: &str) -> Option<String> {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .and_then(|p| p.text.as_deref())
            .map(unescape)
    }

    /// Replace (or add) a field value; an empty value removes the field
    pub fn set_property_value(&mut self, name: &str, value: &str) {
        let Some(text) = encode_value(value) else {
            self.properties.retain(|p| p.name != name);
            return;
        };
        match self.property_mut(name) {
            Some(property) => property.text = Some(text),
            None => self.properties.push(PropertyNode {
                name: name.to_string(),
                text: Some(text),
            }),
        }
    }
}

/// Parsed in-memory form of one data file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryDocument {
    records: Vec<RecordNode>,
}

impl HistoryDocument {
    /// Empty document shell (just the root element)
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[RecordNode] {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut Vec<RecordNode> {
        &mut self.records
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn push(&mut self, record: RecordNode) {
        self.records.push(record);
    }
}

/// Escape text for storage inside an element
pub fn escape(value: &str) -> String {
    quick_xml::escape::escape(value).into_owned()
}

/// Reverse the escaping applied by [`escape`].
///
/// Text that is not valid escaped XML is returned unchanged.
pub fn unescape(value: &str) -> String {
    match quick_xml::escape::unescape(value) {
        Ok(unescaped) => unescaped.into_owned(),
        Err(_) => value.to_string(),
    }
}

/// Canonical timestamp attribute value: epoch milliseconds
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.timestamp_millis().to_string()
}

/// Parse a timestamp attribute; epoch millis first, then the legacy
/// human-readable layout
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(millis) = raw.parse::<i64>() {
        return Utc.timestamp_millis_opt(millis).single();
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, LEGACY_DATE_FORMAT) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, LEGACY_NAIVE_DATE_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn encode_value(value: &str) -> Option<String> {
    let value = value.replace('\0', " ");
    if value.is_empty() {
        None
    } else {
        Some(escape(&value))
    }
}

/// Encode a record into its document node.
///
/// Empty values cannot survive an empty element, so those fields are left out.
pub fn encode_record(record: &HistoryRecord) -> RecordNode {
    let properties = record
        .properties()
        .iter()
        .filter_map(|(name, value)| {
            encode_value(value).map(|text| PropertyNode {
                name: name.clone(),
                text: Some(text),
            })
        })
        .collect();

    RecordNode {
        timestamp: Some(format_timestamp(record.timestamp())),
        properties,
    }
}

/// Decode a record node.
///
/// Returns `None` (the record is skipped) when the timestamp is missing or
/// unparseable, or when any field element has no text.
pub fn decode_record(node: &RecordNode) -> Option<HistoryRecord> {
    let timestamp = match node.parsed_timestamp() {
        Some(ts) => ts,
        None => {
            debug!(timestamp = ?node.timestamp, "Skipping record with bad timestamp");
            return None;
        }
    };

    let mut properties = Vec::with_capacity(node.properties.len());
    for property in &node.properties {
        match property.text.as_deref() {
            Some(text) if !text.is_empty() => {
                properties.push((property.name.clone(), unescape(text)));
            }
            _ => {
                debug!(field = %property.name, "Skipping record with empty field");
                return None;
            }
        }
    }

    Some(HistoryRecord::new(properties, timestamp))
}

fn element_name(element: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(element.name().as_ref()).into_owned()
}

fn timestamp_attribute(element: &BytesStart<'_>) -> Result<Option<String>> {
    for attr in element.attributes() {
        let attr = attr.map_err(|e| HistoryError::malformed(e.to_string()))?;
        if attr.key.as_ref() == TIMESTAMP_ATTRIBUTE.as_bytes() {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

/// Parse a complete document.
///
/// Fails on malformed XML, on elements left open at end of input and on
/// input without a root element. Records are the `<record>` children of the
/// root; anything else is ignored.
pub fn parse_document(xml: &str) -> Result<HistoryDocument> {
    let mut reader = XmlReader::from_str(xml);
    reader.trim_text(false);

    let mut buf = Vec::new();
    let mut open: Vec<String> = Vec::new();
    let mut seen_root = false;
    let mut document = HistoryDocument::new();
    let mut record: Option<RecordNode> = None;
    let mut property: Option<PropertyNode> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                let name = element_name(&e);
                match open.len() {
                    0 if seen_root => {
                        return Err(HistoryError::malformed("more than one root element"))
                    }
                    0 => seen_root = true,
                    1 if name == RECORD_ELEMENT => {
                        record = Some(RecordNode {
                            timestamp: timestamp_attribute(&e)?,
                            properties: Vec::new(),
                        });
                    }
                    2 if record.is_some() => {
                        property = Some(PropertyNode { name: name.clone(), text: None });
                    }
                    _ => {}
                }
                open.push(name);
            }
            Event::Empty(e) => {
                let name = element_name(&e);
                match open.len() {
                    0 if seen_root => {
                        return Err(HistoryError::malformed("more than one root element"))
                    }
                    0 => seen_root = true,
                    1 if name == RECORD_ELEMENT => document.push(RecordNode {
                        timestamp: timestamp_attribute(&e)?,
                        properties: Vec::new(),
                    }),
                    2 => {
                        if let Some(current) = record.as_mut() {
                            current.properties.push(PropertyNode { name, text: None });
                        }
                    }
                    _ => {}
                }
            }
            Event::End(_) => {
                match open.len() {
                    0 => return Err(HistoryError::malformed("unexpected closing tag")),
                    2 => {
                        if let Some(current) = record.take() {
                            document.push(current);
                        }
                    }
                    3 => {
                        if let (Some(current), Some(done)) = (record.as_mut(), property.take()) {
                            current.properties.push(done);
                        }
                    }
                    _ => {}
                }
                open.pop();
            }
            Event::Text(t) => {
                let text = t.unescape()?;
                if open.len() == 3 {
                    if let Some(current) = property.as_mut() {
                        current.text.get_or_insert_with(String::new).push_str(&text);
                    }
                } else if open.is_empty() && !text.trim().is_empty() {
                    return Err(HistoryError::malformed("text outside the root element"));
                }
            }
            Event::CData(c) => {
                if open.len() == 3 {
                    if let Some(current) = property.as_mut() {
                        let raw = c.into_inner();
                        // stored text is kept escaped once, like plain text nodes
                        let text = escape(&String::from_utf8_lossy(&raw));
                        current.text.get_or_insert_with(String::new).push_str(&text);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if let Some(name) = open.last() {
        return Err(HistoryError::malformed(format!(
            "document ends inside <{}>",
            name
        )));
    }
    if !seen_root {
        return Err(HistoryError::malformed("document has no root element"));
    }

    Ok(document)
}

/// Serialize a document, one record per line
pub fn serialize_document(document: &HistoryDocument) -> Result<String> {
    let mut writer = XmlWriter::new(Vec::new());
    let newline = || Event::Text(BytesText::from_escaped("\n"));

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(newline())?;
    writer.write_event(Event::Start(BytesStart::new(ROOT_ELEMENT)))?;

    for record in document.records() {
        writer.write_event(newline())?;

        let mut start = BytesStart::new(RECORD_ELEMENT);
        if let Some(timestamp) = &record.timestamp {
            start.push_attribute((TIMESTAMP_ATTRIBUTE, timestamp.as_str()));
        }
        writer.write_event(Event::Start(start))?;

        for property in &record.properties {
            let name = property.name.as_str();
            match property.text.as_deref() {
                Some(text) if !text.is_empty() => {
                    writer.write_event(Event::Start(BytesStart::new(name)))?;
                    writer.write_event(Event::Text(BytesText::new(text)))?;
                    writer.write_event(Event::End(BytesEnd::new(name)))?;
                }
                _ => writer.write_event(Event::Empty(BytesStart::new(name)))?,
            }
        }

        writer.write_event(Event::End(BytesEnd::new(RECORD_ELEMENT)))?;
    }

    writer.write_event(newline())?;
    writer.write_event(Event::End(BytesEnd::new(ROOT_ELEMENT)))?;
    writer.write_event(newline())?;

    String::from_utf8(writer.into_inner()).map_err(|e| HistoryError::malformed(e.to_string()))
}

/// Position of the next `<record` start tag in `text`
fn find_record_start(text: &str) -> Option<usize> {
    text.match_indices(RECORD_START).map(|(i, _)| i).find(|&i| {
        match text[i + RECORD_START.len()..].chars().next() {
            None => true,
            Some(c) => c.is_whitespace() || c == '>' || c == '/',
        }
    })
}

/// Split raw text into `<record ...>...</record>` fragments.
///
/// A fragment still open when the next record starts, or at end of input,
/// is truncated and dropped.
fn record_fragments(raw: &str) -> Vec<String> {
    let mut fragments = Vec::new();
    let mut pending: Option<String> = None;

    for line in raw.lines() {
        let mut rest = line;

        loop {
            let Some(fragment) = pending.as_mut() else {
                match find_record_start(rest) {
                    Some(start) => {
                        let tag_end = start + RECORD_START.len();
                        pending = Some(rest[start..tag_end].to_string());
                        rest = &rest[tag_end..];
                        continue;
                    }
                    None => break,
                }
            };

            let next_start = find_record_start(rest);
            let next_end = rest.find(RECORD_END);
            let restart = match (next_start, next_end) {
                (Some(start), Some(end)) => (start < end).then_some(start),
                (Some(start), None) => Some(start),
                _ => None,
            };

            if let Some(start) = restart {
                debug!("Dropping unterminated record fragment");
                pending = None;
                rest = &rest[start..];
                continue;
            }

            match next_end {
                Some(end) => {
                    let end = end + RECORD_END.len();
                    fragment.push_str(&rest[..end]);
                    if let Some(done) = pending.take() {
                        fragments.push(done);
                    }
                    rest = &rest[end..];
                }
                None => {
                    fragment.push_str(rest);
                    fragment.push('\n');
                    break;
                }
            }
        }
    }

    if pending.is_some() {
        debug!("Dropping record fragment cut off at end of file");
    }

    fragments
}

/// Rebuild a document from the intact records of a damaged file.
///
/// Every `<record>` fragment is re-validated on its own; the ones that
/// parse are wrapped in a fresh root element. Returns `None` when even the
/// reassembled document does not parse.
pub fn repair_document(raw: &str) -> Option<HistoryDocument> {
    let mut body = String::new();
    let mut dropped = 0usize;

    for fragment in record_fragments(raw) {
        match parse_document(&fragment) {
            Ok(_) => {
                body.push_str(&fragment);
                body.push('\n');
            }
            Err(e) => {
                debug!(error = %e, "Record fragment is not valid XML");
                dropped += 1;
            }
        }
    }

    let rebuilt = format!("<{root}>\n{body}</{root}>", root = ROOT_ELEMENT);
    match parse_document(&rebuilt) {
        Ok(document) => {
            debug!(
                kept = document.record_count(),
                dropped, "Rebuilt document from record fragments"
            );
            Some(document)
        }
        Err(e) => {
            warn!(error = %e, "Rebuilt document still does not parse");
            None
        }
    }
}
