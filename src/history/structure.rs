//! The `dbstruct.dat` metadata document kept in every history directory.
//!
//! ```xml
//! <dbstruct version="1.0">
//!   <id value="msg">
//!     <id value="roomA"/>
//!   </id>
//!   <structure>
//!     <property name="from"/>
//!     <property name="body"/>
//!   </structure>
//! </dbstruct>
//! ```

use super::id::HistoryId;
use super::record::HistoryRecordStructure;
use crate::error::{HistoryError, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader as XmlReader, Writer as XmlWriter};
use std::path::Path;
use tracing::warn;

/// Fixed name of the metadata file inside a history directory
pub const METADATA_FILE: &str = "dbstruct.dat";

const METADATA_VERSION: &str = "1.0";
const ROOT_ELEMENT: &str = "dbstruct";
const ID_ELEMENT: &str = "id";
const STRUCTURE_ELEMENT: &str = "structure";
const PROPERTY_ELEMENT: &str = "property";

/// Contents of a metadata file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryMetadata {
    pub id: HistoryId,
    pub structure: HistoryRecordStructure,
}

pub fn serialize_metadata(id: &HistoryId, structure: &HistoryRecordStructure) -> Result<String> {
    let mut writer = XmlWriter::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut root = BytesStart::new(ROOT_ELEMENT);
    root.push_attribute(("version", METADATA_VERSION));
    writer.write_event(Event::Start(root))?;

    let components = id.components();
    for (depth, component) in components.iter().enumerate() {
        let mut element = BytesStart::new(ID_ELEMENT);
        element.push_attribute(("value", component.as_str()));
        if depth + 1 == components.len() {
            writer.write_event(Event::Empty(element))?;
        } else {
            writer.write_event(Event::Start(element))?;
        }
    }
    for _ in 1..components.len() {
        writer.write_event(Event::End(BytesEnd::new(ID_ELEMENT)))?;
    }

    writer.write_event(Event::Start(BytesStart::new(STRUCTURE_ELEMENT)))?;
    for name in structure.property_names() {
        let mut property = BytesStart::new(PROPERTY_ELEMENT);
        property.push_attribute(("name", name.as_str()));
        writer.write_event(Event::Empty(property))?;
    }
    writer.write_event(Event::End(BytesEnd::new(STRUCTURE_ELEMENT)))?;
    writer.write_event(Event::End(BytesEnd::new(ROOT_ELEMENT)))?;

    String::from_utf8(writer.into_inner()).map_err(|e| HistoryError::malformed(e.to_string()))
}

fn attribute(element: &BytesStart<'_>, key: &str) -> Result<Option<String>> {
    for attr in element.attributes() {
        let attr = attr.map_err(|e| HistoryError::malformed(e.to_string()))?;
        if attr.key.as_ref() == key.as_bytes() {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

pub fn parse_metadata(xml: &str) -> Result<HistoryMetadata> {
    let mut reader = XmlReader::from_str(xml);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut saw_root = false;
    let mut in_structure = false;
    let mut components = Vec::new();
    let mut properties = Vec::new();

    loop {
        let (element, is_empty) = match reader.read_event_into(&mut buf)? {
            Event::Start(e) => (e.into_owned(), false),
            Event::Empty(e) => (e.into_owned(), true),
            Event::End(e) => {
                if e.name().as_ref() == STRUCTURE_ELEMENT.as_bytes() {
                    in_structure = false;
                }
                depth = depth.saturating_sub(1);
                buf.clear();
                continue;
            }
            Event::Eof => break,
            _ => {
                buf.clear();
                continue;
            }
        };

        let name = element.name();
        let name = name.as_ref();
        if depth == 0 {
            if name != ROOT_ELEMENT.as_bytes() {
                return Err(HistoryError::malformed("metadata root must be <dbstruct>"));
            }
            saw_root = true;
            match attribute(&element, "version")?.as_deref() {
                Some(METADATA_VERSION) => {}
                other => warn!(version = ?other, "Unexpected metadata version"),
            }
        } else if name == ID_ELEMENT.as_bytes() && !in_structure {
            let value = attribute(&element, "value")?
                .ok_or_else(|| HistoryError::malformed("<id> without a value"))?;
            components.push(value);
        } else if name == STRUCTURE_ELEMENT.as_bytes() {
            in_structure = !is_empty;
        } else if name == PROPERTY_ELEMENT.as_bytes() && in_structure {
            let value = attribute(&element, "name")?
                .ok_or_else(|| HistoryError::malformed("<property> without a name"))?;
            properties.push(value);
        }

        if !is_empty {
            depth += 1;
        }
        buf.clear();
    }

    if !saw_root || depth != 0 {
        return Err(HistoryError::malformed("incomplete metadata document"));
    }

    Ok(HistoryMetadata {
        id: HistoryId::new(components)?,
        structure: HistoryRecordStructure::new(properties)?,
    })
}

/// Write the metadata file for a history into `directory`
pub fn write_metadata(
    directory: &Path,
    id: &HistoryId,
    structure: &HistoryRecordStructure,
) -> Result<()> {
    let xml = serialize_metadata(id, structure)?;
    std::fs::write(directory.join(METADATA_FILE), xml)?;
    Ok(())
}

/// Read a metadata file
pub fn read_metadata(path: &Path) -> Result<HistoryMetadata> {
    let xml = std::fs::read_to_string(path)?;
    parse_metadata(&xml)
}
