//! Hierarchical history identifiers and their on-disk directory names.

use crate::error::{HistoryError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Characters that cannot appear in a directory name and their replacement.
///
/// `&` must stay first: every replacement itself starts with `&`.
const ESCAPE_SEQUENCES: [(&str, &str); 10] = [
    ("&", "&_amp"),
    ("/", "&_sl"),
    ("\\", "&_bs"),
    (":", "&_co"),
    ("*", "&_as"),
    ("?", "&_qm"),
    ("\"", "&_pa"),
    ("<", "&_lt"),
    (">", "&_gt"),
    ("|", "&_pp"),
];

/// Identity of a history: an ordered path of string components.
///
/// `["callhistory", "default", "default"]` maps to the directory
/// `<root>/callhistory/default/default`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HistoryId {
    components: Vec<String>,
}

impl HistoryId {
    /// Create an id from raw components.
    ///
    /// Components may contain any character; reserved ones are escaped when
    /// the id is mapped to a directory. Empty components and the `.`/`..`
    /// path segments are rejected.
    pub fn new<I, S>(components: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let components: Vec<String> = components.into_iter().map(Into::into).collect();

        if components.is_empty() {
            return Err(HistoryError::invalid_input(
                "a history id needs at least one component",
            ));
        }
        for component in &components {
            if component.is_empty() || component == "." || component == ".." {
                return Err(HistoryError::invalid_input(format!(
                    "invalid history id component: {:?}",
                    component
                )));
            }
        }

        Ok(Self { components })
    }

    /// Parse a `/`-separated path such as `msg/roomA`
    pub fn parse(path: &str) -> Result<Self> {
        Self::new(path.split('/').filter(|part| !part.is_empty()))
    }

    /// The raw components of this id
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// The components with reserved characters replaced
    pub fn escaped_components(&self) -> Vec<String> {
        self.components
            .iter()
            .map(|component| escape_component(component))
            .collect()
    }

    /// Whether this id lies at or below `parent` in the hierarchy
    pub fn is_sub_of(&self, parent: &HistoryId) -> bool {
        self.components.starts_with(&parent.components)
    }

    /// Directory for this id below `root`
    pub fn directory_in(&self, root: &Path) -> PathBuf {
        self.escaped_components()
            .iter()
            .fold(root.to_path_buf(), |dir, component| dir.join(component))
    }
}

impl fmt::Display for HistoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.components.join("/"))
    }
}

/// Replace the characters that are not allowed in directory names
pub fn escape_component(component: &str) -> String {
    ESCAPE_SEQUENCES
        .iter()
        .fold(component.to_string(), |acc, (from, to)| acc.replace(from, to))
}

/// Reverse of [`escape_component`]
pub fn unescape_component(component: &str) -> String {
    let mut result = String::with_capacity(component.len());
    let mut rest = component;

    'outer: while !rest.is_empty() {
        if rest.starts_with('&') {
            for (raw, escaped) in ESCAPE_SEQUENCES.iter() {
                if let Some(tail) = rest.strip_prefix(escaped) {
                    result.push_str(raw);
                    rest = tail;
                    continue 'outer;
                }
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            result.push(c);
        }
        rest = chars.as_str();
    }

    result
}
