//! Items: Markdown files with a `---` delimited YAML header block.
//!
//! ```text
//! ---
//! type: file_drop
//! created: 2026-10-19T08:15:00Z
//! status: pending
//! priority: high
//! original_name: invoice.pdf
//! ---
//!
//! # File Drop for Processing
//! ...
//! ```
//!
//! Unknown header keys are kept in [`ItemHeader::extra`] so that every field a
//! writer put in the header can be read back unchanged.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use super::state::ItemState;

/// Header delimiter line
const DELIMITER: &str = "---";

/// Errors produced when an item file cannot be parsed
#[derive(Debug, Error)]
pub enum ItemParseError {
    #[error("Item has no header block (file must start with '---')")]
    MissingHeader,

    #[error("Header block is not terminated by a closing '---' line")]
    UnterminatedHeader,

    #[error("Header block is not valid: {0}")]
    InvalidHeader(#[from] serde_yaml::Error),

    #[error("Required header field is empty: {0}")]
    EmptyField(&'static str),
}

/// Processing priority, derived from Handbook keywords
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" | "medium" => Ok(Self::Normal),
            "high" | "urgent" => Ok(Self::High),
            other => Err(format!("Unknown priority: {}", other)),
        }
    }
}

/// Structured header block of an item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemHeader {
    /// Item type (e.g. `file_drop`, `email`, `approval_request`)
    #[serde(rename = "type")]
    pub kind: String,

    /// When the item was created
    #[serde(
        serialize_with = "serialize_timestamp",
        deserialize_with = "deserialize_timestamp"
    )]
    pub created: DateTime<Utc>,

    /// Free-form status written by the last actor (e.g. `pending`)
    pub status: String,

    /// Priority (defaults to normal when a writer leaves it out)
    #[serde(default)]
    pub priority: Priority,

    /// Keywords used for prioritization
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Any other header keys, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl ItemHeader {
    /// Create a header with the required fields
    pub fn new(kind: impl Into<String>, created: DateTime<Utc>, priority: Priority) -> Self {
        Self {
            kind: kind.into(),
            created,
            status: "pending".to_string(),
            priority,
            tags: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    /// Set an extra header field
    pub fn with_field(mut self, key: &str, value: impl Into<serde_yaml::Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    /// Read an extra field as a string (numbers and booleans are stringified)
    pub fn field(&self, key: &str) -> Option<String> {
        match self.extra.get(key)? {
            serde_yaml::Value::String(s) => Some(s.clone()),
            serde_yaml::Value::Number(n) => Some(n.to_string()),
            serde_yaml::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// The `action` field of a request item (payment, email_send, ...)
    pub fn action(&self) -> Option<String> {
        self.field("action").map(|a| a.trim().to_ascii_lowercase())
    }

    /// The `amount` field, accepting `600`, `600.50`, `"$600"` and `"1,200"`
    pub fn amount(&self) -> Option<f64> {
        match self.extra.get("amount")? {
            serde_yaml::Value::Number(n) => n.as_f64(),
            serde_yaml::Value::String(s) => s
                .trim()
                .trim_start_matches('$')
                .replace(',', "")
                .parse()
                .ok(),
            _ => None,
        }
    }

    /// Whether the header flags the counterpart as a new contact
    pub fn is_new_contact(&self) -> bool {
        match self.extra.get("new_contact") {
            Some(serde_yaml::Value::Bool(b)) => *b,
            Some(serde_yaml::Value::String(s)) => s.eq_ignore_ascii_case("true") || s == "yes",
            _ => false,
        }
    }

    fn validate(&self) -> Result<(), ItemParseError> {
        if self.kind.trim().is_empty() {
            return Err(ItemParseError::EmptyField("type"));
        }
        if self.status.trim().is_empty() {
            return Err(ItemParseError::EmptyField("status"));
        }
        Ok(())
    }
}

/// A unit of work: header + body, located in one state folder
#[derive(Debug, Clone)]
pub struct Item {
    /// Identifier (file name without `.md`)
    pub id: String,

    /// State the item was read from
    pub state: ItemState,

    /// Parsed header block
    pub header: ItemHeader,

    /// Markdown body after the header
    pub body: String,

    /// Where the item file lives
    pub path: PathBuf,
}

impl Item {
    /// Parse an item file's contents
    pub fn parse(
        id: impl Into<String>,
        state: ItemState,
        path: PathBuf,
        text: &str,
    ) -> Result<Self, ItemParseError> {
        let (header, body) = parse_document(text)?;
        Ok(Self {
            id: id.into(),
            state,
            header,
            body,
            path,
        })
    }

    /// File name of the item (`<id>.md`)
    pub fn file_name(&self) -> String {
        item_file_name(&self.id)
    }
}

/// Split a document into header and body
pub fn parse_document(text: &str) -> Result<(ItemHeader, String), ItemParseError> {
    let (yaml, body) = split_document(text)?;
    let header: ItemHeader = serde_yaml::from_str(yaml)?;
    header.validate()?;

    Ok((header, body.to_string()))
}

/// Split a document into its raw header text and body without interpreting the header
pub fn split_document(text: &str) -> Result<(&str, &str), ItemParseError> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let mut lines = text.split_inclusive('\n');
    let first = lines.next().ok_or(ItemParseError::MissingHeader)?;
    if first.trim_end() != DELIMITER {
        return Err(ItemParseError::MissingHeader);
    }

    let mut offset = first.len();
    let header_start = offset;

    for line in lines {
        if line.trim_end() == DELIMITER {
            return Ok((&text[header_start..offset], &text[offset + line.len()..]));
        }
        offset += line.len();
    }

    Err(ItemParseError::UnterminatedHeader)
}

/// Render a header and body as a document
pub fn render_document(header: &ItemHeader, body: &str) -> Result<String, serde_yaml::Error> {
    let yaml = serde_yaml::to_string(header)?;
    Ok(format!("{DELIMITER}\n{yaml}{DELIMITER}\n{body}"))
}

/// File name for an item id
pub fn item_file_name(id: &str) -> String {
    format!("{}.md", id)
}

/// Item id from a file name, if it is an item file
pub fn id_from_file_name(name: &str) -> Option<&str> {
    name.strip_suffix(".md").filter(|id| !id.is_empty() && !id.starts_with('.'))
}

/// Reduce arbitrary text to characters safe in an item id
pub fn sanitize_id(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    cleaned.trim_matches('.').to_string()
}

fn serialize_timestamp<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

/// Accepts RFC 3339, naive `YYYY-MM-DDTHH:MM:SS[.f]` (taken as UTC), or a bare date
fn deserialize_timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(d)?;
    parse_timestamp(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw)))
}

/// Lenient timestamp parsing for agent- and human-written headers
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
