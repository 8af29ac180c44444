use chrono::{DateTime, Utc};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Key namespace for raw page/element embeddings in the key-value store.
pub const EMBEDDING_KEY_PREFIX: &str = "doc_raw_page";

/// Processing status of a tracked file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatus {
    New,
    Processed,
    Error,
}

impl FileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Processed => "PROCESSED",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(Self::New),
            "PROCESSED" => Ok(Self::Processed),
            "ERROR" => Ok(Self::Error),
            other => Err(format!("unknown file status `{other}`")),
        }
    }
}

/// A tracked case file and its processing state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    pub case_id: String,
    /// Path relative to the case root, `/`-separated.
    pub filename: String,
    pub checksum: String,
    pub status: FileStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Result of one processing attempt, reported back to the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Processed,
    Error(String),
}

impl FileOutcome {
    pub fn status(&self) -> FileStatus {
        match self {
            Self::Processed => FileStatus::Processed,
            Self::Error(_) => FileStatus::Error,
        }
    }
}

/// What `register_or_update` did with a scanned file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// First sighting; a NEW record was created.
    Inserted,
    /// Checksum changed; the record went back to NEW.
    Reset,
    /// Checksum unchanged; nothing was written.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub file_id: String,
    pub filename: String,
    pub outcome: RegisterOutcome,
}

/// Closed set of element types the vision model may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementKind {
    #[serde(rename = "text", alias = "texto")]
    Text,
    #[serde(rename = "table", alias = "tabla")]
    Table,
    #[serde(
        rename = "checkbox-table",
        alias = "tabla_checkbox",
        alias = "checkbox_table",
        alias = "checkbox"
    )]
    CheckboxTable,
    #[serde(rename = "chart", alias = "grafico", alias = "gráfico")]
    Chart,
    #[serde(rename = "diagram", alias = "esquema")]
    Diagram,
    #[serde(rename = "image", alias = "imagen")]
    Image,
    #[serde(rename = "logo")]
    Logo,
    #[serde(rename = "signature", alias = "firma")]
    Signature,
}

impl ElementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Table => "table",
            Self::CheckboxTable => "checkbox-table",
            Self::Chart => "chart",
            Self::Diagram => "diagram",
            Self::Image => "image",
            Self::Logo => "logo",
            Self::Signature => "signature",
        }
    }

    /// Only images, logos and signatures carry a bounding box.
    pub fn has_coordinates(self) -> bool {
        matches!(self, Self::Image | Self::Logo | Self::Signature)
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckboxRow {
    #[serde(alias = "valor", alias = "value", alias = "text")]
    pub label: String,
    #[serde(default)]
    pub checked: bool,
}

/// Element payload; the variant always matches the element kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementContent {
    Text(String),
    Table(Vec<Vec<String>>),
    Checkboxes(Vec<CheckboxRow>),
    Empty,
}

impl ElementContent {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.trim().is_empty(),
            Self::Table(rows) => rows.iter().all(|row| row.iter().all(|c| c.trim().is_empty())),
            Self::Checkboxes(rows) => rows.is_empty(),
            Self::Empty => true,
        }
    }
}

impl Serialize for ElementContent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Text(text) => serializer.serialize_str(text),
            Self::Table(rows) => {
                let mut seq = serializer.serialize_seq(Some(rows.len()))?;
                for row in rows {
                    seq.serialize_element(row)?;
                }
                seq.end()
            }
            Self::Checkboxes(rows) => {
                let mut seq = serializer.serialize_seq(Some(rows.len()))?;
                for row in rows {
                    seq.serialize_element(row)?;
                }
                seq.end()
            }
            Self::Empty => serializer.serialize_str(""),
        }
    }
}

/// Why a raw element could not be turned into a typed [`Element`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ElementError {
    #[error("content of a `{kind}` element must be {expected}, got {found}")]
    ContentMismatch {
        kind: ElementKind,
        expected: &'static str,
        found: &'static str,
    },
}

/// One element exactly as the model (or a stored artifact) describes it.
#[derive(Debug, Clone, Deserialize)]
pub struct RawElement {
    #[serde(default)]
    pub id: Value,
    #[serde(rename = "type", alias = "tipo")]
    pub kind: ElementKind,
    #[serde(default, alias = "posicion")]
    pub position: Option<u32>,
    #[serde(default, alias = "titulo")]
    pub title: Option<String>,
    #[serde(default, alias = "descripcion")]
    pub description: Option<String>,
    #[serde(default, alias = "contenido")]
    pub content: Value,
    #[serde(default, alias = "coordenadas")]
    pub coordinates: Value,
    #[serde(default, alias = "metadatos")]
    pub metadata: Option<BTreeMap<String, Value>>,
}

/// A single extracted unit on a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawElement")]
pub struct Element {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ElementKind,
    pub position: u32,
    pub title: String,
    pub description: String,
    pub content: ElementContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl TryFrom<RawElement> for Element {
    type Error = ElementError;

    fn try_from(raw: RawElement) -> Result<Self, Self::Error> {
        let kind = raw.kind;
        let mut description = raw.description.unwrap_or_default();

        let content = match kind {
            ElementKind::Text => text_content(kind, raw.content)?,
            ElementKind::Table => table_content(kind, raw.content)?,
            ElementKind::CheckboxTable => checkbox_content(kind, raw.content)?,
            _ => {
                // Stray captions on visual elements are kept as description.
                if let Value::String(text) = raw.content {
                    if description.trim().is_empty() && !text.trim().is_empty() {
                        description = text;
                    }
                }
                ElementContent::Empty
            }
        };

        let coordinates = if kind.has_coordinates() {
            serde_json::from_value::<Coordinates>(raw.coordinates).ok()
        } else {
            None
        };

        Ok(Self {
            id: scalar_to_string(&raw.id),
            kind,
            position: raw.position.unwrap_or(0),
            title: raw.title.unwrap_or_default(),
            description,
            content,
            coordinates,
            metadata: raw.metadata.unwrap_or_default(),
        })
    }
}

impl Element {
    /// Text used both for embeddings and for the page aggregate.
    pub fn embedding_text(&self) -> String {
        match &self.content {
            ElementContent::Text(text) => text.trim().to_string(),
            ElementContent::Table(rows) => rows
                .iter()
                .map(|row| row.join(" | "))
                .filter(|line| !line.trim().is_empty())
                .collect::<Vec<_>>()
                .join("\n"),
            ElementContent::Checkboxes(rows) => rows
                .iter()
                .map(|row| {
                    let mark = if row.checked { "[x]" } else { "[ ]" };
                    format!("{mark} {}", row.label.trim())
                })
                .collect::<Vec<_>>()
                .join("\n"),
            ElementContent::Empty => String::new(),
        }
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

fn text_content(kind: ElementKind, value: Value) -> Result<ElementContent, ElementError> {
    match value {
        Value::Null => Ok(ElementContent::Text(String::new())),
        Value::String(text) => Ok(ElementContent::Text(text)),
        Value::Bool(_) | Value::Number(_) => Ok(ElementContent::Text(value.to_string())),
        other => Err(ElementError::ContentMismatch {
            kind,
            expected: "a string",
            found: value_kind(&other),
        }),
    }
}

fn table_content(kind: ElementKind, value: Value) -> Result<ElementContent, ElementError> {
    match value {
        Value::Null => Ok(ElementContent::Table(Vec::new())),
        Value::String(ref text) if text.trim().is_empty() => Ok(ElementContent::Table(Vec::new())),
        Value::Array(rows) => Ok(ElementContent::Table(
            rows.into_iter()
                .map(|row| match row {
                    Value::Array(cells) => cells.iter().map(scalar_to_string).collect(),
                    other => vec![scalar_to_string(&other)],
                })
                .collect(),
        )),
        other => Err(ElementError::ContentMismatch {
            kind,
            expected: "an array of rows",
            found: value_kind(&other),
        }),
    }
}

fn checkbox_content(kind: ElementKind, value: Value) -> Result<ElementContent, ElementError> {
    match value {
        Value::Null => Ok(ElementContent::Checkboxes(Vec::new())),
        Value::String(ref text) if text.trim().is_empty() => {
            Ok(ElementContent::Checkboxes(Vec::new()))
        }
        Value::Array(items) => {
            let mut rows = Vec::with_capacity(items.len());
            for item in items {
                if !item.is_object() {
                    return Err(ElementError::ContentMismatch {
                        kind,
                        expected: "an array of {label, checked} objects",
                        found: value_kind(&item),
                    });
                }
                let found = value_kind(&item);
                let row = serde_json::from_value::<CheckboxRow>(item).map_err(|_| {
                    ElementError::ContentMismatch {
                        kind,
                        expected: "an array of {label, checked} objects",
                        found,
                    }
                })?;
                rows.push(row);
            }
            Ok(ElementContent::Checkboxes(rows))
        }
        other => Err(ElementError::ContentMismatch {
            kind,
            expected: "an array of {label, checked} objects",
            found: value_kind(&other),
        }),
    }
}

/// Extraction result for one page of one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResult {
    /// 1-based page number.
    pub page: u32,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub elements: Vec<Element>,
    #[serde(default)]
    pub raw: String,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    /// Set when the page yielded no elements because something went wrong.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl PageResult {
    /// Empty result for a page that could not be processed.
    pub fn failed(page: u32, reason: impl Into<String>) -> Self {
        Self {
            page,
            title: String::new(),
            confidence: None,
            elements: Vec::new(),
            raw: String::new(),
            tokens_in: 0,
            tokens_out: 0,
            failure: Some(reason.into()),
        }
    }

    /// Non-empty element texts joined in page order.
    pub fn aggregate_text(&self) -> String {
        self.elements
            .iter()
            .map(Element::embedding_text)
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A vector stored for one element or one page aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub page: u32,
    /// 1-based element index; `None` for the page aggregate.
    pub element: Option<usize>,
    pub text: String,
    pub embedding: Vec<f32>,
    pub kind: String,
}

impl EmbeddingRecord {
    pub fn key(&self, file_id: &str) -> String {
        match self.element {
            Some(element) => element_key(file_id, self.page, element),
            None => page_key(file_id, self.page),
        }
    }

    /// Hash fields written to the key-value store.
    pub fn to_fields(&self) -> Result<Vec<(&'static str, String)>, serde_json::Error> {
        let mut fields = vec![("page", self.page.to_string())];
        if let Some(element) = self.element {
            fields.push(("element", element.to_string()));
        }
        fields.push(("text", self.text.clone()));
        fields.push(("embedding", serde_json::to_string(&self.embedding)?));
        fields.push(("type", self.kind.clone()));
        Ok(fields)
    }
}

/// Prefix shared by every record of one document.
pub fn document_key_prefix(file_id: &str) -> String {
    format!("{EMBEDDING_KEY_PREFIX}:{file_id}:")
}

pub fn element_key(file_id: &str, page: u32, element: usize) -> String {
    format!("{EMBEDDING_KEY_PREFIX}:{file_id}:p{page}_e{element}")
}

pub fn page_key(file_id: &str, page: u32) -> String {
    format!("{EMBEDDING_KEY_PREFIX}:{file_id}:p{page}")
}
