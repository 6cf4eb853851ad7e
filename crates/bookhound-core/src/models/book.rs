use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::field::{FieldValue, identifier_subfield};

/// Integer identity of a book inside one library.
pub type BookId = i64;

/// A book file attached to a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookFormat {
    /// Upper-case format name, e.g. `EPUB`.
    pub format: String,
    pub path: PathBuf,
}

/// Snapshot of one book's metadata as stored by the host library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookRecord {
    pub id: BookId,
    pub title: String,

    #[serde(default)]
    pub authors: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_index: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub languages: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubdate: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    /// 0–10, half stars allowed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<u8>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub identifiers: BTreeMap<String, String>,

    /// Values of `#custom` columns, keyed by column name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, FieldValue>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub formats: Vec<BookFormat>,
}

impl BookRecord {
    pub fn new(id: BookId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            authors: Vec::new(),
            series: None,
            series_index: None,
            publisher: None,
            tags: Vec::new(),
            languages: Vec::new(),
            pubdate: None,
            timestamp: None,
            rating: None,
            identifiers: BTreeMap::new(),
            custom: BTreeMap::new(),
            formats: Vec::new(),
        }
    }

    pub fn with_authors(mut self, authors: &[&str]) -> Self {
        self.authors = authors.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_series(mut self, series: &str, index: f64) -> Self {
        self.series = Some(series.to_string());
        self.series_index = Some(index);
        self
    }

    pub fn with_publisher(mut self, publisher: &str) -> Self {
        self.publisher = Some(publisher.to_string());
        self
    }

    pub fn with_identifier(mut self, id_type: &str, value: &str) -> Self {
        self.identifiers
            .insert(id_type.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn with_custom(mut self, column: &str, value: FieldValue) -> Self {
        self.custom.insert(column.to_string(), value);
        self
    }

    /// Stored value of a non-composite field. Empty values read as `None`.
    pub fn raw_field(&self, name: &str) -> Option<FieldValue> {
        if let Some(id_type) = identifier_subfield(name) {
            return self
                .identifiers
                .get(&id_type.to_ascii_lowercase())
                .filter(|v| !v.trim().is_empty())
                .map(|v| FieldValue::Text(v.clone()));
        }

        let value = match name {
            "title" => Some(FieldValue::Text(self.title.clone())),
            "authors" => Some(FieldValue::List(self.authors.clone())),
            "series" => self.series.clone().map(FieldValue::Text),
            "series_index" => self.series_index.map(FieldValue::Number),
            "publisher" => self.publisher.clone().map(FieldValue::Text),
            "tags" => Some(FieldValue::List(self.tags.clone())),
            "languages" => Some(FieldValue::List(self.languages.clone())),
            "pubdate" => self.pubdate.map(FieldValue::Date),
            "timestamp" => self.timestamp.map(FieldValue::Date),
            "rating" => self.rating.map(FieldValue::Rating),
            "identifiers" => Some(FieldValue::Identifiers(self.identifiers.clone())),
            custom => self.custom.get(custom).cloned(),
        };
        value.filter(|v| !v.is_empty())
    }
}
