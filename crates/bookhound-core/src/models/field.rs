use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Storage kind of a book field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    /// Series name; the index lives in the companion `<name>_index` field.
    Series,
    Numeric,
    Date,
    Rating,
    Identifiers,
    /// Derived text produced by a template.
    Composite,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::Series => "series",
            FieldKind::Numeric => "numeric",
            FieldKind::Date => "date",
            FieldKind::Rating => "rating",
            FieldKind::Identifiers => "identifiers",
            FieldKind::Composite => "composite",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(FieldKind::Text),
            "series" => Some(FieldKind::Series),
            "numeric" => Some(FieldKind::Numeric),
            "date" => Some(FieldKind::Date),
            "rating" => Some(FieldKind::Rating),
            "identifiers" => Some(FieldKind::Identifiers),
            "composite" => Some(FieldKind::Composite),
            _ => None,
        }
    }
}

/// Describes how a field is stored and how multi-valued content is split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMetadata {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub multi: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_separator: Option<String>,
    /// Personal-name field (authors and similar columns).
    #[serde(default)]
    pub names: bool,
    /// Template of a composite column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

impl FieldMetadata {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            multi: false,
            list_separator: None,
            names: false,
            template: None,
        }
    }

    pub fn multi(mut self, separator: &str) -> Self {
        self.multi = true;
        self.list_separator = Some(separator.to_string());
        self
    }

    pub fn with_names(mut self) -> Self {
        self.names = true;
        if self.list_separator.is_none() {
            self.list_separator = Some("&".to_string());
        }
        self
    }

    pub fn composite(name: impl Into<String>, template: impl Into<String>) -> Self {
        let mut meta = Self::new(name, FieldKind::Composite);
        meta.template = Some(template.into());
        meta
    }

    /// Separator used to split a raw value into items.
    pub fn separator(&self) -> &str {
        match self.list_separator.as_deref() {
            Some(sep) => sep,
            None if self.names => "&",
            None => ",",
        }
    }

    /// Name of the companion index field for series kinds.
    pub fn index_field(&self) -> Option<String> {
        (self.kind == FieldKind::Series).then(|| format!("{}_index", self.name))
    }

    pub fn is_custom(&self) -> bool {
        self.name.starts_with('#')
    }
}

/// Metadata for a built-in field, or for an `identifiers:<type>` sub-field.
pub fn builtin_field(name: &str) -> Option<FieldMetadata> {
    if let Some(id_type) = identifier_subfield(name) {
        if id_type.is_empty() {
            return None;
        }
        return Some(FieldMetadata::new(name, FieldKind::Text));
    }

    let meta = match name {
        "title" => FieldMetadata::new("title", FieldKind::Text),
        "authors" => FieldMetadata::new("authors", FieldKind::Text)
            .multi("&")
            .with_names(),
        "series" => FieldMetadata::new("series", FieldKind::Series),
        "series_index" => FieldMetadata::new("series_index", FieldKind::Numeric),
        "publisher" => FieldMetadata::new("publisher", FieldKind::Text),
        "tags" => FieldMetadata::new("tags", FieldKind::Text).multi(","),
        "languages" => FieldMetadata::new("languages", FieldKind::Text).multi(","),
        "pubdate" => FieldMetadata::new("pubdate", FieldKind::Date),
        "timestamp" => FieldMetadata::new("timestamp", FieldKind::Date),
        "rating" => FieldMetadata::new("rating", FieldKind::Rating),
        "identifiers" => FieldMetadata::new("identifiers", FieldKind::Identifiers).multi(","),
        _ => return None,
    };
    Some(meta)
}

/// Names of all built-in fields.
pub const BUILTIN_FIELDS: &[&str] = &[
    "title",
    "authors",
    "series",
    "series_index",
    "publisher",
    "tags",
    "languages",
    "pubdate",
    "timestamp",
    "rating",
    "identifiers",
];

/// `identifiers:isbn` / `identifiers.isbn` → `isbn`.
pub fn identifier_subfield(name: &str) -> Option<&str> {
    name.strip_prefix("identifiers:")
        .or_else(|| name.strip_prefix("identifiers."))
}

/// A field value as read from the host library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    List(Vec<String>),
    Number(f64),
    Date(DateTime<Utc>),
    Rating(u8),
    Identifiers(BTreeMap<String, String>),
}

impl FieldValue {
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Text(s) => s.trim().is_empty(),
            FieldValue::List(items) => items.iter().all(|i| i.trim().is_empty()),
            FieldValue::Identifiers(map) => map.is_empty(),
            FieldValue::Number(_) | FieldValue::Date(_) => false,
            FieldValue::Rating(r) => *r == 0,
        }
    }

    /// Canonical single-string rendering. Lists are joined with `separator`.
    pub fn render(&self, separator: &str) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::List(items) => items.join(separator),
            FieldValue::Number(n) => format_number(*n),
            FieldValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            FieldValue::Rating(r) => r.to_string(),
            FieldValue::Identifiers(map) => map
                .iter()
                .map(|(k, v)| format!("{k}:{v}"))
                .collect::<Vec<_>>()
                .join(separator),
        }
    }

    /// Split into items: lists yield their entries, identifier maps yield
    /// `type:value` pairs, text is split on `separator`.
    pub fn items(&self, separator: &str) -> Vec<String> {
        let raw: Vec<String> = match self {
            FieldValue::List(items) => items.clone(),
            FieldValue::Identifiers(map) => {
                map.iter().map(|(k, v)| format!("{k}:{v}")).collect()
            }
            FieldValue::Text(s) => s.split(separator).map(str::to_string).collect(),
            other => vec![other.render(separator)],
        };
        raw.into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Rating(r) => Some(f64::from(*r)),
            FieldValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Numbers without trailing zeros: `3.0` → `3`, `2.5` → `2.5`.
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// One distinct value in a field's domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldItem {
    pub id: i64,
    pub value: String,
    /// Number of books carrying the value.
    pub count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_authors_are_names() {
        let meta = builtin_field("authors").unwrap();
        assert!(meta.multi);
        assert!(meta.names);
        assert_eq!(meta.separator(), "&");
    }

    #[test]
    fn test_identifier_subfield_forms() {
        assert_eq!(identifier_subfield("identifiers:isbn"), Some("isbn"));
        assert_eq!(identifier_subfield("identifiers.isbn"), Some("isbn"));
        assert_eq!(identifier_subfield("title"), None);
        assert!(builtin_field("identifiers.isbn").is_some());
        assert!(builtin_field("identifiers:").is_none());
    }

    #[test]
    fn test_series_index_field() {
        let meta = builtin_field("series").unwrap();
        assert_eq!(meta.index_field().as_deref(), Some("series_index"));
        assert!(builtin_field("title").unwrap().index_field().is_none());
    }

    #[test]
    fn test_render_and_items() {
        assert_eq!(FieldValue::Number(3.0).render(","), "3");
        assert_eq!(FieldValue::Number(2.5).render(","), "2.5");

        let text = FieldValue::Text("Smith & Jones & ".to_string());
        assert_eq!(text.items("&"), vec!["Smith", "Jones"]);

        let mut ids = BTreeMap::new();
        ids.insert("isbn".to_string(), "123".to_string());
        assert_eq!(FieldValue::Identifiers(ids).items(","), vec!["isbn:123"]);
    }

    #[test]
    fn test_empty_values() {
        assert!(FieldValue::Text("  ".into()).is_empty());
        assert!(FieldValue::List(vec![]).is_empty());
        assert!(FieldValue::Rating(0).is_empty());
        assert!(!FieldValue::Number(0.0).is_empty());
    }
}
