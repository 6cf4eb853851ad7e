//! Capabilities the duplicate engine consumes from its host library.
//!
//! The engine only ever reads metadata through [`Library`]; the SQLite
//! [`Database`](crate::storage::database::Database) and the
//! [`MemoryLibrary`](crate::storage::memory::MemoryLibrary) are the two
//! implementations shipped with the workspace.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::models::{BookId, FieldItem, FieldKind, FieldMetadata, FieldValue};

/// Restricts a run to a subset of the library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Restriction {
    /// Only these ids (unknown ids are ignored).
    Ids(BTreeSet<BookId>),
    /// Books with a non-empty value in the field.
    HasField(String),
    /// Books carrying the marked-ids label.
    Marked(String),
}

/// Read access to a book library plus the small amount of scratch state the
/// engine is allowed to write (custom book data and marked ids).
pub trait Library {
    /// Stable identity of the underlying database.
    fn database_id(&self) -> Uuid;

    /// All book ids in ascending order.
    fn all_ids(&self) -> Result<Vec<BookId>>;

    /// Value of `field` for a book, `None` when empty.
    fn field(&self, book_id: BookId, field: &str) -> Result<Option<FieldValue>>;

    /// Metadata for a field name, `None` when the library has no such field.
    fn field_metadata(&self, field: &str) -> Option<FieldMetadata>;

    /// Format names attached to a book, sorted.
    fn formats(&self, book_id: BookId) -> Result<Vec<String>>;

    fn format_size(&self, book_id: BookId, format: &str) -> Result<Option<u64>>;

    /// Lower-case hex SHA-256 of the format file.
    fn format_hash(&self, book_id: BookId, format: &str) -> Result<Option<String>>;

    fn format_mtime(&self, book_id: BookId, format: &str) -> Result<Option<DateTime<Utc>>>;

    fn get_custom_book_data(&self, namespace: &str) -> Result<BTreeMap<BookId, serde_json::Value>>;

    /// Replaces the whole namespace.
    fn set_custom_book_data(
        &self,
        namespace: &str,
        data: &BTreeMap<BookId, serde_json::Value>,
    ) -> Result<()>;

    /// Replaces the marked-ids registry.
    fn set_marked_ids(&self, marks: &BTreeMap<BookId, String>) -> Result<()>;

    fn marked_ids(&self) -> Result<BTreeMap<BookId, String>>;

    fn subset_ids(&self, restriction: &Restriction) -> Result<Vec<BookId>> {
        match restriction {
            Restriction::Ids(ids) => Ok(self
                .all_ids()?
                .into_iter()
                .filter(|id| ids.contains(id))
                .collect()),
            Restriction::HasField(field) => {
                let mut out = Vec::new();
                for id in self.all_ids()? {
                    if self.field(id, field)?.is_some() {
                        out.push(id);
                    }
                }
                Ok(out)
            }
            Restriction::Marked(label) => Ok(self
                .marked_ids()?
                .into_iter()
                .filter(|(_, labels)| labels.split(',').any(|l| l == label))
                .map(|(id, _)| id)
                .collect()),
        }
    }

    /// Identifier types used anywhere in the library, sorted.
    fn identifier_types(&self) -> Result<Vec<String>> {
        let mut types = BTreeSet::new();
        for id in self.all_ids()? {
            if let Some(FieldValue::Identifiers(map)) = self.field(id, "identifiers")? {
                types.extend(map.into_keys());
            }
        }
        Ok(types.into_iter().collect())
    }

    /// Distinct items of a field with the number of books carrying each.
    /// Item ids are assigned in value order, starting at 1.
    fn field_domain(&self, field: &str) -> Result<Vec<FieldItem>> {
        let meta = self
            .field_metadata(field)
            .ok_or_else(|| CoreError::UnknownField(field.to_string()))?;
        let split = meta.multi || meta.names || meta.kind == FieldKind::Identifiers;

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for id in self.all_ids()? {
            let Some(value) = self.field(id, field)? else {
                continue;
            };
            let items: BTreeSet<String> = if split {
                value.items(meta.separator()).into_iter().collect()
            } else {
                std::iter::once(value.render(meta.separator())).collect()
            };
            for item in items {
                *counts.entry(item).or_default() += 1;
            }
        }

        Ok(counts
            .into_iter()
            .enumerate()
            .map(|(idx, (value, count))| FieldItem {
                id: idx as i64 + 1,
                value,
                count,
            })
            .collect())
    }
}

/// Named values a template can reference.
pub trait FieldSource {
    fn value_of(&self, field: &str) -> Option<FieldValue>;
}

/// Fields of one book, plus the value currently being hashed as `{value}`.
pub struct BookFields<'a> {
    pub library: &'a dyn Library,
    pub book_id: BookId,
    pub value: Option<&'a str>,
}

impl FieldSource for BookFields<'_> {
    fn value_of(&self, field: &str) -> Option<FieldValue> {
        if field == "value" {
            return self.value.map(|v| FieldValue::Text(v.to_string()));
        }
        if field == "id" {
            return Some(FieldValue::Number(self.book_id as f64));
        }
        match self.library.field(self.book_id, field) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!(book_id = self.book_id, field, "template field lookup failed: {e}");
                None
            }
        }
    }
}

/// Only `{value}` is bound; used when hashing field items rather than books.
pub struct ItemFields<'a> {
    pub value: &'a str,
}

impl FieldSource for ItemFields<'_> {
    fn value_of(&self, field: &str) -> Option<FieldValue> {
        (field == "value").then(|| FieldValue::Text(self.value.to_string()))
    }
}
