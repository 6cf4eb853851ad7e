use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::host::Library;
use crate::models::{BookId, BookRecord, FieldMetadata, FieldValue, builtin_field};

/// In-memory format file.
#[derive(Debug, Clone)]
pub struct FormatBlob {
    pub data: Vec<u8>,
    pub mtime: DateTime<Utc>,
}

/// A [`Library`] held entirely in memory. Used by tests and by callers that
/// already have their records loaded.
#[derive(Debug)]
pub struct MemoryLibrary {
    id: Uuid,
    books: BTreeMap<BookId, BookRecord>,
    columns: BTreeMap<String, FieldMetadata>,
    formats: BTreeMap<(BookId, String), FormatBlob>,
    custom_data: RefCell<BTreeMap<String, BTreeMap<BookId, serde_json::Value>>>,
    marks: RefCell<BTreeMap<BookId, String>>,
    hash_requests: Cell<usize>,
}

impl Default for MemoryLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLibrary {
    pub fn new() -> Self {
        Self {
            id: Uuid::now_v7(),
            books: BTreeMap::new(),
            columns: BTreeMap::new(),
            formats: BTreeMap::new(),
            custom_data: RefCell::new(BTreeMap::new()),
            marks: RefCell::new(BTreeMap::new()),
            hash_requests: Cell::new(0),
        }
    }

    pub fn with_books(books: impl IntoIterator<Item = BookRecord>) -> Self {
        let mut library = Self::new();
        for book in books {
            library.insert(book);
        }
        library
    }

    pub fn insert(&mut self, book: BookRecord) {
        self.books.insert(book.id, book);
    }

    pub fn remove(&mut self, id: BookId) -> Option<BookRecord> {
        self.formats.retain(|(book_id, _), _| *book_id != id);
        self.books.remove(&id)
    }

    pub fn get(&self, id: BookId) -> Option<&BookRecord> {
        self.books.get(&id)
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }

    /// Declare a `#custom` column.
    pub fn add_column(&mut self, meta: FieldMetadata) -> Result<()> {
        if !meta.is_custom() {
            return Err(CoreError::ValidationError(format!(
                "custom column names start with '#': {}",
                meta.name
            )));
        }
        super::check_composite(&meta)?;
        self.columns.insert(meta.name.clone(), meta);
        Ok(())
    }

    pub fn add_format(&mut self, book_id: BookId, format: &str, data: Vec<u8>, mtime: DateTime<Utc>) {
        self.formats
            .insert((book_id, format.to_uppercase()), FormatBlob { data, mtime });
    }

    /// Number of `format_hash` calls served so far.
    pub fn hash_requests(&self) -> usize {
        self.hash_requests.get()
    }

    fn blob(&self, book_id: BookId, format: &str) -> Option<&FormatBlob> {
        self.formats.get(&(book_id, format.to_uppercase()))
    }
}

impl Library for MemoryLibrary {
    fn database_id(&self) -> Uuid {
        self.id
    }

    fn all_ids(&self) -> Result<Vec<BookId>> {
        Ok(self.books.keys().copied().collect())
    }

    fn field(&self, book_id: BookId, field: &str) -> Result<Option<FieldValue>> {
        let record = self
            .books
            .get(&book_id)
            .ok_or(CoreError::BookNotFound(book_id))?;
        super::resolve_field(self, record, field)
    }

    fn field_metadata(&self, field: &str) -> Option<FieldMetadata> {
        builtin_field(field).or_else(|| self.columns.get(field).cloned())
    }

    fn formats(&self, book_id: BookId) -> Result<Vec<String>> {
        Ok(self
            .formats
            .keys()
            .filter(|(id, _)| *id == book_id)
            .map(|(_, fmt)| fmt.clone())
            .collect())
    }

    fn format_size(&self, book_id: BookId, format: &str) -> Result<Option<u64>> {
        Ok(self.blob(book_id, format).map(|b| b.data.len() as u64))
    }

    fn format_hash(&self, book_id: BookId, format: &str) -> Result<Option<String>> {
        self.hash_requests.set(self.hash_requests.get() + 1);
        Ok(self
            .blob(book_id, format)
            .map(|b| format!("{:x}", Sha256::digest(&b.data))))
    }

    fn format_mtime(&self, book_id: BookId, format: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.blob(book_id, format).map(|b| b.mtime))
    }

    fn get_custom_book_data(&self, namespace: &str) -> Result<BTreeMap<BookId, serde_json::Value>> {
        Ok(self
            .custom_data
            .borrow()
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }

    fn set_custom_book_data(
        &self,
        namespace: &str,
        data: &BTreeMap<BookId, serde_json::Value>,
    ) -> Result<()> {
        self.custom_data
            .borrow_mut()
            .insert(namespace.to_string(), data.clone());
        Ok(())
    }

    fn set_marked_ids(&self, marks: &BTreeMap<BookId, String>) -> Result<()> {
        *self.marks.borrow_mut() = marks.clone();
        Ok(())
    }

    fn marked_ids(&self) -> Result<BTreeMap<BookId, String>> {
        Ok(self.marks.borrow().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Restriction;
    use crate::models::FieldKind;

    fn library() -> MemoryLibrary {
        MemoryLibrary::with_books([
            BookRecord::new(1, "Dune").with_authors(&["Frank Herbert"]).with_tags(&["sf"]),
            BookRecord::new(2, "Emma").with_authors(&["Jane Austen"]).with_tags(&["classic", "sf"]),
            BookRecord::new(3, "Persuasion")
                .with_authors(&["Jane Austen"])
                .with_identifier("isbn", "123"),
        ])
    }

    #[test]
    fn test_field_domain_counts_books() {
        let lib = library();
        let domain = lib.field_domain("authors").unwrap();
        assert_eq!(domain.len(), 2);
        assert_eq!(domain[0].value, "Frank Herbert");
        assert_eq!(domain[0].id, 1);
        assert_eq!(domain[1].value, "Jane Austen");
        assert_eq!(domain[1].count, 2);

        let tags = lib.field_domain("tags").unwrap();
        let sf = tags.iter().find(|t| t.value == "sf").unwrap();
        assert_eq!(sf.count, 2);
    }

    #[test]
    fn test_subset_ids() {
        let lib = library();
        assert_eq!(
            lib.subset_ids(&Restriction::HasField("identifiers".into())).unwrap(),
            vec![3]
        );
        assert_eq!(
            lib.subset_ids(&Restriction::Ids([2, 3, 99].into_iter().collect()))
                .unwrap(),
            vec![2, 3]
        );

        let mut marks = BTreeMap::new();
        marks.insert(1, "duplicate,first_duplicate".to_string());
        marks.insert(3, "entangled_book".to_string());
        lib.set_marked_ids(&marks).unwrap();
        assert_eq!(
            lib.subset_ids(&Restriction::Marked("first_duplicate".into())).unwrap(),
            vec![1]
        );
    }

    #[test]
    fn test_composite_column() {
        let mut lib = library();
        lib.add_column(FieldMetadata::composite("#label", "{title:lower} by {authors:first}"))
            .unwrap();
        assert_eq!(
            lib.field(1, "#label").unwrap(),
            Some(FieldValue::Text("dune by Frank Herbert".into()))
        );
    }

    #[test]
    fn test_self_referencing_composite_rejected() {
        let mut lib = library();
        let err = lib.add_column(FieldMetadata::composite("#loop", "{#loop}"));
        assert!(err.is_err());
        let err = lib.add_column(FieldMetadata::new("plain", FieldKind::Text));
        assert!(err.is_err());
    }

    #[test]
    fn test_format_hash_and_identifier_types() {
        let mut lib = library();
        lib.add_format(1, "epub", b"same bytes".to_vec(), Utc::now());
        lib.add_format(2, "EPUB", b"same bytes".to_vec(), Utc::now());

        assert_eq!(lib.formats(1).unwrap(), vec!["EPUB".to_string()]);
        assert_eq!(
            lib.format_hash(1, "EPUB").unwrap(),
            lib.format_hash(2, "epub").unwrap()
        );
        assert_eq!(lib.hash_requests(), 2);
        assert_eq!(lib.identifier_types().unwrap(), vec!["isbn".to_string()]);
    }
}
