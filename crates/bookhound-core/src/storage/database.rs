use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::host::Library;
use crate::models::{BookFormat, BookId, BookRecord, FieldKind, FieldMetadata, FieldValue, builtin_field};

/// Buffer size for streaming format hashing (64KB).
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// SQLite-backed book library.
pub struct Database {
    conn: Connection,
    id: Uuid,
}

impl Database {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open a database that must already exist (used for comparison targets).
    pub fn open_existing(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(CoreError::LibraryNotFound(path.display().to_string()));
        }
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let has_books: bool = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name='books'")?
            .exists([])?;
        if !has_books {
            return Err(CoreError::LibraryNotFound(format!(
                "{} is not a bookhound library",
                path.display()
            )));
        }
        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        init_schema(&conn)?;
        let id = library_id(&conn)?;
        Ok(Self { conn, id })
    }

    // ─── Books ─────────────────────────────────────────────

    pub fn upsert_book(&self, book: &BookRecord) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO books
                (id, title, authors, series, series_index, publisher, tags, languages,
                 pubdate, timestamp, rating, identifiers, custom)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                book.id,
                book.title,
                serde_json::to_string(&book.authors)?,
                book.series,
                book.series_index,
                book.publisher,
                serde_json::to_string(&book.tags)?,
                serde_json::to_string(&book.languages)?,
                book.pubdate.map(|d| d.to_rfc3339()),
                book.timestamp.map(|d| d.to_rfc3339()),
                book.rating,
                serde_json::to_string(&book.identifiers)?,
                serde_json::to_string(&book.custom)?,
            ],
        )?;

        self.conn
            .execute("DELETE FROM formats WHERE book_id = ?1", params![book.id])?;
        for format in &book.formats {
            self.add_format(book.id, &format.format, &format.path)?;
        }
        Ok(())
    }

    pub fn get_book(&self, id: BookId) -> Result<BookRecord> {
        let mut record = self
            .conn
            .query_row(
                "SELECT id, title, authors, series, series_index, publisher, tags, languages,
                        pubdate, timestamp, rating, identifiers, custom
                 FROM books WHERE id = ?1",
                params![id],
                row_to_record,
            )
            .optional()?
            .ok_or(CoreError::BookNotFound(id))?;

        let mut stmt = self
            .conn
            .prepare("SELECT format, path FROM formats WHERE book_id = ?1 ORDER BY format")?;
        record.formats = stmt
            .query_map(params![id], |row| {
                Ok(BookFormat {
                    format: row.get(0)?,
                    path: PathBuf::from(row.get::<_, String>(1)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(record)
    }

    pub fn delete_book(&self, id: BookId) -> Result<()> {
        self.conn
            .execute("DELETE FROM formats WHERE book_id = ?1", params![id])?;
        self.conn
            .execute("DELETE FROM custom_book_data WHERE book_id = ?1", params![id])?;
        self.conn
            .execute("DELETE FROM marked_ids WHERE book_id = ?1", params![id])?;
        let affected = self.conn.execute("DELETE FROM books WHERE id = ?1", params![id])?;
        if affected == 0 {
            return Err(CoreError::BookNotFound(id));
        }
        Ok(())
    }

    pub fn count_books(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM books", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Next free book id.
    pub fn next_id(&self) -> Result<BookId> {
        let max: Option<i64> = self
            .conn
            .query_row("SELECT MAX(id) FROM books", [], |row| row.get(0))?;
        Ok(max.unwrap_or(0) + 1)
    }

    // ─── Columns & formats ─────────────────────────────────

    /// Declare a `#custom` column.
    pub fn add_custom_column(&self, meta: &FieldMetadata) -> Result<()> {
        if !meta.is_custom() {
            return Err(CoreError::ValidationError(format!(
                "custom column names start with '#': {}",
                meta.name
            )));
        }
        super::check_composite(meta)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO custom_columns (name, kind, multi, list_separator, names, template)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                meta.name,
                meta.kind.as_str(),
                meta.multi,
                meta.list_separator,
                meta.names,
                meta.template,
            ],
        )?;
        Ok(())
    }

    pub fn custom_columns(&self) -> Result<Vec<FieldMetadata>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, kind, multi, list_separator, names, template FROM custom_columns ORDER BY name",
        )?;
        let columns = stmt
            .query_map([], row_to_column)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(columns)
    }

    pub fn add_format(&self, book_id: BookId, format: &str, path: &Path) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO formats (book_id, format, path) VALUES (?1, ?2, ?3)",
            params![book_id, format.to_uppercase(), path.to_string_lossy().to_string()],
        )?;
        Ok(())
    }

    fn format_path(&self, book_id: BookId, format: &str) -> Result<Option<PathBuf>> {
        let path: Option<String> = self
            .conn
            .query_row(
                "SELECT path FROM formats WHERE book_id = ?1 AND format = ?2",
                params![book_id, format.to_uppercase()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(path.map(PathBuf::from).filter(|p| p.is_file()))
    }
}

impl Library for Database {
    fn database_id(&self) -> Uuid {
        self.id
    }

    fn all_ids(&self) -> Result<Vec<BookId>> {
        let mut stmt = self.conn.prepare("SELECT id FROM books ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<BookId>, _>>()?;
        Ok(ids)
    }

    fn field(&self, book_id: BookId, field: &str) -> Result<Option<FieldValue>> {
        let record = self.get_book(book_id)?;
        super::resolve_field(self, &record, field)
    }

    fn field_metadata(&self, field: &str) -> Option<FieldMetadata> {
        if let Some(meta) = builtin_field(field) {
            return Some(meta);
        }
        let row = self
            .conn
            .query_row(
                "SELECT name, kind, multi, list_separator, names, template
                 FROM custom_columns WHERE name = ?1",
                params![field],
                row_to_column,
            )
            .optional();
        match row {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(field, "failed to read custom column: {e}");
                None
            }
        }
    }

    fn formats(&self, book_id: BookId) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT format FROM formats WHERE book_id = ?1 ORDER BY format")?;
        let formats = stmt
            .query_map(params![book_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(formats)
    }

    fn format_size(&self, book_id: BookId, format: &str) -> Result<Option<u64>> {
        match self.format_path(book_id, format)? {
            Some(path) => Ok(Some(std::fs::metadata(path)?.len())),
            None => Ok(None),
        }
    }

    fn format_hash(&self, book_id: BookId, format: &str) -> Result<Option<String>> {
        let Some(path) = self.format_path(book_id, format)? else {
            return Ok(None);
        };
        let mut reader = BufReader::with_capacity(HASH_BUFFER_SIZE, File::open(path)?);
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(Some(format!("{:x}", hasher.finalize())))
    }

    fn format_mtime(&self, book_id: BookId, format: &str) -> Result<Option<DateTime<Utc>>> {
        match self.format_path(book_id, format)? {
            Some(path) => {
                let modified = std::fs::metadata(path)?.modified()?;
                Ok(Some(DateTime::<Utc>::from(modified)))
            }
            None => Ok(None),
        }
    }

    fn get_custom_book_data(&self, namespace: &str) -> Result<BTreeMap<BookId, serde_json::Value>> {
        let mut stmt = self
            .conn
            .prepare("SELECT book_id, value FROM custom_book_data WHERE namespace = ?1")?;
        let rows = stmt.query_map(params![namespace], |row| {
            Ok((row.get::<_, BookId>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (id, raw) = row?;
            out.insert(id, serde_json::from_str(&raw)?);
        }
        Ok(out)
    }

    fn set_custom_book_data(
        &self,
        namespace: &str,
        data: &BTreeMap<BookId, serde_json::Value>,
    ) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM custom_book_data WHERE namespace = ?1",
            params![namespace],
        )?;
        for (id, value) in data {
            tx.execute(
                "INSERT INTO custom_book_data (namespace, book_id, value) VALUES (?1, ?2, ?3)",
                params![namespace, id, serde_json::to_string(value)?],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn set_marked_ids(&self, marks: &BTreeMap<BookId, String>) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM marked_ids", [])?;
        for (id, label) in marks {
            tx.execute(
                "INSERT INTO marked_ids (book_id, label) VALUES (?1, ?2)",
                params![id, label],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn marked_ids(&self) -> Result<BTreeMap<BookId, String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT book_id, label FROM marked_ids ORDER BY book_id")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (id, label): (BookId, String) = row?;
            out.insert(id, label);
        }
        Ok(out)
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS library_meta (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS books (
            id           INTEGER PRIMARY KEY,
            title        TEXT NOT NULL,
            authors      TEXT DEFAULT '[]',
            series       TEXT,
            series_index REAL,
            publisher    TEXT,
            tags         TEXT DEFAULT '[]',
            languages    TEXT DEFAULT '[]',
            pubdate      TEXT,
            timestamp    TEXT,
            rating       INTEGER,
            identifiers  TEXT DEFAULT '{}',
            custom       TEXT DEFAULT '{}'
        );

        CREATE TABLE IF NOT EXISTS custom_columns (
            name           TEXT PRIMARY KEY,
            kind           TEXT NOT NULL,
            multi          INTEGER NOT NULL DEFAULT 0,
            list_separator TEXT,
            names          INTEGER NOT NULL DEFAULT 0,
            template       TEXT
        );

        CREATE TABLE IF NOT EXISTS formats (
            book_id INTEGER NOT NULL,
            format  TEXT NOT NULL,
            path    TEXT NOT NULL,
            PRIMARY KEY (book_id, format)
        );

        CREATE TABLE IF NOT EXISTS custom_book_data (
            namespace TEXT NOT NULL,
            book_id   INTEGER NOT NULL,
            value     TEXT NOT NULL,
            PRIMARY KEY (namespace, book_id)
        );

        CREATE TABLE IF NOT EXISTS marked_ids (
            book_id INTEGER PRIMARY KEY,
            label   TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

fn library_id(conn: &Connection) -> Result<Uuid> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT value FROM library_meta WHERE key = 'library_id'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(raw) = existing
        && let Ok(id) = Uuid::parse_str(&raw)
    {
        return Ok(id);
    }

    let id = Uuid::now_v7();
    conn.execute(
        "INSERT OR REPLACE INTO library_meta (key, value) VALUES ('library_id', ?1)",
        params![id.to_string()],
    )?;
    Ok(id)
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<BookRecord> {
    let pubdate: Option<String> = row.get(8)?;
    let timestamp: Option<String> = row.get(9)?;

    let mut record = BookRecord::new(row.get(0)?, row.get::<_, String>(1)?);
    record.authors = json_column(row, 2)?;
    record.series = row.get(3)?;
    record.series_index = row.get(4)?;
    record.publisher = row.get(5)?;
    record.tags = json_column(row, 6)?;
    record.languages = json_column(row, 7)?;
    record.pubdate = pubdate.as_deref().and_then(parse_date);
    record.timestamp = timestamp.as_deref().and_then(parse_date);
    record.rating = row.get(10)?;
    record.identifiers = json_column(row, 11)?;
    record.custom = json_column(row, 12)?;
    Ok(record)
}

fn json_column<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(raw) if !raw.is_empty() => serde_json::from_str(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        }),
        _ => Ok(T::default()),
    }
}

fn row_to_column(row: &rusqlite::Row<'_>) -> rusqlite::Result<FieldMetadata> {
    let kind: String = row.get(1)?;
    let kind = FieldKind::parse(&kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown column kind: {kind}").into(),
        )
    })?;
    Ok(FieldMetadata {
        name: row.get(0)?,
        kind,
        multi: row.get(2)?,
        list_separator: row.get(3)?,
        names: row.get(4)?,
        template: row.get(5)?,
    })
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Restriction;
    use tempfile::TempDir;

    fn sample_book(id: BookId) -> BookRecord {
        BookRecord::new(id, "The Left Hand of Darkness")
            .with_authors(&["Ursula K. Le Guin"])
            .with_tags(&["sf", "classic"])
            .with_series("Hainish Cycle", 4.0)
            .with_identifier("isbn", "9780441478125")
    }

    #[test]
    fn test_upsert_and_get_book() {
        let db = Database::open_in_memory().unwrap();
        let book = sample_book(1);
        db.upsert_book(&book).unwrap();

        let loaded = db.get_book(1).unwrap();
        assert_eq!(loaded, book);
        assert_eq!(db.count_books().unwrap(), 1);
        assert_eq!(db.next_id().unwrap(), 2);
    }

    #[test]
    fn test_missing_book_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(db.get_book(42), Err(CoreError::BookNotFound(42))));
        assert!(db.delete_book(42).is_err());
    }

    #[test]
    fn test_library_fields() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_book(&sample_book(1)).unwrap();
        db.upsert_book(&BookRecord::new(2, "Untitled")).unwrap();

        assert_eq!(
            db.field(1, "identifiers:isbn").unwrap(),
            Some(FieldValue::Text("9780441478125".into()))
        );
        assert_eq!(db.field(2, "authors").unwrap(), None);
        assert!(db.field(1, "#nope").is_err());
        assert_eq!(
            db.subset_ids(&Restriction::HasField("series".into())).unwrap(),
            vec![1]
        );
    }

    #[test]
    fn test_custom_columns_persist() {
        let db = Database::open_in_memory().unwrap();
        db.add_custom_column(&FieldMetadata::new("#shelf", FieldKind::Text))
            .unwrap();
        db.add_custom_column(&FieldMetadata::composite("#sort_title", "{title:lower}"))
            .unwrap();
        db.upsert_book(&sample_book(1)).unwrap();

        assert_eq!(db.custom_columns().unwrap().len(), 2);
        assert_eq!(
            db.field(1, "#sort_title").unwrap(),
            Some(FieldValue::Text("the left hand of darkness".into()))
        );
    }

    #[test]
    fn test_format_access() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("book.epub");
        std::fs::write(&path, b"epub bytes").unwrap();

        let db = Database::open_in_memory().unwrap();
        db.upsert_book(&sample_book(1)).unwrap();
        db.add_format(1, "epub", &path).unwrap();

        assert_eq!(db.formats(1).unwrap(), vec!["EPUB".to_string()]);
        assert_eq!(db.format_size(1, "EPUB").unwrap(), Some(10));
        assert_eq!(
            db.format_hash(1, "epub").unwrap().unwrap(),
            format!("{:x}", Sha256::digest(b"epub bytes"))
        );
        assert!(db.format_mtime(1, "EPUB").unwrap().is_some());
        assert_eq!(db.format_size(1, "PDF").unwrap(), None);
    }

    #[test]
    fn test_custom_book_data_and_marks() {
        let db = Database::open_in_memory().unwrap();
        let mut data = BTreeMap::new();
        data.insert(1, serde_json::json!({"EPUB": {"size": 10}}));
        db.set_custom_book_data("find_duplicates", &data).unwrap();
        assert_eq!(db.get_custom_book_data("find_duplicates").unwrap(), data);
        assert!(db.get_custom_book_data("other").unwrap().is_empty());

        let mut marks = BTreeMap::new();
        marks.insert(3, "duplicate".to_string());
        db.set_marked_ids(&marks).unwrap();
        assert_eq!(db.marked_ids().unwrap(), marks);
    }

    #[test]
    fn test_library_id_is_stable_and_open_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("library.db");

        let first = Database::open(&path).unwrap().database_id();
        let second = Database::open_existing(&path).unwrap().database_id();
        assert_eq!(first, second);

        assert!(matches!(
            Database::open_existing(&dir.path().join("missing.db")),
            Err(CoreError::LibraryNotFound(_))
        ));
    }
}
