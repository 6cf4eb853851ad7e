use thiserror::Error;

/// All errors that can occur in bookhound-core.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Book not found: {0}")]
    BookNotFound(i64),

    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Library not found: {0}")]
    LibraryNotFound(String),

    #[error("Format {format} not found for book {book_id}")]
    FormatNotFound { book_id: i64, format: String },

    #[error("Template error: {0}")]
    Template(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Exit codes used by the CLI.
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    NotFound = 2,
    InvalidArgs = 3,
    ValidationFailed = 4,
    Cancelled = 5,
}

pub type Result<T> = std::result::Result<T, CoreError>;
