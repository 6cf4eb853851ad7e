pub mod config;
pub mod error;
pub mod host;
pub mod models;
pub mod storage;
pub mod template;

pub use config::AppConfig;
pub use error::{CoreError, Result};
pub use host::{BookFields, FieldSource, ItemFields, Library, Restriction};
pub use models::*;
pub use template::{TemplateEvaluator, Templates};

pub use storage::database::Database;
pub use storage::json_files::{load_json, save_json};
pub use storage::memory::MemoryLibrary;
