use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Root application configuration, loaded from `~/.config/bookhound/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub library: LibraryConfig,
    pub engine: EngineConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    pub database_path: String,
}

/// Defaults for duplicate runs; CLI flags override them per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sort_groups_by_title: bool,
    pub show_all_mode: bool,
    /// `book` or `author`.
    pub exemptions_scope: String,
    pub soundex_length: u32,
    /// ISO 639-2 code used by language-aware algorithms.
    pub language: String,
    /// Rule set used when none is named on the command line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_rule_set: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
}

// ─── Defaults ──────────────────────────────────────────────

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("~/.local/share"))
        .join("bookhound")
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            database_path: data_dir()
                .join("library.db")
                .to_string_lossy()
                .to_string(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sort_groups_by_title: true,
            show_all_mode: true,
            exemptions_scope: "book".to_string(),
            soundex_length: 6,
            language: "eng".to_string(),
            default_rule_set: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: data_dir().to_string_lossy().to_string(),
        }
    }
}

// ─── Load / Save ───────────────────────────────────────────

impl AppConfig {
    /// Standard config file path: `~/.config/bookhound/config.toml`
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("BOOKHOUND_CONFIG") {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("bookhound")
            .join("config.toml")
    }

    /// Load config from disk, falling back to defaults if the file doesn't exist.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let toml_str = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_str)?;
        Ok(())
    }

    pub fn set_database_path(&mut self, path: PathBuf) {
        self.library.database_path = path.to_string_lossy().to_string();
    }

    // ─── Derived paths ─────────────────────────────────────

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.library.database_path)
    }

    /// Book-scope exemptions: `{data_dir}/exemptions/books.json`.
    pub fn book_exemptions_path(&self) -> PathBuf {
        PathBuf::from(&self.storage.data_dir)
            .join("exemptions")
            .join("books.json")
    }

    /// Author-scope exemptions: `{data_dir}/exemptions/authors.json`.
    pub fn author_exemptions_path(&self) -> PathBuf {
        PathBuf::from(&self.storage.data_dir)
            .join("exemptions")
            .join("authors.json")
    }

    /// Saved rule sets: `{data_dir}/rule_sets.json`.
    pub fn rule_sets_path(&self) -> PathBuf {
        PathBuf::from(&self.storage.data_dir).join("rule_sets.json")
    }
}
