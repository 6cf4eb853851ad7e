//! Registry of match algorithms.
//!
//! An [`Algorithm`] is a plain value: a name plus four functions. The
//! registry is built once and handed to whoever compiles rules, so hosts can
//! add their own algorithms without touching the engine.

use std::collections::BTreeMap;
use std::fmt;

use bookhound_core::{BookFields, BookId, ItemFields, Library, TemplateEvaluator};
use serde_json::Value;

use crate::hashing::{RunScratch, TemplateKey};
use crate::normalize::{self, Language, TextKind};

/// Algorithm settings as stored in a match rule.
pub type Settings = serde_json::Map<String, Value>;

/// Output of a template that failed to evaluate.
pub const TEMPLATE_ERROR: &str = "\u{0}TEMPLATE_ERROR\u{0}";

pub const MAX_SOUNDEX_LENGTH: u64 = 32;

/// A compiled hash function. Receives one value and returns its normalized
/// form, or an error message.
pub type HashFn =
    Box<dyn Fn(&str, &mut EvalContext<'_>) -> std::result::Result<String, String>>;

/// What the hash functions may read while they run.
pub struct EvalContext<'a> {
    /// `None` when hashing field items instead of books.
    pub library: Option<&'a dyn Library>,
    pub book_id: Option<BookId>,
    pub templates: &'a dyn TemplateEvaluator,
    pub scratch: &'a mut RunScratch,
}

/// The field an algorithm is being instantiated for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldContext {
    pub field: String,
    pub kind: TextKind,
}

/// Why a settings object was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsError {
    pub message: String,
    pub details: Option<String>,
}

impl SettingsError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.details {
            Some(details) => write!(f, "{} ({details})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

type Factory = fn(&FieldContext, &Settings, bool) -> HashFn;
type Validator = fn(&Settings, &dyn TemplateEvaluator) -> std::result::Result<(), SettingsError>;

#[derive(Clone, Copy)]
pub struct Algorithm {
    pub name: &'static str,
    pub description: &'static str,
    factory: Factory,
    validate: Validator,
    has_reverse: fn(&FieldContext) -> bool,
    default_settings: fn() -> Settings,
}

impl fmt::Debug for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Algorithm").field("name", &self.name).finish()
    }
}

impl Algorithm {
    pub fn new(
        name: &'static str,
        description: &'static str,
        factory: Factory,
        validate: Validator,
        has_reverse: fn(&FieldContext) -> bool,
        default_settings: fn() -> Settings,
    ) -> Self {
        Self {
            name,
            description,
            factory,
            validate,
            has_reverse,
            default_settings,
        }
    }

    /// Build the hash function. With `reverse` the function produces the
    /// alternate reading of a personal name.
    pub fn factory(&self, field: &FieldContext, settings: &Settings, reverse: bool) -> HashFn {
        (self.factory)(field, settings, reverse)
    }

    pub fn validate(
        &self,
        settings: &Settings,
        templates: &dyn TemplateEvaluator,
    ) -> std::result::Result<(), SettingsError> {
        (self.validate)(settings, templates)
    }

    pub fn has_reverse(&self, field: &FieldContext) -> bool {
        (self.has_reverse)(field)
    }

    pub fn default_settings(&self) -> Settings {
        (self.default_settings)()
    }

    /// Defaults, then engine-wide overrides for keys this algorithm knows,
    /// then the rule's own settings.
    pub fn effective_settings(&self, rule: &Settings, engine: &Settings) -> Settings {
        let mut settings = self.default_settings();
        for (key, value) in engine {
            if settings.contains_key(key) {
                settings.insert(key.clone(), value.clone());
            }
        }
        for (key, value) in rule {
            settings.insert(key.clone(), value.clone());
        }
        settings
    }
}

/// Algorithms by name.
#[derive(Debug, Clone)]
pub struct AlgorithmRegistry {
    algorithms: BTreeMap<&'static str, Algorithm>,
}

impl Default for AlgorithmRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl AlgorithmRegistry {
    pub fn empty() -> Self {
        Self {
            algorithms: BTreeMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(Algorithm::new(
            "identical",
            "Case-insensitive exact match",
            identical_factory,
            validate_language_only,
            never_reverse,
            language_defaults,
        ));
        registry.register(Algorithm::new(
            "similar",
            "Ignores punctuation, accents and leading articles",
            similar_factory,
            validate_language_only,
            reverse_for_names,
            language_defaults,
        ));
        registry.register(Algorithm::new(
            "soundex",
            "Phonetic code of the similar form",
            soundex_factory,
            validate_soundex,
            reverse_for_names,
            soundex_defaults,
        ));
        registry.register(Algorithm::new(
            "fuzzy",
            "Drops subtitles and alternates; names become surname plus initial",
            fuzzy_factory,
            validate_language_only,
            reverse_for_names,
            language_defaults,
        ));
        registry.register(Algorithm::new(
            "template",
            "Evaluates a template; {value} is the value being hashed",
            template_factory,
            validate_template,
            never_reverse,
            template_defaults,
        ));
        registry
    }

    /// Add or replace an algorithm.
    pub fn register(&mut self, algorithm: Algorithm) {
        self.algorithms.insert(algorithm.name, algorithm);
    }

    pub fn get(&self, name: &str) -> Option<&Algorithm> {
        self.algorithms.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.algorithms.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Algorithm> {
        self.algorithms.values()
    }
}

// ─── Settings ──────────────────────────────────────────────

fn language_defaults() -> Settings {
    let mut settings = Settings::new();
    settings.insert("language".into(), Value::from(Language::default().code()));
    settings
}

fn soundex_defaults() -> Settings {
    let mut settings = language_defaults();
    settings.insert("length".into(), Value::from(6));
    settings
}

fn template_defaults() -> Settings {
    let mut settings = Settings::new();
    settings.insert("template".into(), Value::from("{value}"));
    settings
}

fn check_keys(settings: &Settings, allowed: &[&str]) -> std::result::Result<(), SettingsError> {
    match settings.keys().find(|key| !allowed.contains(&key.as_str())) {
        Some(key) => Err(SettingsError::new(format!("unknown setting '{key}'"))
            .with_details(format!("allowed: {}", allowed.join(", ")))),
        None => Ok(()),
    }
}

fn language_setting(settings: &Settings) -> std::result::Result<Language, SettingsError> {
    match settings.get("language") {
        None | Some(Value::Null) => Ok(Language::default()),
        Some(Value::String(code)) => Language::parse(code).ok_or_else(|| {
            SettingsError::new(format!("unsupported language '{code}'"))
                .with_details(format!("supported: {}", Language::CODES.join(", ")))
        }),
        Some(other) => Err(SettingsError::new(format!(
            "language must be a string, got {other}"
        ))),
    }
}

fn length_setting(settings: &Settings) -> std::result::Result<usize, SettingsError> {
    let Some(value) = settings.get("length") else {
        return Ok(6);
    };
    match value.as_u64() {
        Some(length) if (1..=MAX_SOUNDEX_LENGTH).contains(&length) => Ok(length as usize),
        _ => Err(SettingsError::new(format!("invalid soundex length {value}"))
            .with_details(format!("expected an integer from 1 to {MAX_SOUNDEX_LENGTH}"))),
    }
}

fn validate_language_only(
    settings: &Settings,
    _templates: &dyn TemplateEvaluator,
) -> std::result::Result<(), SettingsError> {
    check_keys(settings, &["language"])?;
    language_setting(settings).map(|_| ())
}

fn validate_soundex(
    settings: &Settings,
    _templates: &dyn TemplateEvaluator,
) -> std::result::Result<(), SettingsError> {
    check_keys(settings, &["language", "length"])?;
    language_setting(settings)?;
    length_setting(settings).map(|_| ())
}

fn validate_template(
    settings: &Settings,
    templates: &dyn TemplateEvaluator,
) -> std::result::Result<(), SettingsError> {
    check_keys(settings, &["template"])?;
    let template = match settings.get("template") {
        Some(Value::String(t)) if !t.trim().is_empty() => t,
        Some(Value::String(_)) | None => return Err(SettingsError::new("template is empty")),
        Some(other) => {
            return Err(SettingsError::new(format!(
                "template must be a string, got {other}"
            )));
        }
    };
    templates
        .compile(template)
        .map_err(|e| SettingsError::new("template does not parse").with_details(e.to_string()))
}

fn never_reverse(_field: &FieldContext) -> bool {
    false
}

fn reverse_for_names(field: &FieldContext) -> bool {
    field.kind == TextKind::Name
}

// ─── Factories ─────────────────────────────────────────────

fn identical_factory(field: &FieldContext, settings: &Settings, _reverse: bool) -> HashFn {
    let kind = field.kind;
    let language = language_setting(settings).unwrap_or_default();
    Box::new(move |value, _ctx| Ok(normalize::identical(value, kind, language)))
}

fn similar_factory(field: &FieldContext, settings: &Settings, reverse: bool) -> HashFn {
    let kind = field.kind;
    let language = language_setting(settings).unwrap_or_default();
    Box::new(move |value, _ctx| Ok(normalize::similar(value, kind, language, reverse)))
}

fn soundex_factory(field: &FieldContext, settings: &Settings, reverse: bool) -> HashFn {
    let kind = field.kind;
    let language = language_setting(settings).unwrap_or_default();
    let length = length_setting(settings).unwrap_or(6);
    Box::new(move |value, _ctx| {
        Ok(normalize::soundex_of(value, kind, language, length, reverse))
    })
}

fn fuzzy_factory(field: &FieldContext, settings: &Settings, reverse: bool) -> HashFn {
    let kind = field.kind;
    let language = language_setting(settings).unwrap_or_default();
    Box::new(move |value, _ctx| Ok(normalize::fuzzy(value, kind, language, reverse)))
}

fn template_factory(_field: &FieldContext, settings: &Settings, _reverse: bool) -> HashFn {
    let template = settings
        .get("template")
        .and_then(Value::as_str)
        .unwrap_or("{value}")
        .to_string();
    let uses_value = template.contains("{value");

    Box::new(move |value, ctx| {
        let templates = ctx.templates;
        let output = match (ctx.library, ctx.book_id) {
            (Some(library), Some(book_id)) => {
                let key = TemplateKey {
                    template: template.clone(),
                    book_id,
                    database_id: library.database_id(),
                    value: uses_value.then(|| value.to_string()),
                };
                ctx.scratch.template_output(key, || {
                    let fields = BookFields {
                        library,
                        book_id,
                        value: Some(value),
                    };
                    templates.eval(&template, &fields, TEMPLATE_ERROR)
                })
            }
            _ => templates.eval(&template, &ItemFields { value }, TEMPLATE_ERROR),
        };

        if output == TEMPLATE_ERROR {
            Err(format!("template {template:?} could not be evaluated"))
        } else {
            Ok(output.trim().to_string())
        }
    })
}
