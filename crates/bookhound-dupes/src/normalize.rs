//! Text normalizers behind the built-in match algorithms.
//!
//! Every normalizer is a pure function of its input and settings. Personal
//! names have two readings ("Stephen King" and "King, Stephen"); the
//! `reverse` flag selects the reading that assumes the surname comes first.

use bookhound_core::{FieldKind, FieldMetadata};
use once_cell::sync::Lazy;
use regex::Regex;

static WHITESPACE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));
static BRACKETED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[\(\[\{][^\)\]\}]*[\)\]\}]").expect("valid bracketed text regex")
});
static TITLE_ALTERNATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i):|;|\s+or\s+|\s+aka\s+|,\s*or\s+").expect("valid title alternate regex")
});
static LIST_JOINER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s+and\s+|&|/|;|\s+aka\s+|\s+or\s+").expect("valid list joiner regex")
});
static PUBLISHER_SUFFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(inc|incorporated|ltd|limited|llc|co|corp|corporation|company|publishing|publishers|publisher|publications|books|press|group)\b",
    )
    .expect("valid publisher suffix regex")
});

/// What a field holds, which decides how its values are normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextKind {
    Title,
    /// Personal names; normalizers produce a forward and a reversed reading.
    Name,
    Series,
    Publisher,
    Tag,
    Generic,
}

impl TextKind {
    pub fn for_field(meta: &FieldMetadata, composite_has_names: bool) -> Self {
        if meta.names || (meta.kind == FieldKind::Composite && composite_has_names) {
            return TextKind::Name;
        }
        match (meta.name.as_str(), meta.kind) {
            ("title", _) => TextKind::Title,
            ("publisher", _) => TextKind::Publisher,
            ("tags", _) => TextKind::Tag,
            (_, FieldKind::Series) => TextKind::Series,
            _ => TextKind::Generic,
        }
    }

    fn has_articles(self) -> bool {
        matches!(self, TextKind::Title | TextKind::Series | TextKind::Publisher)
    }
}

/// Languages with known leading articles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Language {
    #[default]
    English,
    German,
    French,
    Spanish,
    Italian,
    Dutch,
}

impl Language {
    pub const CODES: &'static [&'static str] = &["eng", "deu", "fra", "spa", "ita", "nld"];

    /// Accepts ISO 639-2 codes, ISO 639-1 codes, and English names.
    pub fn parse(code: &str) -> Option<Self> {
        match code.trim().to_lowercase().as_str() {
            "eng" | "en" | "english" => Some(Language::English),
            "deu" | "ger" | "de" | "german" => Some(Language::German),
            "fra" | "fre" | "fr" | "french" => Some(Language::French),
            "spa" | "es" | "spanish" => Some(Language::Spanish),
            "ita" | "it" | "italian" => Some(Language::Italian),
            "nld" | "dut" | "nl" | "dutch" => Some(Language::Dutch),
            _ => None,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Language::English => "eng",
            Language::German => "deu",
            Language::French => "fra",
            Language::Spanish => "spa",
            Language::Italian => "ita",
            Language::Dutch => "nld",
        }
    }

    fn articles(self) -> &'static [&'static str] {
        match self {
            Language::English => &["a", "an", "the"],
            Language::German => &["der", "die", "das", "ein", "eine", "den", "dem", "des"],
            Language::French => &["le", "la", "les", "un", "une", "des"],
            Language::Spanish => &["el", "la", "los", "las", "un", "una", "unos", "unas"],
            Language::Italian => &["il", "lo", "la", "i", "gli", "le", "un", "uno", "una"],
            Language::Dutch => &["de", "het", "een"],
        }
    }

    fn elides(self) -> bool {
        matches!(self, Language::French | Language::Italian)
    }
}

// ─── Algorithms ────────────────────────────────────────────

/// Case-folded, whitespace-collapsed value. Titles also lose a leading article.
pub fn identical(value: &str, kind: TextKind, language: Language) -> String {
    let lowered = collapse(&value.to_lowercase());
    if kind == TextKind::Title {
        strip_article(&lowered, language).to_string()
    } else {
        lowered
    }
}

/// Drops punctuation, accents and leading articles.
pub fn similar(value: &str, kind: TextKind, language: Language, reverse: bool) -> String {
    if kind == TextKind::Name {
        return orient(name_tokens(value), reverse).join(" ");
    }
    similar_text(value, kind, language)
}

/// Phonetic code of the [`similar`] form. Names put the surname first.
pub fn soundex_of(
    value: &str,
    kind: TextKind,
    language: Language,
    length: usize,
    reverse: bool,
) -> String {
    if kind == TextKind::Name {
        // forward reading assumes "First Last", so the surname is rotated in front
        return soundex(&orient(name_tokens(value), !reverse).concat(), length);
    }
    soundex(&similar_text(value, kind, language), length)
}

/// Aggressive form: subtitles, bracketed text and alternates are dropped,
/// names shrink to surname plus first initial.
pub fn fuzzy(value: &str, kind: TextKind, language: Language, reverse: bool) -> String {
    let lowered = value.to_lowercase();
    let unbracketed = BRACKETED_RE.replace_all(&lowered, " ");

    let splitter: &Regex = match kind {
        TextKind::Title | TextKind::Series => &TITLE_ALTERNATE_RE,
        _ => &LIST_JOINER_RE,
    };
    let head = splitter
        .split(&unbracketed)
        .map(str::trim)
        .find(|part| !part.is_empty())
        .unwrap_or_default();

    match kind {
        TextKind::Name => fuzzy_name(name_tokens(head), reverse),
        TextKind::Publisher => {
            collapse(&PUBLISHER_SUFFIX_RE.replace_all(&similar_text(head, kind, language), " "))
        }
        _ => similar_text(head, kind, language),
    }
}

/// American soundex extended to `length` characters. Non-letters are ignored;
/// short codes are padded with `0`.
pub fn soundex(text: &str, length: usize) -> String {
    let letters: Vec<char> = text
        .chars()
        .map(fold_accent)
        .filter(char::is_ascii_alphabetic)
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let Some((&first, rest)) = letters.split_first() else {
        return String::new();
    };

    let mut code = String::with_capacity(length);
    code.push(first);
    let mut previous = soundex_digit(first);
    for &c in rest {
        if code.len() >= length {
            break;
        }
        match soundex_digit(c) {
            Some(digit) if Some(digit) != previous => {
                code.push(digit);
                previous = Some(digit);
            }
            Some(_) => {}
            // H and W do not separate letters with the same code
            None if c == 'H' || c == 'W' => {}
            None => previous = None,
        }
    }
    while code.len() < length {
        code.push('0');
    }
    code.truncate(length);
    code
}

// ─── Helpers ───────────────────────────────────────────────

fn soundex_digit(c: char) -> Option<char> {
    match c {
        'B' | 'F' | 'P' | 'V' => Some('1'),
        'C' | 'G' | 'J' | 'K' | 'Q' | 'S' | 'X' | 'Z' => Some('2'),
        'D' | 'T' => Some('3'),
        'L' => Some('4'),
        'M' | 'N' => Some('5'),
        'R' => Some('6'),
        _ => None,
    }
}

fn similar_text(value: &str, kind: TextKind, language: Language) -> String {
    let folded: String = value.to_lowercase().chars().map(fold_accent).collect();
    let folded = collapse(&folded);
    let text = if kind.has_articles() {
        strip_article(&folded, language)
    } else {
        &folded
    };
    let cleaned: String = text
        .chars()
        .filter_map(|c| match c {
            '-' | '_' | '.' | '/' | ',' => Some(' '),
            c if c.is_alphanumeric() || c.is_whitespace() => Some(c),
            _ => None,
        })
        .collect();
    collapse(&cleaned)
}

/// Lower-cased name tokens with punctuation removed, in written order.
fn name_tokens(value: &str) -> Vec<String> {
    let cleaned: String = value
        .to_lowercase()
        .chars()
        .map(fold_accent)
        .filter_map(|c| match c {
            ',' | '.' | '-' | '_' => Some(' '),
            c if c.is_alphanumeric() || c.is_whitespace() => Some(c),
            _ => None,
        })
        .collect();
    cleaned.split_whitespace().map(str::to_string).collect()
}

/// Forward keeps written order; reverse moves the last token to the front.
fn orient(mut tokens: Vec<String>, reverse: bool) -> Vec<String> {
    if reverse
        && tokens.len() > 1
        && let Some(last) = tokens.pop()
    {
        tokens.insert(0, last);
    }
    tokens
}

fn fuzzy_name(tokens: Vec<String>, reverse: bool) -> String {
    let (surname, given) = if reverse {
        (tokens.first(), tokens.get(1))
    } else {
        (tokens.last(), tokens.first().filter(|_| tokens.len() > 1))
    };
    match (surname, given.and_then(|g| g.chars().next())) {
        (Some(surname), Some(initial)) => format!("{surname} {initial}"),
        (Some(surname), None) => surname.clone(),
        _ => String::new(),
    }
}

fn strip_article(text: &str, language: Language) -> &str {
    let text = text.trim();
    if language.elides()
        && let Some(rest) = text
            .strip_prefix("l'")
            .or_else(|| text.strip_prefix("l\u{2019}"))
        && !rest.trim().is_empty()
    {
        return rest.trim_start();
    }
    if let Some((first, rest)) = text.split_once(' ')
        && !rest.trim().is_empty()
        && language.articles().contains(&first)
    {
        return rest.trim_start();
    }
    text
}

fn collapse(text: &str) -> String {
    WHITESPACE_RE.replace_all(text.trim(), " ").into_owned()
}

fn fold_accent(c: char) -> char {
    match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' => 'a',
        'ç' => 'c',
        'è' | 'é' | 'ê' | 'ë' => 'e',
        'ì' | 'í' | 'î' | 'ï' => 'i',
        'ñ' => 'n',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' => 'o',
        'ù' | 'ú' | 'û' | 'ü' => 'u',
        'ý' | 'ÿ' => 'y',
        'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => 'A',
        'Ç' => 'C',
        'È' | 'É' | 'Ê' | 'Ë' => 'E',
        'Ì' | 'Í' | 'Î' | 'Ï' => 'I',
        'Ñ' => 'N',
        'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ø' => 'O',
        'Ù' | 'Ú' | 'Û' | 'Ü' => 'U',
        'Ý' => 'Y',
        other => other,
    }
}
