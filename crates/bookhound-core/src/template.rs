/// Template language for composite columns and the `template` match algorithm.
///
/// ```text
/// {title}                  → field value (lists joined with ", ")
/// {authors:first}          → first item of a list
/// {title:lower}            → lower-cased
/// {tags:sorted:lower}      → functions apply left to right
/// {authors:join( & )}      → join items with a custom separator
/// {series|standalone}      → fallback text when the field is empty
/// {identifiers.isbn}       → one identifier type
/// {value}                  → the value currently being hashed
/// ```
///
/// Anything outside braces is copied verbatim. Templates cannot look at other
/// books: the only inputs are the fields handed in through [`FieldSource`].
use crate::error::{CoreError, Result};
use crate::host::FieldSource;
use crate::models::FieldValue;

/// Evaluates user templates against a set of fields.
pub trait TemplateEvaluator {
    /// Check that a template parses.
    fn compile(&self, template: &str) -> Result<()>;

    /// Evaluate `template`; returns `error_sentinel` when it does not parse.
    fn eval(&self, template: &str, fields: &dyn FieldSource, error_sentinel: &str) -> String;
}

/// The built-in template evaluator.
#[derive(Debug, Clone, Copy, Default)]
pub struct Templates;

impl Templates {
    pub fn new() -> Self {
        Self
    }
}

impl TemplateEvaluator for Templates {
    fn compile(&self, template: &str) -> Result<()> {
        parse(template).map(|_| ())
    }

    fn eval(&self, template: &str, fields: &dyn FieldSource, error_sentinel: &str) -> String {
        match parse(template) {
            Ok(segments) => render(&segments, fields),
            Err(e) => {
                tracing::debug!("template {template:?} failed to parse: {e}");
                error_sentinel.to_string()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Field {
        name: String,
        functions: Vec<Function>,
        fallback: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Function {
    Lower,
    Upper,
    Trim,
    First,
    Last,
    Sorted,
    Count,
    Join(String),
}

fn parse(template: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = template.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '{' => {
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                let mut body = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    match c {
                        '}' => {
                            closed = true;
                            break;
                        }
                        '{' => {
                            return Err(CoreError::Template(format!(
                                "nested '{{' in {template:?}"
                            )));
                        }
                        other => body.push(other),
                    }
                }
                if !closed {
                    return Err(CoreError::Template(format!("unclosed '{{' in {template:?}")));
                }
                segments.push(parse_field(&body)?);
            }
            '}' => {
                return Err(CoreError::Template(format!("unmatched '}}' in {template:?}")));
            }
            other => literal.push(other),
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

fn parse_field(body: &str) -> Result<Segment> {
    let (body, fallback) = match body.split_once('|') {
        Some((b, f)) => (b, Some(f.to_string())),
        None => (body, None),
    };

    let parts = split_functions(body)?;
    let mut parts = parts.into_iter();
    let name = parts.next().unwrap_or_default().trim().to_string();
    if name.is_empty() {
        return Err(CoreError::Template("empty field name".to_string()));
    }

    let functions = parts.map(|p| parse_function(&p)).collect::<Result<Vec<_>>>()?;
    Ok(Segment::Field {
        name,
        functions,
        fallback,
    })
}

/// Split on `:` outside parentheses.
fn split_functions(body: &str) -> Result<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;

    for ch in body.chars() {
        match ch {
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| CoreError::Template(format!("unmatched ')' in {body:?}")))?;
                current.push(ch);
            }
            ':' if depth == 0 => parts.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    if depth != 0 {
        return Err(CoreError::Template(format!("unclosed '(' in {body:?}")));
    }
    parts.push(current);
    Ok(parts)
}

fn parse_function(raw: &str) -> Result<Function> {
    let raw_trimmed = raw.trim();
    // Whitespace inside the parentheses is part of the separator.
    if let Some(sep) = raw_trimmed
        .strip_prefix("join(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        return Ok(Function::Join(sep.to_string()));
    }

    match raw_trimmed {
        "lower" => Ok(Function::Lower),
        "upper" => Ok(Function::Upper),
        "trim" => Ok(Function::Trim),
        "first" => Ok(Function::First),
        "last" => Ok(Function::Last),
        "sorted" => Ok(Function::Sorted),
        "count" => Ok(Function::Count),
        other => Err(CoreError::Template(format!("unknown function: {other}"))),
    }
}

fn render(segments: &[Segment], fields: &dyn FieldSource) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Field {
                name,
                functions,
                fallback,
            } => {
                let rendered = render_field(name, functions, fields);
                if rendered.is_empty() {
                    if let Some(fallback) = fallback {
                        out.push_str(fallback);
                    }
                } else {
                    out.push_str(&rendered);
                }
            }
        }
    }
    out
}

fn render_field(name: &str, functions: &[Function], fields: &dyn FieldSource) -> String {
    let mut items: Vec<String> = match fields.value_of(name) {
        Some(FieldValue::List(items)) => items,
        Some(FieldValue::Identifiers(map)) => {
            map.into_iter().map(|(k, v)| format!("{k}:{v}")).collect()
        }
        Some(other) => vec![other.render(", ")],
        None => Vec::new(),
    };
    let mut separator = ", ".to_string();

    for function in functions {
        match function {
            Function::Lower => items.iter_mut().for_each(|i| *i = i.to_lowercase()),
            Function::Upper => items.iter_mut().for_each(|i| *i = i.to_uppercase()),
            Function::Trim => items.iter_mut().for_each(|i| *i = i.trim().to_string()),
            Function::First => items.truncate(1),
            Function::Last => {
                if let Some(last) = items.pop() {
                    items = vec![last];
                }
            }
            Function::Sorted => items.sort(),
            Function::Count => items = vec![items.len().to_string()],
            Function::Join(sep) => separator = sep.clone(),
        }
    }

    items.join(&separator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapFields(HashMap<&'static str, FieldValue>);

    impl FieldSource for MapFields {
        fn value_of(&self, field: &str) -> Option<FieldValue> {
            self.0.get(field).cloned()
        }
    }

    fn fields() -> MapFields {
        let mut map = HashMap::new();
        map.insert("title", FieldValue::Text("The Hobbit".into()));
        map.insert(
            "authors",
            FieldValue::List(vec!["J. R. R. Tolkien".into(), "Christopher Tolkien".into()]),
        );
        map.insert("tags", FieldValue::List(vec!["fantasy".into(), "Classic".into()]));
        map.insert("series_index", FieldValue::Number(2.0));
        MapFields(map)
    }

    #[test]
    fn test_plain_fields_and_literals() {
        let t = Templates::new();
        assert_eq!(
            t.eval("{title} #{series_index}", &fields(), "ERR"),
            "The Hobbit #2"
        );
    }

    #[test]
    fn test_function_chain() {
        let t = Templates::new();
        assert_eq!(t.eval("{authors:first:lower}", &fields(), "ERR"), "j. r. r. tolkien");
        assert_eq!(t.eval("{tags:lower:sorted}", &fields(), "ERR"), "classic, fantasy");
        assert_eq!(t.eval("{tags:count}", &fields(), "ERR"), "2");
        assert_eq!(
            t.eval("{authors:join( & )}", &fields(), "ERR"),
            "J. R. R. Tolkien & Christopher Tolkien"
        );
    }

    #[test]
    fn test_fallback_for_missing_field() {
        let t = Templates::new();
        assert_eq!(t.eval("{series|standalone}", &fields(), "ERR"), "standalone");
        assert_eq!(t.eval("{series}", &fields(), "ERR"), "");
    }

    #[test]
    fn test_compile_errors() {
        let t = Templates::new();
        assert!(t.compile("{title").is_err());
        assert!(t.compile("title}").is_err());
        assert!(t.compile("{title:shout}").is_err());
        assert!(t.compile("{}").is_err());
        assert!(t.compile("{title:lower}").is_ok());
        assert_eq!(t.eval("{title", &fields(), "ERR"), "ERR");
    }
}
