//! Compiling match rules and running them against one book or one item.

use std::collections::BTreeSet;

use bookhound_core::{
    BookId, CoreError, FieldKind, FieldMetadata, Library, TemplateEvaluator, format_number,
};
use serde_json::Value;

use crate::algorithms::{AlgorithmRegistry, EvalContext, FieldContext, HashFn, Settings};
use crate::error::{EvaluationError, RuleError};
use crate::hashing::RunScratch;
use crate::normalize::TextKind;
use crate::rules::MatchRule;

/// Separator between the sorted items of a joined multi-valued field.
const ITEM_JOIN: &str = ",";

struct Step {
    name: String,
    settings: Settings,
    hash: HashFn,
}

/// A validated rule with its hash functions built.
pub struct CompiledRule {
    pub index: usize,
    pub field: String,
    pub meta: FieldMetadata,
    pub kind: TextKind,
    pub multiply: bool,
    split: bool,
    separator: String,
    forward: Vec<Step>,
    /// Same chain with the terminal algorithm in its reversed form.
    reverse: Option<Vec<Step>>,
}

impl std::fmt::Debug for CompiledRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledRule")
            .field("index", &self.index)
            .field("field", &self.field)
            .field("kind", &self.kind)
            .field("multiply", &self.multiply)
            .field(
                "algorithms",
                &self.forward.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            )
            .field("reverse", &self.reverse.is_some())
            .finish()
    }
}

/// Why a rule could not produce a value for one book.
#[derive(Debug)]
pub enum EvalFailure {
    /// An algorithm failed; the book is skipped and the error logged.
    Algorithm(EvaluationError),
    /// The library could not be read; the run stops.
    Library(CoreError),
}

impl From<CoreError> for EvalFailure {
    fn from(e: CoreError) -> Self {
        EvalFailure::Library(e)
    }
}

impl From<EvaluationError> for EvalFailure {
    fn from(e: EvaluationError) -> Self {
        EvalFailure::Algorithm(e)
    }
}

/// Turns [`MatchRule`]s into [`CompiledRule`]s, reporting every problem at once.
pub struct RuleCompiler<'a> {
    registry: &'a AlgorithmRegistry,
    templates: &'a dyn TemplateEvaluator,
    defaults: Settings,
}

impl<'a> RuleCompiler<'a> {
    pub fn new(registry: &'a AlgorithmRegistry, templates: &'a dyn TemplateEvaluator) -> Self {
        Self {
            registry,
            templates,
            defaults: Settings::new(),
        }
    }

    /// Engine-wide settings applied under each rule's own settings.
    pub fn with_defaults(mut self, defaults: Settings) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn compile(
        &self,
        rules: &[MatchRule],
        library: &dyn Library,
    ) -> std::result::Result<Vec<CompiledRule>, Vec<RuleError>> {
        if rules.is_empty() {
            return Err(vec![RuleError::new(0, "", "no match rules given")]);
        }

        let mut compiled = Vec::with_capacity(rules.len());
        let mut errors = Vec::new();
        for (index, rule) in rules.iter().enumerate() {
            match self.compile_rule(index, rule, library) {
                Ok(rule) => compiled.push(rule),
                Err(mut rule_errors) => errors.append(&mut rule_errors),
            }
        }

        if errors.is_empty() {
            Ok(compiled)
        } else {
            Err(errors)
        }
    }

    pub fn compile_rule(
        &self,
        index: usize,
        rule: &MatchRule,
        library: &dyn Library,
    ) -> std::result::Result<CompiledRule, Vec<RuleError>> {
        let field = rule.field.trim();
        if field.is_empty() {
            return Err(vec![RuleError::new(index, field, "no field selected")]);
        }
        let Some(meta) = library.field_metadata(field) else {
            return Err(vec![RuleError::new(
                index,
                field,
                format!("field '{field}' does not exist in this library"),
            )]);
        };
        if rule.algorithms.is_empty() {
            return Err(vec![RuleError::new(index, field, "no algorithms selected")]);
        }

        let split = meta.multi
            || meta.kind == FieldKind::Identifiers
            || (meta.kind == FieldKind::Composite && rule.composite_has_names);
        let separator = match meta.list_separator.as_deref() {
            None if split && rule.composite_has_names => "&".to_string(),
            _ => meta.separator().to_string(),
        };
        let mut errors = Vec::new();
        if rule.multiply && !split {
            errors.push(RuleError::new(
                index,
                field,
                "multiply needs a multi-valued field",
            ));
        }

        let context = FieldContext {
            field: field.to_string(),
            kind: TextKind::for_field(&meta, rule.composite_has_names),
        };

        let mut resolved = Vec::with_capacity(rule.algorithms.len());
        for spec in &rule.algorithms {
            let Some(algorithm) = self.registry.get(&spec.name) else {
                errors.push(
                    RuleError::new(index, field, format!("unknown algorithm '{}'", spec.name))
                        .for_algorithm(&spec.name),
                );
                continue;
            };
            let settings = algorithm.effective_settings(&spec.settings, &self.defaults);
            if let Err(e) = algorithm.validate(&settings, self.templates) {
                errors.push(
                    RuleError::new(index, field, e.message)
                        .for_algorithm(algorithm.name)
                        .with_details(e.details),
                );
                continue;
            }
            resolved.push((algorithm, settings));
        }
        if !errors.is_empty() {
            return Err(errors);
        }

        let build = |reverse_terminal: bool| -> Vec<Step> {
            let last = resolved.len() - 1;
            resolved
                .iter()
                .enumerate()
                .map(|(i, (algorithm, settings))| Step {
                    name: algorithm.name.to_string(),
                    settings: settings.clone(),
                    hash: algorithm.factory(&context, settings, reverse_terminal && i == last),
                })
                .collect()
        };
        let forward = build(false);
        let reverse = resolved
            .last()
            .filter(|(algorithm, _)| algorithm.has_reverse(&context))
            .map(|_| build(true));

        Ok(CompiledRule {
            index,
            field: field.to_string(),
            kind: context.kind,
            meta,
            multiply: rule.multiply,
            split,
            separator,
            forward,
            reverse,
        })
    }
}

impl CompiledRule {
    pub fn has_reverse(&self) -> bool {
        self.reverse.is_some()
    }

    pub fn algorithm_names(&self) -> Vec<&str> {
        self.forward.iter().map(|s| s.name.as_str()).collect()
    }

    /// Normalized outputs of this rule for one book.
    ///
    /// Single-valued fields yield their forward and reversed forms. Split
    /// fields without `multiply` yield the sorted items joined into one
    /// string (again forward and reversed); with `multiply` every item
    /// output is returned on its own. An empty set means the rule has
    /// nothing to say about the book.
    pub fn evaluate_book(
        &self,
        library: &dyn Library,
        book_id: BookId,
        templates: &dyn TemplateEvaluator,
        scratch: &mut RunScratch,
    ) -> std::result::Result<BTreeSet<String>, EvalFailure> {
        let Some(value) = library.field(book_id, &self.field)? else {
            return Ok(BTreeSet::new());
        };
        let separator = self.separator.as_str();
        let items = if self.split {
            value.items(separator)
        } else {
            vec![value.render(separator).trim().to_string()]
        };
        let series_index = match self.meta.index_field() {
            Some(index_field) if library.field_metadata(&index_field).is_some() => library
                .field(book_id, &index_field)?
                .and_then(|v| v.as_number()),
            _ => None,
        };

        let mut ctx = EvalContext {
            library: Some(library),
            book_id: Some(book_id),
            templates,
            scratch,
        };
        let mut forward = BTreeSet::new();
        let mut reverse = BTreeSet::new();
        for item in items.iter().filter(|i| !i.is_empty()) {
            forward.insert(self.run_chain(&self.forward, item, &mut ctx, book_id)?);
            if let Some(steps) = &self.reverse {
                reverse.insert(self.run_chain(steps, item, &mut ctx, book_id)?);
            }
        }
        forward.remove("");
        reverse.remove("");

        let mut outputs: BTreeSet<String> = if self.split && !self.multiply {
            [join_items(&forward), join_items(&reverse)]
                .into_iter()
                .filter(|s| !s.is_empty())
                .collect()
        } else {
            forward.into_iter().chain(reverse).collect()
        };

        if let Some(index) = series_index {
            outputs = outputs
                .into_iter()
                .map(|o| format!("{o}#{}", format_number(index)))
                .collect();
        }
        Ok(outputs)
    }

    /// Normalized outputs for one field item, with only `{value}` bound in
    /// templates. `item_id` is used for error reporting.
    pub fn evaluate_item(
        &self,
        item_id: i64,
        value: &str,
        templates: &dyn TemplateEvaluator,
        scratch: &mut RunScratch,
    ) -> std::result::Result<BTreeSet<String>, EvaluationError> {
        let mut ctx = EvalContext {
            library: None,
            book_id: None,
            templates,
            scratch,
        };
        let mut outputs = BTreeSet::new();
        outputs.insert(self.run_chain(&self.forward, value, &mut ctx, item_id)?);
        if let Some(steps) = &self.reverse {
            outputs.insert(self.run_chain(steps, value, &mut ctx, item_id)?);
        }
        outputs.remove("");
        Ok(outputs)
    }

    fn run_chain(
        &self,
        steps: &[Step],
        input: &str,
        ctx: &mut EvalContext<'_>,
        entity: i64,
    ) -> std::result::Result<String, EvaluationError> {
        let mut value = input.to_string();
        for step in steps {
            value = (step.hash)(&value, ctx).map_err(|message| EvaluationError {
                book_id: entity,
                field: self.field.clone(),
                algorithm: step.name.clone(),
                settings: Value::Object(step.settings.clone()),
                message,
            })?;
        }
        Ok(value)
    }
}

fn join_items(items: &BTreeSet<String>) -> String {
    items.iter().map(String::as_str).collect::<Vec<_>>().join(ITEM_JOIN)
}
