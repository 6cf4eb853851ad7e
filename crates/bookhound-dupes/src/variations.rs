//! Variation mode: spelling variants among the distinct items of one field
//! ("Tolkien, J.R.R." vs "J. R. R. Tolkien"), rather than duplicate books.

use std::collections::{BTreeMap, BTreeSet};

use bookhound_core::{Library, TemplateEvaluator};
use serde::Serialize;

use crate::error::{Result, RuleError};
use crate::evaluate::CompiledRule;
use crate::exemptions::AuthorExemptions;
use crate::hashing::{CandidateMap, RunScratch, tag};
use crate::normalize::TextKind;
use crate::progress::{RunControl, RunLog, Stage};
use crate::rules::MatchRule;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VariationReport {
    pub field: String,
    /// Item id → item value, for items with at least one variation.
    pub item_map: BTreeMap<i64, String>,
    /// Item id → number of books carrying the item.
    pub count_map: BTreeMap<i64, usize>,
    /// Item id → ids of its variants. Symmetric.
    pub variation_map: BTreeMap<i64, BTreeSet<i64>>,
    pub aborted: bool,
    pub log: RunLog,
}

impl VariationReport {
    pub fn is_empty(&self) -> bool {
        self.variation_map.is_empty()
    }
}

/// One rule over `field`, optionally followed by a second rule over the same
/// field whose hashes widen the match.
pub fn check_variation_rules(
    field: &str,
    rules: &[MatchRule],
) -> std::result::Result<(), Vec<RuleError>> {
    let mut errors = Vec::new();
    match rules {
        [] => errors.push(RuleError::new(0, field, "no match rule given")),
        [first, rest @ ..] => {
            if first.field != field {
                errors.push(RuleError::new(
                    0,
                    &first.field,
                    format!("rule field must be '{field}'"),
                ));
            }
            if first.multiply {
                errors.push(RuleError::new(0, &first.field, "multiply is not used for variations"));
            }
            for (offset, extra) in rest.iter().enumerate() {
                let index = offset + 1;
                if index > 1 {
                    errors.push(RuleError::new(index, &extra.field, "at most two rules are allowed"));
                } else if extra.field != first.field {
                    errors.push(RuleError::new(
                        index,
                        &extra.field,
                        "a second rule must use the same field as the first",
                    ));
                }
            }
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

pub struct VariationFinder<'a> {
    library: &'a dyn Library,
    rules: &'a [CompiledRule],
    templates: &'a dyn TemplateEvaluator,
    author_exemptions: Option<&'a AuthorExemptions>,
}

impl<'a> VariationFinder<'a> {
    pub fn new(
        library: &'a dyn Library,
        rules: &'a [CompiledRule],
        templates: &'a dyn TemplateEvaluator,
    ) -> Self {
        Self {
            library,
            rules,
            templates,
            author_exemptions: None,
        }
    }

    /// Name pairs exempted here are never reported as variants.
    pub fn with_author_exemptions(mut self, exemptions: &'a AuthorExemptions) -> Self {
        self.author_exemptions = Some(exemptions);
        self
    }

    pub fn find(
        &self,
        field: &str,
        scratch: &mut RunScratch,
        control: &mut RunControl,
    ) -> Result<VariationReport> {
        let mut report = VariationReport {
            field: field.to_string(),
            ..VariationReport::default()
        };
        let items = self.library.field_domain(field)?;
        let total = items.len();

        let mut candidates = CandidateMap::new();
        for (done, item) in items.iter().enumerate() {
            if control.is_aborted() {
                report.log.note(format!("aborted after {done} of {total} items"));
                report.aborted = true;
                return Ok(report);
            }
            for (position, rule) in self.rules.iter().enumerate() {
                match rule.evaluate_item(item.id, &item.value, self.templates, scratch) {
                    Ok(outputs) => {
                        for output in outputs {
                            let key = format!("{position}{}", tag(&rule.field, &output));
                            candidates.entry(key).or_default().insert(item.id);
                        }
                    }
                    Err(e) => report.log.record_error(e),
                }
            }
            control.report(Stage::Variations, done + 1, total);
        }

        let names = self.rules.iter().any(|r| r.kind == TextKind::Name);
        let by_id: BTreeMap<i64, &str> = items.iter().map(|i| (i.id, i.value.as_str())).collect();
        for ids in candidates.values().filter(|ids| ids.len() >= 2) {
            for &a in ids {
                for &b in ids {
                    if a == b || (names && self.names_exempt(by_id[&a], by_id[&b])) {
                        continue;
                    }
                    report.variation_map.entry(a).or_default().insert(b);
                }
            }
        }

        for item in &items {
            if report.variation_map.contains_key(&item.id) {
                report.item_map.insert(item.id, item.value.clone());
                report.count_map.insert(item.id, item.count);
            }
        }
        tracing::debug!(
            field,
            items = total,
            varied = report.item_map.len(),
            "variation search finished"
        );
        Ok(report)
    }

    fn names_exempt(&self, a: &str, b: &str) -> bool {
        self.author_exemptions
            .is_some_and(|store| store.are_exempt(&a.to_string(), &b.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::AlgorithmRegistry;
    use crate::evaluate::RuleCompiler;
    use bookhound_core::{BookRecord, MemoryLibrary, Templates};

    fn library() -> MemoryLibrary {
        MemoryLibrary::with_books([
            BookRecord::new(1, "The Hobbit").with_authors(&["J. R. R. Tolkien"]),
            BookRecord::new(2, "Silmarillion").with_authors(&["Tolkien, J R R"]),
            BookRecord::new(3, "Unfinished Tales").with_authors(&["J. R. R. Tolkien"]),
            BookRecord::new(4, "Wasp Factory").with_authors(&["Iain Banks"]),
            BookRecord::new(5, "Excession").with_authors(&["Banks, Iain"]),
            BookRecord::new(6, "Dune").with_authors(&["Frank Herbert"]),
        ])
    }

    fn find(
        lib: &MemoryLibrary,
        rules: &[MatchRule],
        exemptions: Option<&AuthorExemptions>,
    ) -> VariationReport {
        let registry = AlgorithmRegistry::builtin();
        let compiled = RuleCompiler::new(&registry, &Templates)
            .compile(rules, lib)
            .unwrap();
        let mut finder = VariationFinder::new(lib, &compiled, &Templates);
        if let Some(store) = exemptions {
            finder = finder.with_author_exemptions(store);
        }
        finder
            .find("authors", &mut RunScratch::default(), &mut RunControl::new())
            .unwrap()
    }

    #[test]
    fn test_name_variants_found_with_counts() {
        let lib = library();
        let report = find(&lib, &[MatchRule::new("authors", &["similar"])], None);

        // domain ids follow value order: Banks, Iain=1, Frank Herbert=2,
        // Iain Banks=3, J. R. R. Tolkien=4, Tolkien, J R R=5
        assert_eq!(report.variation_map.len(), 4);
        assert_eq!(report.variation_map[&4], [5].into_iter().collect());
        assert_eq!(report.variation_map[&5], [4].into_iter().collect());
        assert_eq!(report.variation_map[&1], [3].into_iter().collect());
        assert_eq!(report.item_map[&4], "J. R. R. Tolkien");
        assert_eq!(report.count_map[&4], 2);
        assert!(!report.item_map.contains_key(&2));
    }

    #[test]
    fn test_exempt_names_are_not_variants() {
        let lib = library();
        let mut store = AuthorExemptions::new();
        store.add_exemption(["Iain Banks".to_string(), "Banks, Iain".to_string()]);
        let report = find(&lib, &[MatchRule::new("authors", &["similar"])], Some(&store));
        assert!(!report.variation_map.contains_key(&1));
        assert!(!report.variation_map.contains_key(&3));
        assert!(report.variation_map.contains_key(&4));
    }

    #[test]
    fn test_rule_shape_checks() {
        assert!(check_variation_rules("authors", &[MatchRule::new("authors", &["similar"])]).is_ok());
        assert!(check_variation_rules(
            "authors",
            &[
                MatchRule::new("authors", &["similar"]),
                MatchRule::new("authors", &["soundex"]),
            ]
        )
        .is_ok());

        let errors = check_variation_rules(
            "authors",
            &[
                MatchRule::new("authors", &["similar"]),
                MatchRule::new("title", &["similar"]),
                MatchRule::new("authors", &["fuzzy"]),
            ],
        )
        .unwrap_err();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].rule, 1);
        assert_eq!(errors[1].rule, 2);

        assert!(check_variation_rules("tags", &[MatchRule::new("authors", &["similar"])]).is_err());
        assert!(check_variation_rules("tags", &[]).is_err());
    }

    #[test]
    fn test_aborted_variation_search() {
        let lib = library();
        let registry = AlgorithmRegistry::builtin();
        let compiled = RuleCompiler::new(&registry, &Templates)
            .compile(&[MatchRule::new("authors", &["similar"])], &lib)
            .unwrap();
        let mut control = RunControl::new();
        control.abort_handle().store(true, std::sync::atomic::Ordering::Relaxed);

        let report = VariationFinder::new(&lib, &compiled, &Templates)
            .find("authors", &mut RunScratch::default(), &mut control)
            .unwrap();
        assert!(report.aborted);
        assert!(report.variation_map.is_empty());
    }
}
