//! Combining per-rule outputs into book hashes and bucketing books by hash.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use bookhound_core::{BookId, Library, TemplateEvaluator};
use uuid::Uuid;

use crate::error::Result;
use crate::evaluate::{CompiledRule, EvalFailure};
use crate::progress::{RunControl, RunLog, Stage};

/// Hash → books (or items) that produced it.
pub type CandidateMap = BTreeMap<String, BTreeSet<BookId>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct TemplateKey {
    pub template: String,
    pub book_id: BookId,
    pub database_id: Uuid,
    /// Only set when the template reads `{value}`.
    pub value: Option<String>,
}

/// State that lives for exactly one run.
#[derive(Debug, Default)]
pub struct RunScratch {
    templates: HashMap<TemplateKey, String>,
    hits: usize,
}

impl RunScratch {
    pub fn clear(&mut self) {
        self.templates.clear();
        self.hits = 0;
    }

    pub fn cached_templates(&self) -> usize {
        self.templates.len()
    }

    pub fn cache_hits(&self) -> usize {
        self.hits
    }

    pub(crate) fn template_output(
        &mut self,
        key: TemplateKey,
        evaluate: impl FnOnce() -> String,
    ) -> String {
        if let Some(cached) = self.templates.get(&key) {
            self.hits += 1;
            return cached.clone();
        }
        let output = evaluate();
        self.templates.insert(key, output.clone());
        output
    }
}

/// `|field:value|`
pub fn tag(field: &str, value: &str) -> String {
    format!("|{field}:{value}|")
}

/// Builds the hash set of a book from compiled rules.
pub struct BookHasher<'a> {
    rules: &'a [CompiledRule],
    templates: &'a dyn TemplateEvaluator,
}

impl<'a> BookHasher<'a> {
    pub fn new(rules: &'a [CompiledRule], templates: &'a dyn TemplateEvaluator) -> Self {
        Self { rules, templates }
    }

    /// Every hash the book is reachable under. Each rule's outputs are
    /// tagged with the field name and multiplied into the running set, so a
    /// rule with a reversed reading or several `multiply` items fans the
    /// set out. Empty when no rule contributed anything.
    pub fn hashes(
        &self,
        library: &dyn Library,
        book_id: BookId,
        scratch: &mut RunScratch,
    ) -> std::result::Result<BTreeSet<String>, EvalFailure> {
        let mut hashes = vec![String::new()];
        let mut contributed = false;

        for rule in self.rules {
            let outputs = rule.evaluate_book(library, book_id, self.templates, scratch)?;
            if outputs.is_empty() {
                continue;
            }
            contributed = true;

            let tokens: Vec<String> = outputs.iter().map(|o| tag(&rule.field, o)).collect();
            hashes = hashes
                .iter()
                .flat_map(|prefix| tokens.iter().map(move |token| format!("{prefix}{token}")))
                .collect();
        }

        if !contributed {
            return Ok(BTreeSet::new());
        }
        Ok(hashes.into_iter().collect())
    }

    /// Hash every book in `ids` into a candidate map. Books whose
    /// evaluation fails are logged and skipped. Returns `None` when the run
    /// was aborted.
    pub fn candidates(
        &self,
        library: &dyn Library,
        ids: &[BookId],
        scratch: &mut RunScratch,
        control: &mut RunControl,
        log: &mut RunLog,
        stage: Stage,
    ) -> Result<Option<CandidateMap>> {
        let mut candidates = CandidateMap::new();
        let total = ids.len();

        for (done, &book_id) in ids.iter().enumerate() {
            if control.is_aborted() {
                log.note(format!("aborted after {done} of {total} books"));
                return Ok(None);
            }
            match self.hashes(library, book_id, scratch) {
                Ok(hashes) => {
                    for hash in hashes {
                        candidates.entry(hash).or_default().insert(book_id);
                    }
                }
                Err(EvalFailure::Algorithm(e)) => log.record_error(e),
                Err(EvalFailure::Library(e)) => return Err(e.into()),
            }
            control.report(stage, done + 1, total);
        }

        tracing::debug!(books = total, hashes = candidates.len(), "hashed books");
        Ok(Some(candidates))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::AlgorithmRegistry;
    use crate::evaluate::RuleCompiler;
    use crate::rules::MatchRule;
    use bookhound_core::{BookRecord, MemoryLibrary, Templates};

    fn library() -> MemoryLibrary {
        MemoryLibrary::with_books([
            BookRecord::new(1, "Good Omens")
                .with_authors(&["Terry Pratchett", "Neil Gaiman"])
                .with_tags(&["fantasy", "humour"]),
            BookRecord::new(2, "Good Omens").with_authors(&["Gaiman, Neil"]),
            BookRecord::new(3, ""),
        ])
    }

    fn hashes_of(lib: &MemoryLibrary, rules: &[MatchRule], id: BookId) -> BTreeSet<String> {
        let registry = AlgorithmRegistry::builtin();
        let compiled = RuleCompiler::new(&registry, &Templates)
            .compile(rules, lib)
            .unwrap();
        let mut scratch = RunScratch::default();
        BookHasher::new(&compiled, &Templates)
            .hashes(lib, id, &mut scratch)
            .unwrap()
    }

    #[test]
    fn test_single_rule_hash_is_tagged() {
        let lib = library();
        let hashes = hashes_of(&lib, &[MatchRule::new("title", &["similar"])], 1);
        assert_eq!(hashes.into_iter().collect::<Vec<_>>(), vec!["|title:good omens|"]);
    }

    #[test]
    fn test_multiply_fans_out() {
        let lib = library();
        let rules = [
            MatchRule::new("title", &["similar"]),
            MatchRule::new("authors", &["similar"]).multiply(),
        ];
        let hashes = hashes_of(&lib, &rules, 1);
        assert_eq!(hashes.len(), 4);
        assert!(hashes.contains("|title:good omens||authors:neil gaiman|"));
        assert!(hashes.contains("|title:good omens||authors:gaiman neil|"));

        let other = hashes_of(&lib, &rules, 2);
        assert!(hashes.intersection(&other).next().is_some());
    }

    #[test]
    fn test_book_without_contribution_has_no_hashes() {
        let lib = library();
        let hashes = hashes_of(&lib, &[MatchRule::new("title", &["similar"])], 3);
        assert!(hashes.is_empty());
    }

    #[test]
    fn test_empty_rule_is_skipped() {
        let lib = library();
        let rules = [
            MatchRule::new("title", &["identical"]),
            MatchRule::new("tags", &["identical"]),
        ];
        let hashes = hashes_of(&lib, &rules, 2);
        assert_eq!(hashes.into_iter().collect::<Vec<_>>(), vec!["|title:good omens|"]);
    }

    #[test]
    fn test_candidates_bucket_books() {
        let lib = library();
        let registry = AlgorithmRegistry::builtin();
        let compiled = RuleCompiler::new(&registry, &Templates)
            .compile(&[MatchRule::new("title", &["identical"])], &lib)
            .unwrap();
        let mut scratch = RunScratch::default();
        let mut control = RunControl::new();
        let mut log = RunLog::default();

        let candidates = BookHasher::new(&compiled, &Templates)
            .candidates(&lib, &[1, 2, 3], &mut scratch, &mut control, &mut log, Stage::Hashing)
            .unwrap()
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(
            candidates["|title:good omens|"],
            [1, 2].into_iter().collect::<BTreeSet<_>>()
        );
    }

    #[test]
    fn test_candidates_stop_on_abort() {
        let lib = library();
        let registry = AlgorithmRegistry::builtin();
        let compiled = RuleCompiler::new(&registry, &Templates)
            .compile(&[MatchRule::new("title", &["identical"])], &lib)
            .unwrap();
        let mut control = RunControl::new();
        let abort = control.abort_handle();
        control.on_progress(move |p| {
            if p.done == 1 {
                abort.store(true, std::sync::atomic::Ordering::Relaxed);
            }
        });
        let mut log = RunLog::default();

        let result = BookHasher::new(&compiled, &Templates)
            .candidates(
                &lib,
                &[1, 2, 3],
                &mut RunScratch::default(),
                &mut control,
                &mut log,
                Stage::Hashing,
            )
            .unwrap();
        assert!(result.is_none());
        assert!(log.messages[0].contains("aborted after 1"));
    }
}
