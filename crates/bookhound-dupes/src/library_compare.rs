//! Cross-library mode: which local books already exist in another library.

use std::collections::{BTreeMap, BTreeSet};

use bookhound_core::{BookId, Library, TemplateEvaluator};
use serde::Serialize;

use crate::algorithms::{AlgorithmRegistry, Settings};
use crate::error::{DupesError, Result, RuleError};
use crate::evaluate::{EvalFailure, RuleCompiler};
use crate::hashing::{BookHasher, RunScratch};
use crate::progress::{RunControl, RunLog, Stage};
use crate::rules::MatchRule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareState {
    Idle,
    Validating,
    AnalyzingTarget,
    AnalyzingLocal,
    Reporting,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LibraryComparison {
    /// Local books with at least one match in the target library.
    pub duplicates: BTreeSet<BookId>,
    pub aborted: bool,
    /// Mentions the matching target ids; those ids are not part of the result.
    pub log: RunLog,
}

pub struct LibraryComparer<'a> {
    local: &'a dyn Library,
    target: &'a dyn Library,
    registry: &'a AlgorithmRegistry,
    templates: &'a dyn TemplateEvaluator,
    defaults: Settings,
    state: CompareState,
    history: Vec<CompareState>,
}

impl<'a> LibraryComparer<'a> {
    pub fn new(
        local: &'a dyn Library,
        target: &'a dyn Library,
        registry: &'a AlgorithmRegistry,
        templates: &'a dyn TemplateEvaluator,
    ) -> Self {
        Self {
            local,
            target,
            registry,
            templates,
            defaults: Settings::new(),
            state: CompareState::Idle,
            history: Vec::new(),
        }
    }

    pub fn with_defaults(mut self, defaults: Settings) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn state(&self) -> CompareState {
        self.state
    }

    /// States entered so far, in order.
    pub fn history(&self) -> &[CompareState] {
        &self.history
    }

    fn enter(&mut self, state: CompareState) {
        tracing::debug!(from = ?self.state, to = ?state, "library comparison");
        self.state = state;
        self.history.push(state);
    }

    /// Hash the target, then flag every local book in `local_ids` that
    /// shares a hash with it. An abort discards partial results.
    pub fn run(
        &mut self,
        rules: &[MatchRule],
        local_ids: &[BookId],
        scratch: &mut RunScratch,
        control: &mut RunControl,
    ) -> Result<LibraryComparison> {
        let result = self.compare(rules, local_ids, scratch, control);
        self.enter(CompareState::Idle);
        result
    }

    fn compare(
        &mut self,
        rules: &[MatchRule],
        local_ids: &[BookId],
        scratch: &mut RunScratch,
        control: &mut RunControl,
    ) -> Result<LibraryComparison> {
        self.enter(CompareState::Validating);
        let compiler =
            RuleCompiler::new(self.registry, self.templates).with_defaults(self.defaults.clone());
        let local_rules = compiler.compile(rules, self.local);
        let target_rules = compiler.compile(rules, self.target);
        let (local_rules, target_rules) = match (local_rules, target_rules) {
            (Ok(local), Ok(target)) => (local, target),
            (local, target) => {
                let mut errors = local.err().unwrap_or_default();
                errors.extend(target.err().unwrap_or_default().into_iter().map(in_target));
                return Err(DupesError::Validation(errors));
            }
        };

        let mut comparison = LibraryComparison::default();

        self.enter(CompareState::AnalyzingTarget);
        let target_ids = self.target.all_ids()?;
        let target_candidates = BookHasher::new(&target_rules, self.templates).candidates(
            self.target,
            &target_ids,
            scratch,
            control,
            &mut comparison.log,
            Stage::AnalyzingTarget,
        )?;
        let Some(target_candidates) = target_candidates else {
            comparison.aborted = true;
            return Ok(comparison);
        };

        self.enter(CompareState::AnalyzingLocal);
        let hasher = BookHasher::new(&local_rules, self.templates);
        let total = local_ids.len();
        let mut matches: BTreeMap<BookId, BTreeSet<BookId>> = BTreeMap::new();
        for (done, &book_id) in local_ids.iter().enumerate() {
            if control.is_aborted() {
                comparison
                    .log
                    .note(format!("aborted after {done} of {total} local books"));
                comparison.aborted = true;
                return Ok(comparison);
            }
            match hasher.hashes(self.local, book_id, scratch) {
                Ok(hashes) => {
                    for hash in hashes {
                        if let Some(target_books) = target_candidates.get(&hash) {
                            matches
                                .entry(book_id)
                                .or_default()
                                .extend(target_books.iter().copied());
                        }
                    }
                }
                Err(EvalFailure::Algorithm(e)) => comparison.log.record_error(e),
                Err(EvalFailure::Library(e)) => return Err(e.into()),
            }
            control.report(Stage::AnalyzingLocal, done + 1, total);
        }

        self.enter(CompareState::Reporting);
        for (book_id, target_books) in matches {
            comparison.log.note(format!(
                "book {book_id} matches target books {}",
                target_books
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
            comparison.duplicates.insert(book_id);
        }
        Ok(comparison)
    }
}

fn in_target(mut error: RuleError) -> RuleError {
    error.message = format!("target library: {}", error.message);
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use bookhound_core::{BookRecord, FieldKind, FieldMetadata, MemoryLibrary, Templates};
    use std::sync::atomic::Ordering;

    fn local() -> MemoryLibrary {
        MemoryLibrary::with_books([
            BookRecord::new(1, "Dune").with_authors(&["Frank Herbert"]),
            BookRecord::new(2, "Emma").with_authors(&["Jane Austen"]),
            BookRecord::new(3, "Persuasion").with_authors(&["Jane Austen"]),
        ])
    }

    fn target() -> MemoryLibrary {
        MemoryLibrary::with_books([
            BookRecord::new(10, "DUNE").with_authors(&["Herbert, Frank"]),
            BookRecord::new(11, "Emma").with_authors(&["Someone Else"]),
        ])
    }

    fn rules() -> Vec<MatchRule> {
        vec![
            MatchRule::new("title", &["similar"]),
            MatchRule::new("authors", &["similar"]),
        ]
    }

    #[test]
    fn test_local_matches_reported_by_local_id() {
        let (local, target) = (local(), target());
        let registry = AlgorithmRegistry::builtin();
        let mut comparer = LibraryComparer::new(&local, &target, &registry, &Templates);

        let result = comparer
            .run(&rules(), &[1, 2, 3], &mut RunScratch::default(), &mut RunControl::new())
            .unwrap();

        assert_eq!(result.duplicates, [1].into_iter().collect());
        assert!(!result.aborted);
        assert!(result.log.messages.iter().any(|m| m.contains("target books 10")));
        assert_eq!(
            comparer.history(),
            &[
                CompareState::Validating,
                CompareState::AnalyzingTarget,
                CompareState::AnalyzingLocal,
                CompareState::Reporting,
                CompareState::Idle,
            ]
        );
    }

    #[test]
    fn test_field_missing_in_target_fails_validation() {
        let mut local = local();
        local
            .add_column(FieldMetadata::new("#shelf", FieldKind::Text))
            .unwrap();
        let target = target();
        let registry = AlgorithmRegistry::builtin();
        let mut comparer = LibraryComparer::new(&local, &target, &registry, &Templates);

        let err = comparer
            .run(
                &[MatchRule::new("#shelf", &["identical"])],
                &[1],
                &mut RunScratch::default(),
                &mut RunControl::new(),
            )
            .unwrap_err();
        match err {
            DupesError::Validation(errors) => {
                assert_eq!(errors.len(), 1);
                assert!(errors[0].message.starts_with("target library:"));
            }
            other => panic!("unexpected {other}"),
        }
        assert_eq!(comparer.state(), CompareState::Idle);
    }

    #[test]
    fn test_abort_discards_partial_results() {
        let (local, target) = (local(), target());
        let registry = AlgorithmRegistry::builtin();
        let mut comparer = LibraryComparer::new(&local, &target, &registry, &Templates);
        let mut control = RunControl::new();
        let abort = control.abort_handle();
        control.on_progress(move |p| {
            if p.stage == Stage::AnalyzingLocal && p.done == 1 {
                abort.store(true, Ordering::Relaxed);
            }
        });

        let result = comparer
            .run(&rules(), &[1, 2, 3], &mut RunScratch::default(), &mut control)
            .unwrap();
        assert!(result.aborted);
        assert!(result.duplicates.is_empty());
        assert!(!comparer.history().contains(&CompareState::Reporting));
        assert_eq!(comparer.state(), CompareState::Idle);
    }
}
