//! The host-facing entry point: one [`DuplicateEngine`] per open library.
//!
//! The engine owns the exemption stores, the current report and the per-run
//! scratch. Every run starts by clearing the scratch and the abort flag, so
//! two runs over the same input produce the same ids and orderings.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use bookhound_core::config::EngineConfig;
use bookhound_core::{BookId, Database, Library, Restriction, TemplateEvaluator, Templates};
use serde_json::Value;

use crate::algorithms::{AlgorithmRegistry, Settings};
use crate::binary::BinaryComparer;
use crate::error::{DupesError, Result, RuleError};
use crate::evaluate::{CompiledRule, RuleCompiler};
use crate::exemptions::{AuthorExemptions, BookExemptions, ExemptionScope};
use crate::grouping::{AuthorScope, ExemptionLookup, assemble_groups};
use crate::hashing::{BookHasher, CandidateMap, RunScratch};
use crate::library_compare::{LibraryComparer, LibraryComparison};
use crate::presentation::{GroupSorter, order_groups};
use crate::progress::{Progress, RunControl, RunLog, Stage};
use crate::report::{DuplicateReport, GroupId, ReportKind, labels};
use crate::rules::{MatchRule, SortFilter};
use crate::variations::{VariationFinder, VariationReport, check_variation_rules};

/// Per-engine run options; the CLI fills them from `[engine]` and flags.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    pub sort_filters: Vec<SortFilter>,
    pub sort_groups_by_title: bool,
    pub show_all_mode: bool,
    pub scope: ExemptionScope,
    pub soundex_length: u32,
    pub language: String,
    /// Limit runs to part of the library; `None` means every book.
    pub restriction: Option<Restriction>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for EngineOptions {
    fn from(config: &EngineConfig) -> Self {
        let scope = ExemptionScope::parse(&config.exemptions_scope).unwrap_or_else(|| {
            tracing::warn!(
                scope = %config.exemptions_scope,
                "unknown exemptions scope, using book scope"
            );
            ExemptionScope::Book
        });
        Self {
            sort_filters: Vec::new(),
            sort_groups_by_title: config.sort_groups_by_title,
            show_all_mode: config.show_all_mode,
            scope,
            soundex_length: config.soundex_length,
            language: config.language.clone(),
            restriction: None,
        }
    }
}

pub struct DuplicateEngine<'a> {
    library: &'a dyn Library,
    templates: &'a dyn TemplateEvaluator,
    registry: AlgorithmRegistry,
    options: EngineOptions,
    book_exemptions: BookExemptions,
    author_exemptions: AuthorExemptions,
    report: Option<DuplicateReport>,
    control: RunControl,
    scratch: RunScratch,
}

impl<'a> DuplicateEngine<'a> {
    pub fn new(library: &'a dyn Library) -> Self {
        Self {
            library,
            templates: &Templates,
            registry: AlgorithmRegistry::builtin(),
            options: EngineOptions::default(),
            book_exemptions: BookExemptions::new(),
            author_exemptions: AuthorExemptions::new(),
            report: None,
            control: RunControl::new(),
            scratch: RunScratch::default(),
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_templates(mut self, templates: &'a dyn TemplateEvaluator) -> Self {
        self.templates = templates;
        self
    }

    pub fn with_registry(mut self, registry: AlgorithmRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_exemptions(mut self, books: BookExemptions, authors: AuthorExemptions) -> Self {
        self.book_exemptions = books;
        self.author_exemptions = authors;
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut EngineOptions {
        &mut self.options
    }

    pub fn registry(&self) -> &AlgorithmRegistry {
        &self.registry
    }

    pub fn book_exemptions(&self) -> &BookExemptions {
        &self.book_exemptions
    }

    pub fn author_exemptions(&self) -> &AuthorExemptions {
        &self.author_exemptions
    }

    /// Flag the host sets to cancel a run in progress.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        self.control.abort_handle()
    }

    pub fn on_progress(&mut self, callback: impl FnMut(&Progress) + Send + 'static) {
        self.control.on_progress(callback);
    }

    /// Template memo entries held from the last run.
    pub fn scratch(&self) -> &RunScratch {
        &self.scratch
    }

    // ─── Validation ────────────────────────────────────────

    /// Settings every rule inherits unless it sets them itself.
    fn engine_defaults(&self) -> Settings {
        let mut defaults = Settings::new();
        defaults.insert("length".into(), Value::from(self.options.soundex_length));
        defaults.insert("language".into(), Value::from(self.options.language.clone()));
        defaults
    }

    fn compiler(&self) -> RuleCompiler<'_> {
        RuleCompiler::new(&self.registry, self.templates).with_defaults(self.engine_defaults())
    }

    /// Check match rules and the configured sort filters against the
    /// library. All problems are collected; nothing runs.
    pub fn validate_rules(&self, rules: &[MatchRule]) -> std::result::Result<(), Vec<RuleError>> {
        self.compile(rules).map(|_| ())
    }

    fn compile(&self, rules: &[MatchRule]) -> std::result::Result<Vec<CompiledRule>, Vec<RuleError>> {
        let compiled = self.compiler().compile(rules, self.library);
        let mut errors = compiled.as_ref().err().cloned().unwrap_or_default();
        for (index, filter) in self.options.sort_filters.iter().enumerate() {
            if self.library.field_metadata(&filter.field).is_none() {
                errors.push(RuleError::new(
                    index,
                    &filter.field,
                    format!("sort field '{}' does not exist in this library", filter.field),
                ));
            }
        }
        match compiled {
            Ok(rules) if errors.is_empty() => Ok(rules),
            _ => Err(errors),
        }
    }

    fn begin_run(&mut self) {
        self.control.reset();
        self.scratch.clear();
    }

    fn book_ids(&self) -> Result<Vec<BookId>> {
        let ids = match &self.options.restriction {
            Some(restriction) => self.library.subset_ids(restriction)?,
            None => self.library.all_ids()?,
        };
        Ok(ids)
    }

    // ─── Runs ──────────────────────────────────────────────

    /// Find duplicate books under `rules`. The report replaces any previous
    /// one; an aborted run leaves an empty report flagged as aborted.
    pub fn run_book_duplicates(&mut self, rules: &[MatchRule]) -> Result<&DuplicateReport> {
        let compiled = self.compile(rules).map_err(DupesError::Validation)?;
        self.begin_run();
        let ids = self.book_ids()?;

        let mut log = RunLog::default();
        let candidates = BookHasher::new(&compiled, self.templates).candidates(
            self.library,
            &ids,
            &mut self.scratch,
            &mut self.control,
            &mut log,
            Stage::Hashing,
        )?;
        let report = match candidates {
            Some(candidates) => self.build_report(candidates, ReportKind::Metadata, log)?,
            None => DuplicateReport::aborted(ReportKind::Metadata, log),
        };
        tracing::info!(
            books = ids.len(),
            groups = report.group_count(),
            errors = report.log.errors.len(),
            aborted = report.aborted,
            "duplicate check finished"
        );
        Ok(self.report.insert(report))
    }

    /// Group books whose format files are byte-identical.
    pub fn run_binary_duplicates(&mut self) -> Result<&DuplicateReport> {
        self.begin_run();
        let ids = self.book_ids()?;

        let mut log = RunLog::default();
        let candidates =
            BinaryComparer::new(self.library).candidates(&ids, &mut self.control, &mut log)?;
        let report = match candidates {
            Some(candidates) => self.build_report(candidates, ReportKind::Binary, log)?,
            None => DuplicateReport::aborted(ReportKind::Binary, log),
        };
        tracing::info!(
            books = ids.len(),
            groups = report.group_count(),
            aborted = report.aborted,
            "binary duplicate check finished"
        );
        Ok(self.report.insert(report))
    }

    fn build_report(
        &mut self,
        candidates: CandidateMap,
        kind: ReportKind,
        mut log: RunLog,
    ) -> Result<DuplicateReport> {
        let members: BTreeSet<BookId> = candidates
            .values()
            .filter(|books| books.len() >= 2)
            .flatten()
            .copied()
            .collect();
        let lookup = exemption_lookup(
            self.library,
            self.options.scope,
            &self.book_exemptions,
            &self.author_exemptions,
            &members,
        )?;
        let Some(groups) = assemble_groups(candidates, lookup.as_ref(), &mut self.control, &mut log)
        else {
            return Ok(DuplicateReport::aborted(kind, log));
        };

        let sorter = GroupSorter::new(self.library, &self.options.sort_filters);
        let sorted = groups
            .iter()
            .map(|group| sorter.sort(group))
            .collect::<Result<Vec<_>>>()?;
        let ordered = order_groups(self.library, sorted, self.options.sort_groups_by_title)?;

        let mut report = DuplicateReport::from_groups(ordered, kind).with_log(log);
        report.next_group();
        Ok(report)
    }

    /// Local books that already exist in `target`. The current report is
    /// left untouched.
    pub fn run_library_duplicates(
        &mut self,
        target: &dyn Library,
        rules: &[MatchRule],
    ) -> Result<LibraryComparison> {
        self.begin_run();
        let ids = self.book_ids()?;
        let defaults = self.engine_defaults();
        let mut comparer = LibraryComparer::new(self.library, target, &self.registry, self.templates)
            .with_defaults(defaults);
        let comparison = comparer.run(rules, &ids, &mut self.scratch, &mut self.control)?;
        tracing::info!(
            books = ids.len(),
            duplicates = comparison.duplicates.len(),
            aborted = comparison.aborted,
            "library comparison finished"
        );
        Ok(comparison)
    }

    /// Like [`run_library_duplicates`](Self::run_library_duplicates) with the
    /// target opened from disk. Failing to open it is fatal.
    pub fn run_library_duplicates_at(
        &mut self,
        path: &Path,
        rules: &[MatchRule],
    ) -> Result<LibraryComparison> {
        let target = Database::open_existing(path).map_err(DupesError::TargetUnavailable)?;
        self.run_library_duplicates(&target, rules)
    }

    /// Spelling variants among the items of `field`.
    pub fn run_variations(&mut self, field: &str, rules: &[MatchRule]) -> Result<VariationReport> {
        check_variation_rules(field, rules).map_err(DupesError::Validation)?;
        let compiled = self
            .compiler()
            .compile(rules, self.library)
            .map_err(DupesError::Validation)?;
        self.begin_run();

        let report = VariationFinder::new(self.library, &compiled, self.templates)
            .with_author_exemptions(&self.author_exemptions)
            .find(field, &mut self.scratch, &mut self.control)?;
        tracing::info!(
            field,
            items = report.item_map.len(),
            aborted = report.aborted,
            "variation search finished"
        );
        Ok(report)
    }

    // ─── Exemptions ────────────────────────────────────────

    /// Mark `books` as not duplicates of each other. A current report is
    /// re-split when book scope is active.
    pub fn add_book_exemption(&mut self, books: impl IntoIterator<Item = BookId>) {
        self.book_exemptions.add_exemption(books);
        if self.options.scope == ExemptionScope::Book
            && let Some(report) = self.report.as_mut()
        {
            report.apply_exemptions(&self.book_exemptions);
        }
    }

    /// Mark `authors` as different people. A current report is re-split when
    /// author scope is active.
    pub fn add_author_exemption(&mut self, authors: impl IntoIterator<Item = String>) -> Result<()> {
        self.author_exemptions.add_exemption(authors);
        if self.options.scope != ExemptionScope::Author {
            return Ok(());
        }
        let Some(report) = self.report.as_mut() else {
            return Ok(());
        };
        let books = report.books();
        let scope = AuthorScope::new(&self.author_exemptions, book_authors(self.library, &books)?);
        report.apply_exemptions(&scope);
        Ok(())
    }

    /// Takes effect on the next run; an existing report is not regrouped.
    pub fn remove_book_exemption(&mut self, book: BookId, from: BookId) -> bool {
        self.book_exemptions.remove_exemption(&book, &from)
    }

    pub fn remove_author_exemption(&mut self, author: &str, from: &str) -> bool {
        self.author_exemptions
            .remove_exemption(&author.to_string(), &from.to_string())
    }

    /// Exempt the books of group `id` from each other and drop the group.
    pub fn exempt_group(&mut self, id: GroupId) -> Result<Vec<BookId>> {
        let report = self.report.as_mut().ok_or(DupesError::NoReport)?;
        let books = report.remove_group(id).ok_or(DupesError::GroupNotFound(id))?;
        self.book_exemptions.add_exemption(books.iter().copied());
        if self.options.scope == ExemptionScope::Book {
            report.apply_exemptions(&self.book_exemptions);
        }
        Ok(books)
    }

    pub fn exempt_current_group(&mut self) -> Result<Vec<BookId>> {
        let report = self.report.as_ref().ok_or(DupesError::NoReport)?;
        let id = report.current_group().ok_or(DupesError::NoCurrentGroup)?;
        self.exempt_group(id)
    }

    // ─── Report ────────────────────────────────────────────

    pub fn report(&self) -> Option<&DuplicateReport> {
        self.report.as_ref()
    }

    pub fn report_mut(&mut self) -> Option<&mut DuplicateReport> {
        self.report.as_mut()
    }

    pub fn clear_report(&mut self) {
        self.report = None;
    }

    /// Forget books the host deleted.
    pub fn remove_books(&mut self, ids: &BTreeSet<BookId>) {
        if let Some(report) = self.report.as_mut() {
            report.remove_books(ids);
        }
    }

    pub fn next_group(&mut self) -> Result<Option<GroupId>> {
        Ok(self.report.as_mut().ok_or(DupesError::NoReport)?.next_group())
    }

    pub fn previous_group(&mut self) -> Result<Option<GroupId>> {
        Ok(self.report.as_mut().ok_or(DupesError::NoReport)?.previous_group())
    }

    pub fn select_group(&mut self, id: GroupId) -> Result<()> {
        self.report.as_mut().ok_or(DupesError::NoReport)?.select_group(id)
    }

    /// Labels for the current report under the configured show-all mode.
    pub fn marks(&self) -> Result<BTreeMap<BookId, String>> {
        let report = self.report.as_ref().ok_or(DupesError::NoReport)?;
        Ok(report.marks(self.options.show_all_mode))
    }

    /// Replace the host's marked ids with the report marks. Returns the
    /// number of books marked.
    pub fn apply_marks(&self) -> Result<usize> {
        let marks = self.marks()?;
        self.library.set_marked_ids(&marks)?;
        Ok(marks.len())
    }

    /// Books covered by exemptions of `scope`: members of book exemption
    /// sets, or books written by an author in an author exemption set.
    pub fn exemption_marks(&self, scope: ExemptionScope) -> Result<BTreeMap<BookId, String>> {
        let books: BTreeSet<BookId> = match scope {
            ExemptionScope::Book => self.book_exemptions.sets().flatten().copied().collect(),
            ExemptionScope::Author => {
                let ids: BTreeSet<BookId> = self.library.all_ids()?.into_iter().collect();
                book_authors(self.library, &ids)?
                    .into_iter()
                    .filter(|(_, authors)| {
                        authors.iter().any(|a| self.author_exemptions.is_exempt(a))
                    })
                    .map(|(book, _)| book)
                    .collect()
            }
        };
        let label = match scope {
            ExemptionScope::Book => labels::BOOK_EXEMPTION,
            ExemptionScope::Author => labels::AUTHOR_EXEMPTION,
        };
        Ok(books.into_iter().map(|b| (b, label.to_string())).collect())
    }
}

fn exemption_lookup<'s>(
    library: &dyn Library,
    scope: ExemptionScope,
    books: &'s BookExemptions,
    authors: &'s AuthorExemptions,
    members: &BTreeSet<BookId>,
) -> Result<Box<dyn ExemptionLookup + 's>> {
    Ok(match scope {
        ExemptionScope::Book => Box::new(books),
        ExemptionScope::Author => Box::new(AuthorScope::new(authors, book_authors(library, members)?)),
    })
}

/// Author names per book, split the way the library splits `authors`.
fn book_authors(
    library: &dyn Library,
    ids: &BTreeSet<BookId>,
) -> Result<BTreeMap<BookId, BTreeSet<String>>> {
    let separator = library
        .field_metadata("authors")
        .map(|meta| meta.separator().to_string())
        .unwrap_or_else(|| "&".to_string());
    let mut authors = BTreeMap::new();
    for &id in ids {
        let names: BTreeSet<String> = library
            .field(id, "authors")?
            .map(|value| value.items(&separator).into_iter().collect())
            .unwrap_or_default();
        authors.insert(id, names);
    }
    Ok(authors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::AlgorithmSpec;
    use bookhound_core::{BookRecord, MemoryLibrary};
    use std::sync::atomic::Ordering;

    fn group(ids: &[BookId]) -> Vec<BookId> {
        ids.to_vec()
    }

    fn groups(report: &DuplicateReport) -> Vec<BTreeSet<BookId>> {
        report
            .books_for_group
            .values()
            .map(|books| books.iter().copied().collect())
            .collect()
    }

    fn set(ids: &[BookId]) -> BTreeSet<BookId> {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_identical_title_groups_books() {
        let lib = MemoryLibrary::with_books([
            BookRecord::new(1, "Dune").with_authors(&["F. Herbert"]),
            BookRecord::new(2, "dune").with_authors(&["Frank Herbert"]),
        ]);
        let mut engine = DuplicateEngine::new(&lib);
        let report = engine
            .run_book_duplicates(&[MatchRule::new("title", &["identical"])])
            .unwrap();

        assert_eq!(report.group_count(), 1);
        assert_eq!(report.books_for_group[&1], group(&[1, 2]));
        assert_eq!(report.groups_for_book[&2], BTreeSet::from([1]));
        assert!(!report.aborted);
    }

    #[test]
    fn test_similar_authors_tolerate_name_order() {
        let lib = MemoryLibrary::with_books([
            BookRecord::new(1, "X").with_authors(&["King, Stephen"]),
            BookRecord::new(2, "X").with_authors(&["Stephen King"]),
        ]);
        let mut engine = DuplicateEngine::new(&lib);
        let report = engine
            .run_book_duplicates(&[
                MatchRule::new("title", &["identical"]),
                MatchRule::new("authors", &["similar"]),
            ])
            .unwrap();
        assert_eq!(groups(report), vec![set(&[1, 2])]);
    }

    #[test]
    fn test_book_exemption_blocks_pair() {
        let lib = MemoryLibrary::with_books((1..=3).map(|id| BookRecord::new(id, "Same")));
        let mut engine = DuplicateEngine::new(&lib);
        engine.add_book_exemption([1, 2]);

        let report = engine
            .run_book_duplicates(&[MatchRule::new("title", &["identical"])])
            .unwrap();
        assert_eq!(groups(report), vec![set(&[1, 3]), set(&[2, 3])]);
        assert!(
            report
                .books_for_group
                .values()
                .all(|books| !(books.contains(&1) && books.contains(&2)))
        );
    }

    #[test]
    fn test_multiply_entangles_shared_book() {
        let lib = MemoryLibrary::with_books([
            BookRecord::new(1, "One").with_authors(&["A", "B"]),
            BookRecord::new(2, "Two").with_authors(&["A"]),
            BookRecord::new(3, "Three").with_authors(&["B"]),
        ]);
        let mut engine = DuplicateEngine::new(&lib);
        let report = engine
            .run_book_duplicates(&[MatchRule::new("authors", &["identical"]).multiply()])
            .unwrap();

        let mut found = groups(report);
        found.sort();
        assert_eq!(found, vec![set(&[1, 2]), set(&[1, 3])]);
        assert_eq!(report.entangled_books(), set(&[1]));
        assert_eq!(report.entangled_groups().len(), 2);
    }

    #[test]
    fn test_adjacent_series_indices_do_not_group() {
        let lib = MemoryLibrary::with_books([
            BookRecord::new(1, "Part One").with_series("Saga", 1.0),
            BookRecord::new(2, "Part Two").with_series("Saga", 2.0),
        ]);
        let mut engine = DuplicateEngine::new(&lib);
        let report = engine
            .run_book_duplicates(&[MatchRule::new("series", &["identical"])])
            .unwrap();
        assert!(report.is_empty());
        assert!(report.groups_for_book.is_empty());
    }

    #[test]
    fn test_cross_library_partial_overlap() {
        let local = MemoryLibrary::with_books([
            BookRecord::new(1, "First").with_identifier("isbn", "9780000000001"),
            BookRecord::new(2, "Second").with_identifier("isbn", "9780000000002"),
        ]);
        let target = MemoryLibrary::with_books([
            BookRecord::new(77, "Elsewhere").with_identifier("isbn", "9780000000001"),
        ]);
        let mut engine = DuplicateEngine::new(&local);
        let result = engine
            .run_library_duplicates(&target, &[MatchRule::new("identifiers.isbn", &["identical"])])
            .unwrap();

        assert_eq!(result.duplicates, set(&[1]));
        assert!(result.log.messages.iter().any(|m| m.contains("77")));
        assert!(engine.report().is_none());
    }

    #[test]
    fn test_missing_target_is_fatal() {
        let lib = MemoryLibrary::new();
        let dir = tempfile::TempDir::new().unwrap();
        let mut engine = DuplicateEngine::new(&lib);
        let err = engine
            .run_library_duplicates_at(
                &dir.path().join("missing.db"),
                &[MatchRule::new("title", &["identical"])],
            )
            .unwrap_err();
        assert!(matches!(err, DupesError::TargetUnavailable(_)));
    }

    #[test]
    fn test_runs_are_deterministic() {
        let lib = MemoryLibrary::with_books([
            BookRecord::new(5, "Emma").with_authors(&["Jane Austen"]),
            BookRecord::new(3, "emma").with_authors(&["Austen, Jane"]),
            BookRecord::new(9, "Dracula").with_authors(&["Bram Stoker"]),
            BookRecord::new(1, "DRACULA").with_authors(&["Stoker, Bram"]),
            BookRecord::new(7, "Dracula").with_authors(&["B. Stoker"]),
        ]);
        let rules = [
            MatchRule::new("title", &["identical"]),
            MatchRule::new("authors", &["fuzzy"]),
        ];
        let mut engine = DuplicateEngine::new(&lib);
        let first = engine.run_book_duplicates(&rules).unwrap().clone();
        let second = engine.run_book_duplicates(&rules).unwrap().clone();

        assert_eq!(first.books_for_group, second.books_for_group);
        assert_eq!(first.groups_for_book, second.groups_for_book);
        // ordered by fuzzy title: dracula before emma
        assert_eq!(first.books_for_group[&1], group(&[1, 7, 9]));
        assert_eq!(first.books_for_group[&2], group(&[3, 5]));
    }

    #[test]
    fn test_group_maps_are_symmetric() {
        let lib = MemoryLibrary::with_books([
            BookRecord::new(1, "One").with_authors(&["A", "B", "C"]),
            BookRecord::new(2, "Two").with_authors(&["A", "B"]),
            BookRecord::new(3, "Three").with_authors(&["C"]),
            BookRecord::new(4, "Four").with_authors(&["D"]),
        ]);
        let mut engine = DuplicateEngine::new(&lib);
        let report = engine
            .run_book_duplicates(&[MatchRule::new("authors", &["identical"]).multiply()])
            .unwrap();

        for (gid, books) in &report.books_for_group {
            assert!(books.len() >= 2);
            for book in books {
                assert!(report.groups_for_book[book].contains(gid));
            }
        }
        for (book, gids) in &report.groups_for_book {
            for gid in gids {
                assert!(report.books_for_group[gid].contains(book));
            }
        }
        assert!(!report.groups_for_book.contains_key(&4));
        // {1,2} from A and B collapses into one group
        assert_eq!(report.group_count(), 2);
    }

    #[test]
    fn test_sort_filters_order_members() {
        let lib = MemoryLibrary::with_books([
            BookRecord::new(1, "Same").with_series("S", 3.0),
            BookRecord::new(2, "Same").with_series("S", 1.0),
            BookRecord::new(3, "Same").with_series("S", 2.0),
        ]);
        let options = EngineOptions {
            sort_filters: vec![SortFilter::descending("series_index")],
            ..EngineOptions::default()
        };
        let mut engine = DuplicateEngine::new(&lib).with_options(options);
        let report = engine
            .run_book_duplicates(&[MatchRule::new("title", &["identical"])])
            .unwrap();
        assert_eq!(report.books_for_group[&1], group(&[1, 3, 2]));
    }

    #[test]
    fn test_validation_collects_rule_and_sort_errors() {
        let lib = MemoryLibrary::with_books([BookRecord::new(1, "A")]);
        let options = EngineOptions {
            sort_filters: vec![SortFilter::ascending("#nowhere")],
            ..EngineOptions::default()
        };
        let mut engine = DuplicateEngine::new(&lib).with_options(options);
        let rules = [
            MatchRule::new("title", &["nonesuch"]),
            MatchRule::new("authors", &[]),
        ];
        let errors = engine.validate_rules(&rules).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors[2].message.contains("#nowhere"));

        assert!(matches!(
            engine.run_book_duplicates(&rules),
            Err(DupesError::Validation(_))
        ));
        assert!(engine.report().is_none());
    }

    #[test]
    fn test_soundex_length_comes_from_options() {
        let lib = MemoryLibrary::with_books([
            BookRecord::new(1, "Robertson"),
            BookRecord::new(2, "Robert"),
        ]);
        let rules = [MatchRule::new("title", &["soundex"])];

        let short = EngineOptions {
            soundex_length: 4,
            ..EngineOptions::default()
        };
        let mut engine = DuplicateEngine::new(&lib).with_options(short);
        assert_eq!(engine.run_book_duplicates(&rules).unwrap().group_count(), 1);

        engine.options_mut().soundex_length = 8;
        assert!(engine.run_book_duplicates(&rules).unwrap().is_empty());

        // a rule setting wins over the engine default
        let explicit = [MatchRule::new("title", &[])
            .with_algorithm(AlgorithmSpec::new("soundex").with_setting("length", 4))];
        assert_eq!(engine.run_book_duplicates(&explicit).unwrap().group_count(), 1);
    }

    #[test]
    fn test_restriction_limits_books() {
        let lib = MemoryLibrary::with_books((1..=4).map(|id| BookRecord::new(id, "Same")));
        let options = EngineOptions {
            restriction: Some(Restriction::Ids(set(&[2, 4]))),
            ..EngineOptions::default()
        };
        let mut engine = DuplicateEngine::new(&lib).with_options(options);
        let report = engine
            .run_book_duplicates(&[MatchRule::new("title", &["identical"])])
            .unwrap();
        assert_eq!(groups(report), vec![set(&[2, 4])]);
    }

    #[test]
    fn test_abort_flags_report() {
        let lib = MemoryLibrary::with_books((1..=5).map(|id| BookRecord::new(id, "Same")));
        let mut engine = DuplicateEngine::new(&lib);
        let abort = engine.abort_handle();
        engine.on_progress(move |p| {
            if p.stage == Stage::Hashing && p.done == 2 {
                abort.store(true, Ordering::Relaxed);
            }
        });

        let report = engine
            .run_book_duplicates(&[MatchRule::new("title", &["identical"])])
            .unwrap();
        assert!(report.aborted);
        assert!(report.is_empty());
        assert!(report.log.messages[0].contains("aborted"));
    }

    #[test]
    fn test_exempt_current_group_and_marks() {
        let lib = MemoryLibrary::with_books([
            BookRecord::new(1, "Alpha"),
            BookRecord::new(2, "alpha"),
            BookRecord::new(3, "Beta"),
            BookRecord::new(4, "BETA"),
        ]);
        let options = EngineOptions {
            show_all_mode: false,
            ..EngineOptions::default()
        };
        let mut engine = DuplicateEngine::new(&lib).with_options(options);
        engine
            .run_book_duplicates(&[MatchRule::new("title", &["identical"])])
            .unwrap();

        assert_eq!(engine.report().unwrap().current_group(), Some(1));
        let marks = engine.marks().unwrap();
        assert_eq!(marks.keys().copied().collect::<Vec<_>>(), vec![1, 2]);

        assert_eq!(engine.next_group().unwrap(), Some(2));
        assert_eq!(engine.apply_marks().unwrap(), 2);
        assert!(lib.marked_ids().unwrap()[&3].contains("duplicate_group0002_sort_0001"));

        assert_eq!(engine.exempt_current_group().unwrap(), vec![3, 4]);
        assert!(engine.book_exemptions().are_exempt(&3, &4));
        assert_eq!(engine.report().unwrap().group_count(), 1);

        let exempt = engine.exemption_marks(ExemptionScope::Book).unwrap();
        assert_eq!(exempt.len(), 2);
        assert_eq!(exempt[&3], labels::BOOK_EXEMPTION);
    }

    #[test]
    fn test_author_scope_splits_existing_report() {
        let lib = MemoryLibrary::with_books([
            BookRecord::new(1, "Consider Phlebas").with_authors(&["Iain M. Banks"]),
            BookRecord::new(2, "consider phlebas").with_authors(&["Iain Banks"]),
            BookRecord::new(3, "Consider Phlebas").with_authors(&["Iain M. Banks"]),
        ]);
        let options = EngineOptions {
            scope: ExemptionScope::Author,
            ..EngineOptions::default()
        };
        let mut engine = DuplicateEngine::new(&lib).with_options(options);
        engine
            .run_book_duplicates(&[MatchRule::new("title", &["identical"])])
            .unwrap();
        assert_eq!(engine.report().unwrap().group_count(), 1);

        engine
            .add_author_exemption(["Iain Banks".to_string(), "Iain M. Banks".to_string()])
            .unwrap();
        let report = engine.report().unwrap();
        assert_eq!(groups(report), vec![set(&[1, 3])]);

        let marks = engine.exemption_marks(ExemptionScope::Author).unwrap();
        assert_eq!(marks.len(), 3);
        assert_eq!(marks[&2], labels::AUTHOR_EXEMPTION);
    }

    #[test]
    fn test_binary_report_marks_deletion_candidates() {
        use chrono::{TimeZone, Utc};
        let when = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut lib = MemoryLibrary::with_books((1..=3).map(|id| BookRecord::new(id, "Book")));
        lib.add_format(1, "EPUB", b"same bytes".to_vec(), when);
        lib.add_format(2, "EPUB", b"same bytes".to_vec(), when);
        lib.add_format(3, "EPUB", b"other byte".to_vec(), when);

        let mut engine = DuplicateEngine::new(&lib);
        let report = engine.run_binary_duplicates().unwrap();
        assert_eq!(report.kind, ReportKind::Binary);
        assert_eq!(groups(report), vec![set(&[1, 2])]);

        let marks = engine.marks().unwrap();
        assert!(!marks[&1].contains(labels::DELETED_BINARY_DUPLICATE));
        assert!(marks[&2].contains(labels::DELETED_BINARY_DUPLICATE));
    }

    #[test]
    fn test_variations_through_engine() {
        let lib = MemoryLibrary::with_books([
            BookRecord::new(1, "A").with_authors(&["Anne Rice"]),
            BookRecord::new(2, "B").with_authors(&["Rice, Anne"]),
        ]);
        let mut engine = DuplicateEngine::new(&lib);
        let report = engine
            .run_variations("authors", &[MatchRule::new("authors", &["similar"])])
            .unwrap();
        assert_eq!(report.item_map.len(), 2);

        let err = engine
            .run_variations("authors", &[MatchRule::new("title", &["similar"])])
            .unwrap_err();
        assert!(matches!(err, DupesError::Validation(_)));
    }

    #[test]
    fn test_report_operations_need_a_report() {
        let lib = MemoryLibrary::new();
        let mut engine = DuplicateEngine::new(&lib);
        assert!(matches!(engine.marks(), Err(DupesError::NoReport)));
        assert!(matches!(engine.exempt_group(1), Err(DupesError::NoReport)));
        assert!(matches!(engine.next_group(), Err(DupesError::NoReport)));

        engine
            .run_book_duplicates(&[MatchRule::new("title", &["identical"])])
            .unwrap();
        assert!(matches!(engine.exempt_group(3), Err(DupesError::GroupNotFound(3))));
        engine.clear_report();
        assert!(engine.report().is_none());
    }
}
