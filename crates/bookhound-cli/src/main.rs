use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use bookhound_core::error::ExitCode;
use bookhound_core::{AppConfig, BookId, BookRecord, CoreError, Database, FieldMetadata, Library};
use bookhound_dupes::{
    AuthorExemptions, BookExemptions, DupesError, DuplicateEngine, DuplicateReport, EngineOptions,
    ExemptionScope, MatchRule, RuleSet, RuleSetStore, SortFilter,
};

// ─── CLI Definition ─────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "bookhound",
    about = "Find duplicate books, metadata variations and byte-identical files",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output in JSON format. Also enabled by setting BOOKHOUND_JSON=1.
    #[arg(long, global = true)]
    json: bool,

    /// Library database to use instead of the configured one.
    #[arg(long, global = true)]
    library: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Import books (and custom columns) from a JSON file.
    Import { file: PathBuf },

    /// Find duplicate books.
    Dupes {
        #[command(flatten)]
        run: RunArgs,
        /// Sort books inside groups, e.g. `--sort pubdate:desc`.
        #[arg(long, action = clap::ArgAction::Append)]
        sort: Vec<String>,
    },

    /// Find spelling variants among the values of one field.
    Variations {
        #[arg(long)]
        field: String,
        /// Rule file or saved rule set; defaults to `similar` over the field.
        #[arg(long)]
        rule: Option<String>,
    },

    /// Flag local books that already exist in another library.
    Compare {
        #[arg(long)]
        target: PathBuf,
        #[arg(long)]
        rules: Option<String>,
    },

    /// Find books whose format files are byte-identical.
    Binary {
        #[command(flatten)]
        run: RunArgs,
    },

    /// Manage "not a duplicate" exemptions.
    Exempt {
        #[command(subcommand)]
        action: ExemptAction,
    },

    /// Manage saved rule sets.
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Rule file (JSON) or the name of a saved rule set.
    #[arg(long)]
    rules: Option<String>,
    /// `book` or `author`; overrides the configured scope.
    #[arg(long)]
    scope: Option<String>,
    /// Order groups by size instead of title.
    #[arg(long)]
    by_size: bool,
    /// Only check these book ids.
    #[arg(long, value_delimiter = ',')]
    ids: Vec<BookId>,
    /// Write report marks to the library.
    #[arg(long)]
    mark: bool,
}

#[derive(Subcommand)]
enum ExemptAction {
    /// Exempt members from each other (book ids or author names).
    Add {
        #[arg(long, default_value = "book")]
        scope: String,
        members: Vec<String>,
    },
    /// Separate one member from the exemption set of another.
    Remove {
        #[arg(long, default_value = "book")]
        scope: String,
        member: String,
        #[arg(long)]
        from: String,
    },
    /// List exemption sets.
    List {
        #[arg(long, default_value = "book")]
        scope: String,
        /// Also mark exempt books in the library.
        #[arg(long)]
        mark: bool,
    },
}

#[derive(Subcommand)]
enum RulesAction {
    /// List saved rule sets.
    List,
    /// Print a rule set as JSON.
    Show { name: String },
    /// Save a rule set from a JSON file.
    Save {
        name: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// Delete a saved rule set.
    Remove { name: String },
    /// Rename a saved rule set.
    Rename { old: String, new: String },
}

/// Shape of `bookhound import` input.
#[derive(Deserialize)]
struct ImportFile {
    #[serde(default)]
    columns: Vec<FieldMetadata>,
    books: Vec<BookRecord>,
}

// ─── Main ────────────────────────────────────────────────────────────────────

fn main() {
    let filter = EnvFilter::try_from_env("BOOKHOUND_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_output = cli.json || std::env::var("BOOKHOUND_JSON").as_deref() == Ok("1");

    if let Err(err) = run(cli, json_output) {
        let code = exit_code(&err);
        if json_output {
            let _ = print_json(&serde_json::json!({
                "status": "error",
                "message": format!("{err:#}"),
            }));
        } else {
            eprintln!("error: {err:#}");
        }
        std::process::exit(code as i32);
    }
}

fn run(cli: Cli, json_output: bool) -> Result<()> {
    let start = Instant::now();
    let mut config = AppConfig::load()?;
    if let Some(path) = cli.library {
        config.set_database_path(path);
    }
    tracing::debug!(database = %config.database_path().display(), "using library");

    match cli.command {
        Commands::Import { file } => {
            let contents = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let import: ImportFile = serde_json::from_str(&contents)?;
            let db = open_db(&config)?;
            for column in &import.columns {
                db.add_custom_column(column)?;
            }
            for book in &import.books {
                db.upsert_book(book)?;
            }
            let dur = start.elapsed().as_millis();
            if json_output {
                print_json(&serde_json::json!({
                    "status": "ok",
                    "data": { "books": import.books.len(), "columns": import.columns.len() },
                    "meta": { "duration_ms": dur }
                }))?;
            } else {
                println!(
                    "Imported {} books and {} columns.",
                    import.books.len(),
                    import.columns.len()
                );
            }
        }

        Commands::Dupes { run, sort } => {
            let db = open_db(&config)?;
            let rules = resolve_rules(&config, run.rules.as_deref())?;
            let mut options = run_options(&config, &run)?;
            options.sort_filters = if sort.is_empty() {
                rules.sort_filters.clone()
            } else {
                sort.iter().map(|s| parse_sort(s)).collect()
            };

            let mut engine = engine_for(&db, &config, options)?;
            let report = engine.run_book_duplicates(&rules.match_rules)?.clone();
            finish_report(&engine, &db, &report, run.mark, json_output, start)?;
        }

        Commands::Binary { run } => {
            let db = open_db(&config)?;
            let options = run_options(&config, &run)?;
            let mut engine = engine_for(&db, &config, options)?;
            let report = engine.run_binary_duplicates()?.clone();
            finish_report(&engine, &db, &report, run.mark, json_output, start)?;
        }

        Commands::Variations { field, rule } => {
            let db = open_db(&config)?;
            let rules = match rule {
                Some(rule) => resolve_rules(&config, Some(&rule))?.match_rules,
                None => vec![MatchRule::new(field.as_str(), &["similar"])],
            };
            let mut engine = engine_for(&db, &config, EngineOptions::from(&config.engine))?;
            let report = engine.run_variations(&field, &rules)?;
            let dur = start.elapsed().as_millis();

            if json_output {
                print_json(&serde_json::json!({
                    "status": "ok",
                    "data": report,
                    "meta": { "duration_ms": dur }
                }))?;
            } else if report.is_empty() {
                println!("No variations found in {field}.");
            } else {
                for (id, variants) in &report.variation_map {
                    let names: Vec<String> = variants
                        .iter()
                        .filter_map(|v| report.item_map.get(v))
                        .map(|v| format!("{v:?}"))
                        .collect();
                    println!(
                        "{:?} ({} books) ~ {}",
                        report.item_map.get(id).map(String::as_str).unwrap_or_default(),
                        report.count_map.get(id).copied().unwrap_or_default(),
                        names.join(", ")
                    );
                }
            }
            if report.aborted {
                std::process::exit(ExitCode::Cancelled as i32);
            }
        }

        Commands::Compare { target, rules } => {
            let db = open_db(&config)?;
            let rules = resolve_rules(&config, rules.as_deref())?;
            let mut engine = engine_for(&db, &config, EngineOptions::from(&config.engine))?;
            let comparison = engine.run_library_duplicates_at(&target, &rules.match_rules)?;
            let dur = start.elapsed().as_millis();

            if json_output {
                print_json(&serde_json::json!({
                    "status": "ok",
                    "data": comparison,
                    "meta": { "duration_ms": dur }
                }))?;
            } else if comparison.duplicates.is_empty() {
                println!("No books from this library exist in {}.", target.display());
            } else {
                println!("{} books also exist in {}:", comparison.duplicates.len(), target.display());
                for &id in &comparison.duplicates {
                    println!("  {}", describe(&db, id));
                }
            }
            if comparison.aborted {
                std::process::exit(ExitCode::Cancelled as i32);
            }
        }

        Commands::Exempt { action } => exempt(&config, action, json_output, start)?,

        Commands::Rules { action } => rules_command(&config, action, json_output, start)?,
    }

    Ok(())
}

// ─── Subcommands ────────────────────────────────────────────────────────────

fn finish_report(
    engine: &DuplicateEngine<'_>,
    db: &Database,
    report: &DuplicateReport,
    mark: bool,
    json_output: bool,
    start: Instant,
) -> Result<()> {
    let marked = if mark { Some(engine.apply_marks()?) } else { None };
    let dur = start.elapsed().as_millis();

    if json_output {
        print_json(&serde_json::json!({
            "status": "ok",
            "data": {
                "kind": report.kind,
                "groups": report.books_for_group,
                "entangled_books": report.entangled_books(),
                "errors": report.log.errors,
                "aborted": report.aborted,
                "marked": marked,
            },
            "meta": { "duration_ms": dur }
        }))?;
    } else if report.is_empty() {
        println!("No duplicate groups found.");
    } else {
        let entangled = report.entangled_books();
        for (group, books) in &report.books_for_group {
            println!("Group {group} ({} books)", books.len());
            for &id in books {
                let flag = if entangled.contains(&id) { " *" } else { "" };
                println!("  {}{flag}", describe(db, id));
            }
        }
        if !report.log.is_clean() {
            println!("{} books skipped because of errors.", report.log.errors.len());
        }
        if let Some(count) = marked {
            println!("Marked {count} books.");
        }
    }

    if report.aborted {
        std::process::exit(ExitCode::Cancelled as i32);
    }
    Ok(())
}

fn exempt(config: &AppConfig, action: ExemptAction, json_output: bool, start: Instant) -> Result<()> {
    let books_path = config.book_exemptions_path();
    let authors_path = config.author_exemptions_path();
    let mut books = BookExemptions::load(&books_path)?;
    let mut authors = AuthorExemptions::load(&authors_path)?;

    match action {
        ExemptAction::Add { scope, members } => {
            match parse_scope(&scope)? {
                ExemptionScope::Book => {
                    books.add_exemption(parse_ids(&members)?);
                    books.save(&books_path)?;
                }
                ExemptionScope::Author => {
                    authors.add_exemption(members.iter().cloned());
                    authors.save(&authors_path)?;
                }
            }
            if json_output {
                print_json(&serde_json::json!({
                    "status": "ok",
                    "data": { "scope": scope, "members": members },
                    "meta": { "duration_ms": start.elapsed().as_millis() }
                }))?;
            } else {
                println!("Exempted {} from each other.", members.join(", "));
            }
        }

        ExemptAction::Remove {
            scope,
            member,
            from,
        } => {
            let removed = match parse_scope(&scope)? {
                ExemptionScope::Book => {
                    let removed = books.remove_exemption(&parse_id(&member)?, &parse_id(&from)?);
                    books.save(&books_path)?;
                    removed
                }
                ExemptionScope::Author => {
                    let removed = authors.remove_exemption(&member, &from);
                    authors.save(&authors_path)?;
                    removed
                }
            };
            if json_output {
                print_json(&serde_json::json!({
                    "status": "ok",
                    "data": { "removed": removed },
                    "meta": { "duration_ms": start.elapsed().as_millis() }
                }))?;
            } else if removed {
                println!("{member} is no longer exempt from {from}.");
            } else {
                println!("{member} and {from} are not in the same exemption set.");
            }
        }

        ExemptAction::List { scope, mark } => {
            let scope_kind = parse_scope(&scope)?;
            let sets: Vec<Vec<String>> = match scope_kind {
                ExemptionScope::Book => books
                    .sets()
                    .map(|set| set.iter().map(ToString::to_string).collect())
                    .collect(),
                ExemptionScope::Author => authors.sets().map(|set| set.iter().cloned().collect()).collect(),
            };
            let marked = if mark {
                let db = open_db(config)?;
                let engine = DuplicateEngine::new(&db).with_exemptions(books, authors);
                let marks = engine.exemption_marks(scope_kind)?;
                db.set_marked_ids(&marks)?;
                Some(marks.len())
            } else {
                None
            };

            if json_output {
                print_json(&serde_json::json!({
                    "status": "ok",
                    "data": { "scope": scope, "sets": sets, "marked": marked },
                    "meta": { "duration_ms": start.elapsed().as_millis() }
                }))?;
            } else if sets.is_empty() {
                println!("No {scope} exemptions.");
            } else {
                for set in &sets {
                    println!("  {}", set.join(" | "));
                }
                if let Some(count) = marked {
                    println!("Marked {count} books.");
                }
            }
        }
    }
    Ok(())
}

fn rules_command(config: &AppConfig, action: RulesAction, json_output: bool, start: Instant) -> Result<()> {
    let path = config.rule_sets_path();
    let mut store = RuleSetStore::load(&path)?;

    match action {
        RulesAction::List => {
            let names: Vec<&str> = store.names().collect();
            if json_output {
                print_json(&serde_json::json!({
                    "status": "ok",
                    "data": names,
                    "meta": { "duration_ms": start.elapsed().as_millis() }
                }))?;
            } else if names.is_empty() {
                println!("No saved rule sets. `{}` is always available.", RuleSetStore::TITLE_AUTHOR);
            } else {
                for name in names {
                    println!("  {name}");
                }
            }
        }

        RulesAction::Show { name } => {
            let set = store.get(&name)?;
            if json_output {
                print_json(&serde_json::json!({
                    "status": "ok",
                    "data": set,
                    "meta": { "duration_ms": start.elapsed().as_millis() }
                }))?;
            } else {
                println!("{}", serde_json::to_string_pretty(&set)?);
            }
        }

        RulesAction::Save { name, file } => {
            let set = read_rule_file(&file)?;
            let db = open_db(config)?;
            DuplicateEngine::new(&db)
                .validate_rules(&set.match_rules)
                .map_err(DupesError::Validation)?;
            let replaced = store.insert(name.clone(), set).is_some();
            store.save(&path)?;
            if json_output {
                print_json(&serde_json::json!({
                    "status": "ok",
                    "data": { "name": name, "replaced": replaced },
                    "meta": { "duration_ms": start.elapsed().as_millis() }
                }))?;
            } else {
                println!("Saved rule set {name}.");
            }
        }

        RulesAction::Remove { name } => {
            store.remove(&name)?;
            store.save(&path)?;
            if json_output {
                print_json(&serde_json::json!({
                    "status": "ok",
                    "data": { "deleted": name },
                    "meta": { "duration_ms": start.elapsed().as_millis() }
                }))?;
            } else {
                println!("Deleted rule set {name}.");
            }
        }

        RulesAction::Rename { old, new } => {
            store.rename(&old, &new)?;
            store.save(&path)?;
            if json_output {
                print_json(&serde_json::json!({
                    "status": "ok",
                    "data": { "old": old, "new": new },
                    "meta": { "duration_ms": start.elapsed().as_millis() }
                }))?;
            } else {
                println!("Renamed {old} to {new}.");
            }
        }
    }
    Ok(())
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn print_json(val: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(val)?);
    Ok(())
}

fn open_db(config: &AppConfig) -> Result<Database> {
    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Database::open(&db_path)?)
}

fn engine_for<'a>(db: &'a Database, config: &AppConfig, options: EngineOptions) -> Result<DuplicateEngine<'a>> {
    let books = BookExemptions::load(&config.book_exemptions_path())?;
    let authors = AuthorExemptions::load(&config.author_exemptions_path())?;
    Ok(DuplicateEngine::new(db)
        .with_options(options)
        .with_exemptions(books, authors))
}

fn run_options(config: &AppConfig, run: &RunArgs) -> Result<EngineOptions> {
    let mut options = EngineOptions::from(&config.engine);
    if let Some(scope) = &run.scope {
        options.scope = parse_scope(scope)?;
    }
    if run.by_size {
        options.sort_groups_by_title = false;
    }
    if !run.ids.is_empty() {
        options.restriction = Some(bookhound_core::Restriction::Ids(
            run.ids.iter().copied().collect::<BTreeSet<_>>(),
        ));
    }
    Ok(options)
}

/// A rule file path, a saved rule set name, or the configured default.
fn resolve_rules(config: &AppConfig, source: Option<&str>) -> Result<RuleSet> {
    let source = source
        .map(str::to_string)
        .or_else(|| config.engine.default_rule_set.clone())
        .unwrap_or_else(|| RuleSetStore::TITLE_AUTHOR.to_string());
    let path = Path::new(&source);
    if path.is_file() {
        return read_rule_file(path);
    }
    Ok(RuleSetStore::load(&config.rule_sets_path())?.get(&source)?)
}

/// Either a full rule set or a bare list of match rules.
fn read_rule_file(path: &Path) -> Result<RuleSet> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RuleFile {
        Set(RuleSet),
        Rules(Vec<MatchRule>),
    }

    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(match serde_json::from_str(&contents)? {
        RuleFile::Set(set) => set,
        RuleFile::Rules(rules) => RuleSet::new(rules),
    })
}

/// `field` or `field:desc`.
fn parse_sort(spec: &str) -> SortFilter {
    match spec.rsplit_once(':') {
        Some((field, "desc")) => SortFilter::descending(field),
        Some((field, "asc")) => SortFilter::ascending(field),
        _ => SortFilter::ascending(spec),
    }
}

fn parse_scope(scope: &str) -> Result<ExemptionScope> {
    ExemptionScope::parse(scope)
        .ok_or_else(|| anyhow::anyhow!("unknown exemption scope '{scope}' (use book or author)"))
}

fn parse_id(value: &str) -> Result<BookId> {
    value
        .trim()
        .parse::<BookId>()
        .with_context(|| format!("'{value}' is not a book id"))
}

fn parse_ids(values: &[String]) -> Result<Vec<BookId>> {
    values.iter().map(|v| parse_id(v)).collect()
}

fn describe(db: &Database, id: BookId) -> String {
    match db.get_book(id) {
        Ok(book) => format!("{id:>6}  {:<40}  {}", book.title, book.authors.join(" & ")),
        Err(_) => format!("{id:>6}  (missing)"),
    }
}

fn exit_code(err: &anyhow::Error) -> ExitCode {
    if let Some(err) = err.downcast_ref::<DupesError>() {
        return match err {
            DupesError::Validation(_) => ExitCode::ValidationFailed,
            DupesError::TargetUnavailable(_) | DupesError::UnknownRuleSet(_) | DupesError::GroupNotFound(_) => {
                ExitCode::NotFound
            }
            DupesError::RuleSetExists(_) => ExitCode::InvalidArgs,
            _ => ExitCode::GeneralError,
        };
    }
    match err.downcast_ref::<CoreError>() {
        Some(CoreError::BookNotFound(_) | CoreError::LibraryNotFound(_)) => ExitCode::NotFound,
        Some(CoreError::UnknownField(_) | CoreError::ValidationError(_)) => ExitCode::InvalidArgs,
        _ => ExitCode::GeneralError,
    }
}
