//! CLI entry point.
//!
//! `clindex index` builds or refreshes the index of a directory and
//! `clindex search` queries it. Without a path, both work on the project
//! that contains the current directory.

use anyhow::Context;
use clap::{
    Args, Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use clindex::indexing::{ProjectDetector, migration};
use clindex::io::{ExitCode, OutputFormat, write_error, write_results};
use clindex::logging::{self, Verbosity};
use clindex::search::{SearchOptions, SearchQuery, SearchType};
use clindex::{IndexBuilder, IndexError, Language, SearchEngine, Settings};
use std::io::Write;
use std::path::{Path, PathBuf};

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Local code search
#[derive(Parser)]
#[command(
    name = "clindex",
    version = env!("CARGO_PKG_VERSION"),
    about = "Local code search",
    long_about = "Index a source tree into structural chunks with vector embeddings, \
                  then search it by text, regex, exact phrase, fuzzy match or meaning.",
    next_line_help = true,
    styles = clap_cargo_style(),
    after_help = "Exit codes:\n  0  success\n  1  error\n  2  invalid arguments\n  3  index or directory not found"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build or refresh the index of a directory
    Index(IndexArgs),

    /// Search the index
    #[command(after_help = "Examples:\n  \
        clindex search \"user authentication\"\n  \
        clindex search \"calculate tax\" --file-pattern \"*.go\" --max-results 5\n  \
        clindex search \"database query\" --with-context --format json\n  \
        clindex search \"function.*error\" --regex")]
    Search(SearchArgs),

    /// Move legacy index files into the index directory
    Migrate(MigrateArgs),

    /// Print the version
    Version,
}

#[derive(Args)]
struct IndexArgs {
    /// Directory to index [default: the current project]
    path: Option<PathBuf>,

    /// Rebuild from scratch instead of updating
    #[arg(short, long)]
    force: bool,

    /// Index hidden files and directories
    #[arg(short, long)]
    include_hidden: bool,

    /// Only index these extensions or languages (comma separated)
    #[arg(long, value_delimiter = ',')]
    file_types: Vec<String>,

    /// Extra exclude patterns (comma separated)
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<String>,

    /// Skip files larger than this many bytes
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    max_file_size: Option<u64>,

    /// Log progress details
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only print errors
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Args)]
#[command(group(
    clap::ArgGroup::new("strategy")
        .args(["semantic", "exact", "fuzzy", "regex", "text"])
        .multiple(false)
))]
struct SearchArgs {
    /// Query text
    query: String,

    /// Maximum number of results (1-1000)
    #[arg(short, long)]
    max_results: Option<usize>,

    /// Only search paths matching this glob, e.g. "*.go"
    #[arg(short, long)]
    file_pattern: Option<String>,

    /// Show the lines around each match
    #[arg(short = 'c', long)]
    with_context: bool,

    /// Ignore cached results
    #[arg(short = 'F', long)]
    force: bool,

    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    /// Minimum relevance score (0.0-1.0)
    #[arg(short, long)]
    threshold: Option<f32>,

    /// Embedding similarity search
    #[arg(short, long)]
    semantic: bool,

    /// Case-insensitive phrase search
    #[arg(short, long)]
    exact: bool,

    /// Term search that tolerates small typos
    #[arg(short = 'z', long)]
    fuzzy: bool,

    /// Regular expression search
    #[arg(short, long)]
    regex: bool,

    /// Plain term search
    #[arg(long)]
    text: bool,

    /// Only search files of this language
    #[arg(short, long)]
    language: Option<Language>,

    /// Root of the indexed tree [default: the current project]
    #[arg(long)]
    path: Option<PathBuf>,
}

#[derive(Args)]
struct MigrateArgs {
    /// Project root [default: the current project]
    path: Option<PathBuf>,

    /// Migrate even if the index directory already has content
    #[arg(short, long)]
    force: bool,

    /// Print the migration status and exit
    #[arg(long, conflicts_with_all = ["force", "rollback"])]
    status: bool,

    /// Move migrated files back into the project root
    #[arg(long, conflicts_with = "force")]
    rollback: bool,
}

impl SearchArgs {
    fn search_type(&self) -> Option<SearchType> {
        [
            (self.semantic, SearchType::Semantic),
            (self.exact, SearchType::Exact),
            (self.fuzzy, SearchType::Fuzzy),
            (self.regex, SearchType::Regex),
            (self.text, SearchType::Text),
        ]
        .into_iter()
        .find_map(|(set, search_type)| set.then_some(search_type))
    }

    fn to_query(&self, settings: &Settings) -> SearchQuery {
        let mut query = SearchQuery::from_config(&self.query, &settings.search)
            .with_context(self.with_context);
        if let Some(max_results) = self.max_results {
            query = query.max_results(max_results);
        }
        if let Some(threshold) = self.threshold {
            query = query.threshold(threshold);
        }
        if let Some(pattern) = &self.file_pattern {
            query = query.file_pattern(pattern);
        }
        if let Some(language) = self.language {
            query = query.language(language);
        }
        if let Some(search_type) = self.search_type() {
            query = query.search_type(search_type);
        }
        query
    }
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    let verbosity = match &cli.command {
        Commands::Index(args) => Verbosity::from_flags(args.verbose, args.quiet),
        _ => Verbosity::Normal,
    };
    logging::init(verbosity);

    let result = match cli.command {
        Commands::Index(args) => run_index(args, verbosity),
        Commands::Search(args) => run_search(args),
        Commands::Migrate(args) => run_migrate(args),
        Commands::Version => {
            println!("clindex {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::Success.into(),
        Err(e) => {
            eprintln!("Error: {e:#}");
            if let Some(index_error) = e.downcast_ref::<IndexError>() {
                for suggestion in index_error.recovery_suggestions() {
                    eprintln!("  {suggestion}");
                }
            }
            ExitCode::from_anyhow(&e).into()
        }
    }
}

/// Settings for `root`; a broken settings file is an error, a missing one
/// is not.
fn load_settings(root: &Path) -> anyhow::Result<Settings> {
    let settings = Settings::load(root).context("failed to load configuration")?;
    settings.validate()?;
    Ok(settings)
}

fn resolve_root(path: PathBuf) -> PathBuf {
    std::fs::canonicalize(&path).unwrap_or(path)
}

/// `path` when given, otherwise the project containing the current
/// directory.
fn project_root(path: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(path) = path {
        return Ok(resolve_root(path));
    }
    let cwd = std::env::current_dir().context("failed to read the current directory")?;
    let settings = load_settings(&cwd)?;
    let root = ProjectDetector::new(settings.index_dir).detect(&cwd)?;
    Ok(resolve_root(root))
}

fn run_index(args: IndexArgs, verbosity: Verbosity) -> anyhow::Result<()> {
    let root = project_root(args.path)?;
    if !root.is_dir() {
        return Err(IndexError::not_found("directory", root.display().to_string()).into());
    }

    let mut settings = load_settings(&root)?;
    let indexing = &mut settings.indexing;
    indexing.include_hidden |= args.include_hidden;
    if !args.file_types.is_empty() {
        indexing.file_types = args.file_types.iter().map(|t| t.trim().to_string()).collect();
    }
    indexing
        .exclude_patterns
        .extend(args.exclude.iter().map(|p| p.trim().to_string()).filter(|p| !p.is_empty()));
    if let Some(max) = args.max_file_size {
        indexing.max_file_size = max;
    }

    let quiet = verbosity == Verbosity::Quiet;
    if !quiet {
        println!("Indexing project: {}", root.display());
    }
    let report = IndexBuilder::new(&root, settings)
        .force(args.force)
        .progress(!quiet)
        .build()?;

    if !quiet {
        print!("{}", report.summary());
    }
    if verbosity == Verbosity::Verbose {
        for (path, error) in report.errors.iter().skip(5) {
            eprintln!("  {path}: {error}");
        }
    }
    Ok(())
}

fn run_search(args: SearchArgs) -> anyhow::Result<()> {
    let outcome = (|| -> anyhow::Result<_> {
        let root = project_root(args.path.clone())?;
        let settings = load_settings(&root)?;
        let query = args.to_query(&settings);
        let engine = SearchEngine::open(&root, settings)?;
        let options = SearchOptions {
            bypass_cache: args.force,
            ..SearchOptions::default()
        };
        Ok(engine.search_with(&query, &options)?)
    })();

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    match outcome {
        Ok(results) => {
            write_results(&mut out, &results, args.format)?;
            out.flush()?;
            Ok(())
        }
        Err(e) => {
            write_error(&mut out, &args.query, &format!("{e:#}"), args.format)?;
            out.flush()?;
            Err(e)
        }
    }
}

fn run_migrate(args: MigrateArgs) -> anyhow::Result<()> {
    let root = project_root(args.path)?;
    let settings = load_settings(&root)?;
    let index_dir = settings.index_path(&root);

    if args.status {
        println!("{}", migration::status(&root, &index_dir));
    } else if args.rollback {
        let restored = migration::rollback(&root, &index_dir)?;
        println!("Restored {restored} legacy entries into {}", root.display());
    } else {
        match migration::migrate(&root, &index_dir, args.force)? {
            Some(record) => println!(
                "Migrated {} legacy entries ({} bytes) into {}",
                record.legacy_files.len(),
                record.bytes,
                index_dir.join(migration::LEGACY_DIR).display()
            ),
            None => println!("No legacy index files found"),
        }
    }
    Ok(())
}
