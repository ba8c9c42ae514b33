use std::io;
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use pagestats_core::config::{StatsConfig, load_config};
use pagestats_core::fetch::{FetchOutcome, ensure_snapshot, refetch_snapshot};
use pagestats_core::report::{
    Widget, build_dashboard, cumulative_chart, latest_update_table, longest_pages_table,
    monthly_trend_chart, page_count_table, preview_table, stalest_pages_table,
};
use pagestats_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, init_layout, inspect_runtime,
    resolve_paths,
};
use pagestats_core::session::{SessionCell, StatsSession};
use pagestats_core::snapshot::{
    read_snapshot, sample_pages, snapshot_digest, summarize_pages, write_snapshot,
};
use pagestats_core::stats::{
    cumulative_page_counts, latest_update, longest_pages, monthly_creation_trend, preview,
    stalest_pages, total_page_count,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "pagestats",
    version,
    about = "Aggregate statistics over a cached page-corpus snapshot"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, help = "Enable debug logging on stderr")]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create .pagestats/ and a default config")]
    Init(InitArgs),
    #[command(about = "Download the snapshot unless it is already cached")]
    Fetch(FetchArgs),
    #[command(about = "Show resolved paths and snapshot details")]
    Status,
    #[command(about = "Render every statistic")]
    Report(ReportArgs),
    #[command(about = "Most recent page update")]
    Latest(FormatArgs),
    #[command(about = "Number of distinct pages with at least one line")]
    Count(FormatArgs),
    #[command(about = "Expanded rows of one page in line order")]
    Preview(PreviewArgs),
    #[command(about = "Pages with the most characters")]
    Longest(LimitArgs),
    #[command(about = "Pages created per month")]
    Trend(TrendArgs),
    #[command(about = "Pages with the oldest last update")]
    Stale(LimitArgs),
    #[command(about = "Write a small sample snapshot for offline use")]
    Fixture(FixtureArgs),
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
}

#[derive(Debug, Args)]
struct FetchArgs {
    #[arg(long, help = "Discard the cached snapshot and download it again")]
    force: bool,
}

#[derive(Debug, Args)]
struct FormatArgs {
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

#[derive(Debug, Args)]
struct ReportArgs {
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
    #[arg(long, help = "Rows per ranked table (default from config)")]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
struct PreviewArgs {
    #[arg(long, help = "Page title to preview (default from config)")]
    title: Option<String>,
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

#[derive(Debug, Args)]
struct LimitArgs {
    #[arg(long, help = "Number of rows (default from config)")]
    limit: Option<usize>,
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

#[derive(Debug, Args)]
struct TrendArgs {
    #[arg(long, help = "Show the running total instead of monthly counts")]
    cumulative: bool,
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

#[derive(Debug, Args)]
struct FixtureArgs {
    #[arg(long, value_name = "PATH")]
    output: PathBuf,
}

struct Workspace {
    paths: ResolvedPaths,
    config: StatsConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Fetch(args)) => run_fetch(&runtime, args),
        Some(Commands::Status) => run_status(&runtime),
        Some(Commands::Report(args)) => run_report(&runtime, args),
        Some(Commands::Latest(FormatArgs { format })) => {
            run_widget(&runtime, format, |_, session| {
                Ok(Widget::Table(latest_update_table(latest_update(session)?)))
            })
        }
        Some(Commands::Count(FormatArgs { format })) => {
            run_widget(&runtime, format, |_, session| {
                Ok(Widget::Table(page_count_table(total_page_count(session)?)))
            })
        }
        Some(Commands::Preview(PreviewArgs { title, format })) => {
            run_widget(&runtime, format, |config, session| {
                let title = title.as_deref().unwrap_or(config.preview_title());
                Ok(Widget::Table(preview_table(title, &preview(session, title)?)))
            })
        }
        Some(Commands::Longest(LimitArgs { limit, format })) => {
            run_widget(&runtime, format, |config, session| {
                let limit = limit.unwrap_or(config.report_limit());
                let prefix = config.page_url_prefix();
                let pages = longest_pages(session, &prefix, limit)?;
                Ok(Widget::Table(longest_pages_table(&pages, &prefix, limit)))
            })
        }
        Some(Commands::Trend(TrendArgs { cumulative, format })) => {
            run_widget(&runtime, format, |_, session| {
                let trend = monthly_creation_trend(session)?;
                Ok(Widget::Chart(if cumulative {
                    cumulative_chart(&cumulative_page_counts(&trend))
                } else {
                    monthly_trend_chart(&trend)
                }))
            })
        }
        Some(Commands::Stale(LimitArgs { limit, format })) => {
            run_widget(&runtime, format, |config, session| {
                let limit = limit.unwrap_or(config.report_limit());
                let prefix = config.page_url_prefix();
                let pages = stalest_pages(session, &prefix, limit)?;
                Ok(Widget::Table(stalest_pages_table(&pages, &prefix, limit)))
            })
        }
        Some(Commands::Fixture(args)) => run_fixture(args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(&paths, &InitOptions { force: args.force })?;

    println!("Initialized pagestats runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_fetch(runtime: &RuntimeOptions, args: FetchArgs) -> Result<()> {
    let workspace = load_workspace(runtime)?;
    let outcome = if args.force {
        refetch_snapshot(&workspace.paths, &workspace.config)?
    } else {
        ensure_snapshot(&workspace.paths, &workspace.config)?
    };

    println!("snapshot fetch");
    println!("url: {}", workspace.config.snapshot_url());
    println!(
        "snapshot_path: {}",
        normalize_path(&workspace.paths.snapshot_path)
    );
    println!(
        "status: {}",
        match outcome {
            FetchOutcome::AlreadyPresent { .. } => "cached",
            FetchOutcome::Downloaded { .. } => "downloaded",
        }
    );
    println!("bytes: {}", outcome.bytes());
    print_diagnostics(runtime, &workspace.paths);
    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let workspace = load_workspace(runtime)?;
    let paths = &workspace.paths;
    let status = inspect_runtime(paths)?;

    println!("runtime status");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir_exists: {}", format_flag(status.state_dir_exists));
    println!("data_dir_exists: {}", format_flag(status.data_dir_exists));
    println!("config_exists: {}", format_flag(status.config_exists));
    println!("snapshot_url: {}", workspace.config.snapshot_url());
    println!("snapshot_path: {}", normalize_path(&paths.snapshot_path));
    println!("snapshot_exists: {}", format_flag(status.snapshot_exists));
    println!(
        "snapshot_size_bytes: {}",
        status
            .snapshot_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    if status.snapshot_exists {
        println!("snapshot_sha256: {}", snapshot_digest(&paths.snapshot_path)?);
        let summary = summarize_pages(&read_snapshot(&paths.snapshot_path)?);
        println!("snapshot.pages: {}", summary.pages);
        println!("snapshot.lines: {}", summary.lines);
        println!("snapshot.pages_without_lines: {}", summary.pages_without_lines);
    }
    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    print_diagnostics(runtime, paths);
    Ok(())
}

fn run_report(runtime: &RuntimeOptions, args: ReportArgs) -> Result<()> {
    let workspace = load_workspace(runtime)?;
    let sessions = prepare_session(&workspace)?;
    let session = sessions.get()?;
    let limit = args.limit.unwrap_or(workspace.config.report_limit());

    let dashboard = build_dashboard(session, &workspace.config, limit)?;
    match args.format {
        OutputFormat::Text => {
            print!("{}", dashboard.render_text());
            let summary = session.summary();
            if summary.pages_without_lines > 0 {
                println!(
                    "\nnote: {} of {} snapshot page(s) have no lines and are not counted above",
                    summary.pages_without_lines, summary.pages
                );
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&dashboard.to_json())?),
    }
    print_diagnostics(runtime, &workspace.paths);
    Ok(())
}

fn run_widget<F>(runtime: &RuntimeOptions, format: OutputFormat, build: F) -> Result<()>
where
    F: FnOnce(&StatsConfig, &StatsSession) -> Result<Widget>,
{
    let workspace = load_workspace(runtime)?;
    let sessions = prepare_session(&workspace)?;
    let widget = build(&workspace.config, sessions.get()?)?;
    match format {
        OutputFormat::Text => print!("{}", widget.render_text()),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&widget.to_json())?),
    }
    print_diagnostics(runtime, &workspace.paths);
    Ok(())
}

fn run_fixture(args: FixtureArgs) -> Result<()> {
    let pages = sample_pages();
    write_snapshot(&args.output, &pages)?;
    let summary = summarize_pages(&pages);
    println!("Wrote sample snapshot: {}", normalize_path(&args.output));
    println!("pages: {}", summary.pages);
    println!("lines: {}", summary.lines);
    Ok(())
}

fn prepare_session(workspace: &Workspace) -> Result<SessionCell> {
    ensure_snapshot(&workspace.paths, &workspace.config)?;
    Ok(SessionCell::new(&workspace.paths.snapshot_path))
}

fn load_workspace(runtime: &RuntimeOptions) -> Result<Workspace> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    debug!(
        root = %normalize_path(&paths.project_root),
        snapshot = %normalize_path(&paths.snapshot_path),
        project = %config.project_name(),
        "workspace resolved"
    );
    Ok(Workspace { paths, config })
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        debug!(path = %normalize_path(&project_env), "loading project .env");
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        eprintln!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};

    use super::{Cli, Commands};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn report_accepts_json_format_and_limit() {
        let cli = Cli::try_parse_from(["pagestats", "report", "--format", "json", "--limit", "5"])
            .expect("parse");
        match cli.command {
            Some(Commands::Report(args)) => assert_eq!(args.limit, Some(5)),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
