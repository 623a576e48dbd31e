use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use scute_core::catalog::{self, AddonStatus, ListFilter};
use scute_core::config::{ScuteConfig, load_config};
use scute_core::install::{Installer, UpdateOutcome};
use scute_core::installed;
use scute_core::reconcile::reconcile;
use scute_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, init_layout, inspect_runtime,
    normalize_for_display, resolve_paths,
};
use scute_core::store;
use scute_core::sync::{self, RevisionCheck};

#[derive(Debug, Parser)]
#[command(
    name = "scute",
    version,
    about = "Catalog, install, and update game-client add-ons"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    game_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    game_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            game_root: cli.game_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create the add-on directory layout and a config file")]
    Init(InitArgs),
    #[command(about = "Inspect the resolved runtime layout")]
    Status,
    #[command(about = "Sync the catalog from collaborator records")]
    Sync(SyncArgs),
    #[command(about = "List catalog entries (reconciles installed state first)")]
    List(ListArgs),
    #[command(about = "Show one add-on's catalog entry and installed state")]
    Info(InfoArgs),
    #[command(about = "Install an add-on (checkout first, archive fallback)")]
    Install(InstallArgs),
    #[command(about = "Remove an installed add-on")]
    Remove(NameArg),
    #[command(about = "Update one add-on, everything, or just check")]
    Update(UpdateArgs),
    #[command(about = "Re-link a disabled add-on")]
    Enable(NameArg),
    #[command(about = "Unlink an add-on without touching its checkout")]
    Disable(NameArg),
    #[command(about = "Operator edits on catalog rows")]
    Catalog(CatalogArgs),
    #[command(about = "Store maintenance and inspection")]
    Db(DbArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(
        long,
        value_name = "PATH",
        help = "JSON file of catalog records produced by the wiki scraper"
    )]
    from_json: Option<PathBuf>,
    #[arg(long, help = "Apply even when the upstream page revision is unchanged")]
    force: bool,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(help = "Filter by a name/description search term")]
    search: Option<String>,
    #[arg(short = 't', long, help = "Filter by tag")]
    tag: Option<String>,
    #[arg(short = 'i', long, help = "Only show installed add-ons")]
    installed: bool,
    #[arg(short = 'n', long, default_value_t = 20, help = "Number of results")]
    limit: usize,
    #[arg(short = 'a', long, help = "Show all results")]
    all: bool,
}

#[derive(Debug, Args)]
struct InfoArgs {
    name: String,
}

#[derive(Debug, Args)]
struct InstallArgs {
    name: String,
    #[arg(long, value_name = "URL", help = "Install from this URL instead of the catalog")]
    url: Option<String>,
}

#[derive(Debug, Args)]
struct NameArg {
    name: String,
}

#[derive(Debug, Args)]
struct UpdateArgs {
    name: Option<String>,
    #[arg(long, conflicts_with = "name", help = "Update every installed add-on")]
    all: bool,
    #[arg(long, help = "Only report which add-ons are behind upstream")]
    check: bool,
}

#[derive(Debug, Args)]
struct CatalogArgs {
    #[command(subcommand)]
    command: CatalogSubcommand,
}

#[derive(Debug, Subcommand)]
enum CatalogSubcommand {
    #[command(about = "Set or clear the override URL (override wins on install)")]
    Override {
        name: String,
        #[arg(help = "New override URL; omit to clear")]
        url: Option<String>,
    },
    #[command(about = "Set the lifecycle status (active|broken|missing|unstable)")]
    Status { name: String, status: String },
}

#[derive(Debug, Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbSubcommand,
}

#[derive(Debug, Subcommand)]
enum DbSubcommand {
    Stats,
    Migrate,
    Events {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Status) => run_status(&runtime),
        Some(Commands::Sync(args)) => run_sync(&runtime, args),
        Some(Commands::List(args)) => run_list(&runtime, args),
        Some(Commands::Info(InfoArgs { name })) => run_info(&runtime, &name),
        Some(Commands::Install(args)) => run_install(&runtime, args),
        Some(Commands::Remove(NameArg { name })) => run_remove(&runtime, &name),
        Some(Commands::Update(args)) => run_update(&runtime, args),
        Some(Commands::Enable(NameArg { name })) => run_enable(&runtime, &name, true),
        Some(Commands::Disable(NameArg { name })) => run_enable(&runtime, &name, false),
        Some(Commands::Catalog(CatalogArgs { command })) => match command {
            CatalogSubcommand::Override { name, url } => {
                run_catalog_override(&runtime, &name, url.as_deref())
            }
            CatalogSubcommand::Status { name, status } => {
                run_catalog_status(&runtime, &name, &status)
            }
        },
        Some(Commands::Db(DbArgs { command })) => match command {
            DbSubcommand::Stats => run_db_stats(&runtime),
            DbSubcommand::Migrate => run_db_migrate(&runtime),
            DbSubcommand::Events { limit } => run_db_events(&runtime, limit),
        },
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("SCUTE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        game_root: runtime.game_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };
    resolve_paths(&context, &overrides)
}

fn load_runtime_config(paths: &ResolvedPaths) -> Result<ScuteConfig> {
    load_config(&paths.config_path)
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            materialize_config: true,
            force: args.force,
        },
    )?;

    println!("Initialized scute runtime layout");
    println!("game_root: {}", normalize_for_display(&paths.game_root));
    println!("addons_dir: {}", normalize_for_display(&paths.addons_dir));
    println!("data_dir: {}", normalize_for_display(&paths.data_dir));
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;

    println!("runtime status");
    println!("game_root: {}", normalize_for_display(&paths.game_root));
    println!("game_root_exists: {}", format_flag(status.game_root_exists));
    println!("addons_dir_exists: {}", format_flag(status.addons_dir_exists));
    println!("staging_dir_exists: {}", format_flag(status.staging_dir_exists));
    println!("data_dir_exists: {}", format_flag(status.data_dir_exists));
    println!("db_exists: {}", format_flag(status.db_exists));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("config_exists: {}", format_flag(status.config_exists));
    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_sync(runtime: &RuntimeOptions, args: SyncArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_runtime_config(&paths)?;
    let connection = store::open_store(&paths)?;

    println!("catalog sync");
    let api_url = config.api_url_owned();
    let revision = sync::check_catalog_revision(
        &connection,
        api_url.as_deref(),
        &config.catalog_page(),
        &config.user_agent(),
    )?;

    let current_revision = match &revision {
        Some(RevisionCheck::Unchanged { revision }) => {
            println!("upstream_revision: {revision} (unchanged)");
            if !args.force {
                println!("catalog: up to date, nothing applied (use --force to apply anyway)");
                print_diagnostics(runtime, &paths);
                return Ok(());
            }
            Some(revision.clone())
        }
        Some(RevisionCheck::Changed { current, previous }) => {
            println!(
                "upstream_revision: {current} (previous: {})",
                previous.as_deref().unwrap_or("<none>")
            );
            Some(current.clone())
        }
        None => {
            println!("upstream_revision: <no catalog API configured>");
            None
        }
    };

    let Some(records_path) = args.from_json else {
        println!("records: <none supplied>; pass --from-json to apply collaborator records");
        print_diagnostics(runtime, &paths);
        return Ok(());
    };

    let records = sync::load_records(&records_path)?;
    let report = sync::apply_records(&connection, &records)?;
    println!("records.total: {}", report.total);
    println!("records.inserted: {}", report.inserted);
    println!("records.updated: {}", report.updated);
    println!("records.tags_merged: {}", report.tags_merged);
    println!("records.skipped: {}", report.skipped);

    if let Some(revision) = current_revision {
        sync::store_catalog_revision(&connection, &revision)?;
        println!("stored_revision: {revision}");
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_list(runtime: &RuntimeOptions, args: ListArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let connection = store::open_store(&paths)?;

    let reconciled = reconcile(&connection, &paths)?;
    if reconciled.found > 0 || reconciled.removed > 0 {
        println!(
            "reconciled: {} found, {} removed",
            reconciled.found, reconciled.removed
        );
    }

    let installed_map = installed::installed_by_key(&connection)?;
    let entries = catalog::list_addons(
        &connection,
        &ListFilter {
            search: args.search.clone(),
            tag: args.tag.clone(),
        },
    )?;

    let mut shown = 0usize;
    let mut total = 0usize;
    for entry in &entries {
        let record = installed_map.get(&entry.name.to_lowercase());
        if args.installed && record.is_none() {
            continue;
        }
        total += 1;
        if !args.all && shown >= args.limit {
            continue;
        }
        shown += 1;
        let marker = match record {
            Some(record) if record.enabled => format!("[installed {}]", record.version),
            Some(record) => format!("[disabled {}]", record.version),
            None => String::new(),
        };
        let description = entry.description.as_deref().unwrap_or("");
        println!("{} {} {}", entry.name, marker, description);
    }

    // folders on disk the catalog knows nothing about still show up
    if !args.installed {
        println!("catalog.count: {total} (shown: {shown})");
    } else {
        for (key, record) in &installed_map {
            if entries.iter().any(|entry| entry.name.to_lowercase() == *key) {
                continue;
            }
            let state = if record.enabled { "installed" } else { "disabled" };
            println!("{} [{} {}] (not in catalog)", record.name, state, record.version);
        }
        println!("installed.count: {}", installed_map.len());
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_info(runtime: &RuntimeOptions, name: &str) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let connection = store::open_store(&paths)?;
    reconcile(&connection, &paths)?;

    let entry = catalog::get_addon(&connection, name)?;
    let record = installed::find_installed(&connection, name)?;
    if entry.is_none() && record.is_none() {
        bail!("{name} is neither in the catalog nor installed");
    }

    if let Some(entry) = entry {
        println!("name: {}", entry.name);
        println!("status: {}", entry.status.map(|s| s.as_str()).unwrap_or("unknown"));
        println!("host: {}", entry.host.as_str());
        println!(
            "source_url: {}",
            entry.source_url.as_deref().unwrap_or("<none>")
        );
        println!(
            "override_url: {}",
            entry.override_url.as_deref().unwrap_or("<none>")
        );
        println!(
            "description: {}",
            entry.description.as_deref().unwrap_or("<none>")
        );
        if !entry.tags.is_empty() {
            println!(
                "tags: {}",
                entry.tags.iter().cloned().collect::<Vec<_>>().join(", ")
            );
        }
    } else {
        println!("name: {name}");
        println!("catalog: <not listed>");
    }

    match record {
        Some(record) => {
            println!("installed: yes");
            println!("installed.version: {}", record.version);
            println!("installed.enabled: {}", record.enabled);
            println!("installed.path: {}", normalize_for_display(&record.path));
            println!(
                "installed.source_url: {}",
                record.source_url.as_deref().unwrap_or("<none>")
            );
        }
        None => println!("installed: no"),
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_install(runtime: &RuntimeOptions, args: InstallArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_runtime_config(&paths)?;
    let connection = store::open_store(&paths)?;

    let engine = Installer::new(&connection, &paths, &config)?;
    let report = engine.install(&args.name, args.url.as_deref())?;

    println!("installed: {}", report.name);
    println!("strategy: {}", report.strategy.as_str());
    println!("version: {}", report.version);
    for folder in &report.linked {
        println!("linked: {folder}");
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_remove(runtime: &RuntimeOptions, name: &str) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_runtime_config(&paths)?;
    let connection = store::open_store(&paths)?;

    let engine = Installer::new(&connection, &paths, &config)?;
    engine.remove(name)?;
    println!("removed: {name}");
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_update(runtime: &RuntimeOptions, args: UpdateArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_runtime_config(&paths)?;
    let connection = store::open_store(&paths)?;
    let engine = Installer::new(&connection, &paths, &config)?;

    if args.check {
        let candidates = engine.check_for_updates()?;
        println!("updates.count: {}", candidates.len());
        for candidate in candidates {
            println!(
                "behind: {} (version {}, {} commits)",
                candidate.name, candidate.current_version, candidate.behind_count
            );
        }
        print_diagnostics(runtime, &paths);
        return Ok(());
    }

    if args.all {
        let report = engine.update_all()?;
        println!("updated: {}", report.succeeded);
        println!("failed.count: {}", report.failed.len());
        for name in &report.failed {
            println!("failed: {name}");
        }
        print_diagnostics(runtime, &paths);
        return Ok(());
    }

    let Some(name) = args.name else {
        bail!("pass an add-on name, --all, or --check");
    };
    match engine.update(&name)? {
        UpdateOutcome::FastForwarded { version } => {
            println!("updated: {name}");
            println!("strategy: fast-forward");
            println!("version: {version}");
        }
        UpdateOutcome::Reinstalled { strategy } => {
            println!("updated: {name}");
            println!("strategy: reinstall ({})", strategy.as_str());
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_enable(runtime: &RuntimeOptions, name: &str, enable: bool) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_runtime_config(&paths)?;
    let connection = store::open_store(&paths)?;
    let engine = Installer::new(&connection, &paths, &config)?;

    if enable {
        engine.enable(name)?;
        println!("enabled: {name}");
    } else {
        engine.disable(name)?;
        println!("disabled: {name}");
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_catalog_override(runtime: &RuntimeOptions, name: &str, url: Option<&str>) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let connection = store::open_store(&paths)?;

    if !catalog::set_override_url(&connection, name, url)? {
        bail!("{name} is not in the catalog");
    }
    match url {
        Some(url) => println!("override: {name} -> {url}"),
        None => println!("override: {name} cleared"),
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_catalog_status(runtime: &RuntimeOptions, name: &str, status: &str) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let connection = store::open_store(&paths)?;

    let status = AddonStatus::parse(status)?;
    if !catalog::set_status(&connection, name, status)? {
        bail!("{name} is not in the catalog");
    }
    println!("status: {name} -> {}", status.as_str());
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_stats(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let connection = store::open_store(&paths)?;
    let stats = store::load_store_stats(&connection)?;

    println!("db stats");
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("schema_version: {}", stats.schema_version);
    println!("catalog.rows: {} ({} active)", stats.catalog_rows, stats.catalog_active);
    println!(
        "installed.rows: {} ({} active)",
        stats.installed_rows, stats.installed_active
    );
    println!("events.rows: {}", stats.event_rows);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_migrate(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let pending = store::pending_migration_count(&paths)?;
    let report = store::run_migrations(&paths)?;

    println!("db migrate");
    println!("pending_before: {pending}");
    println!("applied: {}", report.applied.len());
    for migration in &report.applied {
        println!("applied.migration: v{:03}_{}", migration.version, migration.name);
    }
    println!("schema_version: {}", report.current_version);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_events(runtime: &RuntimeOptions, limit: usize) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let connection = store::open_store(&paths)?;
    let events = store::recent_events(&connection, limit)?;

    println!("events.count: {}", events.len());
    for event in events {
        let subject = event.subject.as_deref().unwrap_or("-");
        let details = event.details_json.as_deref().unwrap_or("");
        println!("event: {} {} {} {}", event.ts_unix, event.kind, subject, details);
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
