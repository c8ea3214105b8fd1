//! Binary entry point for the taskvault CLI.
#![forbid(unsafe_code)]

#[path = "cli/config.rs"]
mod config;

use std::error::Error;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use taskvault::{
    admin::{checkpoint, open_store, stats, vacuum, verify, AdminOpenOptions},
    Metadata, NewTask, SyncMode, Task, TaskPatch, TaskStatus, TaskType,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use config::CliConfig;

#[derive(Parser, Debug)]
#[command(
    name = "taskvault",
    version,
    about = "Command line access to a taskvault store",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(flatten)]
    open: OpenArgs,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct OpenArgs {
    #[arg(
        long,
        global = true,
        env = "TASKVAULT_DIR",
        value_name = "DIR",
        help = "Storage directory holding the primary file"
    )]
    dir: Option<PathBuf>,

    #[arg(long, global = true, value_name = "FILE", help = "CLI config file")]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Named profile from the config file")]
    profile: Option<String>,

    #[arg(long, global = true, help = "Primary file name inside the directory")]
    file_name: Option<String>,

    #[arg(long, global = true, help = "Read cache capacity (0 disables caching)")]
    cache_capacity: Option<usize>,

    #[arg(long, global = true, help = "Maximum pooled connections")]
    pool_max_size: Option<usize>,

    #[arg(long, global = true, value_enum, help = "WAL sync mode override")]
    sync_mode: Option<SyncModeArg>,
}

#[derive(Args, Debug)]
struct CreateCmd {
    #[arg(value_name = "PATH")]
    path: String,

    #[arg(long, help = "Parent task path; must be a prefix of PATH")]
    parent: Option<String>,

    #[arg(long = "type", value_name = "TYPE", help = "task, milestone or group")]
    task_type: Option<TaskType>,

    #[arg(long, help = "Initial status (defaults to pending)")]
    status: Option<TaskStatus>,

    #[arg(long = "depends-on", value_name = "PATH", help = "Dependency (repeatable)")]
    depends_on: Vec<String>,

    #[arg(long = "meta", value_name = "KEY=VALUE", help = "Metadata entry (repeatable)")]
    meta: Vec<String>,
}

#[derive(Args, Debug)]
struct UpdateCmd {
    #[arg(value_name = "PATH")]
    path: String,

    #[arg(long)]
    status: Option<TaskStatus>,

    #[arg(long = "type", value_name = "TYPE")]
    task_type: Option<TaskType>,

    #[arg(
        long = "depends-on",
        value_name = "PATH",
        help = "Replacement dependency list (repeatable)"
    )]
    depends_on: Vec<String>,

    #[arg(long, conflicts_with = "depends_on", help = "Remove every dependency")]
    clear_deps: bool,

    #[arg(
        long = "meta",
        value_name = "KEY=VALUE",
        help = "Metadata entry to merge; VALUE null removes the key"
    )]
    meta: Vec<String>,
}

#[derive(Args, Debug)]
struct ListCmd {
    #[arg(long, help = "Only tasks with this status")]
    status: Option<TaskStatus>,

    #[arg(long, help = "Only direct children of this task")]
    parent: Option<String>,

    #[arg(long, value_name = "PATH", help = "Every task in the project containing PATH")]
    project: Option<String>,

    #[arg(long, value_name = "PATH", help = "Tasks depending on PATH")]
    dependents_of: Option<String>,

    #[arg(long, help = "Only tasks without a parent")]
    roots: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Create a task (creates the store if needed)")]
    Create(CreateCmd),
    #[command(about = "Print one task")]
    Get {
        #[arg(value_name = "PATH")]
        path: String,
    },
    #[command(about = "Update status, type, dependencies or metadata of a task")]
    Update(UpdateCmd),
    #[command(about = "Delete a task and everything below it")]
    Delete {
        #[arg(value_name = "PATH")]
        path: String,
    },
    #[command(about = "List tasks, optionally filtered")]
    List(ListCmd),
    #[command(about = "Fold the write-ahead log into the primary file")]
    Checkpoint,
    #[command(about = "Print store, log and file statistics")]
    Stats,
    #[command(about = "Verify on-disk structures and references")]
    Verify,
    #[command(about = "Checkpoint and clean up leftovers")]
    Vacuum,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum SyncModeArg {
    Full,
    Off,
}

impl From<SyncModeArg> for SyncMode {
    fn from(mode: SyncModeArg) -> Self {
        match mode {
            SyncModeArg::Full => SyncMode::Full,
            SyncModeArg::Off => SyncMode::Off,
        }
    }
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = ["TASKVAULT_LOG", "RUST_LOG"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find_map(|raw| EnvFilter::try_new(raw.trim()).ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<i32, Box<dyn Error>> {
    let cli = Cli::parse();
    let (dir, open_opts) = resolve_open(&cli.open)?;
    let format = cli.format;
    match cli.command {
        Command::Create(cmd) => {
            let opts = AdminOpenOptions {
                create_if_missing: true,
                ..open_opts
            };
            let store = open_store(&dir, &opts)?;
            let task = store.create_task(build_new_task(cmd)?)?;
            store.close()?;
            emit(format, &task, || print_task(&task))?;
        }
        Command::Get { path } => {
            let store = open_store(&dir, &open_opts)?;
            let task = store.get_task(&path)?;
            store.close()?;
            match task {
                Some(task) => emit(format, &task, || print_task(&task))?,
                None => {
                    eprintln!("task not found: {path}");
                    return Ok(3);
                }
            }
        }
        Command::Update(cmd) => {
            let store = open_store(&dir, &open_opts)?;
            let path = cmd.path.clone();
            let task = store.update_task(&path, build_patch(cmd)?)?;
            store.close()?;
            emit(format, &task, || print_task(&task))?;
        }
        Command::Delete { path } => {
            let store = open_store(&dir, &open_opts)?;
            let removed = store.delete_task(&path)?;
            store.close()?;
            emit(format, &removed, || {
                for path in &removed {
                    println!("deleted {path}");
                }
            })?;
        }
        Command::List(cmd) => {
            let store = open_store(&dir, &open_opts)?;
            let tasks = if let Some(path) = &cmd.project {
                store.project_tasks(path)
            } else if let Some(path) = &cmd.dependents_of {
                store.dependent_tasks(path)
            } else if let Some(parent) = &cmd.parent {
                store.tasks_by_parent(parent)
            } else if cmd.roots {
                store.project_root_tasks()
            } else if let Some(status) = cmd.status {
                store.tasks_by_status(status)
            } else {
                store.list_tasks()
            };
            store.close()?;
            // --status also narrows the structural filters.
            let tasks: Vec<Task> = tasks
                .into_iter()
                .filter(|task| cmd.status.map_or(true, |status| task.status == status))
                .collect();
            emit(format, &tasks, || print_task_table(&tasks))?;
        }
        Command::Checkpoint => {
            let report = checkpoint(&dir, &open_opts)?;
            emit(format, &report, || print_checkpoint_text(&report))?;
        }
        Command::Stats => {
            let report = stats(&dir, &open_opts)?;
            emit(format, &report, || print_stats_text(&report))?;
        }
        Command::Verify => {
            let report = verify(&dir, &open_opts)?;
            emit(format, &report, || print_verify_text(&report))?;
            if !report.success {
                return Ok(2);
            }
        }
        Command::Vacuum => {
            let report = vacuum(&dir, &open_opts)?;
            emit(format, &report, || print_vacuum_text(&report))?;
        }
    }
    Ok(0)
}

/// Flags win over the selected profile, which wins over the config defaults.
fn resolve_open(args: &OpenArgs) -> Result<(PathBuf, AdminOpenOptions), Box<dyn Error>> {
    let config = CliConfig::load(args.config.clone())?;
    let profile = match args.profile.as_deref().or(config.default_profile_name()) {
        Some(name) => Some(config.profile(name)?),
        None => None,
    };
    if let Some(profile) = profile {
        debug!(profile = %profile.name, "cli.profile.selected");
    }

    let dir = args
        .dir
        .clone()
        .or_else(|| profile.and_then(|p| p.storage_dir.clone()))
        .or_else(|| config.default_storage_dir().cloned())
        .ok_or("no storage directory; pass --dir, set TASKVAULT_DIR or configure a profile")?;

    let mut opts = AdminOpenOptions::default();
    if let Some(profile) = profile {
        if let Some(name) = &profile.file_name {
            opts.file_name = name.clone();
        }
        if let Some(capacity) = profile.cache_capacity {
            opts.cache_capacity = capacity;
        }
        if let Some(size) = profile.pool_max_size {
            opts.pool_max_size = size;
        }
        if let Some(mode) = profile.sync_mode {
            opts.sync_mode = mode.into();
        }
    }
    if let Some(name) = &args.file_name {
        opts.file_name = name.clone();
    }
    if let Some(capacity) = args.cache_capacity {
        opts.cache_capacity = capacity;
    }
    if let Some(size) = args.pool_max_size {
        opts.pool_max_size = size;
    }
    if let Some(mode) = args.sync_mode {
        opts.sync_mode = mode.into();
    }
    Ok((dir, opts))
}

fn build_new_task(cmd: CreateCmd) -> Result<NewTask, Box<dyn Error>> {
    let mut task = NewTask::new(cmd.path);
    task.parent_path = cmd.parent;
    task.task_type = cmd.task_type.unwrap_or_default();
    task.status = cmd.status;
    task.dependencies = cmd.depends_on;
    task.metadata = parse_meta(&cmd.meta)?;
    Ok(task)
}

fn build_patch(cmd: UpdateCmd) -> Result<TaskPatch, Box<dyn Error>> {
    let dependencies = if cmd.clear_deps {
        Some(Vec::new())
    } else if cmd.depends_on.is_empty() {
        None
    } else {
        Some(cmd.depends_on)
    };
    let metadata = if cmd.meta.is_empty() {
        None
    } else {
        Some(parse_meta(&cmd.meta)?)
    };
    Ok(TaskPatch {
        status: cmd.status,
        task_type: cmd.task_type,
        dependencies,
        metadata,
    })
}

/// `key=value` pairs; values that parse as JSON keep their type, others become strings.
fn parse_meta(entries: &[String]) -> Result<Metadata, Box<dyn Error>> {
    let mut metadata = Metadata::new();
    for entry in entries {
        let (key, raw) = entry
            .split_once('=')
            .ok_or_else(|| format!("invalid metadata entry '{entry}', expected key=value"))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("metadata entry '{entry}' has an empty key").into());
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        metadata.insert(key.to_string(), value);
    }
    Ok(metadata)
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: serde::Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_task(task: &Task) {
    println!("{}", task.path);
    println!("  type={} status={} version={}", type_name(task.task_type), task.status, task.version);
    if let Some(parent) = &task.parent_path {
        println!("  parent={parent}");
    }
    if !task.dependencies.is_empty() {
        println!("  depends_on={}", task.dependencies.join(","));
    }
    for (key, value) in &task.metadata {
        println!("  meta.{key}={value}");
    }
}

fn print_task_table(tasks: &[Task]) {
    let width = tasks.iter().map(|t| t.path.len()).max().unwrap_or(0);
    for task in tasks {
        println!("{:<width$}  {:<11}  {}", task.path, task.status.as_str(), type_name(task.task_type));
    }
}

fn type_name(task_type: TaskType) -> &'static str {
    match task_type {
        TaskType::Task => "task",
        TaskType::Milestone => "milestone",
        TaskType::Group => "group",
    }
}

fn print_stats_text(report: &taskvault::admin::StatsReport) {
    let store = &report.store;
    println!("Tasks: total={}", store.total_tasks);
    for (status, count) in &store.by_status {
        println!("  {status}={count}");
    }
    println!();
    println!(
        "Cache: entries={} hits={} misses={} hit_rate={:.2} evictions={} expirations={}",
        store.cache.entries,
        store.cache.hits,
        store.cache.misses,
        store.cache_hit_rate,
        store.cache.evictions,
        store.cache.expirations
    );
    println!(
        "Pool: live={} idle={} created={} timeouts={}",
        store.pool.live, store.pool.idle, store.pool.created, store.pool.timeouts
    );
    println!();
    println!(
        "WAL: segments={} size={} next_seq={} checkpoint_seq={} appended={} checkpoints={}",
        report.wal.segments,
        report.wal.size_bytes,
        report.wal.next_seq,
        report.wal.checkpoint_seq,
        report.wal.appended_records,
        report.wal.checkpoints
    );
    if let Some(reason) = &report.wal.halted {
        println!("  halted: {reason}");
    }
    println!();
    println!(
        "Filesystem: primary_size={} primary_path={} cache_size={}",
        report.filesystem.primary_size_bytes,
        report.filesystem.primary_path,
        report.filesystem.cache_size_bytes
    );
}

fn print_checkpoint_text(report: &taskvault::admin::CheckpointReport) {
    println!(
        "Checkpoint completed in {:.2} ms: {} segments, {} records, checkpoint_seq {}",
        report.duration_ms, report.segments, report.records_applied, report.checkpoint_seq
    );
}

fn print_vacuum_text(report: &taskvault::admin::VacuumReport) {
    let outcome = &report.outcome;
    println!(
        "Vacuum finished in {:.2} ms (primary {} -> {} bytes)",
        report.duration_ms, report.primary_bytes_before, report.primary_bytes_after
    );
    println!(
        "  segments_reclaimed={} records_applied={} temp_files_removed={} cache_expired={} transactions_purged={}",
        outcome.segments_reclaimed,
        outcome.records_applied,
        outcome.temp_files_removed,
        outcome.cache_expired,
        outcome.transactions_purged
    );
}

fn print_verify_text(report: &taskvault::admin::VerifyReport) {
    println!(
        "Verify => success={} tasks={} primary_tasks={} wal_segments={}",
        report.success,
        report.counts.tasks,
        report.counts.primary_tasks,
        report.counts.wal_segments
    );
    for finding in &report.findings {
        println!("- {:?}: {}", finding.severity, finding.message);
    }
}
