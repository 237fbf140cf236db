use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use conveyor::{Reporter, TickDeps};
use conveyor_config::ConveyorConfig;
use conveyor_events::EventLog;
use conveyor_lock::LockStore;
use conveyor_state::RunStore;
use conveyor_storage::{FileStorage, HttpRangeFetcher};
use conveyor_types::TriggerType;
use conveyor_webhook::{NullNotifier, Notifier, WebhookNotifier};

#[derive(Parser, Debug)]
#[command(name = "conveyor", version)]
#[command(about = "Tick-driven orchestrator for the catalog synchronization pipeline")]
struct Cli {
    /// Working root containing conveyor.toml and the state tree.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Drive ticks in a loop until the run reaches a terminal status.
    Run {
        #[arg(long, default_value = "manual")]
        trigger: String,
        /// Resume a specific run instead of starting or finding one.
        #[arg(long)]
        resume: Option<Uuid>,
    },
    /// Perform exactly one tick invocation and print its response.
    Tick {
        #[arg(long)]
        resume: Uuid,
    },
    /// Print step states and the event log tail for a run (read-only).
    Status {
        #[arg(long = "run")]
        run_id: Option<Uuid>,
    },
    /// Print environment and configuration diagnostics.
    Doctor,
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn parse_trigger(s: &str) -> Result<TriggerType> {
    match s {
        "manual" => Ok(TriggerType::Manual),
        "cron" => Ok(TriggerType::Cron),
        other => bail!("unknown --trigger {other:?}, expected \"manual\" or \"cron\""),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ConveyorConfig::load_from_root(&cli.root)
        .with_context(|| format!("failed to load conveyor.toml under {}", cli.root.display()))?;

    match cli.cmd {
        Commands::Run { trigger, resume } => run_command(&cli.root, &config, &trigger, resume),
        Commands::Tick { resume } => tick_command(&cli.root, &config, resume),
        Commands::Status { run_id } => status_command(&cli.root, &config, run_id),
        Commands::Doctor => doctor_command(&cli.root, &config),
    }
}

/// Build every step-runner collaborator from config, rooted at `root`.
/// Returns the pieces individually (rather than a bundled `TickDeps`)
/// because `TickDeps` only borrows — callers assemble it themselves once
/// these locals are alive for the duration of the call.
struct Collaborators {
    run_store: RunStore,
    runs_root: PathBuf,
    lock_store: LockStore,
    storage: FileStorage,
    fetcher: HttpRangeFetcher,
    feeds: conveyor::LocalFeedSource,
    notifier: Box<dyn Notifier>,
}

fn build_collaborators(root: &PathBuf, config: &ConveyorConfig) -> Result<Collaborators> {
    let configured = config.state_dir();
    let state_dir = if configured.is_relative() { root.join(&configured) } else { configured };

    let runs_root = state_dir.join("runs");
    let run_store = RunStore::new(runs_root.clone());
    let lock_store = LockStore::new(&state_dir);
    let storage = FileStorage::new(state_dir.join("objects"));
    let fetcher = HttpRangeFetcher::new();

    let mut feeds = conveyor::LocalFeedSource::new(root.join("inbox"));
    if let Ok(url) = std::env::var("CONVEYOR_MATERIAL_URL") {
        feeds = feeds.with_material_url(url);
    }

    let webhook_config = config.notification.to_webhook_config();
    let notifier: Box<dyn Notifier> = if webhook_config.enabled {
        Box::new(WebhookNotifier::new(webhook_config).context("failed to build webhook notifier")?)
    } else {
        Box::new(NullNotifier)
    };

    Ok(Collaborators { run_store, runs_root, lock_store, storage, fetcher, feeds, notifier })
}

fn run_command(root: &PathBuf, config: &ConveyorConfig, trigger: &str, resume: Option<Uuid>) -> Result<()> {
    let trigger_type = parse_trigger(trigger)?;
    let collab = build_collaborators(root, config)?;
    let mut reporter = CliReporter;

    let run_id = match resume {
        Some(id) => {
            if !collab.run_store.exists(id) {
                bail!("no run {id} found under {}", root.display());
            }
            id
        }
        None => match conveyor::find_running_run(&collab.run_store)? {
            Some(id) => {
                reporter.info(&format!("resuming in-progress run {id}"));
                id
            }
            None => {
                let id = conveyor::start_new_run(&collab.run_store, trigger_type, Utc::now())?;
                reporter.info(&format!("started run {id}"));
                id
            }
        },
    };

    let deps = TickDeps {
        run_store: &collab.run_store,
        lock_store: &collab.lock_store,
        state_root: &collab.runs_root,
        storage: &collab.storage,
        fetcher: &collab.fetcher,
        feeds: &collab.feeds,
        notifier: collab.notifier.as_ref(),
        sftp: &config.sftp,
        config,
    };

    let response = conveyor::run_to_completion(&deps, run_id, &mut reporter)?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn tick_command(root: &PathBuf, config: &ConveyorConfig, resume: Uuid) -> Result<()> {
    let collab = build_collaborators(root, config)?;
    if !collab.run_store.exists(resume) {
        bail!("no run {resume} found under {}", root.display());
    }

    let deps = TickDeps {
        run_store: &collab.run_store,
        lock_store: &collab.lock_store,
        state_root: &collab.runs_root,
        storage: &collab.storage,
        fetcher: &collab.fetcher,
        feeds: &collab.feeds,
        notifier: collab.notifier.as_ref(),
        sftp: &config.sftp,
        config,
    };

    let mut reporter = CliReporter;
    let response = conveyor::tick(&deps, resume, Uuid::new_v4(), Utc::now(), &mut reporter)?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn status_command(root: &PathBuf, config: &ConveyorConfig, run_id: Option<Uuid>) -> Result<()> {
    let collab = build_collaborators(root, config)?;

    let ids = match run_id {
        Some(id) => vec![id],
        None => collab.run_store.list_run_ids()?,
    };
    if ids.is_empty() {
        println!("no runs recorded under {}", root.display());
        return Ok(());
    }

    for id in ids {
        let record = collab.run_store.load(id).with_context(|| format!("failed to load run {id}"))?;
        println!("run_id:       {}", record.run_id);
        println!("status:       {:?}", record.status);
        println!("current_step: {:?}", record.current_step);
        println!("warnings:     {}", record.warning_count);
        println!("started_at:   {}", record.started_at);
        if let Some(finished) = record.finished_at {
            println!("finished_at:  {finished}");
        }
        println!("steps:");
        for (step, state) in &record.steps {
            println!("  {step:<18?} {state:?}");
        }

        if run_id.is_some() {
            let events = EventLog::read_from_file(&conveyor_events::events_path(&conveyor_state::run_dir(
                &collab.runs_root,
                id,
            )))?;
            println!("recent events:");
            for event in events.events_for_run(id).iter().rev().take(10).rev() {
                println!("  [{}] {}: {}", event.at, event.message, event.details);
            }
        }
        println!();
    }

    Ok(())
}

fn doctor_command(root: &PathBuf, config: &ConveyorConfig) -> Result<()> {
    println!("root: {}", root.display());
    println!("conveyor.toml: {}", if root.join("conveyor.toml").exists() { "present" } else { "using defaults" });

    match config.validate() {
        Ok(()) => println!("config: valid"),
        Err(e) => println!("config: INVALID ({e})"),
    }

    let collab = build_collaborators(root, config)?;
    let probe_key = "doctor_probe.txt";
    match collab.storage.write(probe_key, b"ok").and_then(|_| collab.storage.delete(probe_key)) {
        Ok(()) => println!("storage: writable ({})", collab.storage.base_path()),
        Err(e) => println!("storage: NOT writable ({e})"),
    }

    println!("lock held: {}", collab.lock_store.is_locked(Utc::now()).unwrap_or(false));

    let sftp_ready = config.sftp.read_credentials().is_some();
    println!("sftp credentials: {}", if sftp_ready { "present" } else { "incomplete" });

    let webhook = config.notification.to_webhook_config();
    println!(
        "notification: {}",
        if webhook.enabled { format!("enabled ({})", webhook.url.as_deref().unwrap_or("")) } else { "disabled".to_string() }
    );

    Ok(())
}
