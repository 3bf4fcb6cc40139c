use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod chunking;
mod config;
mod coordinator;
mod daemon;
mod db;
mod ignore;
mod keystore;
mod queue;
mod remote;
mod scanner;
mod watcher;
mod workers;

use api::ApiClient;
use config::Config;
use keystore::Keystore;

#[derive(Parser)]
#[command(name = "tangle")]
#[command(about = "Zero-knowledge end-to-end encrypted file sync client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the sync folder and generate a fresh shared key
    Init {
        /// Folder to sync
        path: PathBuf,
        /// Master password wrapping the shared key
        #[arg(long)]
        password: Option<String>,
    },
    /// Unlock the keystore and verify the master password
    Unlock {
        #[arg(long)]
        password: Option<String>,
    },
    /// Remove local configuration and keystore (does not touch the sync folder)
    Reset {
        #[arg(long)]
        force: bool,
    },
    /// Print the shared key, base64-encoded, for out-of-band transfer to another machine
    ExportKey {
        #[arg(long)]
        password: Option<String>,
    },
    /// Re-wrap an imported shared key under a local master password
    ImportKey {
        key: String,
        #[arg(long)]
        password: Option<String>,
    },
    /// Register this machine with a server using a single-use invitation token
    Register {
        #[arg(long)]
        server: String,
        #[arg(long)]
        token: String,
        #[arg(long)]
        name: String,
    },
    /// Run one sync pass, or continuously with --watch
    Sync {
        #[arg(long)]
        watch: bool,
        #[arg(long)]
        no_progress: bool,
    },
    /// Run sync in the background
    Start {
        #[arg(long)]
        foreground: bool,
    },
    /// Stop a background sync daemon
    Down,
    /// Show configuration and daemon status
    Status,
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> anyhow::Result<i32> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "tangle=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { path, password } => cmd_init(path, password),
        Commands::Unlock { password } => cmd_unlock(password),
        Commands::Reset { force } => cmd_reset(force),
        Commands::ExportKey { password } => cmd_export_key(password),
        Commands::ImportKey { key, password } => cmd_import_key(&key, password),
        Commands::Register { server, token, name } => cmd_register(server, token, name).await,
        Commands::Sync { watch, no_progress } => cmd_sync(watch, no_progress).await,
        Commands::Start { foreground } => cmd_start(foreground).await,
        Commands::Down => cmd_down(),
        Commands::Status => cmd_status(),
    }
}

fn prompt_password(confirm: bool) -> anyhow::Result<String> {
    let password = rpassword::prompt_password("master password: ")?;
    if confirm {
        let again = rpassword::prompt_password("confirm password: ")?;
        if again != password {
            anyhow::bail!("passwords did not match");
        }
    }
    Ok(password)
}

fn cmd_init(path: PathBuf, password: Option<String>) -> anyhow::Result<i32> {
    let keystore_path = Config::keystore_path()?;
    if Keystore::exists(&keystore_path) {
        anyhow::bail!("keystore already exists at {}; run `tangle reset` first", keystore_path.display());
    }

    std::fs::create_dir_all(&path)?;
    let password = match password {
        Some(p) => p,
        None => prompt_password(true)?,
    };

    let key = keystore::generate_key();
    let ks = Keystore::wrap(&password, &key)?;
    ks.save(&keystore_path)?;

    let mut config = Config::load()?;
    config.sync_root = Some(path.to_string_lossy().to_string());
    config.save()?;

    println!("initialized sync folder at {}", path.display());
    println!("key id: {}", ks.key_id());
    Ok(0)
}

fn cmd_unlock(password: Option<String>) -> anyhow::Result<i32> {
    let keystore_path = Config::keystore_path()?;
    let ks = Keystore::load(&keystore_path)?;
    let password = match password {
        Some(p) => p,
        None => prompt_password(false)?,
    };
    ks.unlock(&password)?;
    println!("keystore unlocked (key id: {})", ks.key_id());
    Ok(0)
}

fn cmd_reset(force: bool) -> anyhow::Result<i32> {
    if !force {
        anyhow::bail!("this deletes local configuration, keystore, and sync state; re-run with --force to confirm");
    }
    let _ = std::fs::remove_file(Config::keystore_path()?);
    let _ = std::fs::remove_file(Config::state_db_path()?);
    let _ = std::fs::remove_file(Config::config_path()?);
    println!("local configuration reset");
    Ok(0)
}

fn cmd_export_key(password: Option<String>) -> anyhow::Result<i32> {
    let ks = Keystore::load(&Config::keystore_path()?)?;
    let password = match password {
        Some(p) => p,
        None => prompt_password(false)?,
    };
    let key = ks.unlock(&password)?;
    println!("{}", keystore::encode_key(&key));
    Ok(0)
}

fn cmd_import_key(encoded: &str, password: Option<String>) -> anyhow::Result<i32> {
    let key = keystore::decode_key(encoded)?;
    let password = match password {
        Some(p) => p,
        None => prompt_password(true)?,
    };
    let ks = Keystore::wrap(&password, &key)?;
    ks.save(&Config::keystore_path()?)?;
    println!("key imported, key id: {}", ks.key_id());
    Ok(0)
}

async fn cmd_register(server: String, token: String, name: String) -> anyhow::Result<i32> {
    let platform = std::env::consts::OS;
    let response = ApiClient::register_machine(&server, &name, platform, &token).await?;

    let mut config = Config::load()?;
    config.server_url = Some(server);
    config.machine_name = Some(name);
    config.bearer_token = Some(response.token);
    config.save()?;

    println!("registered as machine #{} ({})", response.machine.id, response.machine.name);
    Ok(0)
}

async fn cmd_sync(watch: bool, no_progress: bool) -> anyhow::Result<i32> {
    let config = Config::load()?;
    config.require_registered()?;
    let sync_root = config.sync_root_path()?;
    std::fs::create_dir_all(&sync_root)?;

    let keystore_path = Config::keystore_path()?;
    let ks = Keystore::load(&keystore_path)?;
    let password = prompt_password(false)?;
    let key = ks.unlock(&password)?;

    let api = Arc::new(ApiClient::new(
        config.server_url.as_deref().unwrap(),
        config.bearer_token.as_deref().unwrap(),
    ));
    let db = db::LocalDb::open(&Config::state_db_path()?)?;
    let ignore_rules = ignore::IgnoreRules::load(&sync_root);
    let queue = Arc::new(queue::EventQueue::new());

    // Prime the queue with whatever has drifted since the last run.
    scanner::scan_local(&sync_root, &db, &ignore_rules, &queue)?;
    scanner::scan_remote(&api, &db, &queue).await?;

    let pool = Arc::new(workers::WorkerPool::default_sized());
    let coordinator = coordinator::Coordinator::new(queue.clone(), pool.clone());
    let stats = workers::TransferStats::new();
    let summary = workers::RunSummary::new();
    let ctx = Arc::new(workers::WorkerContext {
        api: api.clone(),
        db: db.clone(),
        queue: queue.clone(),
        sync_root: sync_root.clone(),
        key,
        machine_name: config.machine_name.clone().unwrap_or_else(|| "unknown".to_string()),
        stats: stats.clone(),
        summary: summary.clone(),
    });

    let stop = Arc::new(AtomicBool::new(false));
    let worker_handles = pool.clone().run(ctx.clone(), stop.clone());

    if !watch {
        coordinator.run_until_drained();
        for handle in worker_handles {
            handle.abort();
        }
        if !no_progress {
            print_run_summary(&summary);
        }
        return Ok(0);
    }

    let online = Arc::new(AtomicBool::new(true));
    let remote_stop = stop.clone();
    let remote_task = tokio::spawn(remote::run(
        config.server_url.clone().unwrap(),
        config.bearer_token.clone().unwrap(),
        api.clone(),
        db.clone(),
        queue.clone(),
        online.clone(),
        remote_stop,
        stats.clone(),
    ));

    let watcher_root = sync_root.clone();
    let watcher_ignore = ignore_rules.clone();
    let watcher_queue = queue.clone();
    let watcher_stop = stop.clone();
    let watcher_handle = std::thread::spawn(move || {
        let _ = watcher::run(watcher_root, watcher_ignore, watcher_queue, watcher_stop);
    });

    let coordinator_stop = stop.clone();
    tokio::task::spawn_blocking(move || coordinator.run(&coordinator_stop)).await?;

    stop.store(true, Ordering::Relaxed);
    remote_task.abort();
    let _ = watcher_handle.join();
    for handle in worker_handles {
        handle.abort();
    }
    Ok(0)
}

async fn cmd_start(foreground: bool) -> anyhow::Result<i32> {
    if foreground {
        return cmd_sync(true, false).await;
    }
    let pid = daemon::start()?;
    println!("tangle syncing in background (pid {pid})");
    Ok(0)
}

fn cmd_down() -> anyhow::Result<i32> {
    daemon::stop()?;
    Ok(0)
}

/// Prints the coloured conflicts/errors sections and single-line summary
/// described in §7: per-file detail is logged as it happens via `tracing`,
/// this is just the end-of-run tally.
fn print_run_summary(summary: &workers::RunSummary) {
    let (uploaded, downloaded, deleted, conflicts, errors) = summary.snapshot();

    if conflicts > 0 {
        println!("{}", format!("{conflicts} conflict(s) detected — see *.conflict-* files").yellow());
    }
    if errors > 0 {
        println!("{}", format!("{errors} file(s) failed to sync — see log for details").red());
    }

    println!(
        "sync complete: {} uploaded, {} downloaded, {} deleted, {} conflicts, {} errors",
        uploaded, downloaded, deleted, conflicts, errors
    );
}

fn cmd_status() -> anyhow::Result<i32> {
    let config = Config::load()?;
    match &config.server_url {
        Some(server) => {
            println!("server: {server}");
            println!("machine: {}", config.machine_name.as_deref().unwrap_or("unknown"));
            if let Some(root) = &config.sync_root {
                println!("folder: {root}");
            }
        }
        None => {
            println!("not configured. run: tangle init <path>, then tangle register --server <url> --token <invitation> --name <name>");
        }
    }

    match daemon::check_running()? {
        Some(pid) => println!("daemon: running (pid {pid})"),
        None => println!("daemon: stopped"),
    }
    Ok(0)
}
